use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The call is not authorized; per request, never affects the daemon
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid macaroon: {0}")]
    InvalidMacaroon(String),

    #[error("root key store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AuthError::Unauthorized(msg.into())
    }

    /// Whether this error rejects a call rather than signalling a fault
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AuthError::Unauthorized(_) | AuthError::InvalidMacaroon(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds the database
    #[error("root key database is locked")]
    Locked,

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("invalid root key: {0}")]
    InvalidKey(String),

    #[error("store is closed")]
    Closed,
}
