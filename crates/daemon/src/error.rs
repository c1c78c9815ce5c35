use thiserror::Error;

use crate::rpc::RpcStatus;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon can only be started once")]
    AlreadyStarted,

    #[error("daemon is not running")]
    NotRunning,

    /// Startup failed; nothing was left running
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// `endpoint` names the listener and, when known, its address
    #[error("unable to bind {endpoint}: {message}")]
    ListenerBind { endpoint: String, message: String },

    /// A background task failed after startup
    #[error("{task} failed: {message}")]
    RuntimeFailure { task: String, message: String },
}

impl DaemonError {
    pub fn init(msg: impl Into<String>) -> Self {
        DaemonError::Initialization(msg.into())
    }

    /// Whether the error happened before any task was spawned
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            DaemonError::AlreadyStarted
                | DaemonError::Initialization(_)
                | DaemonError::ListenerBind { .. }
        )
    }
}

/// Transport-level errors on the framed RPC connection
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("connection closed before a response")]
    Closed,

    #[error("tls error: {0}")]
    Tls(String),

    #[error("rpc status {0}")]
    Status(RpcStatus),
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Malformed(err.to_string())
    }
}
