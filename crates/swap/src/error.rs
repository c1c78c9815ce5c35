use loopd_types::SwapHash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid swap request: {0}")]
    InvalidRequest(String),

    #[error("swap not found: {0}")]
    NotFound(SwapHash),

    #[error("store migration failed: {0}")]
    Migration(String),

    #[error("backend is closed")]
    Closed,
}
