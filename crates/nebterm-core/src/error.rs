use thiserror::Error;

/// Errors produced by the nebterm session and protocol layers.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("token error: {0}")]
    Token(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TermError {
    fn from(e: serde_json::Error) -> Self {
        TermError::InvalidMessage(e.to_string())
    }
}

pub type TermResult<T> = Result<T, TermError>;
