use thiserror::Error;

/// Application-wide error type
///
/// Every failure mode is explicit; components never fail silently. The
/// disposition of each kind (returned, logged-and-dropped, fatal) is decided
/// at the call site, not here.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Input queue full")]
    InputFull,

    #[error("Port busy: {0}")]
    PortBusy(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Session {0} timed out")]
    SessionTimeout(i64),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Already exists")]
    AlreadyExists,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Video error: {0}")]
    Video(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Fail(String),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// True for errors a caller is expected to retry or absorb rather than
    /// treat as a session/component failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::InputFull | StreamError::InvalidMessage(_))
    }
}
