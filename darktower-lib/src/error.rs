use thiserror::Error;

/// Failures reported by a transport adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Tower not found. Is it powered on and in range?")]
    NotFound,

    #[error("Link is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Timeout during link operation")]
    Timeout,
}

impl LinkError {
    /// True when the error means the link itself is gone, so retrying a write is pointless.
    pub fn is_link_down(&self) -> bool {
        matches!(self, LinkError::NotConnected)
    }
}

/// Encoding errors. These are programming errors and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Buffer too small: expected at least {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Field {field} value {value} exceeds maximum {max}")]
    FieldOutOfRange { field: &'static str, value: u32, max: u32 },

    #[error("{what} index {index} out of range (max {max})")]
    IndexOutOfRange { what: &'static str, index: usize, max: usize },

    #[error("{kind} frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// The primary error type for the `darktower-lib` library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TowerError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Command queue cleared")]
    QueueCleared,

    #[error("Tower controller has been disposed")]
    Disposed,
}

pub type Result<T, E = TowerError> = std::result::Result<T, E>;
