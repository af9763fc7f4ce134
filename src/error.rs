//! Error types for admission control.

use thiserror::Error;

/// Main error type for admission operations.
///
/// A rejected `allow` is not an error; only reservations and the
/// surrounding plumbing (configuration, transports) fail.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The caller's context was cancelled before capacity became available
    #[error("reservation canceled")]
    Canceled,

    /// The caller's deadline passed before capacity became available
    #[error("reservation deadline exceeded")]
    DeadlineExceeded,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound status transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Status message encoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Whether this error came from a cancelled or expired context.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AdmissionError::Canceled | AdmissionError::DeadlineExceeded)
    }
}

/// Result type alias for admission operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
