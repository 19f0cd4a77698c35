/// Error types for Mundus operations.
///
/// Session loops close the connection on [`WmError::Protocol`],
/// [`WmError::InvalidArgument`], and [`WmError::SendExhausted`];
/// persistence failures are reported locally and never travel back to the
/// write path.
use thiserror::Error;

/// The main error type for Mundus operations.
#[derive(Error, Debug)]
pub enum WmError {
    /// Malformed frame, bad handshake, or unknown message id.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A well-formed request with an unusable argument, such as a negative
    /// subscription cadence.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A socket send stayed unavailable past the retry budget.
    #[error("send retry budget exhausted after {attempts} attempts")]
    SendExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// A durable operation could not be completed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The peer went silent past its timeout.
    #[error("peer timed out after {0}s of inactivity")]
    PeerTimeout(i64),

    /// The request conflicts with existing state (e.g. creating a URI that
    /// already exists).
    #[error("state conflict: {0}")]
    Conflict(String),

    /// Bad or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying socket or file I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for WmError {
    fn from(err: sqlx::Error) -> Self {
        WmError::Persistence(err.to_string())
    }
}

/// Result type alias for Mundus operations.
pub type WmResult<T> = Result<T, WmError>;
