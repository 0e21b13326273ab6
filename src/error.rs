use crate::connection::SessionState;
use thiserror::Error;

/// Result type for Tesira operations
pub type Result<T> = std::result::Result<T, TesiraError>;

/// Errors that can occur when talking to a Tesira device
#[derive(Error, Debug)]
pub enum TesiraError {
    /// Transport I/O error (connection lost, write failed)
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Connection was closed while a request was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    /// The session cannot accept commands in its current state
    #[error("Session not connected (state: {state})")]
    NotConnected {
        /// State the session was in when the command was refused
        state: SessionState,
    },

    /// Initial connection could not be established
    #[error("Connection failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        /// Number of attempts made
        attempts: u32,
        /// Description of the last failure
        reason: String,
    },

    /// Request timed out waiting for a reply
    #[error("Request timeout: {command}")]
    Timeout {
        /// Command line that went unanswered
        command: String,
    },

    /// Request was cancelled by an explicit disconnect
    #[error("Request cancelled")]
    Cancelled,

    /// Device answered the command with an error
    #[error("Device error ({code}): {message}")]
    Device {
        /// Error class reported by the device, e.g. `ERR`
        code: String,
        /// Error message text
        message: String,
    },

    /// Malformed line or unexpected reply shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Argument rejected before anything was sent
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No block with this identifier on the device
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Block map snapshot does not match the connected device
    #[error("Snapshot rejected: {0}")]
    SnapshotRejected(String),

    /// Update receiver fell behind and missed messages
    #[error("Lagged by {0} updates")]
    Lagged(u64),
}

impl TesiraError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures of the underlying connection rather than of a single command
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ConnectionClosed
                | Self::NotConnected { .. }
                | Self::ConnectFailed { .. }
        )
    }
}
