//! Upload error types.

use chunkyard_protocol::UploadId;
use chunkyard_transfer::TransferError;

/// Failure reported by a [`Transport`](crate::Transport).
///
/// `transient` errors (timeouts, 5xx, connection resets) are retried by the
/// manager; the rest (authorization, missing destination, quota) fail the
/// upload immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub transient: bool,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

/// Errors produced by the upload manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("permanent transport error: {0}")]
    PermanentTransport(String),

    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetryBudgetExhausted { attempts: u32, last: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown upload: {0}")]
    UnknownUpload(UploadId),

    #[error("source read failed: {0}")]
    Source(String),

    #[error("record store error: {0}")]
    Store(String),
}

impl From<TransportError> for UploadError {
    fn from(err: TransportError) -> Self {
        if err.transient {
            Self::TransientTransport(err.message)
        } else {
            Self::PermanentTransport(err.message)
        }
    }
}

impl UploadError {
    /// Maps a planning/validation failure at the API boundary.
    pub(crate) fn invalid(err: TransferError) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}
