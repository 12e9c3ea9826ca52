//! Queue and registry errors.

use gantry_core::CoreError;

/// Queue result type
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue and worker registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A stream entry or worker hash could not be decoded
    #[error("Malformed {what}: {reason}")]
    Malformed {
        /// What was being decoded
        what: &'static str,
        /// Why it failed
        reason: String,
    },

    /// The backing store failed
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// No queue backend registered under the name
    #[error("Unknown queue backend: {0}")]
    UnknownBackend(String),
}

impl QueueError {
    pub(crate) fn malformed(what: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            what,
            reason: reason.to_string(),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<CoreError> for QueueError {
    fn from(err: CoreError) -> Self {
        Self::malformed("field", err)
    }
}
