//! Core error types for GANTRY.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input could not be parsed or canonicalized
    Parse {
        /// Parser message
        message: String,
    },

    /// Filesystem failure while loading an input document
    Io {
        /// Path that failed
        path: String,
        /// OS error text
        message: String,
    },

    /// Invalid hash format
    InvalidHash {
        /// Why the hash was rejected
        reason: String,
    },

    /// Invalid ID format
    InvalidId {
        /// Why the id was rejected
        reason: String,
    },

    /// Invalid timestamp
    InvalidTimestamp {
        /// Why the timestamp was rejected
        reason: String,
    },

    /// Unknown task status name
    InvalidStatus {
        /// The rejected status string
        status: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { message } => write!(f, "Parse error: {}", message),
            Self::Io { path, message } => write!(f, "I/O error on {}: {}", path, message),
            Self::InvalidHash { reason } => write!(f, "Invalid hash: {}", reason),
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::InvalidTimestamp { reason } => write!(f, "Invalid timestamp: {}", reason),
            Self::InvalidStatus { status } => write!(f, "Unknown task status: {}", status),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}

impl From<crate::hash::DigestError> for CoreError {
    fn from(err: crate::hash::DigestError) -> Self {
        Self::InvalidHash {
            reason: err.to_string(),
        }
    }
}
