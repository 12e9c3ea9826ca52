//! Provenance errors.

use gantry_core::{CoreError, Digest};

/// Provenance result type
pub type ProvenanceResult<T> = Result<T, ProvenanceError>;

/// Provenance errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvenanceError {
    /// A row references a revision that was never committed
    #[error("Hash mismatch: {row} {rev_hash} references missing revision {missing}")]
    HashMismatch {
        /// Kind of row that failed
        row: &'static str,
        /// Digest of the offending row
        rev_hash: Digest,
        /// The parent that does not exist
        missing: Digest,
    },

    /// A row's stored digest does not match its columns
    #[error("Corrupt {row}: stored digest {stored} does not match its contents")]
    Corrupt {
        /// Kind of row that failed
        row: &'static str,
        /// The digest carried by the row
        stored: Digest,
    },

    /// Malformed completion result
    #[error("Invalid result: {0}")]
    InvalidResult(String),

    /// Row encode/decode failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Backing store failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ProvenanceError {
    /// Whether this error is an integrity violation rather than an I/O failure
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::Corrupt { .. })
    }
}

impl From<CoreError> for ProvenanceError {
    fn from(err: CoreError) -> Self {
        Self::InvalidResult(err.to_string())
    }
}

impl From<serde_json::Error> for ProvenanceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
