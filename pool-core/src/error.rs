//! Error types for the pool core

use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pool core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Serialization error (state snapshot)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Tabular audit log error
    #[error("Audit log error: {0}")]
    AuditLog(#[from] csv::Error),

    /// Recomputed fingerprint does not match the stored one.
    ///
    /// Indicates tampering or a canonical-encoding change, never a
    /// transient failure.
    #[error("Audit chain broken at history index {index}: expected {expected}, found {actual}")]
    AuditChainBroken {
        /// Position in the retained history of the first failing trace
        index: usize,
        /// Fingerprint recomputed from the chain
        expected: String,
        /// Fingerprint found in the stored trace
        actual: String,
    },

    /// Invariant violation (supply out of bounds, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Formula parameters rejected by validation
    #[error("Invalid formula parameters: {0}")]
    InvalidParameters(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error signals possible tampering rather than I/O trouble
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(self, Error::AuditChainBroken { .. })
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
