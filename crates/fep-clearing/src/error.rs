//! Clearing error types

use thiserror::Error;

/// Result type for clearing operations
pub type ClearingResult<T> = std::result::Result<T, ClearingError>;

/// Clearing error types
#[derive(Debug, Clone, Error)]
pub enum ClearingError {
    /// A line is shorter than its layout or carries a bad record type
    #[error("malformed line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    /// A fixed-width field failed to parse
    #[error("line {line}, field {field}: {reason}")]
    BadField {
        line: usize,
        field: String,
        reason: String,
    },

    /// File structure violation: missing header/trailer, data after trailer
    #[error("file structure: {reason}")]
    Structure { reason: String },

    /// Trailer totals disagree with the detail lines
    #[error("trailer mismatch: {field} declared {declared}, computed {computed}")]
    TrailerMismatch {
        field: String,
        declared: String,
        computed: String,
    },

    /// Trailer checksum disagrees with the detail bytes
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Workflow guard violation
    #[error("clearing record for {bank} is {status}, cannot {operation}")]
    InvalidTransition {
        bank: String,
        status: String,
        operation: String,
    },

    /// No clearing record for the counterparty
    #[error("no clearing record for {bank}")]
    UnknownCounterparty { bank: String },
}

impl From<ClearingError> for fep_types::FepError {
    fn from(err: ClearingError) -> Self {
        Self::System {
            message: err.to_string(),
        }
    }
}
