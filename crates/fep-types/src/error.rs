//! Error taxonomy for FEP
//!
//! Every failure is explicit and categorized. The category determines the
//! ISO response code mapped at the pipeline boundary and whether the retry
//! policy may re-dispatch the request.

use thiserror::Error;

use crate::response::codes;

/// Result type for FEP operations
pub type Result<T> = std::result::Result<T, FepError>;

/// Coarse error category used for audit and response-code mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed wire data
    Parse,
    /// Field-constraint violation
    Validation,
    /// PIN, MAC or key failure
    Security,
    /// No matching route
    Routing,
    /// Deadline expired without a correlated response
    Timeout,
    /// Re-submission inside the dedup window
    Duplicate,
    /// Connectivity failure on the interbank leg
    Connection,
    /// Everything unexpected
    System,
}

/// FEP error types
#[derive(Debug, Clone, Error)]
pub enum FepError {
    /// Malformed wire message
    #[error("parse error at offset {offset}: expected {expected}, got {got}")]
    Parse {
        offset: usize,
        expected: String,
        got: String,
    },

    /// Bitmap outside 1..=128 or malformed hex/binary form
    #[error("bitmap error: {reason}")]
    Bitmap { reason: String },

    /// A specific field failed to decode or encode
    #[error("field {field} error: {cause}")]
    Field { field: String, cause: String },

    /// Field-constraint violation
    #[error("validation failed on {field}: {reason}")]
    Validation { field: String, reason: String },

    /// PIN decrypt failure, MAC mismatch, key not found, HSM error
    #[error("security error: {reason}")]
    Security { reason: String },

    /// PIN verification specifically (maps to 55 instead of 96)
    #[error("PIN verification failed")]
    InvalidPin,

    /// No routing rule matched and no default destination is configured
    #[error("no route for transaction: {reason}")]
    Routing { reason: String },

    /// Deadline expired without a correlated response
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// Re-submission of the same fingerprint within the dedup window
    #[error("duplicate transaction: {fingerprint}")]
    Duplicate { fingerprint: String },

    /// Interbank connection unusable or lost mid-flight
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// Uncaught or unexpected failure
    #[error("system error: {message}")]
    System { message: String },
}

impl FepError {
    /// Create a system error
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Create a security error
    pub fn security(reason: impl Into<String>) -> Self {
        Self::Security {
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// The coarse category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Parse { .. } | Self::Bitmap { .. } | Self::Field { .. } => ErrorCategory::Parse,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Security { .. } | Self::InvalidPin => ErrorCategory::Security,
            Self::Routing { .. } => ErrorCategory::Routing,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Duplicate { .. } => ErrorCategory::Duplicate,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::System { .. } => ErrorCategory::System,
        }
    }

    /// The ISO response code synthesized for this error at the pipeline
    /// boundary
    pub fn response_code(&self) -> &'static str {
        match self {
            Self::Parse { .. } | Self::Bitmap { .. } | Self::Field { .. } => {
                codes::SYSTEM_MALFUNCTION
            }
            Self::Validation { .. } => codes::INVALID_CARD,
            Self::Security { .. } => codes::SYSTEM_MALFUNCTION,
            Self::InvalidPin => codes::INVALID_PIN,
            Self::Routing { .. } => codes::NOT_PERMITTED,
            Self::Timeout { .. } => codes::ISSUER_INOPERATIVE,
            Self::Duplicate { .. } => codes::DUPLICATE,
            Self::Connection { .. } => codes::ISSUER_INOPERATIVE,
            Self::System { .. } => codes::SYSTEM_MALFUNCTION,
        }
    }

    /// Whether the retry policy may re-dispatch after this error.
    /// Parse and security failures are fatal to the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::System { .. }
        )
    }
}
