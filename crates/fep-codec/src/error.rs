//! Codec error types
//!
//! Partial reads always surface as `Parse` with the offset where the input
//! ran out; a field that decodes but violates its definition surfaces as
//! `Field` with the schema id.

use thiserror::Error;

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Codec error types
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Malformed wire data at a known offset
    #[error("parse error at offset {offset}: expected {expected}, got {got}")]
    Parse {
        offset: usize,
        expected: String,
        got: String,
    },

    /// Bitmap violation: bit outside 1..=128 or malformed hex form
    #[error("bitmap error: {reason}")]
    Bitmap { reason: String },

    /// A specific field failed to decode or encode
    #[error("field {field}: {cause}")]
    Field { field: String, cause: String },

    /// A bit is set for which the schema has no field definition
    #[error("no definition for field {number}")]
    UnknownField { number: u16 },

    /// Variable-length data exceeds its prefix capacity
    #[error("field {field}: length {len} exceeds {max}")]
    Overflow { field: String, len: usize, max: usize },
}

impl CodecError {
    /// Truncated input at `offset` while expecting `expected`
    pub fn eof(offset: usize, expected: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            expected: expected.into(),
            got: "end of input".to_string(),
        }
    }

    /// Field-level failure
    pub fn field(field: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            cause: cause.into(),
        }
    }
}

impl From<CodecError> for fep_types::FepError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Parse {
                offset,
                expected,
                got,
            } => Self::Parse {
                offset,
                expected,
                got,
            },
            CodecError::Bitmap { reason } => Self::Bitmap { reason },
            CodecError::Field { field, cause } => Self::Field { field, cause },
            CodecError::UnknownField { number } => Self::Field {
                field: number.to_string(),
                cause: "no schema definition".to_string(),
            },
            CodecError::Overflow { field, len, max } => Self::Field {
                field,
                cause: format!("length {} exceeds {}", len, max),
            },
        }
    }
}
