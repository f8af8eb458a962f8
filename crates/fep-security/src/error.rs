//! Security error types
//!
//! Error messages never carry PIN digits, key material or clear PAN data.

use thiserror::Error;

/// Result type for security operations
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

/// Security error types
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    /// Key not present in the manager
    #[error("key {key_id} not found")]
    KeyNotFound { key_id: String },

    /// Key exists but its status forbids the operation
    #[error("key {key_id} is {status}, cannot {operation}")]
    KeyNotUsable {
        key_id: String,
        status: String,
        operation: String,
    },

    /// Key material has the wrong length for the cipher
    #[error("invalid key length {len} for {cipher}")]
    InvalidKeyLength { cipher: String, len: usize },

    /// KCV of imported material does not match the declared value
    #[error("key check value mismatch for {key_id}")]
    KcvMismatch { key_id: String },

    /// PIN outside 4..=12 digits or containing non-digits
    #[error("invalid PIN")]
    InvalidPin,

    /// PAN shorter than 13 digits or containing non-digits
    #[error("invalid PAN")]
    InvalidPan,

    /// PIN block malformed for its declared format
    #[error("malformed PIN block: {reason}")]
    MalformedPinBlock { reason: String },

    /// Operation requires a clear (or encrypted) block and got the other
    #[error("PIN block in wrong state: {reason}")]
    PinBlockState { reason: String },

    /// MAC verification failed
    #[error("MAC verification failed")]
    MacMismatch,

    /// Ciphertext malformed (length, padding)
    #[error("malformed ciphertext: {reason}")]
    MalformedCiphertext { reason: String },

    /// HSM adapter failure
    #[error("HSM error: {reason}")]
    Hsm { reason: String },
}

impl From<SecurityError> for fep_types::FepError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::InvalidPin | SecurityError::MalformedPinBlock { .. } => {
                Self::InvalidPin
            }
            other => Self::Security {
                reason: other.to_string(),
            },
        }
    }
}
