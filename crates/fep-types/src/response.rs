//! ISO response codes exchanged with the switch
//!
//! Codes are two ASCII digits on the wire. "ND" never crosses the wire: it
//! is synthesized locally when the deadline expires without a correlated
//! response.

/// Well-known response codes and their retry classification
pub mod codes {
    /// Approved
    pub const APPROVED: &str = "00";
    /// Do not honor
    pub const DO_NOT_HONOR: &str = "05";
    /// Invalid card number
    pub const INVALID_CARD: &str = "14";
    /// Insufficient funds
    pub const INSUFFICIENT_FUNDS: &str = "51";
    /// Expired card
    pub const EXPIRED_CARD: &str = "54";
    /// Incorrect PIN
    pub const INVALID_PIN: &str = "55";
    /// Transaction not permitted
    pub const NOT_PERMITTED: &str = "58";
    /// Exceeds withdrawal limit
    pub const LIMIT_EXCEEDED: &str = "61";
    /// Response received too late
    pub const RESPONSE_LATE: &str = "68";
    /// Issuer or switch inoperative
    pub const ISSUER_INOPERATIVE: &str = "91";
    /// Duplicate transaction
    pub const DUPLICATE: &str = "94";
    /// System malfunction
    pub const SYSTEM_MALFUNCTION: &str = "96";
    /// Synthesized locally on timeout; never sent upstream
    pub const NO_RESPONSE: &str = "ND";

    /// Codes that permit a retry with the same STAN
    pub fn is_retryable(code: &str) -> bool {
        matches!(
            code,
            ISSUER_INOPERATIVE | SYSTEM_MALFUNCTION | RESPONSE_LATE | NO_RESPONSE
        )
    }

    /// Whether the code signals approval
    pub fn is_approved(code: &str) -> bool {
        code == APPROVED
    }
}
