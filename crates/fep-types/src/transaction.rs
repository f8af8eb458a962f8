//! Transaction types for FEP
//!
//! A transaction is the business-layer view of one wire message exchange:
//! the decoded request coming in from an acquiring channel and the response
//! going back out after the interbank leg completes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FepError, Result};
use crate::response::codes;

/// Acquiring channel through which a request entered the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Automated teller machine
    Atm,
    /// Point-of-sale terminal
    Pos,
    /// Internet banking
    Internet,
    /// Mobile banking
    Mobile,
    /// Traffic originated by the switch itself (network management)
    Interbank,
}

impl Channel {
    /// Wire code carried in the settlement file channel column
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Atm => "ATM",
            Self::Pos => "POS",
            Self::Internet => "EBANK",
            Self::Mobile => "MBANK",
            Self::Interbank => "FISC",
        }
    }

    /// Parse a settlement-file channel code, tolerating padding
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "ATM" => Some(Self::Atm),
            "POS" => Some(Self::Pos),
            "EBANK" => Some(Self::Internet),
            "MBANK" => Some(Self::Mobile),
            "FISC" => Some(Self::Interbank),
            _ => None,
        }
    }
}

/// Business type of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Cash withdrawal
    Withdrawal,
    /// Cash or check deposit
    Deposit,
    /// Balance inquiry (non-financial)
    BalanceInquiry,
    /// Interbank funds transfer
    Transfer,
    /// Bill payment via the FISC bill-payment service
    BillPayment,
    /// Card purchase
    Purchase,
    /// Reversal of a prior financial transaction
    Reversal,
    /// Network management (sign-on, echo, key exchange)
    NetworkManagement,
}

impl TransactionType {
    /// Whether this transaction moves money and therefore needs
    /// reversal-on-timeout protection
    pub fn is_financial(&self) -> bool {
        matches!(
            self,
            Self::Withdrawal | Self::Deposit | Self::Transfer | Self::BillPayment | Self::Purchase
        )
    }

    /// Request MTI for this transaction type
    pub fn request_mti(&self) -> &'static str {
        match self {
            Self::BalanceInquiry => "0100",
            Self::Withdrawal
            | Self::Deposit
            | Self::Transfer
            | Self::BillPayment
            | Self::Purchase => "0200",
            Self::Reversal => "0400",
            Self::NetworkManagement => "0800",
        }
    }

    /// First two digits of the processing code for this type
    pub fn processing_prefix(&self) -> &'static str {
        match self {
            Self::Withdrawal => "01",
            Self::Deposit => "21",
            Self::BalanceInquiry => "31",
            Self::Transfer => "40",
            Self::BillPayment => "50",
            Self::Purchase => "00",
            Self::Reversal => "02",
            Self::NetworkManagement => "99",
        }
    }
}

/// Lifecycle status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Received, not yet dispatched upstream
    Pending,
    /// Approved by the issuer
    Approved,
    /// Declined by the issuer or by local validation
    Declined,
    /// No response within the deadline
    TimedOut,
    /// Nullified by a successful reversal
    Reversed,
    /// Failed before dispatch (parse, security, system)
    Failed,
}

impl TransactionStatus {
    /// Terminal states admit no further transition except Reversed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Reversed | Self::Failed)
    }

    /// Statuses from which a reversal may still be issued
    pub fn is_reversible(&self) -> bool {
        matches!(self, Self::Approved | Self::Pending | Self::TimedOut)
    }
}

/// Six-digit processing code: transaction type + source account type +
/// destination account type, two digits each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessingCode {
    /// Transaction type digits
    pub txn_type: [u8; 2],
    /// Source account type digits
    pub source_account: [u8; 2],
    /// Destination account type digits
    pub dest_account: [u8; 2],
}

impl ProcessingCode {
    /// Parse a six-digit processing code
    pub fn parse(code: &str) -> Result<Self> {
        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FepError::Validation {
                field: "processing_code".to_string(),
                reason: format!("expected 6 digits, got {} characters", code.len()),
            });
        }
        let b = code.as_bytes();
        Ok(Self {
            txn_type: [b[0] - b'0', b[1] - b'0'],
            source_account: [b[2] - b'0', b[3] - b'0'],
            dest_account: [b[4] - b'0', b[5] - b'0'],
        })
    }

    /// Render back to the six-digit wire form
    pub fn as_string(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.txn_type[0],
            self.txn_type[1],
            self.source_account[0],
            self.source_account[1],
            self.dest_account[0],
            self.dest_account[1]
        )
    }
}

impl std::fmt::Display for ProcessingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// A request flowing through the gateway pipeline
///
/// STAN is six digits unique per terminal per day; RRN is the twelve-digit
/// end-to-end reference. Together with the terminal id they anchor duplicate
/// detection, response correlation and reversal matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Unique transaction ID assigned at ingress
    pub id: Uuid,
    /// Business type
    pub transaction_type: TransactionType,
    /// Six-digit processing code
    pub processing_code: ProcessingCode,
    /// Primary account number (13-19 digits); masked in all renderings
    pub pan: String,
    /// Transaction amount, two decimals for TWD
    pub amount: Decimal,
    /// ISO 4217 alpha currency code
    pub currency: String,
    /// Source account number
    pub source_account: Option<String>,
    /// Destination account number (transfers, bill payments)
    pub dest_account: Option<String>,
    /// Destination bank code (transfers)
    pub dest_bank_code: Option<String>,
    /// Terminal that originated the request
    pub terminal_id: String,
    /// Merchant, when acquired through POS
    pub merchant_id: Option<String>,
    /// Acquiring bank code
    pub acquiring_bank: String,
    /// System Trace Audit Number, six digits
    pub stan: String,
    /// Retrieval Reference Number, twelve digits
    pub rrn: String,
    /// Acquiring channel
    pub channel: Channel,
    /// Encrypted PIN block, when the channel captured a PIN
    pub pin_block: Option<Vec<u8>>,
    /// Message authentication code over the request body
    pub mac: Option<Vec<u8>>,
    /// Card expiry as YYMM, when present
    pub expiry: Option<String>,
    /// When the gateway received the request
    pub received_at: DateTime<Utc>,
    /// Original transaction being reversed (reversals only)
    pub original_id: Option<Uuid>,
}

impl TransactionRequest {
    /// Correlation key on the interbank leg
    pub fn correlation_key(&self) -> (String, String) {
        (self.stan.clone(), self.terminal_id.clone())
    }

    /// Dedup fingerprint: acquirer, terminal, STAN and transaction date
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.acquiring_bank,
            self.terminal_id,
            self.stan,
            self.received_at.format("%Y%m%d")
        )
    }
}

/// The response returned to the acquiring channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    /// ID of the request this answers
    pub transaction_id: Uuid,
    /// Two-digit ISO response code, or the synthesized "ND"
    pub response_code: String,
    /// Issuer authorization code, on approval
    pub auth_code: Option<String>,
    /// Account balance, for balance inquiries
    pub balance: Option<Decimal>,
    /// STAN echoed from the request
    pub stan: String,
    /// RRN echoed from the request
    pub rrn: String,
    /// When the response was finalized
    pub responded_at: DateTime<Utc>,
    /// End-to-end processing time in milliseconds
    pub processing_ms: u64,
}

impl TransactionResponse {
    /// Build a decline with the given code, echoing request identifiers
    pub fn declined(request: &TransactionRequest, code: &str) -> Self {
        Self {
            transaction_id: request.id,
            response_code: code.to_string(),
            auth_code: None,
            balance: None,
            stan: request.stan.clone(),
            rrn: request.rrn.clone(),
            responded_at: Utc::now(),
            processing_ms: 0,
        }
    }

    /// Build an approval with the issuer's authorization code
    pub fn approved(request: &TransactionRequest, auth_code: impl Into<String>) -> Self {
        Self {
            transaction_id: request.id,
            response_code: codes::APPROVED.to_string(),
            auth_code: Some(auth_code.into()),
            balance: None,
            stan: request.stan.clone(),
            rrn: request.rrn.clone(),
            responded_at: Utc::now(),
            processing_ms: 0,
        }
    }

    /// Whether the issuer approved the transaction
    pub fn is_approved(&self) -> bool {
        self.response_code == codes::APPROVED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> TransactionRequest {
        TransactionRequest {
            id: Uuid::new_v4(),
            transaction_type: TransactionType::Withdrawal,
            processing_code: ProcessingCode::parse("012000").unwrap(),
            pan: "4111111111111111".to_string(),
            amount: dec!(1000.00),
            currency: "TWD".to_string(),
            source_account: Some("1234567890".to_string()),
            dest_account: None,
            dest_bank_code: None,
            terminal_id: "ATM00001".to_string(),
            merchant_id: None,
            acquiring_bank: "8220000".to_string(),
            stan: "000001".to_string(),
            rrn: "000000000001".to_string(),
            channel: Channel::Atm,
            pin_block: None,
            mac: None,
            expiry: None,
            received_at: Utc::now(),
            original_id: None,
        }
    }

    #[test]
    fn processing_code_round_trips() {
        let code = ProcessingCode::parse("012000").unwrap();
        assert_eq!(code.as_string(), "012000");
        assert_eq!(code.txn_type, [0, 1]);
    }

    #[test]
    fn processing_code_rejects_non_digits() {
        assert!(ProcessingCode::parse("01200x").is_err());
        assert!(ProcessingCode::parse("0120").is_err());
    }

    #[test]
    fn financial_types_need_reversal_protection() {
        assert!(TransactionType::Withdrawal.is_financial());
        assert!(TransactionType::Transfer.is_financial());
        assert!(!TransactionType::BalanceInquiry.is_financial());
        assert!(!TransactionType::Reversal.is_financial());
    }

    #[test]
    fn fingerprint_binds_acquirer_terminal_stan_date() {
        let req = request();
        let fp = req.fingerprint();
        assert!(fp.starts_with("8220000:ATM00001:000001:"));
    }

    #[test]
    fn approval_echoes_identifiers() {
        let req = request();
        let resp = TransactionResponse::approved(&req, "A00001");
        assert!(resp.is_approved());
        assert_eq!(resp.stan, "000001");
        assert_eq!(resp.auth_code.as_deref(), Some("A00001"));
    }

    #[test]
    fn status_transitions() {
        assert!(TransactionStatus::Approved.is_reversible());
        assert!(TransactionStatus::Declined.is_terminal());
        assert!(!TransactionStatus::Declined.is_reversible());
    }
}
