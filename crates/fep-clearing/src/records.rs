//! Settlement and clearing record types

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Reconciliation status of one settlement detail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchStatus {
    /// Not yet reconciled
    Pending,
    /// Found in our transaction log with matching amount
    Matched,
    /// Absent from our log or divergent
    Unmatched,
    /// Flagged for manual investigation
    Disputed,
}

/// One parsed detail line of the daily settlement file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub settlement_date: NaiveDate,
    /// Switch-assigned transaction reference
    pub transaction_ref: String,
    pub stan: String,
    pub rrn: String,
    /// Four-digit transaction type code
    pub transaction_type: String,
    pub acquiring_bank: String,
    pub issuing_bank: String,
    /// Already masked by the switch, stored as delivered
    pub pan: String,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub terminal_id: String,
    pub merchant_id: String,
    pub auth_code: String,
    pub response_code: String,
    pub is_reversal: bool,
    pub original_ref: String,
    pub channel: String,
    pub match_status: MatchStatus,
}

/// Parsed file header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementHeader {
    pub file_id: String,
    pub version: String,
    pub creation_date: NaiveDate,
}

/// Parsed file trailer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementTrailer {
    pub record_count: u64,
    pub total_amount: Decimal,
    pub debit_amount: Decimal,
    pub credit_amount: Decimal,
    pub debit_count: u64,
    pub credit_count: u64,
    /// Hex checksum over the raw detail bytes; blank means unverified
    pub checksum: String,
}

/// Workflow status of a per-counterparty clearing record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClearingStatus {
    /// Net position computed from matched details
    Calculated,
    /// Operator confirmed the position
    Confirmed,
    /// Submitted to the settlement system
    Submitted,
    /// Funds moved
    Settled,
    /// Submission or settlement failed
    Failed,
}

impl ClearingStatus {
    /// Whether this status may advance to `next`
    pub fn can_advance_to(&self, next: ClearingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Calculated, Self::Confirmed)
                | (Self::Confirmed, Self::Submitted)
                | (Self::Submitted, Self::Settled)
                | (Self::Confirmed, Self::Failed)
                | (Self::Submitted, Self::Failed)
        )
    }
}

impl std::fmt::Display for ClearingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Calculated => "CALCULATED",
            Self::Confirmed => "CONFIRMED",
            Self::Submitted => "SUBMITTED",
            Self::Settled => "SETTLED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Net position against one counterparty bank for one settlement day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearingRecord {
    pub settlement_date: NaiveDate,
    pub counterparty_bank: String,
    pub currency: String,
    /// Amount we pay (we were the issuer)
    pub debit_amount: Decimal,
    pub debit_count: u64,
    /// Amount we receive (we were the acquirer)
    pub credit_amount: Decimal,
    pub credit_count: u64,
    /// credit − debit; negative means we pay
    pub net_amount: Decimal,
    pub status: ClearingStatus,
    pub confirmed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_guards() {
        assert!(ClearingStatus::Calculated.can_advance_to(ClearingStatus::Confirmed));
        assert!(ClearingStatus::Confirmed.can_advance_to(ClearingStatus::Submitted));
        assert!(ClearingStatus::Submitted.can_advance_to(ClearingStatus::Settled));
        assert!(!ClearingStatus::Calculated.can_advance_to(ClearingStatus::Submitted));
        assert!(!ClearingStatus::Settled.can_advance_to(ClearingStatus::Confirmed));
        assert!(ClearingStatus::Submitted.can_advance_to(ClearingStatus::Failed));
    }
}
