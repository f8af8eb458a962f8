//! Per-counterparty netting and the clearing workflow
//!
//! Matched settlement details aggregate into one clearing record per
//! counterparty bank: debit where we issued, credit where we acquired,
//! net = credit − debit. Reversal details contribute negatively to their
//! side. Records then advance CALCULATED → CONFIRMED → SUBMITTED →
//! SETTLED with operator stamps and status guards.

use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ClearingError, ClearingResult};
use crate::records::{ClearingRecord, ClearingStatus, MatchStatus, SettlementRecord};

/// Day-level aggregate over all counterparties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearingSummary {
    pub settlement_date: NaiveDate,
    pub counterparties: usize,
    /// Sum of |net| where net < 0 (what we owe)
    pub net_payable: Decimal,
    /// Sum of net where net > 0 (what we are owed)
    pub net_receivable: Decimal,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub debit_count: u64,
    pub credit_count: u64,
}

/// The clearing engine for one settlement day
pub struct ClearingEngine {
    our_bank: String,
    settlement_date: NaiveDate,
    records: BTreeMap<String, ClearingRecord>,
}

impl ClearingEngine {
    pub fn new(our_bank: impl Into<String>, settlement_date: NaiveDate) -> Self {
        Self {
            our_bank: our_bank.into(),
            settlement_date,
            records: BTreeMap::new(),
        }
    }

    /// Mark each detail Matched or Unmatched against the RRNs we processed
    pub fn reconcile(records: &mut [SettlementRecord], known_rrns: &HashSet<String>) {
        for record in records.iter_mut() {
            record.match_status = if known_rrns.contains(&record.rrn) {
                MatchStatus::Matched
            } else {
                MatchStatus::Unmatched
            };
        }
    }

    /// Aggregate matched details into per-counterparty clearing records.
    /// Returns the records in counterparty order.
    pub fn calculate(&mut self, details: &[SettlementRecord]) -> Vec<ClearingRecord> {
        self.records.clear();
        for detail in details {
            if detail.match_status != MatchStatus::Matched {
                continue;
            }
            let we_issue = detail.issuing_bank == self.our_bank;
            let we_acquire = detail.acquiring_bank == self.our_bank;
            if !we_issue && !we_acquire {
                continue; // not our traffic
            }
            let counterparty = if we_issue {
                detail.acquiring_bank.clone()
            } else {
                detail.issuing_bank.clone()
            };
            let entry = self
                .records
                .entry(counterparty.clone())
                .or_insert_with(|| ClearingRecord {
                    settlement_date: self.settlement_date,
                    counterparty_bank: counterparty,
                    currency: detail.currency.clone(),
                    debit_amount: Decimal::ZERO,
                    debit_count: 0,
                    credit_amount: Decimal::ZERO,
                    credit_count: 0,
                    net_amount: Decimal::ZERO,
                    status: ClearingStatus::Calculated,
                    confirmed_by: None,
                    updated_at: Utc::now(),
                });
            let signed = if detail.is_reversal {
                -detail.amount
            } else {
                detail.amount
            };
            if we_issue {
                entry.debit_amount += signed;
                entry.debit_count += 1;
            } else {
                entry.credit_amount += signed;
                entry.credit_count += 1;
            }
            entry.net_amount = entry.credit_amount - entry.debit_amount;
        }
        info!(
            date = %self.settlement_date,
            counterparties = self.records.len(),
            "clearing positions calculated"
        );
        self.records.values().cloned().collect()
    }

    fn advance(
        &mut self,
        bank: &str,
        next: ClearingStatus,
        operation: &str,
    ) -> ClearingResult<&mut ClearingRecord> {
        let record =
            self.records
                .get_mut(bank)
                .ok_or_else(|| ClearingError::UnknownCounterparty {
                    bank: bank.to_string(),
                })?;
        if !record.status.can_advance_to(next) {
            return Err(ClearingError::InvalidTransition {
                bank: bank.to_string(),
                status: record.status.to_string(),
                operation: operation.to_string(),
            });
        }
        record.status = next;
        record.updated_at = Utc::now();
        Ok(record)
    }

    /// Operator confirmation stamp
    pub fn confirm(&mut self, bank: &str, operator: &str) -> ClearingResult<()> {
        let record = self.advance(bank, ClearingStatus::Confirmed, "confirm")?;
        record.confirmed_by = Some(operator.to_string());
        info!(bank, operator, "clearing record confirmed");
        Ok(())
    }

    /// Hand the confirmed position to the settlement system
    pub fn submit(&mut self, bank: &str) -> ClearingResult<()> {
        self.advance(bank, ClearingStatus::Submitted, "submit")?;
        info!(bank, "clearing record submitted");
        Ok(())
    }

    /// Funds moved
    pub fn settle(&mut self, bank: &str) -> ClearingResult<()> {
        self.advance(bank, ClearingStatus::Settled, "settle")?;
        info!(bank, "clearing record settled");
        Ok(())
    }

    /// Mark a submission failed
    pub fn fail(&mut self, bank: &str) -> ClearingResult<()> {
        self.advance(bank, ClearingStatus::Failed, "fail")?;
        Ok(())
    }

    /// Current record for a counterparty
    pub fn record(&self, bank: &str) -> Option<&ClearingRecord> {
        self.records.get(bank)
    }

    /// Day summary across all counterparties
    pub fn summary(&self) -> ClearingSummary {
        let mut summary = ClearingSummary {
            settlement_date: self.settlement_date,
            counterparties: self.records.len(),
            net_payable: Decimal::ZERO,
            net_receivable: Decimal::ZERO,
            total_debit: Decimal::ZERO,
            total_credit: Decimal::ZERO,
            debit_count: 0,
            credit_count: 0,
        };
        for record in self.records.values() {
            summary.total_debit += record.debit_amount;
            summary.total_credit += record.credit_amount;
            summary.debit_count += record.debit_count;
            summary.credit_count += record.credit_count;
            if record.net_amount < Decimal::ZERO {
                summary.net_payable += -record.net_amount;
            } else {
                summary.net_receivable += record.net_amount;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const OUR_BANK: &str = "8220000";
    const BANK_B: &str = "0040000";
    const BANK_C: &str = "0050000";

    fn detail(acquirer: &str, issuer: &str, amount: Decimal) -> SettlementRecord {
        SettlementRecord {
            settlement_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            transaction_ref: "TX000001".to_string(),
            stan: "000001".to_string(),
            rrn: "000000000001".to_string(),
            transaction_type: "0100".to_string(),
            acquiring_bank: acquirer.to_string(),
            issuing_bank: issuer.to_string(),
            pan: "411111******1111".to_string(),
            amount,
            fee: Decimal::ZERO,
            currency: "901".to_string(),
            terminal_id: "ATM00001".to_string(),
            merchant_id: String::new(),
            auth_code: "A00001".to_string(),
            response_code: "00".to_string(),
            is_reversal: false,
            original_ref: String::new(),
            channel: "ATM".to_string(),
            match_status: MatchStatus::Matched,
        }
    }

    fn engine() -> ClearingEngine {
        ClearingEngine::new(OUR_BANK, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap())
    }

    #[test]
    fn nets_per_counterparty() {
        // We issue 1000 + 2000 to bank B; bank B issues 500 to us
        let details = vec![
            detail(BANK_B, OUR_BANK, dec!(1000.00)),
            detail(BANK_B, OUR_BANK, dec!(2000.00)),
            detail(OUR_BANK, BANK_B, dec!(500.00)),
        ];
        let mut engine = engine();
        let records = engine.calculate(&details);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.counterparty_bank, BANK_B);
        assert_eq!(record.debit_amount, dec!(3000.00));
        assert_eq!(record.debit_count, 2);
        assert_eq!(record.credit_amount, dec!(500.00));
        assert_eq!(record.credit_count, 1);
        assert_eq!(record.net_amount, dec!(-2500.00));
        assert_eq!(record.status, ClearingStatus::Calculated);
    }

    #[test]
    fn conservation_across_counterparties() {
        let details = vec![
            detail(BANK_B, OUR_BANK, dec!(1000.00)),
            detail(OUR_BANK, BANK_B, dec!(300.00)),
            detail(BANK_C, OUR_BANK, dec!(200.00)),
            detail(OUR_BANK, BANK_C, dec!(900.00)),
        ];
        let mut engine = engine();
        let records = engine.calculate(&details);
        let debit: Decimal = records.iter().map(|r| r.debit_amount).sum();
        let credit: Decimal = records.iter().map(|r| r.credit_amount).sum();
        let net: Decimal = records.iter().map(|r| r.net_amount).sum();
        assert_eq!(debit - credit, -net);
        let counts: u64 = records.iter().map(|r| r.debit_count + r.credit_count).sum();
        assert_eq!(counts, 4);
    }

    #[test]
    fn unmatched_records_are_excluded() {
        let mut unmatched = detail(BANK_B, OUR_BANK, dec!(999.00));
        unmatched.match_status = MatchStatus::Unmatched;
        let details = vec![detail(BANK_B, OUR_BANK, dec!(1000.00)), unmatched];
        let mut engine = engine();
        let records = engine.calculate(&details);
        assert_eq!(records[0].debit_amount, dec!(1000.00));
        assert_eq!(records[0].debit_count, 1);
    }

    #[test]
    fn reversal_subtracts_from_its_side() {
        let mut reversal = detail(BANK_B, OUR_BANK, dec!(400.00));
        reversal.is_reversal = true;
        let details = vec![detail(BANK_B, OUR_BANK, dec!(1000.00)), reversal];
        let mut engine = engine();
        let records = engine.calculate(&details);
        assert_eq!(records[0].debit_amount, dec!(600.00));
        assert_eq!(records[0].net_amount, dec!(-600.00));
    }

    #[test]
    fn reconcile_marks_matched_and_unmatched() {
        let mut details = vec![detail(BANK_B, OUR_BANK, dec!(100.00))];
        details[0].match_status = MatchStatus::Pending;
        let mut known = HashSet::new();
        known.insert("000000000001".to_string());
        ClearingEngine::reconcile(&mut details, &known);
        assert_eq!(details[0].match_status, MatchStatus::Matched);

        let mut unknown_details = vec![detail(BANK_B, OUR_BANK, dec!(100.00))];
        ClearingEngine::reconcile(&mut unknown_details, &HashSet::new());
        assert_eq!(unknown_details[0].match_status, MatchStatus::Unmatched);
    }

    #[test]
    fn workflow_walks_to_settled() {
        let details = vec![detail(BANK_B, OUR_BANK, dec!(1000.00))];
        let mut engine = engine();
        engine.calculate(&details);

        engine.confirm(BANK_B, "operator-1").unwrap();
        assert_eq!(
            engine.record(BANK_B).unwrap().confirmed_by.as_deref(),
            Some("operator-1")
        );
        engine.submit(BANK_B).unwrap();
        engine.settle(BANK_B).unwrap();
        assert_eq!(engine.record(BANK_B).unwrap().status, ClearingStatus::Settled);
    }

    #[test]
    fn cannot_submit_unconfirmed() {
        let details = vec![detail(BANK_B, OUR_BANK, dec!(1000.00))];
        let mut engine = engine();
        engine.calculate(&details);
        assert!(matches!(
            engine.submit(BANK_B),
            Err(ClearingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            engine.confirm("9999999", "op"),
            Err(ClearingError::UnknownCounterparty { .. })
        ));
    }

    #[test]
    fn summary_aggregates_payable_and_receivable() {
        let details = vec![
            detail(BANK_B, OUR_BANK, dec!(3000.00)), // we pay B
            detail(OUR_BANK, BANK_B, dec!(500.00)),
            detail(OUR_BANK, BANK_C, dec!(900.00)), // C pays us
            detail(BANK_C, OUR_BANK, dec!(200.00)),
        ];
        let mut engine = engine();
        engine.calculate(&details);
        let summary = engine.summary();
        assert_eq!(summary.counterparties, 2);
        assert_eq!(summary.net_payable, dec!(2500.00));
        assert_eq!(summary.net_receivable, dec!(700.00));
        assert_eq!(summary.debit_count + summary.credit_count, 4);
    }
}
