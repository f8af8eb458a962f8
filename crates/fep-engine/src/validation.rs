//! Request validation
//!
//! Format violations (card number, processing code, currency) surface as
//! validation errors mapped to code 14; business limits decline in place
//! with their own codes (54 expired, 61 over limit) without treating the
//! request as malformed.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;

use fep_types::{codes, Channel, FepError, Result, TransactionRequest};

/// Outcome of validating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Constraints hold
    Valid,
    /// Business decline with a specific response code
    Declined { code: &'static str, reason: String },
}

/// Field and limit checks applied before routing
pub struct Validator {
    /// Accepted ISO alpha currency codes
    currencies: HashSet<String>,
    /// Per-channel single-transaction ceilings
    ceilings: HashMap<Channel, Decimal>,
}

impl Validator {
    /// TWD-only validator with the standard ATM ceiling
    pub fn new() -> Self {
        let mut currencies = HashSet::new();
        currencies.insert("TWD".to_string());
        let mut ceilings = HashMap::new();
        ceilings.insert(Channel::Atm, Decimal::new(2_000_000, 2)); // 20,000.00
        Self {
            currencies,
            ceilings,
        }
    }

    pub fn allow_currency(mut self, code: impl Into<String>) -> Self {
        self.currencies.insert(code.into());
        self
    }

    pub fn with_ceiling(mut self, channel: Channel, ceiling: Decimal) -> Self {
        self.ceilings.insert(channel, ceiling);
        self
    }

    /// Luhn check over a digit string
    pub fn luhn_valid(pan: &str) -> bool {
        if pan.is_empty() || !pan.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        let sum: u32 = pan
            .bytes()
            .rev()
            .enumerate()
            .map(|(i, b)| {
                let digit = (b - b'0') as u32;
                if i % 2 == 1 {
                    let doubled = digit * 2;
                    if doubled > 9 {
                        doubled - 9
                    } else {
                        doubled
                    }
                } else {
                    digit
                }
            })
            .sum();
        sum % 10 == 0
    }

    /// Apply every check. Format violations are errors; limit violations
    /// are declines.
    pub fn validate(&self, request: &TransactionRequest) -> Result<ValidationOutcome> {
        if request.pan.len() < 13
            || request.pan.len() > 19
            || !request.pan.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(FepError::validation("pan", "must be 13-19 digits"));
        }
        if !Self::luhn_valid(&request.pan) {
            return Err(FepError::validation("pan", "check digit mismatch"));
        }
        if request.stan.len() != 6 || !request.stan.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FepError::validation("stan", "must be 6 digits"));
        }
        if request.rrn.len() != 12 {
            return Err(FepError::validation("rrn", "must be 12 characters"));
        }
        if request.terminal_id.is_empty() || request.terminal_id.len() > 8 {
            return Err(FepError::validation("terminal_id", "must be 1-8 characters"));
        }
        if !self.currencies.contains(&request.currency) {
            return Err(FepError::validation(
                "currency",
                format!("{} not accepted", request.currency),
            ));
        }
        let expected_prefix = request.transaction_type.processing_prefix();
        let actual_prefix = &request.processing_code.as_string()[..2];
        if actual_prefix != expected_prefix {
            return Err(FepError::validation(
                "processing_code",
                format!("prefix {} does not match type", actual_prefix),
            ));
        }
        if request.transaction_type.is_financial() && request.amount <= Decimal::ZERO {
            return Err(FepError::validation("amount", "must be positive"));
        }

        if let Some(expiry) = &request.expiry {
            if expiry.len() != 4 || !expiry.bytes().all(|b| b.is_ascii_digit()) {
                return Err(FepError::validation("expiry", "must be YYMM"));
            }
            let year = 2000 + expiry[..2].parse::<i32>().expect("digits");
            let month = expiry[2..].parse::<u32>().expect("digits");
            if !(1..=12).contains(&month) {
                return Err(FepError::validation("expiry", "month out of range"));
            }
            let now = Utc::now();
            if (year, month) < (now.year(), now.month()) {
                return Ok(ValidationOutcome::Declined {
                    code: codes::EXPIRED_CARD,
                    reason: format!("card expired {}", expiry),
                });
            }
        }

        if let Some(ceiling) = self.ceilings.get(&request.channel) {
            if request.transaction_type.is_financial() && request.amount > *ceiling {
                return Ok(ValidationOutcome::Declined {
                    code: codes::LIMIT_EXCEEDED,
                    reason: format!("amount {} over {} ceiling", request.amount, ceiling),
                });
            }
        }

        Ok(ValidationOutcome::Valid)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fep_types::{ProcessingCode, TransactionType};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

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
    fn valid_request_passes() {
        assert_eq!(
            Validator::new().validate(&request()).unwrap(),
            ValidationOutcome::Valid
        );
    }

    #[test]
    fn luhn() {
        assert!(Validator::luhn_valid("4111111111111111"));
        assert!(Validator::luhn_valid("5500005555555559"));
        assert!(!Validator::luhn_valid("4111111111111112"));
        assert!(!Validator::luhn_valid("411111111111111x"));
    }

    #[test]
    fn bad_pan_is_validation_error() {
        let mut req = request();
        req.pan = "4111111111111112".to_string();
        let err = Validator::new().validate(&req).unwrap_err();
        assert!(matches!(err, FepError::Validation { ref field, .. } if field == "pan"));
        assert_eq!(err.response_code(), codes::INVALID_CARD);
    }

    #[test]
    fn wrong_currency_rejected() {
        let mut req = request();
        req.currency = "USD".to_string();
        assert!(Validator::new().validate(&req).is_err());
        assert!(Validator::new()
            .allow_currency("USD")
            .validate(&req)
            .is_ok());
    }

    #[test]
    fn processing_code_must_match_type() {
        let mut req = request();
        req.processing_code = ProcessingCode::parse("402000").unwrap();
        let err = Validator::new().validate(&req).unwrap_err();
        assert!(
            matches!(err, FepError::Validation { ref field, .. } if field == "processing_code")
        );
    }

    #[test]
    fn over_ceiling_declines_61() {
        let mut req = request();
        req.amount = dec!(50000.00);
        match Validator::new().validate(&req).unwrap() {
            ValidationOutcome::Declined { code, .. } => assert_eq!(code, codes::LIMIT_EXCEEDED),
            other => panic!("expected decline, got {:?}", other),
        }
    }

    #[test]
    fn expired_card_declines_54() {
        let mut req = request();
        req.expiry = Some("2001".to_string());
        match Validator::new().validate(&req).unwrap() {
            ValidationOutcome::Declined { code, .. } => assert_eq!(code, codes::EXPIRED_CARD),
            other => panic!("expected decline, got {:?}", other),
        }
    }

    #[test]
    fn malformed_expiry_is_error() {
        let mut req = request();
        req.expiry = Some("13AB".to_string());
        assert!(Validator::new().validate(&req).is_err());
        req.expiry = Some("2613".to_string());
        assert!(Validator::new().validate(&req).is_err());
    }

    #[test]
    fn zero_amount_financial_rejected() {
        let mut req = request();
        req.amount = dec!(0);
        assert!(Validator::new().validate(&req).is_err());
    }
}
