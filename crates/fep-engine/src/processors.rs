//! Per-transaction-type processors
//!
//! Each processor builds the outbound wire message from the schema
//! registry conventions, dispatches over the FISC link, and maps the
//! upstream reply back to a business response. Financial dispatch runs
//! under the retry policy with the original STAN on every attempt, and
//! falls into reversal when the retries exhaust on a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{info, warn};

use fep_codec::Message;
use fep_connection::FiscConnection;
use fep_types::{codes, FepError, Result, TransactionRequest, TransactionResponse, TransactionType};

use crate::retry::RetryPolicy;
use crate::reversal::{ReversalOutcome, ReversalService};

/// ISO 4217 numeric code for the accepted alpha codes
pub fn currency_numeric(alpha: &str) -> Result<&'static str> {
    match alpha {
        "TWD" => Ok("901"),
        "USD" => Ok("840"),
        "JPY" => Ok("392"),
        other => Err(FepError::validation(
            "currency",
            format!("no numeric code for {}", other),
        )),
    }
}

/// Amount as the 12-digit fixed-point wire form, two implied decimals
pub fn amount_field(amount: Decimal) -> Result<String> {
    let cents = (amount * Decimal::new(100, 0)).round();
    if cents.is_sign_negative() || cents >= Decimal::from(1_000_000_000_000i64) {
        return Err(FepError::validation(
            "amount",
            format!("{} out of wire range", amount),
        ));
    }
    Ok(format!("{:0>12}", cents.normalize()))
}

/// Build the outbound request message for a transaction
pub fn build_request_message(request: &TransactionRequest) -> Result<Message> {
    let mut message = Message::new(request.transaction_type.request_mti())?;
    let now = Utc::now();
    message.set(2, request.pan.clone())?;
    message.set(3, request.processing_code.as_string())?;
    if request.transaction_type.is_financial()
        || request.transaction_type == TransactionType::Reversal
    {
        message.set(4, amount_field(request.amount)?)?;
    }
    message.set(7, now.format("%m%d%H%M%S").to_string())?;
    message.set(11, request.stan.clone())?;
    message.set(12, now.format("%H%M%S").to_string())?;
    message.set(13, now.format("%m%d").to_string())?;
    if let Some(expiry) = &request.expiry {
        message.set(14, expiry.clone())?;
    }
    message.set(32, request.acquiring_bank.clone())?;
    message.set(37, request.rrn.clone())?;
    message.set(41, request.terminal_id.clone())?;
    if let Some(merchant) = &request.merchant_id {
        message.set(42, merchant.clone())?;
    }
    message.set(49, currency_numeric(&request.currency)?)?;
    if let Some(pin_block) = &request.pin_block {
        message.set(52, pin_block.clone())?;
    }
    if let Some(dest) = &request.dest_account {
        message.set(102, dest.clone())?;
    }
    if let Some(source) = &request.source_account {
        message.set(103, source.clone())?;
    }
    if let Some(mac) = &request.mac {
        message.set(64, mac.clone())?;
    }
    Ok(message)
}

/// Original-data elements (field 90) identifying the reversed dispatch:
/// original MTI, STAN and transmission datetime, zero-padded to the wire
/// width
pub fn original_data_elements(request: &TransactionRequest) -> String {
    let base = format!(
        "{}{}{}",
        request.transaction_type.request_mti(),
        request.stan,
        request.received_at.format("%m%d%H%M%S"),
    );
    format!("{:0<42}", base)
}

/// Parse the account balance out of field 54 (last twelve digits, two
/// implied decimals)
fn parse_balance(additional_amounts: &str) -> Option<Decimal> {
    let digits: String = additional_amounts
        .chars()
        .rev()
        .take(12)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    if digits.len() == 12 && digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse::<i64>().ok().map(|cents| Decimal::new(cents, 2))
    } else {
        None
    }
}

/// Map an upstream reply onto the business response
pub fn map_response(request: &TransactionRequest, reply: &Message) -> TransactionResponse {
    let response_code = reply
        .get_text(39)
        .unwrap_or(codes::SYSTEM_MALFUNCTION)
        .to_string();
    TransactionResponse {
        transaction_id: request.id,
        response_code,
        auth_code: reply.get_text(38).map(str::to_string),
        balance: reply.get_text(54).and_then(parse_balance),
        stan: request.stan.clone(),
        rrn: request.rrn.clone(),
        responded_at: Utc::now(),
        processing_ms: 0,
    }
}

/// Uniform processing contract. Implementations must be idempotent under
/// retry: re-dispatching the same STAN must not double-effect.
#[async_trait]
pub trait TransactionProcessor: Send + Sync {
    /// Whether this processor handles the transaction type
    fn supports(&self, transaction_type: TransactionType) -> bool;

    /// Process to completion within the deadline
    async fn process(
        &self,
        request: &TransactionRequest,
        deadline: Duration,
    ) -> Result<TransactionResponse>;
}

/// Withdrawals, deposits, transfers, purchases and bill payments
pub struct FinancialProcessor {
    connection: Arc<FiscConnection>,
    reversal: Arc<ReversalService>,
    policy: RetryPolicy,
}

impl FinancialProcessor {
    pub fn new(connection: Arc<FiscConnection>, reversal: Arc<ReversalService>) -> Self {
        Self {
            connection,
            reversal,
            policy: RetryPolicy::financial(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl TransactionProcessor for FinancialProcessor {
    fn supports(&self, transaction_type: TransactionType) -> bool {
        transaction_type.is_financial()
    }

    async fn process(
        &self,
        request: &TransactionRequest,
        deadline: Duration,
    ) -> Result<TransactionResponse> {
        let message = build_request_message(request)?;
        let mut attempt = 1u32;
        loop {
            match self.connection.send(&message, deadline).await {
                Ok(reply) => {
                    let response = map_response(request, &reply);
                    if self.policy.retryable_code(&response.response_code)
                        && self.policy.attempts_remain(attempt)
                    {
                        warn!(
                            stan = %request.stan,
                            code = %response.response_code,
                            attempt,
                            "retryable decline, re-dispatching"
                        );
                        sleep(self.policy.delay_after(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) if self.policy.retryable_error(&e) && self.policy.attempts_remain(attempt) => {
                    warn!(stan = %request.stan, error = %e, attempt, "dispatch failed, retrying");
                    sleep(self.policy.delay_after(attempt)).await;
                    attempt += 1;
                }
                Err(e @ FepError::Timeout { .. }) | Err(e @ FepError::Connection { .. }) => {
                    // The dispatch may have effected money upstream;
                    // nullify it before answering the channel.
                    warn!(stan = %request.stan, error = %e, "retries exhausted, reversing");
                    let outcome = self
                        .reversal
                        .reverse_after_timeout(request, deadline)
                        .await;
                    info!(stan = %request.stan, outcome = ?outcome, "timeout reversal finished");
                    return Ok(TransactionResponse::declined(
                        request,
                        codes::ISSUER_INOPERATIVE,
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Balance inquiries: non-financial, no reversal path
pub struct BalanceInquiryProcessor {
    connection: Arc<FiscConnection>,
    policy: RetryPolicy,
}

impl BalanceInquiryProcessor {
    pub fn new(connection: Arc<FiscConnection>) -> Self {
        Self {
            connection,
            policy: RetryPolicy::financial(),
        }
    }
}

#[async_trait]
impl TransactionProcessor for BalanceInquiryProcessor {
    fn supports(&self, transaction_type: TransactionType) -> bool {
        transaction_type == TransactionType::BalanceInquiry
    }

    async fn process(
        &self,
        request: &TransactionRequest,
        deadline: Duration,
    ) -> Result<TransactionResponse> {
        let message = build_request_message(request)?;
        let mut attempt = 1u32;
        loop {
            match self.connection.send(&message, deadline).await {
                Ok(reply) => {
                    let response = map_response(request, &reply);
                    if self.policy.retryable_code(&response.response_code)
                        && self.policy.attempts_remain(attempt)
                    {
                        sleep(self.policy.delay_after(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) if self.policy.retryable_error(&e) && self.policy.attempts_remain(attempt) => {
                    sleep(self.policy.delay_after(attempt)).await;
                    attempt += 1;
                }
                Err(FepError::Timeout { .. }) | Err(FepError::Connection { .. }) => {
                    return Ok(TransactionResponse::declined(
                        request,
                        codes::ISSUER_INOPERATIVE,
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Channel-originated reversals of a prior financial transaction
pub struct ReversalProcessor {
    reversal: Arc<ReversalService>,
}

impl ReversalProcessor {
    pub fn new(reversal: Arc<ReversalService>) -> Self {
        Self { reversal }
    }
}

#[async_trait]
impl TransactionProcessor for ReversalProcessor {
    fn supports(&self, transaction_type: TransactionType) -> bool {
        transaction_type == TransactionType::Reversal
    }

    async fn process(
        &self,
        request: &TransactionRequest,
        deadline: Duration,
    ) -> Result<TransactionResponse> {
        let (outcome, response) = self.reversal.reverse_original(request, deadline).await?;
        info!(
            stan = %request.stan,
            rrn = %request.rrn,
            outcome = ?outcome,
            "reversal processed"
        );
        Ok(response)
    }
}

/// Network management requests originated by operations tooling
pub struct NetworkProcessor {
    connection: Arc<FiscConnection>,
}

impl NetworkProcessor {
    pub fn new(connection: Arc<FiscConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl TransactionProcessor for NetworkProcessor {
    fn supports(&self, transaction_type: TransactionType) -> bool {
        transaction_type == TransactionType::NetworkManagement
    }

    async fn process(
        &self,
        request: &TransactionRequest,
        _deadline: Duration,
    ) -> Result<TransactionResponse> {
        match self.connection.echo_test().await {
            Ok(rtt) => {
                let mut response = TransactionResponse::approved(request, "ECHO");
                response.processing_ms = rtt;
                Ok(response)
            }
            Err(_) => Ok(TransactionResponse::declined(
                request,
                codes::ISSUER_INOPERATIVE,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fep_types::{Channel, ProcessingCode};
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
    fn amount_wire_form() {
        assert_eq!(amount_field(dec!(1000.00)).unwrap(), "000000100000");
        assert_eq!(amount_field(dec!(0.01)).unwrap(), "000000000001");
        assert!(amount_field(dec!(-1)).is_err());
    }

    #[test]
    fn outbound_message_carries_core_fields() {
        let message = build_request_message(&request()).unwrap();
        assert_eq!(message.mti(), "0200");
        assert_eq!(message.get_text(2), Some("4111111111111111"));
        assert_eq!(message.get_text(3), Some("012000"));
        assert_eq!(message.get_text(4), Some("000000100000"));
        assert_eq!(message.get_text(11), Some("000001"));
        assert_eq!(message.get_text(37), Some("000000000001"));
        assert_eq!(message.get_text(41), Some("ATM00001"));
        assert_eq!(message.get_text(49), Some("901"));
        assert_eq!(message.get_text(103), Some("1234567890"));
    }

    #[test]
    fn balance_inquiry_builds_0100_without_amount() {
        let mut req = request();
        req.transaction_type = TransactionType::BalanceInquiry;
        req.processing_code = ProcessingCode::parse("312000").unwrap();
        let message = build_request_message(&req).unwrap();
        assert_eq!(message.mti(), "0100");
        assert!(message.get_text(4).is_none());
    }

    #[test]
    fn response_mapping_reads_reply_fields() {
        let req = request();
        let mut reply = Message::new("0210").unwrap();
        reply.set(11, "000001").unwrap();
        reply.set(38, "A00001").unwrap();
        reply.set(39, "00").unwrap();
        reply.set(54, "0001901C000000054321").unwrap();
        let response = map_response(&req, &reply);
        assert!(response.is_approved());
        assert_eq!(response.auth_code.as_deref(), Some("A00001"));
        assert_eq!(response.balance, Some(dec!(543.21)));
    }

    #[test]
    fn missing_response_code_maps_96() {
        let req = request();
        let mut reply = Message::new("0210").unwrap();
        reply.set(11, "000001").unwrap();
        let response = map_response(&req, &reply);
        assert_eq!(response.response_code, codes::SYSTEM_MALFUNCTION);
    }

    #[test]
    fn original_data_is_wire_width() {
        let elements = original_data_elements(&request());
        assert_eq!(elements.len(), 42);
        assert!(elements.starts_with("0200000001"));
    }

    #[test]
    fn unknown_currency_rejected() {
        let mut req = request();
        req.currency = "EUR".to_string();
        assert!(build_request_message(&req).is_err());
    }
}
