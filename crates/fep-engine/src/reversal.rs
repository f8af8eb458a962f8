//! Reversal issuance with exactly-once semantics
//!
//! A reversal nullifies the monetary effect of a prior financial request.
//! Eligibility: the original is found by (RRN, STAN, terminal), its
//! status still admits reversal, it has not already been reversed, the
//! reversal window has not elapsed, and the amount matches exactly. The
//! REVERSED mark is a compare-and-set, so concurrent attempts resolve to
//! one winner and an "already reversed" decline for everyone else.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use fep_codec::Message;
use fep_connection::FiscConnection;
use fep_store::TransactionRepository;
use fep_types::{
    codes, Result, TransactionRequest, TransactionResponse, TransactionStatus,
};

use crate::processors::{amount_field, build_request_message, original_data_elements};

/// What a reversal attempt concluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversalOutcome {
    /// The original is now REVERSED
    Reversed,
    /// Someone already reversed it; idempotent success path
    AlreadyReversed,
    /// Eligibility failed (not found, window elapsed, amount mismatch)
    NotEligible(String),
    /// The upstream declined or the advice could not be delivered
    Failed(String),
}

/// Issues MTI 0400 reversals and maintains the original's status
pub struct ReversalService {
    connection: Arc<FiscConnection>,
    repository: Arc<dyn TransactionRepository>,
    /// How long after receipt an original stays reversible
    window: chrono::Duration,
}

impl ReversalService {
    pub fn new(
        connection: Arc<FiscConnection>,
        repository: Arc<dyn TransactionRepository>,
        window: chrono::Duration,
    ) -> Self {
        Self {
            connection,
            repository,
            window,
        }
    }

    /// Build the MTI 0400 advice from the original request: same STAN,
    /// RRN, terminal and amount, plus the original-data elements.
    fn build_reversal_message(original: &TransactionRequest) -> Result<Message> {
        let financial = build_request_message(original)?;
        let mut reversal = Message::new("0400")?;
        // The PIN block is deliberately not carried into the advice
        for number in [2u16, 3, 7, 11, 12, 13, 32, 37, 41, 49] {
            if let Some(value) = financial.get_text(number) {
                reversal.set(number, value.to_string())?;
            }
        }
        reversal.set(4, amount_field(original.amount)?)?;
        reversal.set(90, original_data_elements(original))?;
        Ok(reversal)
    }

    /// Reversal path for a timed-out financial dispatch: the gateway owns
    /// the original request and its PENDING record.
    pub async fn reverse_after_timeout(
        &self,
        original: &TransactionRequest,
        deadline: Duration,
    ) -> ReversalOutcome {
        let message = match Self::build_reversal_message(original) {
            Ok(m) => m,
            Err(e) => return ReversalOutcome::Failed(e.to_string()),
        };
        match self.connection.send(&message, deadline).await {
            Ok(reply) if reply.get_text(39) == Some("00") => {
                let marked = self
                    .repository
                    .compare_and_set_status(
                        original.id,
                        &[
                            TransactionStatus::Pending,
                            TransactionStatus::Approved,
                            TransactionStatus::TimedOut,
                        ],
                        TransactionStatus::Reversed,
                    )
                    .await;
                match marked {
                    Ok(true) => {
                        info!(stan = %original.stan, "original marked REVERSED");
                        ReversalOutcome::Reversed
                    }
                    Ok(false) => ReversalOutcome::AlreadyReversed,
                    Err(e) => ReversalOutcome::Failed(e.to_string()),
                }
            }
            Ok(reply) => {
                let code = reply.get_text(39).unwrap_or("??").to_string();
                warn!(stan = %original.stan, code = %code, "reversal declined upstream");
                ReversalOutcome::Failed(format!("upstream declined {}", code))
            }
            Err(e) => {
                warn!(stan = %original.stan, error = %e, "reversal advice undeliverable");
                ReversalOutcome::Failed(e.to_string())
            }
        }
    }

    /// Reversal path for a channel-originated reversal request carrying
    /// the original's (RRN, STAN, terminal).
    pub async fn reverse_original(
        &self,
        request: &TransactionRequest,
        deadline: Duration,
    ) -> Result<(ReversalOutcome, TransactionResponse)> {
        let original = self
            .repository
            .find_original(&request.rrn, &request.stan, &request.terminal_id)
            .await?;

        let Some(record) = original else {
            let outcome =
                ReversalOutcome::NotEligible("original not found".to_string());
            return Ok((
                outcome,
                TransactionResponse::declined(request, codes::NOT_PERMITTED),
            ));
        };

        if record.status == TransactionStatus::Reversed {
            // Idempotent repeat
            return Ok((
                ReversalOutcome::AlreadyReversed,
                TransactionResponse::declined(request, codes::DUPLICATE),
            ));
        }
        if !record.status.is_reversible() {
            let outcome = ReversalOutcome::NotEligible(format!(
                "status {:?} not reversible",
                record.status
            ));
            return Ok((
                outcome,
                TransactionResponse::declined(request, codes::NOT_PERMITTED),
            ));
        }
        if Utc::now() - record.request.received_at > self.window {
            return Ok((
                ReversalOutcome::NotEligible("reversal window elapsed".to_string()),
                TransactionResponse::declined(request, codes::NOT_PERMITTED),
            ));
        }
        if record.request.amount != request.amount {
            return Ok((
                ReversalOutcome::NotEligible(format!(
                    "amount {} does not match original {}",
                    request.amount, record.request.amount
                )),
                TransactionResponse::declined(request, codes::NOT_PERMITTED),
            ));
        }

        let message = Self::build_reversal_message(&record.request)?;
        match self.connection.send(&message, deadline).await {
            Ok(reply) if reply.get_text(39) == Some("00") => {
                let won = self
                    .repository
                    .compare_and_set_status(
                        record.request.id,
                        &[
                            TransactionStatus::Pending,
                            TransactionStatus::Approved,
                            TransactionStatus::TimedOut,
                        ],
                        TransactionStatus::Reversed,
                    )
                    .await?;
                if won {
                    let mut response = TransactionResponse::approved(request, "");
                    response.auth_code = reply.get_text(38).map(str::to_string);
                    Ok((ReversalOutcome::Reversed, response))
                } else {
                    // A concurrent reversal won the compare-and-set
                    Ok((
                        ReversalOutcome::AlreadyReversed,
                        TransactionResponse::declined(request, codes::DUPLICATE),
                    ))
                }
            }
            Ok(reply) => {
                let code = reply.get_text(39).unwrap_or("96").to_string();
                Ok((
                    ReversalOutcome::Failed(format!("upstream declined {}", code)),
                    TransactionResponse::declined(request, &code),
                ))
            }
            Err(e) => {
                warn!(stan = %request.stan, error = %e, "reversal dispatch failed");
                Ok((
                    ReversalOutcome::Failed(e.to_string()),
                    TransactionResponse::declined(request, codes::ISSUER_INOPERATIVE),
                ))
            }
        }
    }
}
