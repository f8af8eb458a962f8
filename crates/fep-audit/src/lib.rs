//! FEP Audit - the masked transaction trail
//!
//! One line per request receipt, one per response (approved or declined),
//! one per error. Every line carries the transaction identifiers, the
//! masked PAN, amount and currency, terminal, acquirer and timing; the
//! clear PAN never reaches a sink. Records are also persisted through the
//! [`AuditSink`] seam for compliance export.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use fep_types::{mask_pan, ErrorCategory, FepError, Result, TransactionRequest, TransactionResponse};

/// Taxonomy of audited events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEvent {
    /// A request entered the pipeline
    RequestReceived,
    /// The issuer approved
    ResponseApproved,
    /// The issuer or a local stage declined
    ResponseDeclined,
    /// Processing terminated with an error
    ProcessingError,
    /// A reversal was issued for a prior transaction
    ReversalIssued,
    /// A batch run finished
    BatchCompleted,
    /// Network management traffic (sign-on, echo, key exchange)
    NetworkManagement,
}

/// One persisted audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub event: AuditEvent,
    pub transaction_type: String,
    /// Always masked before construction
    pub masked_pan: String,
    pub amount: Decimal,
    pub currency: String,
    pub terminal_id: String,
    pub acquiring_bank: String,
    pub stan: String,
    pub rrn: String,
    pub response_code: Option<String>,
    pub processing_ms: Option<u64>,
    /// Error category, on error events
    pub error_category: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Free-form supplementary detail
    pub detail: serde_json::Value,
}

/// Compliance persistence seam
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a record
    async fn append(&self, record: AuditRecord) -> Result<()>;

    /// Export records in a time range
    async fn export(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditRecord>>;
}

/// In-memory sink for tests and single-node deployments
#[derive(Default)]
pub struct InMemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.records.write().push(record);
        Ok(())
    }

    async fn export(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| from.map_or(true, |f| r.recorded_at >= f))
            .filter(|r| to.map_or(true, |t| r.recorded_at <= t))
            .cloned()
            .collect())
    }
}

/// The audit logger used by the pipeline's AUDIT stage
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    fn base_record(&self, request: &TransactionRequest, event: AuditEvent) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            transaction_id: request.id,
            event,
            transaction_type: format!("{:?}", request.transaction_type),
            masked_pan: mask_pan(&request.pan),
            amount: request.amount,
            currency: request.currency.clone(),
            terminal_id: request.terminal_id.clone(),
            acquiring_bank: request.acquiring_bank.clone(),
            stan: request.stan.clone(),
            rrn: request.rrn.clone(),
            response_code: None,
            processing_ms: None,
            error_category: None,
            recorded_at: Utc::now(),
            detail: serde_json::Value::Null,
        }
    }

    /// One line per request receipt
    pub async fn request_received(&self, request: &TransactionRequest) -> Result<()> {
        info!(
            transaction_id = %request.id,
            transaction_type = ?request.transaction_type,
            pan = %mask_pan(&request.pan),
            amount = %request.amount,
            currency = %request.currency,
            terminal = %request.terminal_id,
            acquirer = %request.acquiring_bank,
            stan = %request.stan,
            rrn = %request.rrn,
            channel = ?request.channel,
            "request received"
        );
        self.sink
            .append(self.base_record(request, AuditEvent::RequestReceived))
            .await
    }

    /// One line per response, approved or declined
    pub async fn response_sent(
        &self,
        request: &TransactionRequest,
        response: &TransactionResponse,
    ) -> Result<()> {
        let event = if response.is_approved() {
            AuditEvent::ResponseApproved
        } else {
            AuditEvent::ResponseDeclined
        };
        info!(
            transaction_id = %request.id,
            pan = %mask_pan(&request.pan),
            response_code = %response.response_code,
            auth_code = response.auth_code.as_deref().unwrap_or("-"),
            processing_ms = response.processing_ms,
            approved = response.is_approved(),
            "response sent"
        );
        let mut record = self.base_record(request, event);
        record.response_code = Some(response.response_code.clone());
        record.processing_ms = Some(response.processing_ms);
        self.sink.append(record).await
    }

    /// One line per terminating error. Business declines go through
    /// `response_sent`; this is for parse/security/system failures.
    pub async fn processing_error(
        &self,
        request: &TransactionRequest,
        err: &FepError,
    ) -> Result<()> {
        // System errors carry their full rendering; business declines stay
        // terse
        if err.category() == ErrorCategory::System {
            error!(
                transaction_id = %request.id,
                pan = %mask_pan(&request.pan),
                category = ?err.category(),
                error = %err,
                "processing failed"
            );
        } else {
            warn!(
                transaction_id = %request.id,
                pan = %mask_pan(&request.pan),
                category = ?err.category(),
                response_code = err.response_code(),
                "processing declined"
            );
        }
        let mut record = self.base_record(request, AuditEvent::ProcessingError);
        record.response_code = Some(err.response_code().to_string());
        record.error_category = Some(format!("{:?}", err.category()));
        record.detail = serde_json::json!({ "error": err.to_string() });
        self.sink.append(record).await
    }

    /// Record a reversal issued against an original transaction
    pub async fn reversal_issued(
        &self,
        request: &TransactionRequest,
        original_id: Uuid,
        outcome: &str,
    ) -> Result<()> {
        info!(
            transaction_id = %request.id,
            original_id = %original_id,
            outcome,
            "reversal issued"
        );
        let mut record = self.base_record(request, AuditEvent::ReversalIssued);
        record.detail = serde_json::json!({
            "original_id": original_id.to_string(),
            "outcome": outcome,
        });
        self.sink.append(record).await
    }

    /// One summary line per finished batch run
    pub async fn batch_completed(
        &self,
        batch_id: &str,
        status: &str,
        total: usize,
        succeeded: usize,
        failed: usize,
    ) -> Result<()> {
        info!(batch_id, status, total, succeeded, failed, "batch finished");
        let record = AuditRecord {
            id: Uuid::new_v4(),
            transaction_id: Uuid::nil(),
            event: AuditEvent::BatchCompleted,
            transaction_type: "Batch".to_string(),
            masked_pan: String::new(),
            amount: Decimal::ZERO,
            currency: String::new(),
            terminal_id: String::new(),
            acquiring_bank: String::new(),
            stan: String::new(),
            rrn: String::new(),
            response_code: None,
            processing_ms: None,
            error_category: None,
            recorded_at: Utc::now(),
            detail: serde_json::json!({
                "batch_id": batch_id,
                "status": status,
                "total": total,
                "succeeded": succeeded,
                "failed": failed,
            }),
        };
        self.sink.append(record).await
    }

    /// Export the compliance trail
    pub async fn export(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditRecord>> {
        self.sink.export(from, to).await
    }
}
