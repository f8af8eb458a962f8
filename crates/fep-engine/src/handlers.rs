//! Pipeline handlers wiring the stages to the stores and services

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fep_audit::AuditLogger;
use fep_pipeline::{PipelineContext, PipelineHandler};
use fep_router::Router;
use fep_security::{KeyManager, MacAlgorithm, MacService, PinCrypto};
use fep_store::{DuplicateCheck, DuplicateStore, TransactionRecord, TransactionRepository};
use fep_types::{
    ErrorCategory, FepError, Result, TransactionRequest, TransactionResponse, TransactionStatus,
    TransactionType,
};

use crate::processors::TransactionProcessor;
use crate::validation::{ValidationOutcome, Validator};

const ATTR_DEDUP: &str = "dedup";

/// The byte sequence the request MAC covers
pub fn mac_body(request: &TransactionRequest) -> Vec<u8> {
    format!(
        "{}{}{}{}{}{}",
        request.stan,
        request.rrn,
        request.pan,
        request.amount,
        request.terminal_id,
        request.processing_code,
    )
    .into_bytes()
}

/// RECEIVE: audit the receipt and persist the PENDING record
pub struct ReceiveHandler {
    pub audit: Arc<AuditLogger>,
    pub repository: Arc<dyn TransactionRepository>,
}

#[async_trait]
impl PipelineHandler for ReceiveHandler {
    fn name(&self) -> &str {
        "receive"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        self.audit.request_received(&ctx.request).await?;
        self.repository
            .save(TransactionRecord::pending(ctx.request.clone()))
            .await
    }
}

/// DUPLICATE_CHECK: fingerprint registration. Reversals skip the check -
/// they intentionally reuse the original's STAN and are made idempotent
/// by the reversal service itself.
pub struct DedupHandler {
    pub store: Arc<DuplicateStore>,
    /// Replay the cached response for completed fingerprints instead of
    /// declining 94
    pub replay_completed: bool,
}

#[async_trait]
impl PipelineHandler for DedupHandler {
    fn name(&self) -> &str {
        "dedup"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        if ctx.request.transaction_type == TransactionType::Reversal {
            return Ok(());
        }
        let fingerprint = ctx.request.fingerprint();
        match self.store.check_and_register(&fingerprint) {
            DuplicateCheck::New => {
                ctx.attributes
                    .insert(ATTR_DEDUP.to_string(), serde_json::json!("new"));
                Ok(())
            }
            DuplicateCheck::InFlight => Err(FepError::Duplicate { fingerprint }),
            DuplicateCheck::Completed(cached) => {
                if self.replay_completed {
                    debug!(fingerprint = %fingerprint, "replaying cached response");
                    ctx.attributes
                        .insert(ATTR_DEDUP.to_string(), serde_json::json!("replay"));
                    ctx.response = Some(cached);
                    ctx.continue_processing = false;
                    Ok(())
                } else {
                    Err(FepError::Duplicate { fingerprint })
                }
            }
        }
    }
}

/// SECURITY_CHECK: MAC verification and PIN block sanity under the
/// current keys
pub struct SecurityHandler {
    pub keys: Arc<KeyManager>,
    pub mac_algorithm: MacAlgorithm,
    /// Decline requests that arrive without a MAC
    pub require_mac: bool,
}

#[async_trait]
impl PipelineHandler for SecurityHandler {
    fn name(&self) -> &str {
        "security"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        match &ctx.request.mac {
            Some(mac) => {
                let service = MacService::new(&self.keys);
                let body = mac_body(&ctx.request);
                let valid = service
                    .verify(self.mac_algorithm, None, &body, mac)
                    .map_err(FepError::from)?;
                if !valid {
                    return Err(FepError::security("MAC mismatch"));
                }
            }
            None if self.require_mac => {
                return Err(FepError::security("MAC required but absent"));
            }
            None => {}
        }

        if let Some(pin_bytes) = &ctx.request.pin_block {
            let data: [u8; 8] = pin_bytes
                .as_slice()
                .try_into()
                .map_err(|_| FepError::InvalidPin)?;
            let pek = self
                .keys
                .current_key_id(fep_security::KeyType::Pek)
                .map_err(FepError::from)?;
            let block = fep_security::PinBlock::from_encrypted(
                fep_security::PinFormat::Iso0,
                data,
                pek,
            );
            let crypto = PinCrypto::new(&self.keys);
            let clear = crypto.decrypt(&block).map_err(FepError::from)?;
            // Extraction validates the block structure; the PIN itself is
            // dropped and zeroized immediately
            crypto
                .extract_pin(&clear, &ctx.request.pan)
                .map_err(FepError::from)?;
        }
        Ok(())
    }
}

/// VALIDATION: field constraints error out; business limits decline in
/// place
pub struct ValidationHandler {
    pub validator: Validator,
}

#[async_trait]
impl PipelineHandler for ValidationHandler {
    fn name(&self) -> &str {
        "validation"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        match self.validator.validate(&ctx.request)? {
            ValidationOutcome::Valid => Ok(()),
            ValidationOutcome::Declined { code, reason } => {
                debug!(code, reason = %reason, "validation declined");
                ctx.attributes
                    .insert("decline_reason".to_string(), serde_json::json!(reason));
                ctx.response = Some(TransactionResponse::declined(&ctx.request, code));
                ctx.continue_processing = false;
                Ok(())
            }
        }
    }
}

/// ROUTING: first-match rule selection
pub struct RoutingHandler {
    pub router: Arc<Router>,
}

#[async_trait]
impl PipelineHandler for RoutingHandler {
    fn name(&self) -> &str {
        "routing"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        ctx.routing = Some(self.router.route(&ctx.request)?);
        Ok(())
    }
}

/// PROCESSING: dispatch through the matching processor under the route's
/// timeout
pub struct ProcessingHandler {
    pub processors: Vec<Arc<dyn TransactionProcessor>>,
    pub default_timeout_ms: u64,
}

#[async_trait]
impl PipelineHandler for ProcessingHandler {
    fn name(&self) -> &str {
        "processing"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        if ctx.response.is_some() {
            return Ok(()); // already answered upstream of this stage
        }
        let timeout_ms = ctx
            .routing
            .as_ref()
            .map(|r| r.timeout_ms)
            .unwrap_or(self.default_timeout_ms);
        let deadline = std::time::Duration::from_millis(timeout_ms);
        let transaction_type = ctx.request.transaction_type;
        let processor = self
            .processors
            .iter()
            .find(|p| p.supports(transaction_type))
            .ok_or_else(|| FepError::Routing {
                reason: format!("no processor for {:?}", transaction_type),
            })?;
        let response = processor.process(&ctx.request, deadline).await?;
        ctx.response = Some(response);
        Ok(())
    }
}

/// AUDIT: final audit line, dedup-store completion and repository status.
/// Runs in every outcome, including errors and short-circuits.
pub struct FinalizeHandler {
    pub audit: Arc<AuditLogger>,
    pub repository: Arc<dyn TransactionRepository>,
    pub store: Arc<DuplicateStore>,
}

impl FinalizeHandler {
    async fn final_status(
        &self,
        ctx: &PipelineContext,
        response: &TransactionResponse,
    ) -> TransactionStatus {
        // A reversal may already have marked the record; never downgrade it
        if let Ok(Some(record)) = self.repository.find_by_id(ctx.request.id).await {
            if record.status == TransactionStatus::Reversed {
                return TransactionStatus::Reversed;
            }
        }
        match ctx.error.as_ref().map(FepError::category) {
            Some(ErrorCategory::Timeout) => TransactionStatus::TimedOut,
            Some(ErrorCategory::Validation) | Some(ErrorCategory::Duplicate) => {
                TransactionStatus::Declined
            }
            Some(_) => TransactionStatus::Failed,
            None if response.is_approved() => TransactionStatus::Approved,
            None => TransactionStatus::Declined,
        }
    }
}

#[async_trait]
impl PipelineHandler for FinalizeHandler {
    fn name(&self) -> &str {
        "finalize"
    }

    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()> {
        let fingerprint = ctx.request.fingerprint();
        let dedup_state = ctx
            .attributes
            .get(ATTR_DEDUP)
            .and_then(|v| v.as_str())
            .unwrap_or("");

        if let Some(error) = &ctx.error {
            self.audit.processing_error(&ctx.request, error).await?;
            // Release the fingerprint we registered unless the error IS the
            // duplicate decline (the entry belongs to the first submission)
            if dedup_state == "new" && error.category() != ErrorCategory::Duplicate {
                self.store.forget(&fingerprint);
            }
        }

        let Some(response) = ctx.response.clone() else {
            return Ok(());
        };

        if ctx.error.is_none() {
            self.audit.response_sent(&ctx.request, &response).await?;
        }
        if dedup_state == "replay" {
            return Ok(()); // the original outcome already persisted
        }
        if dedup_state == "new" && ctx.error.is_none() {
            self.store.complete(&fingerprint, response.clone());
        }
        let status = self.final_status(ctx, &response).await;
        self.repository
            .complete(ctx.request.id, response, status)
            .await
    }
}
