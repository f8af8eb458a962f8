//! The gateway facade
//!
//! Owns the pipeline wiring: stores, security, validation, routing and
//! processors are constructed once from explicit dependencies and shared
//! by reference. One call to [`Gateway::process`] takes a decoded request
//! through every stage and always returns a response.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use fep_audit::AuditLogger;
use fep_batch::BatchExecutor;
use fep_connection::FiscConnection;
use fep_pipeline::{Pipeline, PipelineListener, Stage};
use fep_router::Router;
use fep_security::{KeyManager, MacAlgorithm};
use fep_store::{DuplicateStore, TransactionRepository};
use fep_types::{
    codes, FepError, Result, RetryConfig, TransactionRequest, TransactionResponse,
};

use crate::handlers::{
    DedupHandler, FinalizeHandler, ProcessingHandler, ReceiveHandler, RoutingHandler,
    SecurityHandler, ValidationHandler,
};
use crate::processors::{
    BalanceInquiryProcessor, FinancialProcessor, NetworkProcessor, ReversalProcessor,
    TransactionProcessor,
};
use crate::retry::RetryPolicy;
use crate::reversal::ReversalService;
use crate::validation::Validator;

/// Gateway-level configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Our institution code, the acquirer side of every request
    pub our_bank: String,
    /// Dedup fingerprint retention
    pub dedup_window: chrono::Duration,
    /// How long an original stays reversible
    pub reversal_window: chrono::Duration,
    /// Dispatch deadline when no routing rule supplies one
    pub default_timeout_ms: u64,
    /// Replay cached responses for completed duplicates instead of
    /// declining 94
    pub replay_completed_duplicates: bool,
    /// Decline requests arriving without a MAC
    pub require_mac: bool,
    /// MAC algorithm expected on the acquiring side
    pub mac_algorithm: MacAlgorithm,
    /// Retry parameters for financial dispatch
    pub financial_retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            our_bank: "8220000".to_string(),
            dedup_window: chrono::Duration::hours(24),
            reversal_window: chrono::Duration::hours(24),
            default_timeout_ms: 10_000,
            replay_completed_duplicates: false,
            require_mac: false,
            mac_algorithm: MacAlgorithm::Iso9797Alg3,
            financial_retry: RetryConfig::financial(),
        }
    }
}

/// The assembled request path
pub struct Gateway {
    pipeline: Pipeline,
    duplicate_store: Arc<DuplicateStore>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        connection: Arc<FiscConnection>,
        keys: Arc<KeyManager>,
        repository: Arc<dyn TransactionRepository>,
        router: Arc<Router>,
        audit: Arc<AuditLogger>,
        validator: Validator,
    ) -> Self {
        let duplicate_store = Arc::new(DuplicateStore::new(config.dedup_window));
        let reversal = Arc::new(ReversalService::new(
            Arc::clone(&connection),
            Arc::clone(&repository),
            config.reversal_window,
        ));

        let processors: Vec<Arc<dyn TransactionProcessor>> = vec![
            Arc::new(
                FinancialProcessor::new(Arc::clone(&connection), Arc::clone(&reversal))
                    .with_policy(RetryPolicy::new(config.financial_retry.clone())),
            ),
            Arc::new(BalanceInquiryProcessor::new(Arc::clone(&connection))),
            Arc::new(ReversalProcessor::new(Arc::clone(&reversal))),
            Arc::new(NetworkProcessor::new(Arc::clone(&connection))),
        ];

        let pipeline = Pipeline::new()
            .register(
                Stage::Receive,
                Arc::new(ReceiveHandler {
                    audit: Arc::clone(&audit),
                    repository: Arc::clone(&repository),
                }),
            )
            .register(
                Stage::DuplicateCheck,
                Arc::new(DedupHandler {
                    store: Arc::clone(&duplicate_store),
                    replay_completed: config.replay_completed_duplicates,
                }),
            )
            .register(
                Stage::SecurityCheck,
                Arc::new(SecurityHandler {
                    keys,
                    mac_algorithm: config.mac_algorithm,
                    require_mac: config.require_mac,
                }),
            )
            .register(
                Stage::Validation,
                Arc::new(ValidationHandler { validator }),
            )
            .register(Stage::Routing, Arc::new(RoutingHandler { router }))
            .register(
                Stage::Processing,
                Arc::new(ProcessingHandler {
                    processors,
                    default_timeout_ms: config.default_timeout_ms,
                }),
            )
            .register(
                Stage::Audit,
                Arc::new(FinalizeHandler {
                    audit,
                    repository,
                    store: Arc::clone(&duplicate_store),
                }),
            );

        info!(our_bank = %config.our_bank, "gateway assembled");
        Self {
            pipeline,
            duplicate_store,
        }
    }

    /// Attach a pipeline listener (monitoring hooks)
    pub fn listen(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.pipeline = self.pipeline.listen(listener);
        self
    }

    /// Run one request through the pipeline. Never errors: every failure
    /// maps to a declined response with the proper code.
    pub async fn process(&self, request: TransactionRequest) -> TransactionResponse {
        let ctx = self.pipeline.execute(request).await;
        match ctx.response {
            Some(response) => response,
            None => TransactionResponse::declined(&ctx.request, codes::SYSTEM_MALFUNCTION),
        }
    }

    /// Sweep expired dedup fingerprints; call periodically
    pub fn purge_expired_fingerprints(&self) -> usize {
        self.duplicate_store.purge_expired()
    }
}

/// Bridges batch completion into the audit trail
pub struct BatchAuditListener {
    pub audit: Arc<AuditLogger>,
}

#[async_trait]
impl fep_batch::BatchListener for BatchAuditListener {
    async fn on_complete(&self, result: &fep_batch::BatchResult) {
        let _ = self
            .audit
            .batch_completed(
                &result.batch_id,
                &format!("{:?}", result.status),
                result.total,
                result.succeeded,
                result.failed,
            )
            .await;
    }

    async fn on_failed(&self, result: &fep_batch::BatchResult) {
        let _ = self
            .audit
            .batch_completed(
                &result.batch_id,
                &format!("{:?}", result.status),
                result.total,
                result.succeeded,
                result.failed,
            )
            .await;
    }
}

#[async_trait]
impl BatchExecutor for Gateway {
    /// Batch items run the full pipeline; a decline is a batch item error
    async fn execute(&self, request: TransactionRequest) -> Result<TransactionResponse> {
        let response = self.process(request).await;
        if response.is_approved() {
            Ok(response)
        } else {
            Err(FepError::system(format!(
                "declined with {}",
                response.response_code
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fep_audit::InMemoryAuditSink;
    use fep_codec::registry::fisc_schema;
    use fep_codec::{Message, MessageAssembler, MessageParser};
    use fep_connection::framing;
    use fep_router::{Destination, RoutingRule};
    use fep_store::InMemoryRepository;
    use fep_types::{
        Channel, ConnectionConfig, EndpointConfig, ProcessingCode, SocketConfig,
        TransactionStatus, TransactionType,
    };
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Single-socket mock switch. Swallows MTIs listed in `silent`,
    /// records every request MTI it sees.
    async fn mock_upstream(
        silent: &'static [&'static str],
        seen: Arc<StdMutex<Vec<String>>>,
    ) -> EndpointConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = conn.into_split();
            let schema = fisc_schema();
            loop {
                let frame = match framing::read_frame(&mut read_half).await {
                    Ok(f) => f,
                    Err(_) => return,
                };
                let request = MessageParser::new(&schema).parse(&frame).unwrap();
                seen.lock().unwrap().push(request.mti().to_string());
                if silent.contains(&request.mti()) {
                    continue;
                }
                let response_mti = match request.mti() {
                    "0100" => "0110",
                    "0200" => "0210",
                    "0400" => "0410",
                    "0800" => "0810",
                    _ => continue,
                };
                let mut response = Message::new(response_mti).unwrap();
                for field in [2u16, 3, 4, 11, 37, 41, 70] {
                    if let Some(value) = request.get_text(field) {
                        response.set(field, value.to_string()).unwrap();
                    }
                }
                response.set(39, "00").unwrap();
                if request.mti() == "0200" {
                    response.set(38, "A00001").unwrap();
                }
                let bytes = MessageAssembler::new(&schema).assemble(&response).unwrap();
                if framing::write_frame(&mut write_half, &bytes).await.is_err() {
                    return;
                }
            }
        });
        EndpointConfig::new("127.0.0.1", port)
    }

    struct Harness {
        gateway: Gateway,
        repository: Arc<InMemoryRepository>,
        seen: Arc<StdMutex<Vec<String>>>,
    }

    async fn harness(silent: &'static [&'static str]) -> Harness {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let endpoint = mock_upstream(silent, Arc::clone(&seen)).await;
        let mut conn_config =
            ConnectionConfig::single("8220000", SocketConfig::for_endpoint(endpoint));
        conn_config.heartbeat_interval_ms = 60_000;
        let connection = Arc::new(FiscConnection::new(conn_config, Arc::new(fisc_schema())));
        connection.connect().await.unwrap();

        let repository = Arc::new(InMemoryRepository::new());
        let router = Arc::new(
            Router::new()
                .add_rule(
                    RoutingRule::new("interbank", 10, Destination::FiscInterbank)
                        .with_timeout_ms(300),
                )
                .with_default(Destination::FiscInterbank, 300),
        );
        let audit = Arc::new(AuditLogger::new(Arc::new(InMemoryAuditSink::new())));
        let keys = Arc::new(KeyManager::new());

        let config = GatewayConfig {
            financial_retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
            },
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(
            config,
            connection,
            keys,
            repository.clone() as Arc<dyn TransactionRepository>,
            router,
            audit,
            Validator::new(),
        );
        Harness {
            gateway,
            repository,
            seen,
        }
    }

    fn withdrawal(stan: &str) -> TransactionRequest {
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
            stan: stan.to_string(),
            rrn: format!("{:0>12}", stan.trim_start_matches('0')),
            channel: Channel::Atm,
            pin_block: None,
            mac: None,
            expiry: None,
            received_at: Utc::now(),
            original_id: None,
        }
    }

    fn financial_mtis(seen: &Arc<StdMutex<Vec<String>>>) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .filter(|m| *m != "0800")
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn withdrawal_round_trip_approves() {
        let h = harness(&[]).await;
        let response = h.gateway.process(withdrawal("000001")).await;
        assert_eq!(response.response_code, "00");
        assert!(response.is_approved());
        assert_eq!(response.auth_code.as_deref(), Some("A00001"));

        let record = h
            .repository
            .find_original("000000000001", "000001", "ATM00001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Approved);
        assert_eq!(financial_mtis(&h.seen), vec!["0200"]);
    }

    #[tokio::test]
    async fn duplicate_within_window_declines_without_second_dispatch() {
        let h = harness(&[]).await;
        let first = withdrawal("000002");
        let mut second = first.clone();
        second.id = Uuid::new_v4();

        let r1 = h.gateway.process(first).await;
        assert!(r1.is_approved());
        let r2 = h.gateway.process(second).await;
        assert_eq!(r2.response_code, codes::DUPLICATE);
        assert!(!r2.is_approved());
        // Exactly one 0200 reached the switch
        assert_eq!(financial_mtis(&h.seen), vec!["0200"]);
    }

    #[tokio::test]
    async fn timeout_retries_then_reverses() {
        let h = harness(&["0200"]).await;
        let request = withdrawal("000003");
        let id = request.id;
        let response = h.gateway.process(request).await;
        assert_eq!(response.response_code, codes::ISSUER_INOPERATIVE);
        assert!(!response.is_approved());

        // Initial dispatch + two retries, then the reversal advice
        let mtis = financial_mtis(&h.seen);
        assert_eq!(mtis, vec!["0200", "0200", "0200", "0400"]);

        let record = h.repository.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Reversed);
        assert!(record.reversed_at.is_some());
    }

    #[tokio::test]
    async fn reversal_request_is_idempotent() {
        let h = harness(&[]).await;
        let original = withdrawal("000004");
        assert!(h.gateway.process(original.clone()).await.is_approved());

        let reversal = TransactionRequest {
            id: Uuid::new_v4(),
            transaction_type: TransactionType::Reversal,
            processing_code: ProcessingCode::parse("022000").unwrap(),
            original_id: Some(original.id),
            received_at: Utc::now(),
            ..original.clone()
        };

        let r1 = h.gateway.process(reversal.clone()).await;
        assert!(r1.is_approved());
        let record = h
            .repository
            .find_by_id(original.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Reversed);

        // The repeat declines as already reversed and sends nothing new
        let dispatched_before = financial_mtis(&h.seen).len();
        let mut repeat = reversal.clone();
        repeat.id = Uuid::new_v4();
        let r2 = h.gateway.process(repeat).await;
        assert_eq!(r2.response_code, codes::DUPLICATE);
        assert_eq!(financial_mtis(&h.seen).len(), dispatched_before);

        let record = h
            .repository
            .find_by_id(original.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Reversed);
    }

    #[tokio::test]
    async fn reversal_of_unknown_original_declines() {
        let h = harness(&[]).await;
        let mut reversal = withdrawal("000005");
        reversal.transaction_type = TransactionType::Reversal;
        reversal.processing_code = ProcessingCode::parse("022000").unwrap();
        let response = h.gateway.process(reversal).await;
        assert_eq!(response.response_code, codes::NOT_PERMITTED);
        assert!(financial_mtis(&h.seen).is_empty());
    }

    #[tokio::test]
    async fn amount_mismatch_blocks_reversal() {
        let h = harness(&[]).await;
        let original = withdrawal("000006");
        assert!(h.gateway.process(original.clone()).await.is_approved());

        let mut reversal = original.clone();
        reversal.id = Uuid::new_v4();
        reversal.transaction_type = TransactionType::Reversal;
        reversal.processing_code = ProcessingCode::parse("022000").unwrap();
        reversal.amount = dec!(999.00);
        let response = h.gateway.process(reversal).await;
        assert_eq!(response.response_code, codes::NOT_PERMITTED);

        let record = h
            .repository
            .find_by_id(original.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Approved);
    }

    #[tokio::test]
    async fn invalid_pan_maps_14() {
        let h = harness(&[]).await;
        let mut request = withdrawal("000007");
        request.pan = "4111111111111112".to_string(); // bad check digit
        let response = h.gateway.process(request).await;
        assert_eq!(response.response_code, codes::INVALID_CARD);
        assert!(financial_mtis(&h.seen).is_empty());
    }

    #[tokio::test]
    async fn over_limit_declines_61_before_dispatch() {
        let h = harness(&[]).await;
        let mut request = withdrawal("000008");
        request.amount = dec!(50000.00);
        let response = h.gateway.process(request).await;
        assert_eq!(response.response_code, codes::LIMIT_EXCEEDED);
        assert!(financial_mtis(&h.seen).is_empty());
    }

    #[tokio::test]
    async fn failed_request_releases_fingerprint_for_retry() {
        let h = harness(&[]).await;
        let mut bad = withdrawal("000009");
        bad.pan = "4111111111111112".to_string();
        assert_eq!(
            h.gateway.process(bad).await.response_code,
            codes::INVALID_CARD
        );

        // Same fingerprint with the corrected PAN goes through
        let good = withdrawal("000009");
        assert!(h.gateway.process(good).await.is_approved());
    }

    #[tokio::test]
    async fn batch_runs_through_gateway_and_audits_summary() {
        use fep_batch::{BatchListener, BatchProcessor, BatchRequest, BatchStatus};
        let h = harness(&[]).await;
        let sink = Arc::new(InMemoryAuditSink::new());
        let listener = BatchAuditListener {
            audit: Arc::new(AuditLogger::new(sink.clone())),
        };
        let transactions: Vec<TransactionRequest> =
            (10..14).map(|n| withdrawal(&format!("{:06}", n))).collect();
        let processor = BatchProcessor::new(Arc::new(h.gateway) as Arc<dyn BatchExecutor>, 8)
            .listen(Arc::new(listener) as Arc<dyn BatchListener>);
        let result = processor
            .process(BatchRequest::new("bulk", transactions).with_parallelism(2))
            .await;
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.succeeded, 4);
        assert_eq!(sink.len(), 1);
    }
}
