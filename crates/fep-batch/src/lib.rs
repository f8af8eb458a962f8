//! FEP Batch - bulk payment execution with bounded parallelism
//!
//! A batch runs sequentially at parallelism 1, otherwise each transaction
//! is submitted under a semaphore limiting in-flight work. Per-item
//! failures become [`BatchItemError`]s; with `continue_on_error` false the
//! first failure stops further submissions while in-flight items drain.
//! Listeners observe start, throttled progress, per-item completion and
//! the final outcome.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use fep_types::{Result, TransactionRequest, TransactionResponse};

/// Final status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Every transaction succeeded
    Completed,
    /// Every transaction failed
    Failed,
    /// Mixed outcomes
    CompletedWithErrors,
}

/// A batch of transactions to execute
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: String,
    /// Free-form batch kind, e.g. "payroll" or "bill-payments"
    pub batch_type: String,
    pub transactions: Vec<TransactionRequest>,
    /// Keep going after a per-item failure
    pub continue_on_error: bool,
    /// Requested in-flight bound; clamped by the processor capacity
    pub parallelism: usize,
}

impl BatchRequest {
    pub fn new(batch_type: impl Into<String>, transactions: Vec<TransactionRequest>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            batch_type: batch_type.into(),
            transactions,
            continue_on_error: true,
            parallelism: 1,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn stop_on_error(mut self) -> Self {
        self.continue_on_error = false;
        self
    }
}

/// One failed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub index: usize,
    pub transaction_id: Uuid,
    pub error: String,
}

/// Outcome of one batch run
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items never submitted because the batch stopped on error
    pub skipped: usize,
    pub errors: Vec<BatchItemError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The per-item work seam; the gateway implements it over the pipeline
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, request: TransactionRequest) -> Result<TransactionResponse>;
}

/// Observer of batch lifecycle events
#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_start(&self, _batch: &BatchRequest) {}
    /// Fired when completion crosses each 10% boundary
    async fn on_progress(&self, _batch_id: &str, _completed: usize, _total: usize) {}
    async fn on_item(
        &self,
        _batch_id: &str,
        _request: &TransactionRequest,
        _outcome: &Result<TransactionResponse>,
    ) {
    }
    async fn on_complete(&self, _result: &BatchResult) {}
    async fn on_failed(&self, _result: &BatchResult) {}
}

/// Throttles progress callbacks to 10% steps
struct ProgressGate {
    total: usize,
    completed: AtomicUsize,
    last_decile: AtomicUsize,
}

impl ProgressGate {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            last_decile: AtomicUsize::new(0),
        }
    }

    /// Returns the completion count when a 10% boundary was crossed
    fn advance(&self) -> Option<usize> {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let decile = done * 10 / self.total.max(1);
        let previous = self.last_decile.swap(decile, Ordering::SeqCst);
        (decile > previous).then_some(done)
    }
}

/// Runs batches against the executor with a capacity ceiling
pub struct BatchProcessor {
    executor: Arc<dyn BatchExecutor>,
    listeners: Vec<Arc<dyn BatchListener>>,
    /// Upper bound on any batch's parallelism
    capacity: usize,
}

impl BatchProcessor {
    pub fn new(executor: Arc<dyn BatchExecutor>, capacity: usize) -> Self {
        Self {
            executor,
            listeners: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn listen(mut self, listener: Arc<dyn BatchListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Execute one batch to completion
    pub async fn process(&self, batch: BatchRequest) -> BatchResult {
        let started_at = Utc::now();
        let total = batch.transactions.len();
        let parallelism = batch.parallelism.clamp(1, self.capacity);
        info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            total,
            parallelism,
            "batch started"
        );
        for listener in &self.listeners {
            listener.on_start(&batch).await;
        }

        let gate = ProgressGate::new(total);
        let (errors, skipped) = if parallelism == 1 {
            self.run_sequential(&batch, &gate).await
        } else {
            self.run_parallel(&batch, parallelism, &gate).await
        };

        let failed = errors.len();
        let succeeded = total - failed - skipped;
        let status = if failed == 0 && skipped == 0 {
            BatchStatus::Completed
        } else if succeeded == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::CompletedWithErrors
        };
        let result = BatchResult {
            batch_id: batch.id.clone(),
            status,
            total,
            succeeded,
            failed,
            skipped,
            errors,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            batch_id = %result.batch_id,
            status = ?result.status,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "batch finished"
        );
        for listener in &self.listeners {
            if result.status == BatchStatus::Failed {
                listener.on_failed(&result).await;
            } else {
                listener.on_complete(&result).await;
            }
        }
        result
    }

    async fn run_sequential(
        &self,
        batch: &BatchRequest,
        gate: &ProgressGate,
    ) -> (Vec<BatchItemError>, usize) {
        let mut errors = Vec::new();
        for (index, request) in batch.transactions.iter().enumerate() {
            let outcome = self.executor.execute(request.clone()).await;
            for listener in &self.listeners {
                listener.on_item(&batch.id, request, &outcome).await;
            }
            if let Some(done) = gate.advance() {
                for listener in &self.listeners {
                    listener.on_progress(&batch.id, done, gate.total).await;
                }
            }
            if let Err(e) = outcome {
                warn!(batch_id = %batch.id, index, error = %e, "batch item failed");
                errors.push(BatchItemError {
                    index,
                    transaction_id: request.id,
                    error: e.to_string(),
                });
                if !batch.continue_on_error {
                    let skipped = batch.transactions.len() - index - 1;
                    return (errors, skipped);
                }
            }
        }
        (errors, 0)
    }

    async fn run_parallel(
        &self,
        batch: &BatchRequest,
        parallelism: usize,
        gate: &ProgressGate,
    ) -> (Vec<BatchItemError>, usize) {
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let stopped = Arc::new(AtomicBool::new(false));
        let mut join_set: JoinSet<Option<BatchItemError>> = JoinSet::new();
        let mut submitted = 0usize;

        for (index, request) in batch.transactions.iter().cloned().enumerate() {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            submitted += 1;
            let executor = Arc::clone(&self.executor);
            let listeners = self.listeners.clone();
            let batch_id = batch.id.clone();
            let stop_flag = Arc::clone(&stopped);
            let continue_on_error = batch.continue_on_error;
            join_set.spawn(async move {
                let _permit = permit;
                let outcome = executor.execute(request.clone()).await;
                for listener in &listeners {
                    listener.on_item(&batch_id, &request, &outcome).await;
                }
                match outcome {
                    Ok(_) => None,
                    Err(e) => {
                        if !continue_on_error {
                            stop_flag.store(true, Ordering::SeqCst);
                        }
                        Some(BatchItemError {
                            index,
                            transaction_id: request.id,
                            error: e.to_string(),
                        })
                    }
                }
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(item_error) => {
                    if let Some(e) = item_error {
                        errors.push(e);
                    }
                    if let Some(done) = gate.advance() {
                        for listener in &self.listeners {
                            listener.on_progress(&batch.id, done, gate.total).await;
                        }
                    }
                }
                Err(e) => warn!(batch_id = %batch.id, error = %e, "batch task panicked"),
            }
        }
        errors.sort_by_key(|e| e.index);
        let skipped = batch.transactions.len() - submitted;
        (errors, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fep_types::{Channel, FepError, ProcessingCode, TransactionType};
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn request(stan: u32) -> TransactionRequest {
        TransactionRequest {
            id: Uuid::new_v4(),
            transaction_type: TransactionType::Transfer,
            processing_code: ProcessingCode::parse("402000").unwrap(),
            pan: "4111111111111111".to_string(),
            amount: dec!(100.00),
            currency: "TWD".to_string(),
            source_account: Some("1234567890".to_string()),
            dest_account: Some("0987654321".to_string()),
            dest_bank_code: Some("0040000".to_string()),
            terminal_id: "EBANK001".to_string(),
            merchant_id: None,
            acquiring_bank: "8220000".to_string(),
            stan: format!("{:06}", stan),
            rrn: format!("{:012}", stan),
            channel: Channel::Internet,
            pin_block: None,
            mac: None,
            expiry: None,
            received_at: Utc::now(),
            original_id: None,
        }
    }

    fn requests(n: u32) -> Vec<TransactionRequest> {
        (1..=n).map(request).collect()
    }

    /// Approves everything except STANs in the fail list; tracks peak
    /// concurrency
    struct FakeExecutor {
        fail_stans: Vec<String>,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeExecutor {
        fn new(fail_stans: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                fail_stans: fail_stans.iter().map(|s| s.to_string()).collect(),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchExecutor for FakeExecutor {
        async fn execute(&self, request: TransactionRequest) -> Result<TransactionResponse> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail_stans.contains(&request.stan) {
                Err(FepError::Timeout { after_ms: 1 })
            } else {
                Ok(TransactionResponse::approved(&request, "A00001"))
            }
        }
    }

    struct CountingListener {
        items: AtomicUsize,
        progress: AtomicUsize,
        completes: AtomicUsize,
        fails: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                items: AtomicUsize::new(0),
                progress: AtomicUsize::new(0),
                completes: AtomicUsize::new(0),
                fails: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchListener for CountingListener {
        async fn on_item(
            &self,
            _batch_id: &str,
            _request: &TransactionRequest,
            _outcome: &Result<TransactionResponse>,
        ) {
            self.items.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_progress(&self, _batch_id: &str, _completed: usize, _total: usize) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_complete(&self, _result: &BatchResult) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_failed(&self, _result: &BatchResult) {
            self.fails.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sequential_batch_completes() {
        let executor = FakeExecutor::new(&[]);
        let listener = CountingListener::new();
        let processor = BatchProcessor::new(executor.clone(), 8).listen(listener.clone());
        let result = processor.process(BatchRequest::new("payroll", requests(5))).await;
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.succeeded, 5);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
        assert_eq!(listener.items.load(Ordering::SeqCst), 5);
        assert_eq!(listener.completes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_semaphore() {
        let executor = FakeExecutor::new(&[]);
        let processor = BatchProcessor::new(executor.clone(), 8);
        let batch = BatchRequest::new("payroll", requests(20)).with_parallelism(4);
        let result = processor.process(batch).await;
        assert_eq!(result.status, BatchStatus::Completed);
        assert!(executor.peak.load(Ordering::SeqCst) <= 4);
        assert!(executor.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn capacity_clamps_requested_parallelism() {
        let executor = FakeExecutor::new(&[]);
        let processor = BatchProcessor::new(executor.clone(), 2);
        let batch = BatchRequest::new("payroll", requests(10)).with_parallelism(64);
        processor.process(batch).await;
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn mixed_outcomes_reported() {
        let executor = FakeExecutor::new(&["000002", "000004"]);
        let processor = BatchProcessor::new(executor, 8);
        let result = processor
            .process(BatchRequest::new("payroll", requests(5)).with_parallelism(2))
            .await;
        assert_eq!(result.status, BatchStatus::CompletedWithErrors);
        assert_eq!(result.succeeded, 3);
        assert_eq!(result.failed, 2);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].index, 1);
    }

    #[tokio::test]
    async fn all_failures_is_failed() {
        let executor = FakeExecutor::new(&["000001", "000002"]);
        let listener = CountingListener::new();
        let processor = BatchProcessor::new(executor, 8).listen(listener.clone());
        let result = processor.process(BatchRequest::new("payroll", requests(2))).await;
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(listener.fails.load(Ordering::SeqCst), 1);
        assert_eq!(listener.completes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_on_error_skips_remaining_sequential() {
        let executor = FakeExecutor::new(&["000002"]);
        let processor = BatchProcessor::new(executor, 8);
        let result = processor
            .process(BatchRequest::new("payroll", requests(5)).stop_on_error())
            .await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.skipped, 3);
        assert_eq!(result.status, BatchStatus::CompletedWithErrors);
    }

    #[tokio::test]
    async fn progress_fires_on_decile_boundaries() {
        let executor = FakeExecutor::new(&[]);
        let listener = CountingListener::new();
        let processor = BatchProcessor::new(executor, 8).listen(listener.clone());
        processor
            .process(BatchRequest::new("payroll", requests(20)))
            .await;
        // 20 items → a boundary every 2 completions → 10 callbacks
        assert_eq!(listener.progress.load(Ordering::SeqCst), 10);
    }
}
