//! Transaction repository seam
//!
//! Persistent storage is external; this trait is the contract and the
//! in-memory implementation backs tests and single-node deployments.
//! Status transitions go through compare-and-set so concurrent reversal
//! attempts cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fep_types::{
    FepError, Result, TransactionRequest, TransactionResponse, TransactionStatus,
    TransactionType,
};

/// The persisted view of one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub request: TransactionRequest,
    pub response: Option<TransactionResponse>,
    pub status: TransactionStatus,
    /// Set when a reversal nullified this transaction
    pub reversed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// A fresh PENDING record for a request entering the pipeline
    pub fn pending(request: TransactionRequest) -> Self {
        Self {
            request,
            response: None,
            status: TransactionStatus::Pending,
            reversed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Storage contract. In-memory satisfies it for tests; production wires a
/// database-backed implementation without touching the pipeline.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert or replace a record
    async fn save(&self, record: TransactionRecord) -> Result<()>;

    /// Record the final response and status
    async fn complete(
        &self,
        id: Uuid,
        response: TransactionResponse,
        status: TransactionStatus,
    ) -> Result<()>;

    /// Fetch by transaction id
    async fn find_by_id(&self, id: Uuid) -> Result<Option<TransactionRecord>>;

    /// Fetch the original for a reversal by (RRN, STAN, terminal)
    async fn find_original(
        &self,
        rrn: &str,
        stan: &str,
        terminal_id: &str,
    ) -> Result<Option<TransactionRecord>>;

    /// Atomically move a record from one of `expected` to `new_status`.
    /// Returns false when the record was not in an expected status, so a
    /// losing racer observes the winner's transition.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[TransactionStatus],
        new_status: TransactionStatus,
    ) -> Result<bool>;
}

type ReversalKey = (String, String, String);

/// DashMap-backed repository
#[derive(Default)]
pub struct InMemoryRepository {
    records: DashMap<Uuid, TransactionRecord>,
    by_reversal_key: DashMap<ReversalKey, Uuid>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(request: &TransactionRequest) -> ReversalKey {
        (
            request.rrn.clone(),
            request.stan.clone(),
            request.terminal_id.clone(),
        )
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryRepository {
    async fn save(&self, record: TransactionRecord) -> Result<()> {
        // Reversal requests reuse the original's (RRN, STAN, terminal);
        // indexing them would shadow the original they refer to. The same
        // goes for duplicate resubmissions, so the first writer keeps the
        // index entry.
        if record.request.transaction_type != TransactionType::Reversal {
            self.by_reversal_key
                .entry(Self::key_of(&record.request))
                .or_insert(record.request.id);
        }
        self.records.insert(record.request.id, record);
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        response: TransactionResponse,
        status: TransactionStatus,
    ) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| FepError::system(format!("record {} not found", id)))?;
        record.response = Some(response);
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TransactionRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn find_original(
        &self,
        rrn: &str,
        stan: &str,
        terminal_id: &str,
    ) -> Result<Option<TransactionRecord>> {
        let key = (rrn.to_string(), stan.to_string(), terminal_id.to_string());
        match self.by_reversal_key.get(&key) {
            Some(id) => Ok(self.records.get(&id).map(|r| r.clone())),
            None => Ok(None),
        }
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[TransactionStatus],
        new_status: TransactionStatus,
    ) -> Result<bool> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| FepError::system(format!("record {} not found", id)))?;
        if !expected.contains(&record.status) {
            return Ok(false);
        }
        record.status = new_status;
        record.updated_at = Utc::now();
        if new_status == TransactionStatus::Reversed {
            record.reversed_at = Some(record.updated_at);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fep_types::{Channel, ProcessingCode, TransactionType};
    use rust_decimal_macros::dec;

    fn request(stan: &str) -> TransactionRequest {
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
            rrn: format!("{:0>12}", stan),
            channel: Channel::Atm,
            pin_block: None,
            mac: None,
            expiry: None,
            received_at: Utc::now(),
            original_id: None,
        }
    }

    #[tokio::test]
    async fn save_and_find_by_reversal_key() {
        let repo = InMemoryRepository::new();
        let req = request("000001");
        let id = req.id;
        repo.save(TransactionRecord::pending(req)).await.unwrap();

        let found = repo
            .find_original("000000000001", "000001", "ATM00001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request.id, id);
        assert!(repo
            .find_original("000000000001", "000002", "ATM00001")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cas_only_one_reversal_wins() {
        let repo = InMemoryRepository::new();
        let req = request("000002");
        let id = req.id;
        let mut record = TransactionRecord::pending(req);
        record.status = TransactionStatus::Approved;
        repo.save(record).await.unwrap();

        let first = repo
            .compare_and_set_status(
                id,
                &[TransactionStatus::Approved, TransactionStatus::Pending],
                TransactionStatus::Reversed,
            )
            .await
            .unwrap();
        let second = repo
            .compare_and_set_status(
                id,
                &[TransactionStatus::Approved, TransactionStatus::Pending],
                TransactionStatus::Reversed,
            )
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let record = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Reversed);
        assert!(record.reversed_at.is_some());
    }

    #[tokio::test]
    async fn complete_attaches_response() {
        let repo = InMemoryRepository::new();
        let req = request("000003");
        let id = req.id;
        let resp = TransactionResponse::approved(&req, "A00001");
        repo.save(TransactionRecord::pending(req)).await.unwrap();
        repo.complete(id, resp, TransactionStatus::Approved)
            .await
            .unwrap();
        let record = repo.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Approved);
        assert!(record.response.unwrap().is_approved());
    }
}
