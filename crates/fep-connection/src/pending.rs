//! Pending-request correlation
//!
//! Every in-flight request is keyed by (STAN, terminal). The sender parks
//! on a oneshot until the reader task dispatches the correlated response,
//! the deadline expires, or the link fails. A duplicate key inside the
//! retention of the map is a protocol violation and is rejected.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;

use fep_codec::Message;
use fep_types::{FepError, Result};

/// (STAN, terminal id)
pub type CorrelationKey = (String, String);

/// The completion a sender parks on
pub type PendingReceiver = oneshot::Receiver<Result<Message>>;

/// Keyed map of in-flight requests
#[derive(Default)]
pub struct PendingStore {
    entries: DashMap<CorrelationKey, oneshot::Sender<Result<Message>>>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request. A key already present means a STAN
    /// reuse under the same terminal inside the window.
    pub fn register(&self, key: CorrelationKey) -> Result<PendingReceiver> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => Err(FepError::system(format!(
                "duplicate correlation key (STAN {}, terminal {})",
                occupied.key().0,
                occupied.key().1
            ))),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Dispatch a correlated response. Returns false when no request was
    /// waiting — the caller logs and drops the reply.
    pub fn complete(&self, key: &CorrelationKey, response: Message) -> bool {
        match self.entries.remove(key) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Drop a registration whose sender gave up (timeout, write failure)
    pub fn cancel(&self, key: &CorrelationKey) {
        self.entries.remove(key);
    }

    /// Fail every in-flight request, e.g. when the link drops under
    /// FAIL_WHEN_ANY_DOWN
    pub fn fail_all(&self, reason: &str) {
        let keys: Vec<CorrelationKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let count = keys.len();
        for key in keys {
            if let Some((_, tx)) = self.entries.remove(&key) {
                let _ = tx.send(Err(FepError::connection(reason)));
            }
        }
        if count > 0 {
            warn!(count, reason, "failed all pending requests");
        }
    }

    /// Number of in-flight requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stan: &str) -> CorrelationKey {
        (stan.to_string(), "ATM00001".to_string())
    }

    #[tokio::test]
    async fn register_and_complete() {
        let store = PendingStore::new();
        let rx = store.register(key("000001")).unwrap();
        let response = Message::new("0210").unwrap();
        assert!(store.complete(&key("000001"), response));
        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.mti(), "0210");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn duplicate_key_rejected() {
        let store = PendingStore::new();
        let _rx = store.register(key("000001")).unwrap();
        assert!(store.register(key("000001")).is_err());
        // A different terminal under the same STAN is a distinct key
        assert!(store
            .register(("000001".to_string(), "ATM00002".to_string()))
            .is_ok());
    }

    #[tokio::test]
    async fn unsolicited_response_is_dropped() {
        let store = PendingStore::new();
        assert!(!store.complete(&key("999999"), Message::new("0210").unwrap()));
    }

    #[tokio::test]
    async fn fail_all_delivers_connection_error() {
        let store = PendingStore::new();
        let rx1 = store.register(key("000001")).unwrap();
        let rx2 = store.register(key("000002")).unwrap();
        store.fail_all("ND");
        assert!(matches!(
            rx1.await.unwrap(),
            Err(FepError::Connection { .. })
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(FepError::Connection { .. })
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_entry() {
        let store = PendingStore::new();
        let _rx = store.register(key("000001")).unwrap();
        store.cancel(&key("000001"));
        assert!(store.is_empty());
        assert!(store.register(key("000001")).is_ok());
    }
}
