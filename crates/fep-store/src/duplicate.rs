//! Incoming-request duplicate detection
//!
//! Fingerprint = (acquiring bank, terminal, STAN, transaction date). A
//! resubmission while the first attempt is still in flight declines with
//! code 94; after completion it returns the cached response without a
//! second upstream dispatch. Entries age out after the retention window.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use fep_types::TransactionResponse;

/// Outcome of registering a fingerprint
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateCheck {
    /// First sighting inside the window; proceed to dispatch
    New,
    /// Same fingerprint still pending; decline as duplicate
    InFlight,
    /// Same fingerprint already completed; replay the cached response
    Completed(TransactionResponse),
}

enum EntryState {
    Pending,
    Completed(TransactionResponse),
}

struct Entry {
    state: EntryState,
    inserted_at: DateTime<Utc>,
}

/// Keyed dedup store with a configurable retention window
pub struct DuplicateStore {
    entries: DashMap<String, Entry>,
    window: Duration,
}

impl DuplicateStore {
    /// Store with the given retention window
    pub fn new(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    /// Store with the default 24-hour retention
    pub fn with_default_window() -> Self {
        Self::new(Duration::hours(24))
    }

    /// Atomically register a fingerprint. The first caller gets `New` and
    /// owns the dispatch; every concurrent caller sees `InFlight`.
    pub fn check_and_register(&self, fingerprint: &str) -> DuplicateCheck {
        use dashmap::mapref::entry::Entry as MapEntry;
        let now = Utc::now();
        let result = match self.entries.entry(fingerprint.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    state: EntryState::Pending,
                    inserted_at: now,
                });
                DuplicateCheck::New
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if now - entry.inserted_at > self.window {
                    // Window elapsed: treat as a fresh transaction
                    entry.state = EntryState::Pending;
                    entry.inserted_at = now;
                    DuplicateCheck::New
                } else {
                    match &entry.state {
                        EntryState::Pending => DuplicateCheck::InFlight,
                        EntryState::Completed(response) => {
                            DuplicateCheck::Completed(response.clone())
                        }
                    }
                }
            }
        };
        if result != DuplicateCheck::New {
            warn!(fingerprint = %fingerprint, "duplicate submission inside window");
        }
        result
    }

    /// Attach the final response so later resubmissions replay it
    pub fn complete(&self, fingerprint: &str, response: TransactionResponse) {
        if let Some(mut entry) = self.entries.get_mut(fingerprint) {
            entry.state = EntryState::Completed(response);
        }
    }

    /// Drop a fingerprint that never dispatched, so a clean retry is not
    /// misdeclined
    pub fn forget(&self, fingerprint: &str) {
        self.entries.remove(fingerprint);
    }

    /// Sweep entries older than the retention window
    pub fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - self.window;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted_at >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "purged expired dedup entries");
        }
        removed
    }

    /// Number of live fingerprints
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fep_types::{codes, TransactionResponse};
    use uuid::Uuid;

    fn response() -> TransactionResponse {
        TransactionResponse {
            transaction_id: Uuid::new_v4(),
            response_code: codes::APPROVED.to_string(),
            auth_code: Some("A00001".to_string()),
            balance: None,
            stan: "000001".to_string(),
            rrn: "000000000001".to_string(),
            responded_at: Utc::now(),
            processing_ms: 42,
        }
    }

    #[test]
    fn first_sighting_is_new() {
        let store = DuplicateStore::with_default_window();
        assert_eq!(store.check_and_register("fp1"), DuplicateCheck::New);
    }

    #[test]
    fn second_sighting_while_pending_is_in_flight() {
        let store = DuplicateStore::with_default_window();
        store.check_and_register("fp1");
        assert_eq!(store.check_and_register("fp1"), DuplicateCheck::InFlight);
    }

    #[test]
    fn completed_fingerprint_replays_response() {
        let store = DuplicateStore::with_default_window();
        store.check_and_register("fp1");
        store.complete("fp1", response());
        match store.check_and_register("fp1") {
            DuplicateCheck::Completed(cached) => {
                assert!(cached.is_approved());
                assert_eq!(cached.auth_code.as_deref(), Some("A00001"));
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn forget_allows_clean_retry() {
        let store = DuplicateStore::with_default_window();
        store.check_and_register("fp1");
        store.forget("fp1");
        assert_eq!(store.check_and_register("fp1"), DuplicateCheck::New);
    }

    #[test]
    fn expired_entries_are_purged() {
        let store = DuplicateStore::new(Duration::milliseconds(0));
        store.check_and_register("fp1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn window_elapse_treats_resubmission_as_new() {
        let store = DuplicateStore::new(Duration::milliseconds(1));
        store.check_and_register("fp1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.check_and_register("fp1"), DuplicateCheck::New);
    }
}
