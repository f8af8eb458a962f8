//! FEP Store - duplicate detection and the transaction repository seam
//!
//! Two responsibilities share the keyed maps here: dedup of incoming
//! requests during the retention window, and lookup of originals for
//! reversal matching with atomic status transitions.

pub mod duplicate;
pub mod repository;

pub use duplicate::{DuplicateCheck, DuplicateStore};
pub use repository::{InMemoryRepository, TransactionRecord, TransactionRepository};
