//! FEP Clearing - daily settlement files and net positions
//!
//! The switch delivers a Big5-encoded fixed-width file per settlement day:
//! one header, one detail line per transaction, one trailer with counts,
//! totals and a checksum. Matched details aggregate into one clearing
//! record per counterparty bank (debit where we issued, credit where we
//! acquired, net = credit − debit) which then walks the
//! CALCULATED → CONFIRMED → SUBMITTED → SETTLED workflow.

pub mod error;
pub mod file;
pub mod netting;
pub mod records;

pub use error::{ClearingError, ClearingResult};
pub use file::{parse_settlement_file, write_settlement_file, SettlementFile};
pub use netting::{ClearingEngine, ClearingSummary};
pub use records::{
    ClearingRecord, ClearingStatus, MatchStatus, SettlementHeader, SettlementRecord,
    SettlementTrailer,
};
