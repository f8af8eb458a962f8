//! FEP Connection - the dual-channel FISC link
//!
//! One logical connection is physically two TCP sockets: all requests go
//! out the send socket, all responses arrive on the receive socket, and
//! correlation is solely by (STAN, terminal). The manager owns the state
//! machine, the reader and heartbeat tasks, sign-on/sign-off, and
//! auto-reconnect with the configured failure strategy.

pub mod framing;
pub mod manager;
pub mod pending;
pub mod socket;
pub mod state;

pub use manager::FiscConnection;
pub use pending::{CorrelationKey, PendingStore};
pub use state::ConnectionState;
