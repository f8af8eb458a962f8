//! FEP Types - Canonical domain types for the Financial Exchange Processor
//!
//! This crate holds the shared vocabulary of the gateway: transaction
//! requests and responses, ISO response codes, channel and configuration
//! types, PAN masking, and the workspace-wide error taxonomy. It depends on
//! no other fep crate.

pub mod config;
pub mod error;
pub mod masking;
pub mod response;
pub mod transaction;

pub use config::{
    ChannelMode, ConnectionConfig, EndpointConfig, FailureStrategy, RetryConfig, SocketConfig,
};
pub use error::{ErrorCategory, FepError, Result};
pub use masking::{mask_account, mask_middle, mask_pan};
pub use response::codes;
pub use transaction::{
    Channel, ProcessingCode, TransactionRequest, TransactionResponse, TransactionStatus,
    TransactionType,
};
