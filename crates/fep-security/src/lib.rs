//! FEP Security - PIN blocks, MAC, PAN encryption and key lifecycle
//!
//! **Security invariant: key material never leaves the key manager except
//! as zeroized-on-drop copies handed to the cipher routines.**
//!
//! The crate implements the ISO 9564 PIN block formats, the ISO 9797 /
//! ANSI X9.19 / CMAC / HMAC MAC suite with constant-time verification,
//! PAN encryption and tokenization, and the HSM adapter contract with a
//! software fallback that satisfies it.

pub mod error;
pub mod hsm;
pub mod keys;
pub mod mac;
pub mod pan;
pub mod pin;
mod tdes;

pub use error::{SecurityError, SecurityResult};
pub use hsm::{HsmAdapter, HsmOperation, HsmRequest, HsmResponse, SoftHsm};
pub use keys::{KeyInfo, KeyManager, KeyStatus, KeyType};
pub use mac::{calculate_mac, verify_mac, MacAlgorithm, MacService};
pub use pan::PanCipher;
pub use pin::{PinBlock, PinCrypto, PinFormat};
