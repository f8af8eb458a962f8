//! PAN encryption and tokenization
//!
//! PANs at rest are 3DES-encrypted under a dedicated DEK with ISO 9797
//! method-2 padding and stored as hex. Lookups go through a SHA-256 index
//! so the clear PAN never becomes a key. Rendering always masks.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{SecurityError, SecurityResult};
use crate::keys::{KeyManager, KeyType};
use crate::mac::{pad_method2, unpad_method2};
use crate::tdes;

pub use fep_types::masking::mask_pan;

/// PAN cipher bound to the key manager's DEK
pub struct PanCipher<'a> {
    keys: &'a KeyManager,
}

impl<'a> PanCipher<'a> {
    pub fn new(keys: &'a KeyManager) -> Self {
        Self { keys }
    }

    fn validate(pan: &str) -> SecurityResult<()> {
        if pan.len() < 13 || !pan.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SecurityError::InvalidPan);
        }
        Ok(())
    }

    /// Encrypt a PAN under the current DEK (or a named key); hex output
    pub fn encrypt(&self, pan: &str, key_id: Option<&str>) -> SecurityResult<String> {
        Self::validate(pan)?;
        let key_id = match key_id {
            Some(id) => id.to_string(),
            None => self.keys.current_key_id(KeyType::Dek)?,
        };
        let material = self.keys.material_for_encrypt(&key_id)?;
        let mut buf = pad_method2(pan.as_bytes());
        tdes::ecb_encrypt(&material, &mut buf)?;
        Ok(hex::encode_upper(&buf))
    }

    /// Decrypt a hex ciphertext back to the clear PAN
    pub fn decrypt(&self, ciphertext: &str, key_id: Option<&str>) -> SecurityResult<Zeroizing<String>> {
        let key_id = match key_id {
            Some(id) => id.to_string(),
            None => self.keys.current_key_id(KeyType::Dek)?,
        };
        let material = self.keys.material_for_decrypt(&key_id)?;
        let mut buf = hex::decode(ciphertext).map_err(|e| SecurityError::MalformedCiphertext {
            reason: e.to_string(),
        })?;
        tdes::ecb_decrypt(&material, &mut buf)?;
        let clear = unpad_method2(&buf)?;
        let pan = String::from_utf8(clear).map_err(|_| SecurityError::MalformedCiphertext {
            reason: "non-UTF8 plaintext".to_string(),
        })?;
        Self::validate(&pan)?;
        Ok(Zeroizing::new(pan))
    }

    /// SHA-256 lookup index over the PAN with whitespace stripped; hex
    pub fn index(&self, pan: &str) -> String {
        let stripped: String = pan.chars().filter(|c| !c.is_whitespace()).collect();
        let mut hasher = Sha256::new();
        hasher.update(stripped.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAN: &str = "4111111111111111";

    fn manager() -> KeyManager {
        let km = KeyManager::new();
        km.generate_key(KeyType::Dek, 16).unwrap();
        km
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let km = manager();
        let cipher = PanCipher::new(&km);
        let encrypted = cipher.encrypt(PAN, None).unwrap();
        assert_ne!(encrypted, PAN);
        assert!(encrypted.bytes().all(|b| b.is_ascii_hexdigit()));
        let decrypted = cipher.decrypt(&encrypted, None).unwrap();
        assert_eq!(&*decrypted, PAN);
    }

    #[test]
    fn rejects_short_pan() {
        let km = manager();
        let cipher = PanCipher::new(&km);
        assert!(matches!(
            cipher.encrypt("41111111", None),
            Err(SecurityError::InvalidPan)
        ));
    }

    #[test]
    fn index_strips_whitespace() {
        let km = manager();
        let cipher = PanCipher::new(&km);
        assert_eq!(cipher.index("4111 1111 1111 1111"), cipher.index(PAN));
        assert_ne!(cipher.index(PAN), cipher.index("4111111111111112"));
    }

    #[test]
    fn masking_convention() {
        assert_eq!(mask_pan(PAN), "411111******1111");
        assert_eq!(mask_pan("123456789012"), "************");
    }

    #[test]
    fn garbage_ciphertext_fails_closed() {
        let km = manager();
        let cipher = PanCipher::new(&km);
        assert!(cipher.decrypt("ZZZZ", None).is_err());
        assert!(cipher.decrypt("00112233", None).is_err());
    }
}
