//! Message authentication codes
//!
//! ISO 9797-1 algorithms 1 and 3, ANSI X9.19 retail MAC, AES-CMAC and
//! HMAC-SHA256. Verification is constant-time.

use cmac::{Cmac, Mac};
use hmac::Hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{SecurityError, SecurityResult};
use crate::keys::{KeyManager, KeyType};
use crate::tdes;

type HmacSha256 = Hmac<Sha256>;

/// Supported MAC algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// ISO 9797-1 algorithm 1: DES-CBC, MAC = last block
    Iso9797Alg1,
    /// ISO 9797-1 algorithm 3 (retail MAC): DES-CBC with K1, final block
    /// decrypt-K2 then encrypt-K1
    Iso9797Alg3,
    /// ANSI X9.19: single-DES CBC for all blocks, final 3DES with the full
    /// key; method-2 padding
    AnsiX919,
    /// AES-CMAC (NIST SP 800-38B)
    AesCmac,
    /// HMAC with SHA-256
    HmacSha256,
}

/// ISO 9797-1 padding method 1: zeros to a block multiple. Empty input
/// becomes one zero block.
fn pad_method1(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % 8;
    let pad = if out.is_empty() { 8 } else { (8 - rem) % 8 };
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

/// ISO 9797-1 padding method 2: a single 0x80 then zeros to a block
/// multiple
pub(crate) fn pad_method2(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.push(0x80);
    let rem = out.len() % 8;
    if rem != 0 {
        out.extend(std::iter::repeat(0u8).take(8 - rem));
    }
    out
}

/// Strip method-2 padding after decryption
pub(crate) fn unpad_method2(data: &[u8]) -> SecurityResult<Vec<u8>> {
    let pos = data
        .iter()
        .rposition(|&b| b == 0x80)
        .ok_or_else(|| SecurityError::MalformedCiphertext {
            reason: "missing padding marker".to_string(),
        })?;
    if data[pos + 1..].iter().any(|&b| b != 0) {
        return Err(SecurityError::MalformedCiphertext {
            reason: "non-zero bytes after padding marker".to_string(),
        });
    }
    Ok(data[..pos].to_vec())
}

fn des_cbc_chain(key: &[u8], blocks: &[u8]) -> SecurityResult<[u8; 8]> {
    let mut chain = [0u8; 8];
    for block in blocks.chunks_exact(8) {
        for (c, b) in chain.iter_mut().zip(block.iter()) {
            *c ^= b;
        }
        tdes::encrypt_block(key, &mut chain)?;
    }
    Ok(chain)
}

fn split_double_key(key: &[u8]) -> SecurityResult<(&[u8], &[u8])> {
    if key.len() != 16 {
        return Err(SecurityError::InvalidKeyLength {
            cipher: "retail MAC".to_string(),
            len: key.len(),
        });
    }
    Ok((&key[..8], &key[8..16]))
}

/// Compute a MAC over the data with raw key material
pub fn calculate_mac(
    algorithm: MacAlgorithm,
    key: &[u8],
    data: &[u8],
) -> SecurityResult<Vec<u8>> {
    match algorithm {
        MacAlgorithm::Iso9797Alg1 => {
            let k1 = if key.len() >= 8 { &key[..8] } else { key };
            let padded = pad_method1(data);
            Ok(des_cbc_chain(k1, &padded)?.to_vec())
        }
        MacAlgorithm::Iso9797Alg3 => {
            let (k1, k2) = split_double_key(key)?;
            let padded = pad_method1(data);
            let mut mac = des_cbc_chain(k1, &padded)?;
            tdes::decrypt_block(k2, &mut mac)?;
            tdes::encrypt_block(k1, &mut mac)?;
            Ok(mac.to_vec())
        }
        MacAlgorithm::AnsiX919 => {
            let (k1, _) = split_double_key(key)?;
            let padded = pad_method2(data);
            let mut mac = des_cbc_chain(k1, &padded)?;
            // Final transformation with the full double-length key
            tdes::decrypt_block(&key[8..16], &mut mac)?;
            tdes::encrypt_block(k1, &mut mac)?;
            Ok(mac.to_vec())
        }
        MacAlgorithm::AesCmac => {
            let mut cmac = match key.len() {
                16 => Cmac::<aes::Aes128>::new_from_slice(key)
                    .map(CmacEither::Aes128)
                    .map_err(|_| invalid_aes(key.len()))?,
                24 => Cmac::<aes::Aes192>::new_from_slice(key)
                    .map(CmacEither::Aes192)
                    .map_err(|_| invalid_aes(key.len()))?,
                32 => Cmac::<aes::Aes256>::new_from_slice(key)
                    .map(CmacEither::Aes256)
                    .map_err(|_| invalid_aes(key.len()))?,
                other => return Err(invalid_aes(other)),
            };
            cmac.update(data);
            Ok(cmac.finalize())
        }
        MacAlgorithm::HmacSha256 => {
            let mut hmac = HmacSha256::new_from_slice(key).map_err(|_| {
                SecurityError::InvalidKeyLength {
                    cipher: "HMAC-SHA256".to_string(),
                    len: key.len(),
                }
            })?;
            hmac.update(data);
            Ok(hmac.finalize().into_bytes().to_vec())
        }
    }
}

fn invalid_aes(len: usize) -> SecurityError {
    SecurityError::InvalidKeyLength {
        cipher: "AES-CMAC".to_string(),
        len,
    }
}

enum CmacEither {
    Aes128(Cmac<aes::Aes128>),
    Aes192(Cmac<aes::Aes192>),
    Aes256(Cmac<aes::Aes256>),
}

impl CmacEither {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Aes128(m) => m.update(data),
            Self::Aes192(m) => m.update(data),
            Self::Aes256(m) => m.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Aes128(m) => m.finalize().into_bytes().to_vec(),
            Self::Aes192(m) => m.finalize().into_bytes().to_vec(),
            Self::Aes256(m) => m.finalize().into_bytes().to_vec(),
        }
    }
}

/// Verify a MAC in constant time
pub fn verify_mac(
    algorithm: MacAlgorithm,
    key: &[u8],
    data: &[u8],
    expected: &[u8],
) -> SecurityResult<bool> {
    let computed = calculate_mac(algorithm, key, data)?;
    if computed.len() != expected.len() {
        return Ok(false);
    }
    Ok(computed.ct_eq(expected).into())
}

/// MAC service resolved against the key manager's MAK
pub struct MacService<'a> {
    keys: &'a KeyManager,
}

impl<'a> MacService<'a> {
    pub fn new(keys: &'a KeyManager) -> Self {
        Self { keys }
    }

    /// MAC under a named key, or the current MAK when `key_id` is None
    pub fn calculate(
        &self,
        algorithm: MacAlgorithm,
        key_id: Option<&str>,
        data: &[u8],
    ) -> SecurityResult<Vec<u8>> {
        let key_id = match key_id {
            Some(id) => id.to_string(),
            None => self.keys.current_key_id(KeyType::Mak)?,
        };
        let material = self.keys.material_for_encrypt(&key_id)?;
        calculate_mac(algorithm, &material, data)
    }

    /// Verify under a named key or the current MAK. EXPIRED keys still
    /// verify during rotation grace.
    pub fn verify(
        &self,
        algorithm: MacAlgorithm,
        key_id: Option<&str>,
        data: &[u8],
        expected: &[u8],
    ) -> SecurityResult<bool> {
        let key_id = match key_id {
            Some(id) => id.to_string(),
            None => self.keys.current_key_id(KeyType::Mak)?,
        };
        let material = self.keys.material_for_decrypt(&key_id)?;
        verify_mac(algorithm, &material, data, expected)
    }
}
