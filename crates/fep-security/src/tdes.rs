//! Single/triple DES block helpers shared by the PIN, MAC and PAN services
//!
//! Key length selects the cipher: 8 bytes single DES, 16 bytes two-key
//! 3DES (EDE2), 24 bytes three-key 3DES (EDE3).

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::{Des, TdesEde2, TdesEde3};

use crate::error::{SecurityError, SecurityResult};

fn bad_len(len: usize) -> SecurityError {
    SecurityError::InvalidKeyLength {
        cipher: "DES/3DES".to_string(),
        len,
    }
}

/// Encrypt one 8-byte block in place
pub fn encrypt_block(key: &[u8], block: &mut [u8; 8]) -> SecurityResult<()> {
    let ga = GenericArray::from_mut_slice(block);
    match key.len() {
        8 => Des::new_from_slice(key)
            .map_err(|_| bad_len(key.len()))?
            .encrypt_block(ga),
        16 => TdesEde2::new_from_slice(key)
            .map_err(|_| bad_len(key.len()))?
            .encrypt_block(ga),
        24 => TdesEde3::new_from_slice(key)
            .map_err(|_| bad_len(key.len()))?
            .encrypt_block(ga),
        other => return Err(bad_len(other)),
    }
    Ok(())
}

/// Decrypt one 8-byte block in place
pub fn decrypt_block(key: &[u8], block: &mut [u8; 8]) -> SecurityResult<()> {
    let ga = GenericArray::from_mut_slice(block);
    match key.len() {
        8 => Des::new_from_slice(key)
            .map_err(|_| bad_len(key.len()))?
            .decrypt_block(ga),
        16 => TdesEde2::new_from_slice(key)
            .map_err(|_| bad_len(key.len()))?
            .decrypt_block(ga),
        24 => TdesEde3::new_from_slice(key)
            .map_err(|_| bad_len(key.len()))?
            .decrypt_block(ga),
        other => return Err(bad_len(other)),
    }
    Ok(())
}

/// ECB over a whole buffer, which must be a multiple of 8 bytes
pub fn ecb_encrypt(key: &[u8], data: &mut [u8]) -> SecurityResult<()> {
    if data.len() % 8 != 0 {
        return Err(SecurityError::MalformedCiphertext {
            reason: format!("length {} not a block multiple", data.len()),
        });
    }
    for chunk in data.chunks_exact_mut(8) {
        let mut block: [u8; 8] = chunk.try_into().unwrap();
        encrypt_block(key, &mut block)?;
        chunk.copy_from_slice(&block);
    }
    Ok(())
}

/// ECB decrypt over a whole buffer
pub fn ecb_decrypt(key: &[u8], data: &mut [u8]) -> SecurityResult<()> {
    if data.len() % 8 != 0 {
        return Err(SecurityError::MalformedCiphertext {
            reason: format!("length {} not a block multiple", data.len()),
        });
    }
    for chunk in data.chunks_exact_mut(8) {
        let mut block: [u8; 8] = chunk.try_into().unwrap();
        decrypt_block(key, &mut block)?;
        chunk.copy_from_slice(&block);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip_all_key_lengths() {
        for len in [8usize, 16, 24] {
            let key = vec![0x5A; len];
            let mut block = *b"12345678";
            encrypt_block(&key, &mut block).unwrap();
            assert_ne!(&block, b"12345678");
            decrypt_block(&key, &mut block).unwrap();
            assert_eq!(&block, b"12345678");
        }
    }

    #[test]
    fn odd_key_length_rejected() {
        let mut block = [0u8; 8];
        assert!(encrypt_block(&[0u8; 10], &mut block).is_err());
    }

    #[test]
    fn ecb_requires_block_multiple() {
        let mut data = vec![0u8; 12];
        assert!(ecb_encrypt(&[0x5A; 16], &mut data).is_err());
    }
}
