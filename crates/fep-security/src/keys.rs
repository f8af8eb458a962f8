//! Key lifecycle management
//!
//! Keys live in process memory, indexed by id and by alias, with one
//! current key per type. Encrypt requires ACTIVE; decrypt tolerates
//! EXPIRED so traffic keyed under the previous generation still verifies
//! during rotation. Material handed out is a zeroized-on-drop copy.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{SecurityError, SecurityResult};
use crate::tdes;

/// Purpose of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// PIN encryption key
    Pek,
    /// Terminal encryption key
    Tek,
    /// Zone encryption key
    Zek,
    /// MAC key
    Mak,
    /// Data encryption key (PAN cipher)
    Dek,
    /// Key-encryption key
    Kek,
}

/// Lifecycle status of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Imported but not yet activated
    Pending,
    /// Usable for encrypt and decrypt
    Active,
    /// Temporarily withheld from all use
    Suspended,
    /// Decrypt-only during rotation grace
    Expired,
    /// Withdrawn; no use permitted
    Revoked,
    /// Mid-rotation marker
    Rotating,
    /// Material wiped
    Destroyed,
}

impl KeyStatus {
    /// Statuses that permit encrypting new data
    pub fn can_encrypt(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Statuses that permit decrypting existing data
    pub fn can_decrypt(&self) -> bool {
        matches!(self, Self::Active | Self::Expired)
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
            Self::Rotating => "ROTATING",
            Self::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

/// Public metadata of a key; never contains material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub key_type: KeyType,
    pub alias: Option<String>,
    /// Key check value: first three bytes of the zero block under this key
    pub kcv: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub version: u32,
    /// Material length in bytes
    pub length: usize,
}

struct KeyEntry {
    info: KeyInfo,
    material: Zeroizing<Vec<u8>>,
}

/// Compute the key check value: 3DES of eight zero bytes, first three
/// bytes upper hex
pub fn compute_kcv(material: &[u8]) -> SecurityResult<String> {
    let mut block = [0u8; 8];
    tdes::encrypt_block(material, &mut block)?;
    Ok(hex::encode_upper(&block[..3]))
}

/// Process-wide key store
///
/// Passed by reference wherever keys are needed; no global instance.
#[derive(Default)]
pub struct KeyManager {
    keys: DashMap<String, KeyEntry>,
    aliases: DashMap<String, String>,
    current: DashMap<KeyType, String>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a key of the given type and byte length, ACTIVE immediately
    pub fn generate_key(&self, key_type: KeyType, length: usize) -> SecurityResult<KeyInfo> {
        if !matches!(length, 8 | 16 | 24) {
            return Err(SecurityError::InvalidKeyLength {
                cipher: "DES/3DES".to_string(),
                len: length,
            });
        }
        let mut material = Zeroizing::new(vec![0u8; length]);
        rand::thread_rng().fill_bytes(&mut material);
        self.insert(key_type, material, None, None)
    }

    /// Import existing material. When `expected_kcv` is given the computed
    /// value must match.
    pub fn import_key(
        &self,
        key_type: KeyType,
        material: Vec<u8>,
        alias: Option<String>,
        expected_kcv: Option<&str>,
    ) -> SecurityResult<KeyInfo> {
        let material = Zeroizing::new(material);
        self.insert(key_type, material, alias, expected_kcv)
    }

    fn insert(
        &self,
        key_type: KeyType,
        material: Zeroizing<Vec<u8>>,
        alias: Option<String>,
        expected_kcv: Option<&str>,
    ) -> SecurityResult<KeyInfo> {
        let id = Uuid::new_v4().to_string();
        let kcv = compute_kcv(&material)?;
        if let Some(expected) = expected_kcv {
            if !expected.eq_ignore_ascii_case(&kcv) {
                return Err(SecurityError::KcvMismatch { key_id: id });
            }
        }
        let info = KeyInfo {
            id: id.clone(),
            key_type,
            alias: alias.clone(),
            kcv,
            status: KeyStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
            last_used_at: None,
            version: 1,
            length: material.len(),
        };
        if let Some(alias) = alias {
            self.aliases.insert(alias, id.clone());
        }
        self.current.entry(key_type).or_insert_with(|| id.clone());
        self.keys.insert(
            id.clone(),
            KeyEntry {
                info: info.clone(),
                material,
            },
        );
        info!(key_id = %id, key_type = ?key_type, kcv = %info.kcv, "key registered");
        Ok(info)
    }

    fn resolve(&self, id_or_alias: &str) -> SecurityResult<String> {
        if self.keys.contains_key(id_or_alias) {
            return Ok(id_or_alias.to_string());
        }
        self.aliases
            .get(id_or_alias)
            .map(|id| id.clone())
            .ok_or_else(|| SecurityError::KeyNotFound {
                key_id: id_or_alias.to_string(),
            })
    }

    /// Metadata for a key by id or alias
    pub fn info(&self, id_or_alias: &str) -> SecurityResult<KeyInfo> {
        let id = self.resolve(id_or_alias)?;
        Ok(self.keys.get(&id).expect("resolved").info.clone())
    }

    /// Current key id for a type
    pub fn current_key_id(&self, key_type: KeyType) -> SecurityResult<String> {
        self.current
            .get(&key_type)
            .map(|id| id.clone())
            .ok_or_else(|| SecurityError::KeyNotFound {
                key_id: format!("current:{:?}", key_type),
            })
    }

    /// Point the current-key pointer at an existing key
    pub fn set_current(&self, key_type: KeyType, id_or_alias: &str) -> SecurityResult<()> {
        let id = self.resolve(id_or_alias)?;
        self.current.insert(key_type, id);
        Ok(())
    }

    /// Change a key's status
    pub fn set_status(&self, id_or_alias: &str, status: KeyStatus) -> SecurityResult<()> {
        let id = self.resolve(id_or_alias)?;
        let mut entry = self.keys.get_mut(&id).expect("resolved");
        entry.info.status = status;
        Ok(())
    }

    /// Rotate the current key of a type: generate a successor, mark the
    /// predecessor EXPIRED (decrypt-only grace), repoint current.
    pub fn rotate(&self, key_type: KeyType) -> SecurityResult<KeyInfo> {
        let old_id = self.current_key_id(key_type)?;
        let (old_len, old_version) = {
            let old = self.keys.get(&old_id).expect("current");
            (old.info.length, old.info.version)
        };
        let new_info = self.generate_key(key_type, old_len)?;
        {
            let mut old = self.keys.get_mut(&old_id).expect("current");
            old.info.status = KeyStatus::Expired;
        }
        let version = old_version + 1;
        {
            let mut new_entry = self.keys.get_mut(&new_info.id).expect("new");
            new_entry.info.version = version;
        }
        self.current.insert(key_type, new_info.id.clone());
        info!(key_type = ?key_type, old = %old_id, new = %new_info.id, "key rotated");
        let mut info = new_info;
        info.version = version;
        Ok(info)
    }

    /// Copy of material for encrypting. Requires ACTIVE.
    pub fn material_for_encrypt(&self, id_or_alias: &str) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.material(id_or_alias, true)
    }

    /// Copy of material for decrypting. ACTIVE or EXPIRED.
    pub fn material_for_decrypt(&self, id_or_alias: &str) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.material(id_or_alias, false)
    }

    fn material(&self, id_or_alias: &str, encrypt: bool) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let id = self.resolve(id_or_alias)?;
        let mut entry = self.keys.get_mut(&id).expect("resolved");
        let usable = if encrypt {
            entry.info.status.can_encrypt()
        } else {
            entry.info.status.can_decrypt()
        };
        if !usable {
            return Err(SecurityError::KeyNotUsable {
                key_id: id,
                status: entry.info.status.to_string(),
                operation: if encrypt { "encrypt" } else { "decrypt" }.to_string(),
            });
        }
        entry.info.last_used_at = Some(Utc::now());
        Ok(Zeroizing::new(entry.material.to_vec()))
    }

    /// Wipe a key's material and mark it DESTROYED
    pub fn destroy(&self, id_or_alias: &str) -> SecurityResult<()> {
        let id = self.resolve(id_or_alias)?;
        let mut entry = self.keys.get_mut(&id).expect("resolved");
        entry.material.zeroize();
        entry.info.status = KeyStatus::Destroyed;
        Ok(())
    }

    /// All key metadata, for diagnostics
    pub fn list(&self) -> Vec<KeyInfo> {
        self.keys.iter().map(|e| e.info.clone()).collect()
    }
}
