//! HSM adapter contract
//!
//! The hardware module is external; only the request/response contract
//! matters here. [`SoftHsm`] satisfies the contract in software against
//! the key manager so the pipeline and tests run without hardware.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{SecurityError, SecurityResult};
use crate::keys::{KeyManager, KeyType};
use crate::mac::{calculate_mac, verify_mac, MacAlgorithm};
use crate::pin::{PinBlock, PinCrypto, PinFormat};
use crate::tdes;

/// Operations the adapter must support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HsmOperation {
    GenerateKey,
    ImportKey,
    ExportKey,
    TranslatePinBlock,
    GenerateMac,
    VerifyMac,
    Encrypt,
    Decrypt,
    Status,
    Diagnostics,
}

/// One request to the module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsmRequest {
    pub operation: HsmOperation,
    /// Primary key referenced by the operation
    pub key_id: Option<String>,
    /// Secondary key (translation target)
    pub target_key_id: Option<String>,
    /// Operation payload (PIN block, MAC body, plaintext...)
    pub payload: Vec<u8>,
    /// Expected MAC for VerifyMac
    pub expected: Option<Vec<u8>>,
    /// Free-form parameters (key type, length, algorithm)
    pub params: HashMap<String, String>,
}

impl HsmRequest {
    pub fn new(operation: HsmOperation) -> Self {
        Self {
            operation,
            key_id: None,
            target_key_id: None,
            payload: Vec::new(),
            expected: None,
            params: HashMap::new(),
        }
    }

    pub fn key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn target_key(mut self, key_id: impl Into<String>) -> Self {
        self.target_key_id = Some(key_id.into());
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn expected(mut self, mac: Vec<u8>) -> Self {
        self.expected = Some(mac);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Adapter response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsmResponse {
    pub success: bool,
    /// Operation output (ciphertext, MAC, translated block, key id bytes)
    pub payload: Vec<u8>,
    /// Module status line for Status/Diagnostics
    pub status: Option<String>,
    pub error: Option<String>,
}

impl HsmResponse {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            success: true,
            payload,
            status: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Vec::new(),
            status: None,
            error: Some(error.into()),
        }
    }
}

/// The adapter seam. Implementations may block on hardware; callers treat
/// every invocation as a suspension point with a deadline.
#[async_trait]
pub trait HsmAdapter: Send + Sync {
    async fn execute(&self, request: HsmRequest) -> SecurityResult<HsmResponse>;
}

/// Software fallback implementing the full contract against the key
/// manager
pub struct SoftHsm {
    keys: Arc<KeyManager>,
}

impl SoftHsm {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    fn key_type_param(params: &HashMap<String, String>) -> SecurityResult<KeyType> {
        match params.get("key_type").map(String::as_str) {
            Some("PEK") => Ok(KeyType::Pek),
            Some("TEK") => Ok(KeyType::Tek),
            Some("ZEK") => Ok(KeyType::Zek),
            Some("MAK") => Ok(KeyType::Mak),
            Some("DEK") => Ok(KeyType::Dek),
            Some("KEK") => Ok(KeyType::Kek),
            other => Err(SecurityError::Hsm {
                reason: format!("bad key_type param {:?}", other),
            }),
        }
    }

    fn algorithm_param(params: &HashMap<String, String>) -> MacAlgorithm {
        match params.get("algorithm").map(String::as_str) {
            Some("ISO9797_ALG1") => MacAlgorithm::Iso9797Alg1,
            Some("X9_19") => MacAlgorithm::AnsiX919,
            Some("AES_CMAC") => MacAlgorithm::AesCmac,
            Some("HMAC_SHA256") => MacAlgorithm::HmacSha256,
            _ => MacAlgorithm::Iso9797Alg3,
        }
    }

    fn require_key<'r>(request: &'r HsmRequest) -> SecurityResult<&'r str> {
        request.key_id.as_deref().ok_or_else(|| SecurityError::Hsm {
            reason: "key_id required".to_string(),
        })
    }
}

#[async_trait]
impl HsmAdapter for SoftHsm {
    async fn execute(&self, request: HsmRequest) -> SecurityResult<HsmResponse> {
        match request.operation {
            HsmOperation::GenerateKey => {
                let key_type = Self::key_type_param(&request.params)?;
                let length = request
                    .params
                    .get("length")
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(16);
                let info = self.keys.generate_key(key_type, length)?;
                Ok(HsmResponse::ok(info.id.into_bytes()))
            }
            HsmOperation::ImportKey => {
                let key_type = Self::key_type_param(&request.params)?;
                let kcv = request.params.get("kcv").map(String::as_str);
                let alias = request.params.get("alias").cloned();
                let info =
                    self.keys
                        .import_key(key_type, request.payload.clone(), alias, kcv)?;
                Ok(HsmResponse::ok(info.id.into_bytes()))
            }
            HsmOperation::ExportKey => {
                // Clear-key export never leaves a real module; the soft
                // fallback refuses as well and returns only the KCV.
                let key_id = Self::require_key(&request)?;
                let info = self.keys.info(key_id)?;
                Ok(HsmResponse::ok(info.kcv.into_bytes()))
            }
            HsmOperation::TranslatePinBlock => {
                let key_id = Self::require_key(&request)?;
                let target = request.target_key_id.as_deref().ok_or_else(|| {
                    SecurityError::Hsm {
                        reason: "target_key_id required".to_string(),
                    }
                })?;
                let data: [u8; 8] =
                    request
                        .payload
                        .as_slice()
                        .try_into()
                        .map_err(|_| SecurityError::Hsm {
                            reason: "PIN block must be 8 bytes".to_string(),
                        })?;
                let block = PinBlock::from_encrypted(PinFormat::Iso0, data, key_id);
                let translated = PinCrypto::new(&self.keys).translate(&block, target)?;
                Ok(HsmResponse::ok(translated.bytes().to_vec()))
            }
            HsmOperation::GenerateMac => {
                let key_id = Self::require_key(&request)?;
                let material = self.keys.material_for_encrypt(key_id)?;
                let algorithm = Self::algorithm_param(&request.params);
                let mac = calculate_mac(algorithm, &material, &request.payload)?;
                Ok(HsmResponse::ok(mac))
            }
            HsmOperation::VerifyMac => {
                let key_id = Self::require_key(&request)?;
                let expected = request.expected.as_deref().ok_or_else(|| {
                    SecurityError::Hsm {
                        reason: "expected MAC required".to_string(),
                    }
                })?;
                let material = self.keys.material_for_decrypt(key_id)?;
                let algorithm = Self::algorithm_param(&request.params);
                let ok = verify_mac(algorithm, &material, &request.payload, expected)?;
                if ok {
                    Ok(HsmResponse::ok(Vec::new()))
                } else {
                    Ok(HsmResponse::failed("MAC mismatch"))
                }
            }
            HsmOperation::Encrypt => {
                let key_id = Self::require_key(&request)?;
                let material = self.keys.material_for_encrypt(key_id)?;
                let mut buf = crate::mac::pad_method2(&request.payload);
                tdes::ecb_encrypt(&material, &mut buf)?;
                Ok(HsmResponse::ok(buf))
            }
            HsmOperation::Decrypt => {
                let key_id = Self::require_key(&request)?;
                let material = self.keys.material_for_decrypt(key_id)?;
                let mut buf = request.payload.clone();
                tdes::ecb_decrypt(&material, &mut buf)?;
                let clear = crate::mac::unpad_method2(&buf)?;
                Ok(HsmResponse::ok(clear))
            }
            HsmOperation::Status => Ok(HsmResponse {
                success: true,
                payload: Vec::new(),
                status: Some(format!("soft-hsm keys={}", self.keys.list().len())),
                error: None,
            }),
            HsmOperation::Diagnostics => {
                let lines: Vec<String> = self
                    .keys
                    .list()
                    .into_iter()
                    .map(|k| format!("{} {:?} {} v{}", k.id, k.key_type, k.status, k.version))
                    .collect();
                Ok(HsmResponse {
                    success: true,
                    payload: lines.join("\n").into_bytes(),
                    status: Some("ok".to_string()),
                    error: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soft_hsm() -> (Arc<KeyManager>, SoftHsm) {
        let keys = Arc::new(KeyManager::new());
        (Arc::clone(&keys), SoftHsm::new(keys))
    }

    #[tokio::test]
    async fn generate_and_mac_via_adapter() {
        let (_, hsm) = soft_hsm();
        let generated = hsm
            .execute(
                HsmRequest::new(HsmOperation::GenerateKey)
                    .param("key_type", "MAK")
                    .param("length", "16"),
            )
            .await
            .unwrap();
        let key_id = String::from_utf8(generated.payload).unwrap();

        let body = b"0200 transaction body".to_vec();
        let mac = hsm
            .execute(
                HsmRequest::new(HsmOperation::GenerateMac)
                    .key(&key_id)
                    .payload(body.clone()),
            )
            .await
            .unwrap();
        assert!(mac.success);

        let verify = hsm
            .execute(
                HsmRequest::new(HsmOperation::VerifyMac)
                    .key(&key_id)
                    .payload(body)
                    .expected(mac.payload),
            )
            .await
            .unwrap();
        assert!(verify.success);
    }

    #[tokio::test]
    async fn verify_rejects_tampered_body() {
        let (_, hsm) = soft_hsm();
        let generated = hsm
            .execute(HsmRequest::new(HsmOperation::GenerateKey).param("key_type", "MAK"))
            .await
            .unwrap();
        let key_id = String::from_utf8(generated.payload).unwrap();
        let mac = hsm
            .execute(
                HsmRequest::new(HsmOperation::GenerateMac)
                    .key(&key_id)
                    .payload(b"body".to_vec()),
            )
            .await
            .unwrap();
        let verify = hsm
            .execute(
                HsmRequest::new(HsmOperation::VerifyMac)
                    .key(&key_id)
                    .payload(b"b0dy".to_vec())
                    .expected(mac.payload),
            )
            .await
            .unwrap();
        assert!(!verify.success);
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let (_, hsm) = soft_hsm();
        let generated = hsm
            .execute(HsmRequest::new(HsmOperation::GenerateKey).param("key_type", "DEK"))
            .await
            .unwrap();
        let key_id = String::from_utf8(generated.payload).unwrap();
        let encrypted = hsm
            .execute(
                HsmRequest::new(HsmOperation::Encrypt)
                    .key(&key_id)
                    .payload(b"sensitive".to_vec()),
            )
            .await
            .unwrap();
        let decrypted = hsm
            .execute(
                HsmRequest::new(HsmOperation::Decrypt)
                    .key(&key_id)
                    .payload(encrypted.payload),
            )
            .await
            .unwrap();
        assert_eq!(decrypted.payload, b"sensitive");
    }

    #[tokio::test]
    async fn export_returns_only_kcv() {
        let (keys, hsm) = soft_hsm();
        let info = keys.generate_key(KeyType::Kek, 16).unwrap();
        let exported = hsm
            .execute(HsmRequest::new(HsmOperation::ExportKey).key(&info.id))
            .await
            .unwrap();
        assert_eq!(exported.payload, info.kcv.into_bytes());
    }
}
