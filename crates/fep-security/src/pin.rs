//! ISO 9564 PIN blocks
//!
//! Formats 0 and 3 XOR the PIN field with a PAN-derived field; formats 1
//! and 2 stand alone. All clear blocks are held in zeroize-on-drop
//! buffers and encrypted with 3DES-ECB under a PEK from the key manager.

use rand::Rng;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{SecurityError, SecurityResult};
use crate::keys::{KeyManager, KeyType};
use crate::tdes;

/// ISO 9564 PIN block format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinFormat {
    /// Format 0: PIN field XOR PAN field
    Iso0,
    /// Format 1: random padding, no PAN binding
    Iso1,
    /// Format 2: F padding, no PAN binding (IC card)
    Iso2,
    /// Format 3: random A-F padding, PAN binding as format 0
    Iso3,
    /// Format 4 (AES, 16 bytes) - recognized but not produced
    Iso4,
}

impl PinFormat {
    /// Control nibble carried in the first half-byte of the block
    pub fn control_nibble(&self) -> u8 {
        match self {
            Self::Iso0 => 0x0,
            Self::Iso1 => 0x1,
            Self::Iso2 => 0x2,
            Self::Iso3 => 0x3,
            Self::Iso4 => 0x4,
        }
    }

    fn from_nibble(nibble: u8) -> SecurityResult<Self> {
        match nibble {
            0x0 => Ok(Self::Iso0),
            0x1 => Ok(Self::Iso1),
            0x2 => Ok(Self::Iso2),
            0x3 => Ok(Self::Iso3),
            other => Err(SecurityError::MalformedPinBlock {
                reason: format!("control nibble {:X}", other),
            }),
        }
    }

    /// Whether this format XORs the PAN field into the block
    pub fn uses_pan(&self) -> bool {
        matches!(self, Self::Iso0 | Self::Iso3)
    }
}

/// An 8-byte PIN block, clear or encrypted
///
/// Never printed; the Debug form shows only format and state.
#[derive(Clone)]
pub struct PinBlock {
    format: PinFormat,
    data: [u8; 8],
    encrypted: bool,
    key_id: Option<String>,
}

impl Drop for PinBlock {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for PinBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinBlock")
            .field("format", &self.format)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

impl PinBlock {
    /// Wrap encrypted wire bytes received in field 52
    pub fn from_encrypted(format: PinFormat, data: [u8; 8], key_id: impl Into<String>) -> Self {
        Self {
            format,
            data,
            encrypted: true,
            key_id: Some(key_id.into()),
        }
    }

    pub fn format(&self) -> PinFormat {
        self.format
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// The raw 8 bytes. Callers zeroize their copies after use.
    pub fn bytes(&self) -> [u8; 8] {
        self.data
    }
}

fn validate_pin(pin: &str) -> SecurityResult<()> {
    if !(4..=12).contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SecurityError::InvalidPin);
    }
    Ok(())
}

fn validate_pan(pan: &str) -> SecurityResult<()> {
    if pan.len() < 13 || !pan.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SecurityError::InvalidPan);
    }
    Ok(())
}

/// PAN field for formats 0 and 3: four zero digits then the rightmost
/// twelve PAN digits excluding the check digit
fn pan_field(pan: &str) -> SecurityResult<[u8; 8]> {
    validate_pan(pan)?;
    let without_check = &pan[..pan.len() - 1];
    let twelve = &without_check[without_check.len() - 12..];
    let mut field = [0u8; 8];
    for (i, b) in twelve.bytes().enumerate() {
        let nibble = b - b'0';
        let byte = 2 + i / 2;
        if i % 2 == 0 {
            field[byte] |= nibble << 4;
        } else {
            field[byte] |= nibble;
        }
    }
    Ok(field)
}

/// Build the PIN field for a format: control nibble, length nibble, PIN
/// digits, then format-specific padding
fn pin_field(format: PinFormat, pin: &str) -> SecurityResult<[u8; 8]> {
    validate_pin(pin)?;
    let mut nibbles = Vec::with_capacity(16);
    nibbles.push(format.control_nibble());
    nibbles.push(pin.len() as u8);
    nibbles.extend(pin.bytes().map(|b| b - b'0'));
    let mut rng = rand::thread_rng();
    while nibbles.len() < 16 {
        let pad = match format {
            PinFormat::Iso0 | PinFormat::Iso2 => 0xF,
            PinFormat::Iso1 => rng.gen_range(0x0..=0xF),
            PinFormat::Iso3 => rng.gen_range(0xA..=0xF),
            PinFormat::Iso4 => {
                return Err(SecurityError::MalformedPinBlock {
                    reason: "format 4 not produced".to_string(),
                })
            }
        };
        nibbles.push(pad);
    }
    let mut field = [0u8; 8];
    for (i, nibble) in nibbles.iter().enumerate() {
        if i % 2 == 0 {
            field[i / 2] |= nibble << 4;
        } else {
            field[i / 2] |= nibble;
        }
    }
    nibbles.zeroize();
    Ok(field)
}

/// PIN block construction, encryption, translation and format conversion
pub struct PinCrypto<'a> {
    keys: &'a KeyManager,
}

impl<'a> PinCrypto<'a> {
    pub fn new(keys: &'a KeyManager) -> Self {
        Self { keys }
    }

    /// Build a clear PIN block in the given format
    pub fn create_pin_block(
        &self,
        format: PinFormat,
        pin: &str,
        pan: &str,
    ) -> SecurityResult<PinBlock> {
        let mut data = pin_field(format, pin)?;
        if format.uses_pan() {
            let pan_f = pan_field(pan)?;
            for (d, p) in data.iter_mut().zip(pan_f.iter()) {
                *d ^= p;
            }
        }
        Ok(PinBlock {
            format,
            data,
            encrypted: false,
            key_id: None,
        })
    }

    /// Extract the PIN digits from a clear block
    pub fn extract_pin(&self, block: &PinBlock, pan: &str) -> SecurityResult<Zeroizing<String>> {
        if block.encrypted {
            return Err(SecurityError::PinBlockState {
                reason: "extract requires a clear block".to_string(),
            });
        }
        let mut field = block.data;
        if block.format.uses_pan() {
            let pan_f = pan_field(pan)?;
            for (d, p) in field.iter_mut().zip(pan_f.iter()) {
                *d ^= p;
            }
        }
        let control = field[0] >> 4;
        let declared = PinFormat::from_nibble(control)?;
        if declared != block.format {
            field.zeroize();
            return Err(SecurityError::MalformedPinBlock {
                reason: "control nibble does not match declared format".to_string(),
            });
        }
        let len = (field[0] & 0x0F) as usize;
        if !(4..=12).contains(&len) {
            field.zeroize();
            return Err(SecurityError::MalformedPinBlock {
                reason: format!("PIN length {}", len),
            });
        }
        let mut pin = Zeroizing::new(String::with_capacity(len));
        for i in 0..len {
            let nibble_index = 2 + i;
            let byte = field[nibble_index / 2];
            let nibble = if nibble_index % 2 == 0 {
                byte >> 4
            } else {
                byte & 0x0F
            };
            if nibble > 9 {
                field.zeroize();
                return Err(SecurityError::MalformedPinBlock {
                    reason: "non-digit in PIN field".to_string(),
                });
            }
            pin.push((b'0' + nibble) as char);
        }
        field.zeroize();
        Ok(pin)
    }

    /// Encrypt a clear block under a PEK (current PEK when `key_id` is None)
    pub fn encrypt(&self, block: &PinBlock, key_id: Option<&str>) -> SecurityResult<PinBlock> {
        if block.encrypted {
            return Err(SecurityError::PinBlockState {
                reason: "already encrypted".to_string(),
            });
        }
        let key_id = match key_id {
            Some(id) => id.to_string(),
            None => self.keys.current_key_id(KeyType::Pek)?,
        };
        let material = self.keys.material_for_encrypt(&key_id)?;
        let mut data = block.data;
        tdes::encrypt_block(&material, &mut data)?;
        Ok(PinBlock {
            format: block.format,
            data,
            encrypted: true,
            key_id: Some(key_id),
        })
    }

    /// Decrypt an encrypted block back to clear form
    pub fn decrypt(&self, block: &PinBlock) -> SecurityResult<PinBlock> {
        if !block.encrypted {
            return Err(SecurityError::PinBlockState {
                reason: "already clear".to_string(),
            });
        }
        let key_id = block.key_id.as_deref().ok_or_else(|| {
            SecurityError::PinBlockState {
                reason: "encrypted block without key id".to_string(),
            }
        })?;
        let material = self.keys.material_for_decrypt(key_id)?;
        let mut data = block.data;
        tdes::decrypt_block(&material, &mut data)?;
        Ok(PinBlock {
            format: block.format,
            data,
            encrypted: false,
            key_id: None,
        })
    }

    /// Translate an encrypted block from its key to another key,
    /// zeroizing the intermediate clear form
    pub fn translate(&self, block: &PinBlock, to_key_id: &str) -> SecurityResult<PinBlock> {
        let clear = self.decrypt(block)?;
        let out = self.encrypt(&clear, Some(to_key_id));
        drop(clear); // zeroizes the intermediate buffer
        out
    }

    /// Convert a clear block to another format. Formats 0 and 3 need the
    /// PAN on either side of the conversion.
    pub fn convert_format(
        &self,
        block: &PinBlock,
        to_format: PinFormat,
        pan: &str,
    ) -> SecurityResult<PinBlock> {
        let pin = self.extract_pin(block, pan)?;
        self.create_pin_block(to_format, &pin, pan)
    }
}
