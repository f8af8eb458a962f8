//! Decoded wire message
//!
//! Two representations exist at the boundary: the dense by-number map kept
//! here for ISO-8583 traffic, and a by-id view derived through the schema
//! for generic schema-driven callers. Sensitive fields never render in
//! clear text.

use std::collections::BTreeMap;
use std::fmt;

use fep_types::masking::mask_middle;

use crate::bitmap::Bitmap;
use crate::error::{CodecError, CodecResult};
use crate::schema::MessageSchema;

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Textual value (alphanumeric, numeric, track2, hex string)
    Text(String),
    /// Raw bytes (binary fields)
    Bytes(Vec<u8>),
    /// Composite children keyed by child id, in schema order
    Composite(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// The textual form, when this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The raw bytes, when this is a binary value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Child map, when this is a composite
    pub fn as_composite(&self) -> Option<&BTreeMap<String, FieldValue>> {
        match self {
            Self::Composite(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

/// An MTI, a bitmap, and the present fields keyed by number
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    mti: String,
    bitmap: Bitmap,
    fields: BTreeMap<u16, FieldValue>,
    /// Header fields keyed by id, in decode order
    header: BTreeMap<String, FieldValue>,
}

impl Message {
    /// Create an empty message with the given MTI
    pub fn new(mti: impl Into<String>) -> CodecResult<Self> {
        let mti = mti.into();
        if mti.len() != 4 || !mti.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::field("mti", format!("bad MTI {:?}", mti)));
        }
        Ok(Self {
            mti,
            bitmap: Bitmap::new(),
            fields: BTreeMap::new(),
            header: BTreeMap::new(),
        })
    }

    /// Four-digit message type indicator
    pub fn mti(&self) -> &str {
        &self.mti
    }

    /// The current bitmap
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Set a field, raising its bitmap bit
    pub fn set(&mut self, number: u16, value: impl Into<FieldValue>) -> CodecResult<()> {
        self.bitmap.set(number)?;
        self.fields.insert(number, value.into());
        Ok(())
    }

    /// Remove a field, clearing its bitmap bit
    pub fn remove(&mut self, number: u16) -> CodecResult<Option<FieldValue>> {
        self.bitmap.clear(number)?;
        Ok(self.fields.remove(&number))
    }

    /// Value of a field by number
    pub fn get(&self, number: u16) -> Option<&FieldValue> {
        self.fields.get(&number)
    }

    /// Textual value of a field by number
    pub fn get_text(&self, number: u16) -> Option<&str> {
        self.get(number).and_then(FieldValue::as_text)
    }

    /// Binary value of a field by number
    pub fn get_bytes(&self, number: u16) -> Option<&[u8]> {
        self.get(number).and_then(FieldValue::as_bytes)
    }

    /// Present field numbers in ascending order
    pub fn field_numbers(&self) -> impl Iterator<Item = u16> + '_ {
        self.fields.keys().copied()
    }

    /// Header fields keyed by id
    pub fn header(&self) -> &BTreeMap<String, FieldValue> {
        &self.header
    }

    /// Record a decoded header field
    pub fn set_header(&mut self, id: impl Into<String>, value: impl Into<FieldValue>) {
        self.header.insert(id.into(), value.into());
    }

    /// By-id view of the body, derived through the schema. Fields present
    /// on the wire but unknown to the schema are keyed "field<N>".
    pub fn to_named(&self, schema: &MessageSchema) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .map(|(number, value)| {
                let id = schema
                    .field(*number)
                    .map(|f| f.id.clone())
                    .unwrap_or_else(|| format!("field{}", number));
                (id, value.clone())
            })
            .collect()
    }

    /// Masked, single-line rendering for logs. Sensitive fields per the
    /// schema show only their edges; binary values show length only.
    pub fn render_masked(&self, schema: &MessageSchema) -> String {
        use fmt::Write;
        let mut out = String::new();
        let _ = write!(out, "MTI={}", self.mti);
        for (number, value) in &self.fields {
            let rendered = match value {
                FieldValue::Text(s) if schema.is_sensitive(*number) => mask_middle(s, 4),
                FieldValue::Text(s) => s.clone(),
                FieldValue::Bytes(b) => format!("<{} bytes>", b.len()),
                FieldValue::Composite(children) => format!("<composite:{}>", children.len()),
            };
            let _ = write!(out, " F{}={}", number, rendered);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, FieldDef, FieldEncoding, LengthType, SchemaBuilder};

    fn schema() -> MessageSchema {
        SchemaBuilder::new("test", "1.0")
            .field(FieldDef::variable(
                "pan",
                2,
                DataType::Numeric,
                19,
                LengthType::Llvar,
                FieldEncoding::Bcd,
            ))
            .field(FieldDef::fixed(
                "stan",
                11,
                DataType::Numeric,
                6,
                FieldEncoding::Bcd,
            ))
            .sensitive(&[2])
            .build()
    }

    #[test]
    fn set_tracks_bitmap() {
        let mut msg = Message::new("0200").unwrap();
        msg.set(2, "4111111111111111").unwrap();
        msg.set(11, "000001").unwrap();
        assert!(msg.bitmap().is_set(2));
        assert!(msg.bitmap().is_set(11));
        msg.remove(2).unwrap();
        assert!(!msg.bitmap().is_set(2));
    }

    #[test]
    fn bad_mti_rejected() {
        assert!(Message::new("02").is_err());
        assert!(Message::new("02x0").is_err());
    }

    #[test]
    fn masked_rendering_hides_pan() {
        let mut msg = Message::new("0200").unwrap();
        msg.set(2, "4111111111111111").unwrap();
        msg.set(11, "000001").unwrap();
        let rendered = msg.render_masked(&schema());
        assert!(!rendered.contains("4111111111111111"));
        assert!(rendered.contains("F2=4111********1111"));
        assert!(rendered.contains("F11=000001"));
    }

    #[test]
    fn named_view_uses_schema_ids() {
        let mut msg = Message::new("0200").unwrap();
        msg.set(11, "000001").unwrap();
        msg.set(63, "private").unwrap();
        let named = msg.to_named(&schema());
        assert_eq!(named["stan"].as_text(), Some("000001"));
        assert_eq!(named["field63"].as_text(), Some("private"));
    }
}
