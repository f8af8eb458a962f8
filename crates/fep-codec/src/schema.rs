//! Declarative wire-format schemas
//!
//! A [`MessageSchema`] is an immutable description of one message family:
//! ordered field descriptors keyed by bitmap position, an optional header
//! and trailer, and a default encoding. Schemas are built once through
//! [`SchemaBuilder`] and shared read-only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Data type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Letters, digits and punctuation
    Alphanumeric,
    /// Digits only
    Numeric,
    /// Raw bytes
    Binary,
    /// Packed digits
    Bcd,
    /// Hex string payload
    Hex,
    /// Track-2 data ('=' separator allowed)
    Track2,
    /// Nested fields
    Composite,
}

/// Length discipline of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LengthType {
    /// Exactly `length` positions
    Fixed,
    /// One-digit length prefix (0-9)
    Lvar,
    /// Two-digit length prefix (0-99)
    Llvar,
    /// Three-digit length prefix (0-999)
    Lllvar,
    /// Four-digit length prefix (0-9999)
    Llllvar,
}

impl LengthType {
    /// Number of prefix digits, zero for fixed
    pub fn prefix_digits(&self) -> usize {
        match self {
            Self::Fixed => 0,
            Self::Lvar => 1,
            Self::Llvar => 2,
            Self::Lllvar => 3,
            Self::Llllvar => 4,
        }
    }

    /// Largest data length the prefix can carry
    pub fn max_length(&self) -> usize {
        match self {
            Self::Fixed => usize::MAX,
            Self::Lvar => 9,
            Self::Llvar => 99,
            Self::Lllvar => 999,
            Self::Llllvar => 9999,
        }
    }
}

/// Byte-level encoding of field data (and of variable-length prefixes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldEncoding {
    /// One character per byte
    Ascii,
    /// CP037 translation
    Ebcdic,
    /// Two digits per byte
    Bcd,
    /// Hex string over raw bytes; length counts bytes
    Hex,
    /// Raw passthrough; length counts bytes
    Binary,
    /// BCD with a trailing sign nibble
    PackedDecimal,
}

/// One field descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Stable schema id, e.g. "pan" or "stan"
    pub id: String,
    /// Bitmap position for body fields; 0 for header/trailer/children
    pub number: u16,
    /// Data type
    pub data_type: DataType,
    /// Fixed length, or maximum length for variable fields
    pub length: usize,
    /// Length discipline
    pub length_type: LengthType,
    /// Data encoding
    pub encoding: FieldEncoding,
    /// Encoding of the length prefix for variable fields
    pub length_encoding: FieldEncoding,
    /// Child fields for composites, decoded in order
    pub children: Vec<FieldDef>,
    /// Default value substituted on encode when absent
    pub default: Option<String>,
    /// Whether encode fails when the field is absent and has no default
    pub required: bool,
}

impl FieldDef {
    /// A fixed-length field
    pub fn fixed(
        id: impl Into<String>,
        number: u16,
        data_type: DataType,
        length: usize,
        encoding: FieldEncoding,
    ) -> Self {
        Self {
            id: id.into(),
            number,
            data_type,
            length,
            length_type: LengthType::Fixed,
            encoding,
            length_encoding: FieldEncoding::Bcd,
            children: Vec::new(),
            default: None,
            required: false,
        }
    }

    /// A variable-length field with the given prefix discipline
    pub fn variable(
        id: impl Into<String>,
        number: u16,
        data_type: DataType,
        max: usize,
        length_type: LengthType,
        encoding: FieldEncoding,
    ) -> Self {
        Self {
            id: id.into(),
            number,
            data_type,
            length: max,
            length_type,
            encoding,
            length_encoding: FieldEncoding::Bcd,
            children: Vec::new(),
            default: None,
            required: false,
        }
    }

    /// Override the length-prefix encoding
    pub fn length_encoding(mut self, encoding: FieldEncoding) -> Self {
        self.length_encoding = encoding;
        self
    }

    /// Mark required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the default substituted on encode
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Attach composite children
    pub fn with_children(mut self, children: Vec<FieldDef>) -> Self {
        self.data_type = DataType::Composite;
        self.children = children;
        self
    }
}

/// Header layout preceding the MTI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderDef {
    /// Whether the header starts with a BCD length that bounds the message
    pub include_length: bool,
    /// Bytes consumed by the length when present
    pub length_bytes: usize,
    /// Fields after the length, decoded in order
    pub fields: Vec<FieldDef>,
}

impl HeaderDef {
    /// The standard FISC `[2-byte BCD length]` header
    pub fn fisc() -> Self {
        Self {
            include_length: true,
            length_bytes: 2,
            fields: Vec::new(),
        }
    }
}

/// Immutable description of one wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSchema {
    /// Schema name, e.g. "fisc"
    pub name: String,
    /// Version string
    pub version: String,
    /// Header, when the format carries one
    pub header: Option<HeaderDef>,
    /// Trailer fields after the body, decoded in order
    pub trailer: Vec<FieldDef>,
    /// Default encoding for fields that do not specify one
    pub default_encoding: FieldEncoding,
    /// Body fields keyed by bitmap position
    fields: BTreeMap<u16, FieldDef>,
    /// Field numbers whose values are masked in renderings
    sensitive: Vec<u16>,
}

impl MessageSchema {
    /// Field definition for a bitmap position
    pub fn field(&self, number: u16) -> Option<&FieldDef> {
        self.fields.get(&number)
    }

    /// Field definition by schema id
    pub fn field_by_id(&self, id: &str) -> Option<&FieldDef> {
        self.fields.values().find(|f| f.id == id)
    }

    /// All body field definitions in ascending bitmap order
    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    /// Whether a field's value must be masked in renderings
    pub fn is_sensitive(&self, number: u16) -> bool {
        self.sensitive.contains(&number)
    }
}

/// Builder for [`MessageSchema`]
pub struct SchemaBuilder {
    name: String,
    version: String,
    header: Option<HeaderDef>,
    trailer: Vec<FieldDef>,
    default_encoding: FieldEncoding,
    fields: BTreeMap<u16, FieldDef>,
    sensitive: Vec<u16>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            header: None,
            trailer: Vec::new(),
            default_encoding: FieldEncoding::Ascii,
            fields: BTreeMap::new(),
            sensitive: Vec::new(),
        }
    }

    pub fn header(mut self, header: HeaderDef) -> Self {
        self.header = Some(header);
        self
    }

    pub fn trailer(mut self, fields: Vec<FieldDef>) -> Self {
        self.trailer = fields;
        self
    }

    pub fn default_encoding(mut self, encoding: FieldEncoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// Add a body field at its bitmap position
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.insert(def.number, def);
        self
    }

    /// Mark field numbers as sensitive
    pub fn sensitive(mut self, numbers: &[u16]) -> Self {
        self.sensitive.extend_from_slice(numbers);
        self
    }

    pub fn build(self) -> MessageSchema {
        MessageSchema {
            name: self.name,
            version: self.version,
            header: self.header,
            trailer: self.trailer,
            default_encoding: self.default_encoding,
            fields: self.fields,
            sensitive: self.sensitive,
        }
    }
}
