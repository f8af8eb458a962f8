//! Schema registry
//!
//! Process-scoped, passed by reference; never a global. Schemas are stored
//! under "name" and "name:version" so callers can pin a version or take
//! the latest registered one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::schema::{
    DataType, FieldDef, FieldEncoding, HeaderDef, LengthType, MessageSchema, SchemaBuilder,
};

/// Keyed store of immutable schemas
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<MessageSchema>>>,
}

impl SchemaRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in FISC schema
    pub fn with_fisc() -> Self {
        let registry = Self::new();
        registry.register(fisc_schema());
        registry
    }

    /// Register a schema under its name and name:version
    pub fn register(&self, schema: MessageSchema) {
        let schema = Arc::new(schema);
        let mut schemas = self.schemas.write();
        schemas.insert(
            format!("{}:{}", schema.name, schema.version),
            Arc::clone(&schema),
        );
        schemas.insert(schema.name.clone(), schema);
    }

    /// Look up by "name" or "name:version"
    pub fn get(&self, key: &str) -> Option<Arc<MessageSchema>> {
        self.schemas.read().get(key).cloned()
    }
}

/// The built-in FISC interbank schema: `[2-byte BCD length][2-byte BCD MTI]
/// [bitmap][fields]`, BCD numerics, ASCII alphanumerics
pub fn fisc_schema() -> MessageSchema {
    SchemaBuilder::new("fisc", "1.0")
        .header(HeaderDef::fisc())
        .default_encoding(FieldEncoding::Ascii)
        .field(FieldDef::variable(
            "pan",
            2,
            DataType::Numeric,
            19,
            LengthType::Llvar,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "processing_code",
            3,
            DataType::Numeric,
            6,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "amount",
            4,
            DataType::Numeric,
            12,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "transmission_datetime",
            7,
            DataType::Numeric,
            10,
            FieldEncoding::Bcd,
        ))
        .field(
            FieldDef::fixed("stan", 11, DataType::Numeric, 6, FieldEncoding::Bcd).required(),
        )
        .field(FieldDef::fixed(
            "local_time",
            12,
            DataType::Numeric,
            6,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "local_date",
            13,
            DataType::Numeric,
            4,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "expiry",
            14,
            DataType::Numeric,
            4,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "pos_entry_mode",
            22,
            DataType::Numeric,
            3,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::variable(
            "acquiring_institution",
            32,
            DataType::Numeric,
            11,
            LengthType::Llvar,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::variable(
            "track2",
            35,
            DataType::Track2,
            37,
            LengthType::Llvar,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "rrn",
            37,
            DataType::Alphanumeric,
            12,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "auth_code",
            38,
            DataType::Alphanumeric,
            6,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "response_code",
            39,
            DataType::Alphanumeric,
            2,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "terminal_id",
            41,
            DataType::Alphanumeric,
            8,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "merchant_id",
            42,
            DataType::Alphanumeric,
            15,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::variable(
            "additional_response",
            44,
            DataType::Alphanumeric,
            25,
            LengthType::Llvar,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::variable(
            "track1",
            45,
            DataType::Alphanumeric,
            76,
            LengthType::Llvar,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "currency",
            49,
            DataType::Numeric,
            3,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::fixed(
            "pin_block",
            52,
            DataType::Binary,
            8,
            FieldEncoding::Binary,
        ))
        .field(FieldDef::fixed(
            "security_control",
            53,
            DataType::Numeric,
            16,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::variable(
            "additional_amounts",
            54,
            DataType::Alphanumeric,
            120,
            LengthType::Lllvar,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::variable(
            "icc_data",
            55,
            DataType::Binary,
            255,
            LengthType::Lllvar,
            FieldEncoding::Binary,
        ))
        .field(FieldDef::fixed(
            "mac",
            64,
            DataType::Binary,
            8,
            FieldEncoding::Binary,
        ))
        .field(FieldDef::fixed(
            "network_mgmt_code",
            70,
            DataType::Numeric,
            3,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::variable(
            "original_data",
            90,
            DataType::Numeric,
            42,
            LengthType::Llvar,
            FieldEncoding::Bcd,
        ))
        .field(FieldDef::variable(
            "dest_account",
            102,
            DataType::Alphanumeric,
            28,
            LengthType::Llvar,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::variable(
            "source_account",
            103,
            DataType::Alphanumeric,
            28,
            LengthType::Llvar,
            FieldEncoding::Ascii,
        ))
        .field(FieldDef::fixed(
            "mac2",
            128,
            DataType::Binary,
            8,
            FieldEncoding::Binary,
        ))
        .sensitive(&[2, 14, 35, 45, 52, 55])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_name_and_version() {
        let registry = SchemaRegistry::with_fisc();
        assert!(registry.get("fisc").is_some());
        assert!(registry.get("fisc:1.0").is_some());
        assert!(registry.get("fisc:9.9").is_none());
    }

    #[test]
    fn fisc_schema_covers_core_fields() {
        let schema = fisc_schema();
        for number in [2u16, 3, 4, 11, 35, 37, 39, 41, 45, 52, 64, 70, 90, 128] {
            assert!(schema.field(number).is_some(), "field {} missing", number);
        }
        assert!(schema.is_sensitive(2));
        assert!(schema.is_sensitive(52));
        assert!(!schema.is_sensitive(39));
    }

    #[test]
    fn every_sensitive_field_has_a_definition() {
        let schema = fisc_schema();
        for number in 1..=128u16 {
            if schema.is_sensitive(number) {
                assert!(
                    schema.field(number).is_some(),
                    "sensitive field {} has no definition",
                    number
                );
            }
        }
    }

    #[test]
    fn latest_registration_wins_bare_name() {
        let registry = SchemaRegistry::new();
        registry.register(SchemaBuilder::new("fisc", "1.0").build());
        registry.register(SchemaBuilder::new("fisc", "2.0").build());
        assert_eq!(registry.get("fisc").unwrap().version, "2.0");
        assert_eq!(registry.get("fisc:1.0").unwrap().version, "1.0");
    }
}
