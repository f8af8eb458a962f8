//! Schema-driven message assembler
//!
//! The symmetric inverse of the parser: header, BCD MTI, bitmap from the
//! set of present fields, then each field in ascending number order with
//! its length prefix. Fixed-length values are right-space-padded
//! (alphanumeric) or left-zero-padded (numeric).

use crate::encodings;
use crate::error::{CodecError, CodecResult};
use crate::message::{FieldValue, Message};
use crate::schema::{DataType, FieldDef, FieldEncoding, LengthType, MessageSchema};

/// Stateless, reentrant assembler over one schema
pub struct MessageAssembler<'a> {
    schema: &'a MessageSchema,
}

impl<'a> MessageAssembler<'a> {
    pub fn new(schema: &'a MessageSchema) -> Self {
        Self { schema }
    }

    /// Assemble the full wire form of a message
    pub fn assemble(&self, message: &Message) -> CodecResult<Vec<u8>> {
        let mut body = Vec::new();

        if let Some(header) = &self.schema.header {
            for def in &header.fields {
                let value = message.header().get(&def.id).cloned().or_else(|| {
                    def.default.as_ref().map(|d| FieldValue::Text(d.clone()))
                });
                match value {
                    Some(v) => self.encode_field(&mut body, def, &v)?,
                    None if def.required => {
                        return Err(CodecError::field(&def.id, "required header field missing"))
                    }
                    None => {
                        return Err(CodecError::field(&def.id, "header field missing"))
                    }
                }
            }
        }

        body.extend_from_slice(&encodings::bcd_encode(message.mti())?);
        body.extend_from_slice(&message.bitmap().to_bytes());

        for number in message.field_numbers() {
            let def = self
                .schema
                .field(number)
                .ok_or(CodecError::UnknownField { number })?;
            let value = message.get(number).expect("present field");
            self.encode_field(&mut body, def, value)?;
        }

        for def in &self.schema.trailer {
            let value = message.header().get(&def.id).cloned().or_else(|| {
                def.default.as_ref().map(|d| FieldValue::Text(d.clone()))
            });
            if let Some(v) = value {
                self.encode_field(&mut body, def, &v)?;
            } else if def.required {
                return Err(CodecError::field(&def.id, "required trailer field missing"));
            }
        }

        // Validate required body fields after the walk so the error names
        // the first gap in schema order
        for def in self.schema.fields() {
            if def.required && message.get(def.number).is_none() && def.default.is_none() {
                return Err(CodecError::field(&def.id, "required field missing"));
            }
        }

        if let Some(header) = &self.schema.header {
            if header.include_length {
                let digits = header.length_bytes * 2;
                let max = 10usize.pow(digits as u32) - 1;
                if body.len() > max {
                    return Err(CodecError::field(
                        "header.length",
                        format!("message length {} exceeds {}", body.len(), max),
                    ));
                }
                let prefix =
                    encodings::bcd_encode(&format!("{:0width$}", body.len(), width = digits))?;
                let mut framed = prefix;
                framed.extend_from_slice(&body);
                return Ok(framed);
            }
        }
        Ok(body)
    }

    /// Encode one field: length prefix when variable, then the data
    fn encode_field(
        &self,
        out: &mut Vec<u8>,
        def: &FieldDef,
        value: &FieldValue,
    ) -> CodecResult<()> {
        if def.data_type == DataType::Composite {
            return self.encode_composite(out, def, value);
        }

        let units = self.value_units(def, value)?;
        match def.length_type {
            LengthType::Fixed => {
                if units > def.length {
                    return Err(CodecError::Overflow {
                        field: def.id.clone(),
                        len: units,
                        max: def.length,
                    });
                }
            }
            _ => {
                let max = def.length.min(def.length_type.max_length());
                if units > max {
                    return Err(CodecError::Overflow {
                        field: def.id.clone(),
                        len: units,
                        max,
                    });
                }
                self.encode_length_prefix(out, def, units)?;
            }
        }
        self.encode_data(out, def, value, units)
    }

    /// Number of positions the value occupies: characters, digits or bytes
    /// depending on the encoding
    fn value_units(&self, def: &FieldDef, value: &FieldValue) -> CodecResult<usize> {
        match (value, def.encoding) {
            (FieldValue::Text(s), FieldEncoding::Hex) => {
                if s.len() % 2 != 0 {
                    return Err(CodecError::field(&def.id, "odd hex length"));
                }
                Ok(s.len() / 2)
            }
            (FieldValue::Text(s), _) => Ok(s.len()),
            (FieldValue::Bytes(b), _) => Ok(b.len()),
            (FieldValue::Composite(_), _) => {
                Err(CodecError::field(&def.id, "composite in scalar field"))
            }
        }
    }

    fn encode_length_prefix(
        &self,
        out: &mut Vec<u8>,
        def: &FieldDef,
        units: usize,
    ) -> CodecResult<()> {
        let digits = def.length_type.prefix_digits();
        let text = format!("{:0width$}", units, width = digits);
        match def.length_encoding {
            FieldEncoding::Bcd => out.extend_from_slice(&encodings::bcd_encode(&text)?),
            FieldEncoding::Ascii => out.extend_from_slice(text.as_bytes()),
            FieldEncoding::Ebcdic => {
                out.extend_from_slice(&encodings::ascii_to_ebcdic(text.as_bytes()))
            }
            other => {
                return Err(CodecError::field(
                    &def.id,
                    format!("unsupported length encoding {:?}", other),
                ))
            }
        }
        Ok(())
    }

    fn encode_data(
        &self,
        out: &mut Vec<u8>,
        def: &FieldDef,
        value: &FieldValue,
        units: usize,
    ) -> CodecResult<()> {
        let fixed = def.length_type == LengthType::Fixed;
        match (value, def.encoding) {
            (FieldValue::Text(s), FieldEncoding::Ascii) => {
                let padded = if fixed {
                    self.pad_text(def, s)
                } else {
                    s.clone()
                };
                out.extend_from_slice(padded.as_bytes());
            }
            (FieldValue::Text(s), FieldEncoding::Ebcdic) => {
                let padded = if fixed {
                    self.pad_text(def, s)
                } else {
                    s.clone()
                };
                out.extend_from_slice(&encodings::ascii_to_ebcdic(padded.as_bytes()));
            }
            (FieldValue::Text(s), FieldEncoding::Bcd) => {
                let padded = if fixed {
                    format!("{:0>width$}", s, width = def.length)
                } else {
                    s.clone()
                };
                out.extend_from_slice(&encodings::bcd_encode(&padded)?);
            }
            (FieldValue::Text(s), FieldEncoding::Hex) => {
                out.extend_from_slice(&encodings::hex_decode(s)?);
                if fixed && units < def.length {
                    out.extend(std::iter::repeat(0u8).take(def.length - units));
                }
            }
            (FieldValue::Text(s), FieldEncoding::PackedDecimal) => {
                out.extend_from_slice(&encodings::packed_decimal_encode(s)?);
            }
            (FieldValue::Text(_), FieldEncoding::Binary) => {
                return Err(CodecError::field(&def.id, "text value in binary field"));
            }
            (FieldValue::Bytes(b), FieldEncoding::Binary) => {
                out.extend_from_slice(b);
                if fixed && b.len() < def.length {
                    out.extend(std::iter::repeat(0u8).take(def.length - b.len()));
                }
            }
            (FieldValue::Bytes(_), other) => {
                return Err(CodecError::field(
                    &def.id,
                    format!("byte value in {:?} field", other),
                ));
            }
            (FieldValue::Composite(_), _) => unreachable!("handled above"),
        }
        Ok(())
    }

    /// Fixed character fields: alphanumerics pad right with spaces,
    /// numerics pad left with zeros
    fn pad_text(&self, def: &FieldDef, s: &str) -> String {
        match def.data_type {
            DataType::Numeric | DataType::Bcd => format!("{:0>width$}", s, width = def.length),
            _ => format!("{:<width$}", s, width = def.length),
        }
    }

    /// Composite: assemble children into a region, then emit the region
    /// with the composite's own length discipline
    fn encode_composite(
        &self,
        out: &mut Vec<u8>,
        def: &FieldDef,
        value: &FieldValue,
    ) -> CodecResult<()> {
        let children = value
            .as_composite()
            .ok_or_else(|| CodecError::field(&def.id, "scalar in composite field"))?;
        let mut region = Vec::new();
        for child in &def.children {
            let child_value = children.get(&child.id).cloned().or_else(|| {
                child.default.as_ref().map(|d| FieldValue::Text(d.clone()))
            });
            match child_value {
                Some(v) => self.encode_field(&mut region, child, &v)?,
                None => {
                    return Err(CodecError::field(
                        format!("{}.{}", def.id, child.id),
                        "composite child missing",
                    ))
                }
            }
        }
        match def.length_type {
            LengthType::Fixed => {
                if region.len() != def.length {
                    return Err(CodecError::field(
                        &def.id,
                        format!("composite is {} bytes, expected {}", region.len(), def.length),
                    ));
                }
            }
            _ => {
                let max = def.length.min(def.length_type.max_length());
                if region.len() > max {
                    return Err(CodecError::Overflow {
                        field: def.id.clone(),
                        len: region.len(),
                        max,
                    });
                }
                self.encode_length_prefix(out, def, region.len())?;
            }
        }
        out.extend_from_slice(&region);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::MessageParser;
    use crate::schema::{HeaderDef, SchemaBuilder};
    use std::collections::BTreeMap;

    fn schema() -> MessageSchema {
        SchemaBuilder::new("test", "1.0")
            .header(HeaderDef::fisc())
            .field(
                FieldDef::fixed("stan", 11, DataType::Numeric, 6, FieldEncoding::Bcd).required(),
            )
            .field(FieldDef::fixed(
                "terminal",
                41,
                DataType::Alphanumeric,
                8,
                FieldEncoding::Ascii,
            ))
            .field(FieldDef::variable(
                "additional",
                44,
                DataType::Alphanumeric,
                25,
                LengthType::Llvar,
                FieldEncoding::Ascii,
            ))
            .field(
                FieldDef::variable(
                    "icc",
                    55,
                    DataType::Composite,
                    255,
                    LengthType::Lllvar,
                    FieldEncoding::Binary,
                )
                .with_children(vec![
                    FieldDef::fixed("app_id", 0, DataType::Alphanumeric, 4, FieldEncoding::Ascii),
                    FieldDef::variable(
                        "cryptogram",
                        0,
                        DataType::Hex,
                        32,
                        LengthType::Llvar,
                        FieldEncoding::Hex,
                    ),
                ]),
            )
            .build()
    }

    #[test]
    fn fixed_padding_conventions() {
        let schema = schema();
        let mut msg = Message::new("0200").unwrap();
        msg.set(11, "42").unwrap();
        msg.set(41, "T1").unwrap();
        let bytes = MessageAssembler::new(&schema).assemble(&msg).unwrap();
        let parsed = MessageParser::new(&schema).parse(&bytes).unwrap();
        // Numeric left-zero-padded; alphanumeric right-space-padded then
        // trimmed back on decode
        assert_eq!(parsed.get_text(11), Some("000042"));
        assert_eq!(parsed.get_text(41), Some("T1"));
    }

    #[test]
    fn variable_field_prefix_capacity_enforced() {
        let schema = schema();
        let mut msg = Message::new("0200").unwrap();
        msg.set(11, "000001").unwrap();
        msg.set(44, "X".repeat(26)).unwrap();
        let err = MessageAssembler::new(&schema).assemble(&msg).unwrap_err();
        assert!(matches!(err, CodecError::Overflow { .. }));
    }

    #[test]
    fn missing_required_field_fails() {
        let schema = schema();
        let mut msg = Message::new("0200").unwrap();
        msg.set(41, "ATM00001").unwrap();
        let err = MessageAssembler::new(&schema).assemble(&msg).unwrap_err();
        assert!(matches!(err, CodecError::Field { .. }));
    }

    #[test]
    fn composite_round_trips() {
        let schema = schema();
        let mut children = BTreeMap::new();
        children.insert("app_id".to_string(), FieldValue::Text("A000".to_string()));
        children.insert(
            "cryptogram".to_string(),
            FieldValue::Text("DEADBEEF".to_string()),
        );
        let mut msg = Message::new("0200").unwrap();
        msg.set(11, "000001").unwrap();
        msg.set(55, FieldValue::Composite(children)).unwrap();

        let bytes = MessageAssembler::new(&schema).assemble(&msg).unwrap();
        let parsed = MessageParser::new(&schema).parse(&bytes).unwrap();
        let icc = parsed.get(55).unwrap().as_composite().unwrap();
        assert_eq!(icc["app_id"].as_text(), Some("A000"));
        assert_eq!(icc["cryptogram"].as_text(), Some("DEADBEEF"));
    }
}
