//! Schema-driven message parser
//!
//! Decode order: header length (bound only) → header fields → MTI →
//! primary bitmap → secondary bitmap when bit 1 is set → each present
//! field in ascending number order → trailer. Partial reads always yield
//! a parse error carrying the offset.

use std::collections::BTreeMap;

use crate::bitmap::Bitmap;
use crate::encodings;
use crate::error::{CodecError, CodecResult};
use crate::message::{FieldValue, Message};
use crate::schema::{DataType, FieldDef, FieldEncoding, LengthType, MessageSchema};

/// Byte cursor with EOF-as-parse-error semantics
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, expected: &str) -> CodecResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Parse {
                offset: self.pos,
                expected: format!("{} ({} bytes)", expected, n),
                got: format!("{} bytes left", self.buf.len() - self.pos),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Stateless, reentrant parser over one schema
pub struct MessageParser<'a> {
    schema: &'a MessageSchema,
}

impl<'a> MessageParser<'a> {
    pub fn new(schema: &'a MessageSchema) -> Self {
        Self { schema }
    }

    /// Parse one complete message from the buffer
    pub fn parse(&self, buf: &[u8]) -> CodecResult<Message> {
        let mut cur = Cursor::new(buf);

        // Header length bounds the read but is otherwise discarded
        if let Some(header) = &self.schema.header {
            if header.include_length {
                let raw = cur.take(header.length_bytes, "header length")?;
                let digits = encodings::bcd_decode(raw, header.length_bytes * 2)?;
                let declared: usize = digits.parse().map_err(|_| {
                    CodecError::field("header.length", format!("bad length {:?}", digits))
                })?;
                if declared > cur.remaining() {
                    return Err(CodecError::Parse {
                        offset: cur.pos,
                        expected: format!("{} bytes per header length", declared),
                        got: format!("{} bytes left", cur.remaining()),
                    });
                }
            }
        }

        let mut header_fields = Vec::new();
        if let Some(header) = &self.schema.header {
            for def in &header.fields {
                let value = self.decode_field(&mut cur, def)?;
                header_fields.push((def.id.clone(), value));
            }
        }

        // MTI: two bytes BCD, four digits
        let mti_raw = cur.take(2, "MTI")?;
        let mti = encodings::bcd_decode(mti_raw, 4)?;

        let primary = cur.take(8, "primary bitmap")?;
        let bitmap = if primary[0] & 0x80 != 0 {
            let mut both = primary.to_vec();
            both.extend_from_slice(cur.take(8, "secondary bitmap")?);
            Bitmap::from_bytes(&both)?
        } else {
            Bitmap::from_bytes(primary)?
        };

        let mut message = Message::new(mti)?;
        for (id, value) in header_fields {
            message.set_header(id, value);
        }

        for number in bitmap.fields() {
            let def = self
                .schema
                .field(number)
                .ok_or(CodecError::UnknownField { number })?;
            let value = self.decode_field(&mut cur, def)?;
            message.set(number, value)?;
        }

        for def in &self.schema.trailer {
            let value = self.decode_field(&mut cur, def)?;
            message.set_header(def.id.clone(), value);
        }

        Ok(message)
    }

    /// Decode one field: length prefix when variable, then the data
    fn decode_field(&self, cur: &mut Cursor<'_>, def: &FieldDef) -> CodecResult<FieldValue> {
        let units = match def.length_type {
            LengthType::Fixed => def.length,
            _ => {
                let len = self.decode_length_prefix(cur, def)?;
                if len > def.length_type.max_length() || len > def.length {
                    return Err(CodecError::Overflow {
                        field: def.id.clone(),
                        len,
                        max: def.length.min(def.length_type.max_length()),
                    });
                }
                len
            }
        };
        self.decode_data(cur, def, units)
    }

    fn decode_length_prefix(&self, cur: &mut Cursor<'_>, def: &FieldDef) -> CodecResult<usize> {
        let digits = def.length_type.prefix_digits();
        let text = match def.length_encoding {
            FieldEncoding::Bcd => {
                let raw = cur.take(digits.div_ceil(2), "length prefix")?;
                encodings::bcd_decode(raw, digits)?
            }
            FieldEncoding::Ascii => {
                let raw = cur.take(digits, "length prefix")?;
                String::from_utf8_lossy(raw).into_owned()
            }
            FieldEncoding::Ebcdic => {
                let raw = cur.take(digits, "length prefix")?;
                String::from_utf8_lossy(&encodings::ebcdic_to_ascii(raw)).into_owned()
            }
            other => {
                return Err(CodecError::field(
                    &def.id,
                    format!("unsupported length encoding {:?}", other),
                ))
            }
        };
        text.trim().parse().map_err(|_| {
            CodecError::field(&def.id, format!("bad length prefix {:?}", text))
        })
    }

    /// Decode `units` positions of data per the field encoding. Units are
    /// characters for character encodings, digits for BCD, bytes for
    /// binary and hex.
    fn decode_data(
        &self,
        cur: &mut Cursor<'_>,
        def: &FieldDef,
        units: usize,
    ) -> CodecResult<FieldValue> {
        if def.data_type == DataType::Composite {
            return self.decode_composite(cur, def, units);
        }
        match def.encoding {
            FieldEncoding::Ascii => {
                let raw = cur.take(units, &def.id)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| CodecError::field(&def.id, "non-UTF8 ASCII data"))?;
                Ok(FieldValue::Text(self.canonical_text(def, text)))
            }
            FieldEncoding::Ebcdic => {
                let raw = cur.take(units, &def.id)?;
                let ascii = encodings::ebcdic_to_ascii(raw);
                let text = String::from_utf8_lossy(&ascii).into_owned();
                Ok(FieldValue::Text(self.canonical_text(def, &text)))
            }
            FieldEncoding::Bcd => {
                let raw = cur.take(units.div_ceil(2), &def.id)?;
                Ok(FieldValue::Text(encodings::bcd_decode(raw, units)?))
            }
            FieldEncoding::Hex => {
                let raw = cur.take(units, &def.id)?;
                Ok(FieldValue::Text(encodings::hex_encode(raw)))
            }
            FieldEncoding::Binary => {
                let raw = cur.take(units, &def.id)?;
                Ok(FieldValue::Bytes(raw.to_vec()))
            }
            FieldEncoding::PackedDecimal => {
                let raw = cur.take((units + 1).div_ceil(2), &def.id)?;
                Ok(FieldValue::Text(encodings::packed_decimal_decode(raw)?))
            }
        }
    }

    /// Fixed alphanumeric data arrives right-space-padded; strip it back to
    /// the canonical value. Numerics keep their leading zeros.
    fn canonical_text(&self, def: &FieldDef, text: &str) -> String {
        match (def.length_type, def.data_type) {
            (LengthType::Fixed, DataType::Alphanumeric) | (LengthType::Fixed, DataType::Track2) => {
                text.trim_end_matches(' ').to_string()
            }
            _ => text.to_string(),
        }
    }

    /// Composite region: children decoded in order, consuming the region
    /// exactly
    fn decode_composite(
        &self,
        cur: &mut Cursor<'_>,
        def: &FieldDef,
        region_bytes: usize,
    ) -> CodecResult<FieldValue> {
        let raw = cur.take(region_bytes, &def.id)?;
        let mut inner = Cursor::new(raw);
        let mut children = BTreeMap::new();
        for child in &def.children {
            let value = self.decode_field(&mut inner, child)?;
            children.insert(child.id.clone(), value);
        }
        if inner.remaining() != 0 {
            return Err(CodecError::field(
                &def.id,
                format!("{} trailing bytes in composite", inner.remaining()),
            ));
        }
        Ok(FieldValue::Composite(children))
    }
}
