//! FEP Codec - Schema-driven ISO-8583 wire codec
//!
//! The codec is stateless across messages and reentrant: a schema plus a
//! byte buffer in, a [`Message`] out, and the symmetric inverse on encode.
//! Field layout, encodings and length disciplines are all declared in the
//! [`MessageSchema`]; nothing about a specific switch is hard-wired except
//! the built-in FISC schema registered by [`SchemaRegistry::with_fisc`].

pub mod assembler;
pub mod bitmap;
pub mod encodings;
pub mod error;
pub mod message;
pub mod parser;
pub mod registry;
pub mod schema;

pub use assembler::MessageAssembler;
pub use bitmap::Bitmap;
pub use error::{CodecError, CodecResult};
pub use message::{FieldValue, Message};
pub use parser::MessageParser;
pub use registry::SchemaRegistry;
pub use schema::{
    DataType, FieldDef, FieldEncoding, HeaderDef, LengthType, MessageSchema, SchemaBuilder,
};
