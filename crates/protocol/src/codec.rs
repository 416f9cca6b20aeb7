//! Field codec
//!
//! Converts between a [`Frame`] payload and a map of named [`FieldValue`]s
//! using a [`MessageSchema`] layout. Encoding and decoding are symmetric:
//! extracting the fields of a built frame gives back the fields it was built
//! from (missing fields encode as zero / empty).
//!
//! # Field encodings
//! - `U8` / `U16` / `U32`: little-endian integers, carried as `FieldValue::Int`
//! - `Str(n)`: text NUL-padded to exactly `n` bytes
//! - `Bytes(n)`: opaque bytes zero-padded to exactly `n` bytes
//! - `Text`: text followed by a NUL terminator
//!
//! Text is carried as the raw bytes the server sent (game servers use
//! legacy code pages, not UTF-8) so a decoded field encodes back to the
//! same bytes. [`Fields::text`] gives a lossy UTF-8 view for display.
//! - `Blob`: opaque bytes to the end of the payload
//! - `Records`: back-to-back fixed-width records to the end of the payload

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use korelink_core::{KoreError, Result};

use crate::frame::Frame;
use crate::schema::{record_width, FieldDescriptor, FieldKind, LengthRule, MessageSchema};

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u32),
    /// Raw text bytes without the NUL terminator or padding
    Text(Bytes),
    Bytes(Bytes),
    Records(Vec<Fields>),
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        Self::Int(v as u32)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        Self::Int(v as u32)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(Bytes::from(v))
    }
}

impl From<Bytes> for FieldValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<Vec<Fields>> for FieldValue {
    fn from(v: Vec<Fields>) -> Self {
        Self::Records(v)
    }
}

/// Named field values of one message (or one record)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn int(&self, name: &str) -> Result<u32> {
        match self.0.get(name) {
            Some(FieldValue::Int(v)) => Ok(*v),
            Some(other) => Err(wrong_type(name, "integer", other)),
            None => Err(missing(name)),
        }
    }

    /// Text field for display; bytes that are not UTF-8 are replaced
    pub fn text(&self, name: &str) -> Result<Cow<'_, str>> {
        self.text_bytes(name).map(|raw| String::from_utf8_lossy(raw))
    }

    /// Text field exactly as it appears on the wire
    pub fn text_bytes(&self, name: &str) -> Result<&Bytes> {
        match self.0.get(name) {
            Some(FieldValue::Text(v)) => Ok(v),
            Some(other) => Err(wrong_type(name, "text", other)),
            None => Err(missing(name)),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&Bytes> {
        match self.0.get(name) {
            Some(FieldValue::Bytes(v)) => Ok(v),
            Some(other) => Err(wrong_type(name, "bytes", other)),
            None => Err(missing(name)),
        }
    }

    pub fn records(&self, name: &str) -> Result<&[Fields]> {
        match self.0.get(name) {
            Some(FieldValue::Records(v)) => Ok(v),
            Some(other) => Err(wrong_type(name, "records", other)),
            None => Err(missing(name)),
        }
    }
}

fn missing(name: &str) -> KoreError {
    KoreError::Codec(format!("Missing field '{}'", name))
}

fn wrong_type(name: &str, wanted: &str, found: &FieldValue) -> KoreError {
    KoreError::Codec(format!("Field '{}' is not {}: {:?}", name, wanted, found))
}

/// Build a frame for `schema` from named fields
pub fn encode_message(schema: &MessageSchema, fields: &Fields) -> Result<Frame> {
    let mut body = BytesMut::new();
    if schema.length == LengthRule::Variable {
        body.put_u16_le(0);
    }
    encode_fields(&schema.fields, fields, &mut body)?;

    match schema.length {
        LengthRule::Fixed(total) => {
            if 2 + body.len() != total {
                return Err(KoreError::Codec(format!(
                    "{} encoded to {} bytes, expected {}",
                    schema.name,
                    2 + body.len(),
                    total
                )));
            }
        }
        LengthRule::Variable => {
            let total = 2 + body.len();
            if total > u16::MAX as usize {
                return Err(KoreError::Codec(format!(
                    "{} too large for a variable-length frame ({} bytes)",
                    schema.name, total
                )));
            }
            body[..2].copy_from_slice(&(total as u16).to_le_bytes());
        }
    }

    Ok(Frame::new(schema.id, body.freeze()))
}

/// Extract the named fields of `frame` using `schema`
pub fn decode_message(schema: &MessageSchema, frame: &Frame) -> Result<Fields> {
    let mut buf: &[u8] = &frame.payload;
    match schema.length {
        LengthRule::Fixed(total) => {
            if frame.wire_len() != total {
                return Err(KoreError::Codec(format!(
                    "{} is {} bytes, expected {}",
                    schema.name,
                    frame.wire_len(),
                    total
                )));
            }
        }
        LengthRule::Variable => {
            if buf.remaining() < 2 {
                return Err(KoreError::Codec(format!("{} has no length field", schema.name)));
            }
            let declared = buf.get_u16_le() as usize;
            if declared != frame.wire_len() {
                return Err(KoreError::Codec(format!(
                    "{} declares {} bytes but carries {}",
                    schema.name,
                    declared,
                    frame.wire_len()
                )));
            }
        }
    }
    decode_fields(&schema.fields, &mut buf)
}

fn encode_fields(layout: &[FieldDescriptor], fields: &Fields, buf: &mut BytesMut) -> Result<()> {
    for field in layout {
        let value = fields.get(field.name);
        match &field.kind {
            FieldKind::U8 => {
                let v = int_value(field.name, value)?;
                let v = u8::try_from(v).map_err(|_| out_of_range(field.name, v, "u8"))?;
                buf.put_u8(v);
            }
            FieldKind::U16 => {
                let v = int_value(field.name, value)?;
                let v = u16::try_from(v).map_err(|_| out_of_range(field.name, v, "u16"))?;
                buf.put_u16_le(v);
            }
            FieldKind::U32 => {
                buf.put_u32_le(int_value(field.name, value)?);
            }
            FieldKind::Str(size) => {
                let text = text_value(field.name, value)?;
                if text.len() > *size {
                    return Err(KoreError::Codec(format!(
                        "Field '{}' is {} bytes, limit is {}",
                        field.name,
                        text.len(),
                        size
                    )));
                }
                buf.put_slice(text);
                buf.put_bytes(0, size - text.len());
            }
            FieldKind::Bytes(size) => {
                let data = bytes_value(field.name, value)?;
                if data.len() > *size {
                    return Err(KoreError::Codec(format!(
                        "Field '{}' is {} bytes, limit is {}",
                        field.name,
                        data.len(),
                        size
                    )));
                }
                buf.put_slice(data);
                buf.put_bytes(0, size - data.len());
            }
            FieldKind::Text => {
                buf.put_slice(text_value(field.name, value)?);
                buf.put_u8(0);
            }
            FieldKind::Blob => {
                buf.put_slice(bytes_value(field.name, value)?);
            }
            FieldKind::Records(record) => match value {
                None => {}
                Some(FieldValue::Records(list)) => {
                    for entry in list {
                        encode_fields(record, entry, buf)?;
                    }
                }
                Some(other) => return Err(wrong_type(field.name, "records", other)),
            },
        }
    }
    Ok(())
}

fn decode_fields(layout: &[FieldDescriptor], buf: &mut &[u8]) -> Result<Fields> {
    let mut fields = Fields::new();
    for field in layout {
        if let Some(width) = field.kind.fixed_width() {
            if buf.remaining() < width {
                return Err(KoreError::Codec(format!(
                    "Not enough bytes for field '{}' ({} < {})",
                    field.name,
                    buf.remaining(),
                    width
                )));
            }
        }
        let value = match &field.kind {
            FieldKind::U8 => FieldValue::Int(buf.get_u8() as u32),
            FieldKind::U16 => FieldValue::Int(buf.get_u16_le() as u32),
            FieldKind::U32 => FieldValue::Int(buf.get_u32_le()),
            FieldKind::Str(size) => {
                let raw = &buf[..*size];
                let text = read_cstr(raw);
                buf.advance(*size);
                FieldValue::Text(text)
            }
            FieldKind::Bytes(size) => {
                let data = Bytes::copy_from_slice(&buf[..*size]);
                buf.advance(*size);
                FieldValue::Bytes(data)
            }
            FieldKind::Text => {
                let text = read_cstr(buf);
                *buf = &[];
                FieldValue::Text(text)
            }
            FieldKind::Blob => {
                let data = Bytes::copy_from_slice(buf);
                *buf = &[];
                FieldValue::Bytes(data)
            }
            FieldKind::Records(record) => {
                let width = record_width(record);
                if width == 0 || buf.remaining() % width != 0 {
                    return Err(KoreError::Codec(format!(
                        "Field '{}' has {} bytes, not a multiple of the {}-byte record",
                        field.name,
                        buf.remaining(),
                        width
                    )));
                }
                let mut list = Vec::with_capacity(buf.remaining() / width);
                while buf.has_remaining() {
                    list.push(decode_fields(record, buf)?);
                }
                FieldValue::Records(list)
            }
        };
        fields.0.insert(field.name.to_string(), value);
    }
    Ok(fields)
}

fn read_cstr(raw: &[u8]) -> Bytes {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Bytes::copy_from_slice(&raw[..end])
}

fn int_value(name: &str, value: Option<&FieldValue>) -> Result<u32> {
    match value {
        None => Ok(0),
        Some(FieldValue::Int(v)) => Ok(*v),
        Some(other) => Err(wrong_type(name, "integer", other)),
    }
}

fn text_value<'a>(name: &str, value: Option<&'a FieldValue>) -> Result<&'a [u8]> {
    match value {
        None => Ok(&[]),
        Some(FieldValue::Text(v)) => {
            if v.contains(&0) {
                return Err(KoreError::Codec(format!("Field '{}' contains a NUL byte", name)));
            }
            Ok(v)
        }
        Some(other) => Err(wrong_type(name, "text", other)),
    }
}

fn bytes_value<'a>(name: &str, value: Option<&'a FieldValue>) -> Result<&'a [u8]> {
    match value {
        None => Ok(&[]),
        Some(FieldValue::Bytes(v)) => Ok(v),
        Some(other) => Err(wrong_type(name, "bytes", other)),
    }
}

fn out_of_range(name: &str, value: u32, kind: &str) -> KoreError {
    KoreError::Codec(format!("Field '{}' value {} does not fit in {}", name, value, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use korelink_core::MessageId;

    fn chat_schema() -> MessageSchema {
        MessageSchema::variable(0x009A, "system_chat", vec![FieldDescriptor::text("message")])
    }

    fn mixed_schema() -> MessageSchema {
        MessageSchema::variable(
            0x0999,
            "mixed",
            vec![
                FieldDescriptor::u8("a"),
                FieldDescriptor::u16("b"),
                FieldDescriptor::u32("c"),
                FieldDescriptor::str("name", 8),
                FieldDescriptor::bytes("key", 4),
                FieldDescriptor::records(
                    "entries",
                    vec![FieldDescriptor::u16("index"), FieldDescriptor::str("label", 4)],
                ),
            ],
        )
    }

    #[test]
    fn test_encode_system_chat_matches_wire() {
        let frame = encode_message(&chat_schema(), &Fields::new().with("message", "hi")).unwrap();
        assert_eq!(frame.id, MessageId(0x009A));
        assert_eq!(&frame.payload[..], &[0x09, 0x00, b'h', b'i', 0x00]);
    }

    #[test]
    fn test_build_then_extract_is_symmetric() {
        let fields = Fields::new()
            .with("a", 7u8)
            .with("b", 0xBEEFu16)
            .with("c", 0xDEADBEEFu32)
            .with("name", "poring")
            .with("key", vec![1u8, 2, 3, 4])
            .with(
                "entries",
                vec![
                    Fields::new().with("index", 2u16).with("label", "red"),
                    Fields::new().with("index", 5u16).with("label", "blue"),
                ],
            );

        let frame = encode_message(&mixed_schema(), &fields).unwrap();
        assert_eq!(frame.wire_len(), 4 + 1 + 2 + 4 + 8 + 4 + 2 * 6);

        let decoded = decode_message(&mixed_schema(), &frame).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn test_missing_fields_encode_as_zero() {
        let frame = encode_message(&mixed_schema(), &Fields::new().with("a", 1u8)).unwrap();
        let decoded = decode_message(&mixed_schema(), &frame).unwrap();
        assert_eq!(decoded.int("b").unwrap(), 0);
        assert_eq!(decoded.text("name").unwrap(), "");
        assert!(decoded.records("entries").unwrap().is_empty());
    }

    #[test]
    fn test_encode_rejects_out_of_range_and_oversized() {
        let too_big = Fields::new().with("a", 300u32);
        assert!(matches!(
            encode_message(&mixed_schema(), &too_big),
            Err(KoreError::Codec(_))
        ));

        let too_long = Fields::new().with("name", "a-very-long-name");
        assert!(encode_message(&mixed_schema(), &too_long).is_err());

        let wrong_kind = Fields::new().with("name", 3u32);
        assert!(encode_message(&mixed_schema(), &wrong_kind).is_err());
    }

    #[test]
    fn test_non_utf8_text_keeps_its_bytes() {
        let schema = MessageSchema::variable(
            0x00D7,
            "chat_info",
            vec![FieldDescriptor::u32("owner_id"), FieldDescriptor::text("title")],
        );
        let frame = Frame::new(MessageId(0x00D7), vec![0x0B, 0x00, 9, 0, 0, 0, 0xB0, 0xA1, 0x00]);

        let fields = decode_message(&schema, &frame).unwrap();
        assert_eq!(&fields.text_bytes("title").unwrap()[..], &[0xB0, 0xA1]);
        assert_eq!(fields.text("title").unwrap(), "\u{FFFD}\u{FFFD}");

        let rebuilt = encode_message(&schema, &fields).unwrap();
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn test_fixed_text_field_fills_its_width() {
        let schema =
            MessageSchema::fixed(0x0131, "vender_found", 14, vec![FieldDescriptor::str("title", 12)]);
        let title: Vec<u8> = std::iter::repeat([0xC7, 0xD1]).take(6).flatten().collect();
        let fields = Fields::new().with("title", FieldValue::Text(Bytes::from(title.clone())));

        let frame = encode_message(&schema, &fields).unwrap();
        assert_eq!(&frame.payload[..], &title[..]);
        assert_eq!(decode_message(&schema, &frame).unwrap(), fields);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let frame = Frame::new(MessageId(0x009A), vec![0x20, 0x00, b'h', 0x00]);
        assert!(decode_message(&chat_schema(), &frame).is_err());
    }

    #[test]
    fn test_decode_rejects_partial_record() {
        let schema = MessageSchema::variable(
            0x0201,
            "friend_list",
            vec![FieldDescriptor::records("friends", vec![FieldDescriptor::u32("id")])],
        );
        let frame = Frame::new(MessageId(0x0201), vec![0x07, 0x00, 1, 0, 0]);
        assert!(decode_message(&schema, &frame).is_err());
    }
}
