//! Message schemas
//!
//! A schema describes the length rule and the field layout of one message.
//! The layout is an ordered list of fields; fixed-width fields come first and
//! at most one trailing field (`Text`, `Blob` or `Records`) may consume the
//! remainder of the payload.

use korelink_core::{KoreError, MessageId, Result};

/// How a field is laid out on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    /// Little-endian u16
    U16,
    /// Little-endian u32
    U32,
    /// Fixed-size NUL-padded string
    Str(usize),
    /// Fixed-size opaque bytes
    Bytes(usize),
    /// NUL-terminated string running to the end of the payload
    Text,
    /// Opaque bytes running to the end of the payload
    Blob,
    /// Repeated fixed-width records running to the end of the payload
    Records(Vec<FieldDescriptor>),
}

impl FieldKind {
    /// Width in bytes, or `None` for the trailing kinds
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::U8 => Some(1),
            Self::U16 => Some(2),
            Self::U32 => Some(4),
            Self::Str(n) | Self::Bytes(n) => Some(*n),
            Self::Text | Self::Blob | Self::Records(_) => None,
        }
    }
}

/// A named field in a message layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }

    pub const fn u8(name: &'static str) -> Self {
        Self::new(name, FieldKind::U8)
    }

    pub const fn u16(name: &'static str) -> Self {
        Self::new(name, FieldKind::U16)
    }

    pub const fn u32(name: &'static str) -> Self {
        Self::new(name, FieldKind::U32)
    }

    pub const fn str(name: &'static str, size: usize) -> Self {
        Self::new(name, FieldKind::Str(size))
    }

    pub const fn bytes(name: &'static str, size: usize) -> Self {
        Self::new(name, FieldKind::Bytes(size))
    }

    pub const fn text(name: &'static str) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub const fn blob(name: &'static str) -> Self {
        Self::new(name, FieldKind::Blob)
    }

    pub fn records(name: &'static str, fields: Vec<FieldDescriptor>) -> Self {
        Self::new(name, FieldKind::Records(fields))
    }
}

/// Length rule of a message, as used by the frame assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRule {
    /// Total wire length, identifier included
    Fixed(usize),
    /// A u16 LE length field follows the identifier
    Variable,
}

impl LengthRule {
    /// Parse the length column of a length table: `-1` means variable
    pub fn from_table(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::Variable),
            n if (2..=u16::MAX as i64).contains(&n) => Some(Self::Fixed(n as usize)),
            _ => None,
        }
    }
}

/// Length rule, field layout and metadata for one message identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchema {
    pub id: MessageId,
    pub name: String,
    pub length: LengthRule,
    pub fields: Vec<FieldDescriptor>,

    /// Only meaningful once a character is in the map
    pub requires_character: bool,
}

impl MessageSchema {
    pub fn fixed(id: u16, name: &str, length: usize, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            id: MessageId(id),
            name: name.to_string(),
            length: LengthRule::Fixed(length),
            fields,
            requires_character: false,
        }
    }

    pub fn variable(id: u16, name: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            id: MessageId(id),
            name: name.to_string(),
            length: LengthRule::Variable,
            fields,
            requires_character: false,
        }
    }

    /// A layout-less schema; the payload is carried as a single blob
    pub fn opaque(id: MessageId, length: LengthRule) -> Self {
        let fields = match length {
            LengthRule::Fixed(n) if n > 2 => vec![FieldDescriptor::bytes("data", n - 2)],
            LengthRule::Fixed(_) => Vec::new(),
            LengthRule::Variable => vec![FieldDescriptor::blob("data")],
        };
        Self {
            id,
            name: format!("unknown_{:04X}", id.get()),
            length,
            fields,
            requires_character: false,
        }
    }

    pub fn in_game(mut self) -> Self {
        self.requires_character = true;
        self
    }

    /// Check that the layout is consistent with the length rule
    pub fn validate(&self) -> Result<()> {
        let mut fixed = 0usize;
        for (index, field) in self.fields.iter().enumerate() {
            match field.kind.fixed_width() {
                Some(width) => fixed += width,
                None => {
                    if index + 1 != self.fields.len() {
                        return Err(KoreError::Configuration(format!(
                            "{} ({}): trailing field '{}' is not last",
                            self.name, self.id, field.name
                        )));
                    }
                    if let FieldKind::Records(record) = &field.kind {
                        if record.is_empty()
                            || record.iter().any(|f| f.kind.fixed_width().is_none())
                        {
                            return Err(KoreError::Configuration(format!(
                                "{} ({}): records '{}' must be non-empty and fixed-width",
                                self.name, self.id, field.name
                            )));
                        }
                    }
                }
            }
        }

        match self.length {
            LengthRule::Fixed(total) => {
                if self.has_trailing() {
                    return Err(KoreError::Configuration(format!(
                        "{} ({}): fixed-length message with a trailing field",
                        self.name, self.id
                    )));
                }
                if total != 2 + fixed {
                    return Err(KoreError::Configuration(format!(
                        "{} ({}): layout is {} bytes, length rule says {}",
                        self.name,
                        self.id,
                        2 + fixed,
                        total
                    )));
                }
            }
            LengthRule::Variable => {
                if 4 + fixed > u16::MAX as usize {
                    return Err(KoreError::Configuration(format!(
                        "{} ({}): layout too large",
                        self.name, self.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn has_trailing(&self) -> bool {
        self.fields
            .last()
            .map(|f| f.kind.fixed_width().is_none())
            .unwrap_or(false)
    }
}

/// Width of one record in a `Records` field
pub(crate) fn record_width(fields: &[FieldDescriptor]) -> usize {
    fields.iter().filter_map(|f| f.kind.fixed_width()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_layout_must_match_length() {
        let ok = MessageSchema::fixed(
            0x0066,
            "char_select",
            3,
            vec![FieldDescriptor::u8("slot")],
        );
        assert!(ok.validate().is_ok());

        let bad = MessageSchema::fixed(
            0x0066,
            "char_select",
            4,
            vec![FieldDescriptor::u8("slot")],
        );
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_trailing_field_must_be_last() {
        let bad = MessageSchema::variable(
            0x009A,
            "broken",
            vec![FieldDescriptor::text("message"), FieldDescriptor::u8("flag")],
        );
        assert!(bad.validate().is_err());

        let nested = MessageSchema::variable(
            0x0201,
            "broken_list",
            vec![FieldDescriptor::records("entries", vec![FieldDescriptor::text("x")])],
        );
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_length_rule_from_table() {
        assert_eq!(LengthRule::from_table(-1), Some(LengthRule::Variable));
        assert_eq!(LengthRule::from_table(55), Some(LengthRule::Fixed(55)));
        assert_eq!(LengthRule::from_table(1), None);
        assert_eq!(LengthRule::from_table(70_000), None);
    }

    #[test]
    fn test_opaque_schema_is_valid() {
        assert!(MessageSchema::opaque(MessageId(0x0999), LengthRule::Fixed(2)).validate().is_ok());
        assert!(MessageSchema::opaque(MessageId(0x0999), LengthRule::Fixed(9)).validate().is_ok());
        assert!(MessageSchema::opaque(MessageId(0x0999), LengthRule::Variable).validate().is_ok());
    }
}
