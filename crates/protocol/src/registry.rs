//! Message registry
//!
//! Maps message identifiers to their [`MessageSchema`] and exposes the generic
//! build / extract operations. The registry is populated once at startup
//! (built-in catalog, then an optional external length table) and shared
//! read-only afterwards.
//!
//! # Length tables
//!
//! ```text
//! # recvpackets
//! 0064 55
//! 009A -1
//! 0A00 269
//! ```
//!
//! One `XXXX LEN` pair per line, `-1` meaning variable length. A line for a
//! known identifier replaces its length rule (the field layout is kept when
//! the rule is unchanged); a line for an unknown identifier registers an
//! opaque schema.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use korelink_core::{KoreError, MessageId, Result};
use tracing::{debug, warn};

use crate::codec::{decode_message, encode_message, Fields};
use crate::frame::Frame;
use crate::schema::{FieldDescriptor as F, LengthRule, MessageSchema};

/// Identifier -> schema lookup with name-based build / extract
#[derive(Debug, Clone, Default)]
pub struct Registry {
    by_id: HashMap<MessageId, MessageSchema>,
    by_name: HashMap<String, MessageId>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in message catalog
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for schema in builtin_catalog() {
            // The catalog is static; a layout mismatch is a programming error
            // that the unit tests catch, so it is logged rather than surfaced.
            if let Err(e) = registry.register(schema) {
                warn!("Skipping built-in schema: {}", e);
            }
        }
        registry
    }

    /// Add or replace a schema after validating its layout
    pub fn register(&mut self, schema: MessageSchema) -> Result<()> {
        schema.validate()?;
        if let Some(previous) = self.by_id.get(&schema.id) {
            self.by_name.remove(&previous.name);
        }
        self.by_name.insert(schema.name.clone(), schema.id);
        self.by_id.insert(schema.id, schema);
        Ok(())
    }

    pub fn schema(&self, id: MessageId) -> Option<&MessageSchema> {
        self.by_id.get(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<MessageId> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Whether `id` is only meaningful once a character is in the map
    pub fn requires_character(&self, id: MessageId) -> bool {
        self.by_id
            .get(&id)
            .map(|s| s.requires_character)
            .unwrap_or(false)
    }

    /// Build a frame for the message called `name`
    pub fn build(&self, name: &str, fields: &Fields) -> Result<Frame> {
        let id = self
            .id_of(name)
            .ok_or_else(|| KoreError::NotFound(format!("Message '{}'", name)))?;
        self.build_id(id, fields)
    }

    /// Build a frame for identifier `id`
    pub fn build_id(&self, id: MessageId, fields: &Fields) -> Result<Frame> {
        let schema = self
            .schema(id)
            .ok_or_else(|| KoreError::NotFound(format!("Message {}", id)))?;
        encode_message(schema, fields)
    }

    /// Extract the named fields of `frame`
    pub fn extract(&self, frame: &Frame) -> Result<Fields> {
        let schema = self
            .schema(frame.id)
            .ok_or_else(|| KoreError::NotFound(format!("Message {}", frame.id)))?;
        decode_message(schema, frame)
    }

    /// Load a length table file, see [`Registry::apply_length_table`]
    pub fn load_length_table<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            KoreError::Configuration(format!("Cannot read length table {}: {}", path.display(), e))
        })?;
        self.apply_length_table(&content)
    }

    /// Apply `XXXX LEN` lines, returning how many entries were applied
    pub fn apply_length_table(&mut self, content: &str) -> Result<usize> {
        let mut applied = 0;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(id), Some(len)) = (parts.next(), parts.next()) else {
                return Err(bad_line(line_no, line));
            };
            let id = MessageId::from_hex(id).ok_or_else(|| bad_line(line_no, line))?;
            let rule = len
                .parse::<i64>()
                .ok()
                .and_then(LengthRule::from_table)
                .ok_or_else(|| bad_line(line_no, line))?;

            let schema = match self.by_id.get(&id) {
                Some(known) if known.length == rule => continue,
                Some(known) => {
                    warn!(
                        "Length table changes {} ({}) from {:?} to {:?}; layout becomes opaque",
                        known.name, id, known.length, rule
                    );
                    MessageSchema {
                        name: known.name.clone(),
                        requires_character: known.requires_character,
                        ..MessageSchema::opaque(id, rule)
                    }
                }
                None => MessageSchema::opaque(id, rule),
            };
            self.register(schema)?;
            applied += 1;
        }

        debug!("Applied {} length table entries", applied);
        Ok(applied)
    }
}

fn bad_line(line_no: usize, line: &str) -> KoreError {
    KoreError::Configuration(format!("Length table line {}: '{}'", line_no + 1, line))
}

fn builtin_catalog() -> Vec<MessageSchema> {
    vec![
        MessageSchema::fixed(
            0x0064,
            "master_login",
            55,
            vec![
                F::u32("version"),
                F::str("username", 24),
                F::str("password", 24),
                F::u8("master_version"),
            ],
        ),
        MessageSchema::fixed(
            0x0065,
            "game_login",
            17,
            vec![
                F::u32("account_id"),
                F::u32("session_id"),
                F::u32("session_id2"),
                F::u16("unknown"),
                F::u8("sex"),
            ],
        ),
        MessageSchema::fixed(0x0066, "char_select", 3, vec![F::u8("slot")]),
        MessageSchema::variable(
            0x0069,
            "account_server_info",
            vec![
                F::u32("session_id"),
                F::u32("account_id"),
                F::u32("session_id2"),
                F::u32("last_ip"),
                F::str("last_login", 26),
                F::u8("sex"),
                F::records(
                    "servers",
                    vec![
                        F::u32("ip"),
                        F::u16("port"),
                        F::str("name", 20),
                        F::u16("users"),
                        F::u16("state"),
                        F::u16("property"),
                    ],
                ),
            ],
        ),
        MessageSchema::fixed(
            0x006A,
            "login_error",
            23,
            vec![F::u8("error"), F::str("date", 20)],
        ),
        MessageSchema::variable(
            0x006B,
            "received_characters",
            vec![F::records(
                "characters",
                vec![
                    F::u32("char_id"),
                    F::str("name", 24),
                    F::u16("base_level"),
                    F::u16("job"),
                    F::u8("slot"),
                ],
            )],
        ),
        MessageSchema::fixed(0x006C, "login_error_game_login_server", 3, vec![F::u8("error")]),
        MessageSchema::fixed(
            0x0071,
            "received_character_id_and_map",
            28,
            vec![
                F::u32("char_id"),
                F::str("map", 16),
                F::u32("map_ip"),
                F::u16("map_port"),
            ],
        ),
        MessageSchema::fixed(
            0x0072,
            "map_login",
            19,
            vec![
                F::u32("account_id"),
                F::u32("char_id"),
                F::u32("session_id"),
                F::u32("tick"),
                F::u8("sex"),
            ],
        ),
        MessageSchema::fixed(
            0x0073,
            "map_loaded",
            11,
            vec![F::u32("tick"), F::u16("x"), F::u16("y"), F::u8("dir")],
        ),
        MessageSchema::fixed(
            0x0078,
            "actor_exists",
            15,
            vec![
                F::u32("actor_id"),
                F::u16("actor_type"),
                F::u16("x"),
                F::u16("y"),
                F::u8("dir"),
                F::u16("speed"),
            ],
        ),
        MessageSchema::fixed(0x007D, "map_loaded_ack", 2, vec![]),
        MessageSchema::fixed(0x007E, "sync", 6, vec![F::u32("tick")]),
        MessageSchema::fixed(
            0x0080,
            "actor_disappeared",
            7,
            vec![F::u32("actor_id"), F::u8("kind")],
        ),
        MessageSchema::fixed(0x0081, "errors", 3, vec![F::u8("error")]),
        MessageSchema::fixed(
            0x0089,
            "actor_action",
            7,
            vec![F::u32("target_id"), F::u8("action")],
        )
        .in_game(),
        MessageSchema::variable(0x009A, "system_chat", vec![F::text("message")]),
        MessageSchema::variable(
            0x00A4,
            "inventory_items_nonstackable",
            vec![F::records(
                "items",
                vec![
                    F::u16("index"),
                    F::u16("item_id"),
                    F::u8("item_type"),
                    F::u8("identified"),
                    F::u16("equip_pos"),
                    F::u16("equipped"),
                    F::u8("broken"),
                    F::u8("refine"),
                    F::bytes("cards", 8),
                ],
            )],
        ),
        MessageSchema::fixed(0x00B0, "stat_info", 8, vec![F::u16("stat"), F::u32("value")]),
        MessageSchema::variable(
            0x00D7,
            "chat_info",
            vec![
                F::u32("owner_id"),
                F::u32("room_id"),
                F::u16("limit"),
                F::u16("users"),
                F::u8("public"),
                F::text("title"),
            ],
        ),
        MessageSchema::variable(0x00F3, "public_chat", vec![F::text("message")]).in_game(),
        MessageSchema::fixed(
            0x0131,
            "vender_found",
            86,
            vec![F::u32("vendor_id"), F::str("title", 80)],
        ),
        MessageSchema::fixed(0x014D, "guild_check", 2, vec![]).in_game(),
        MessageSchema::fixed(0x014E, "guild_master_member", 6, vec![F::u32("kind")]),
        MessageSchema::fixed(0x014F, "guild_info_request", 6, vec![F::u32("page")]).in_game(),
        MessageSchema::fixed(0x0187, "ban_check", 6, vec![F::u32("account_id")]),
        MessageSchema::fixed(
            0x0196,
            "actor_status_active",
            9,
            vec![F::u16("status"), F::u32("actor_id"), F::u8("flag")],
        ),
        MessageSchema::fixed(
            0x01B6,
            "guild_info",
            78,
            vec![
                F::u32("guild_id"),
                F::u32("level"),
                F::u32("members"),
                F::u32("max_members"),
                F::u32("avg_level"),
                F::u32("exp"),
                F::u32("next_exp"),
                F::str("name", 24),
                F::str("master", 24),
            ],
        ),
        MessageSchema::variable(
            0x01EE,
            "inventory_items_stackable",
            vec![F::records(
                "items",
                vec![
                    F::u16("index"),
                    F::u16("item_id"),
                    F::u8("item_type"),
                    F::u8("identified"),
                    F::u16("amount"),
                    F::u16("equip_pos"),
                    F::bytes("cards", 8),
                ],
            )],
        ),
        MessageSchema::variable(
            0x0201,
            "friend_list",
            vec![F::records(
                "friends",
                vec![F::u32("account_id"), F::u32("char_id"), F::str("name", 24)],
            )],
        ),
        MessageSchema::variable(0x0227, "gameguard_request", vec![F::blob("challenge")]),
        MessageSchema::variable(0x0228, "gameguard_reply", vec![F::blob("answer")]),
        MessageSchema::fixed(0x0258, "gameguard_grant_request", 2, vec![]),
        MessageSchema::fixed(0x0259, "gameguard_grant", 3, vec![F::u8("verdict")]),
        MessageSchema::fixed(0x0283, "account_id", 6, vec![F::u32("account_id")]),
        MessageSchema::fixed(
            0x02AE,
            "initialize_message_id_encryption",
            10,
            vec![F::u32("param1"), F::u32("param2")],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_ids;
    use std::io::Write;

    #[test]
    fn test_builtin_catalog_is_complete() {
        let registry = Registry::builtin();
        assert_eq!(registry.len(), builtin_catalog().len());
        for schema in builtin_catalog() {
            assert!(schema.validate().is_ok(), "{} failed validation", schema.name);
        }
        assert_eq!(registry.id_of("master_login"), Some(message_ids::MASTER_LOGIN));
        assert_eq!(
            registry.schema(message_ids::MASTER_LOGIN).unwrap().length,
            LengthRule::Fixed(55)
        );
        assert!(registry.requires_character(message_ids::ACTOR_ACTION));
        assert!(!registry.requires_character(message_ids::MASTER_LOGIN));
    }

    #[test]
    fn test_build_and_extract_master_login() {
        let registry = Registry::builtin();
        let fields = Fields::new()
            .with("version", 22u32)
            .with("username", "alice")
            .with("password", "secret")
            .with("master_version", 18u8);

        let frame = registry.build("master_login", &fields).unwrap();
        assert_eq!(frame.wire_len(), 55);
        assert_eq!(registry.extract(&frame).unwrap(), fields);
    }

    #[test]
    fn test_build_and_extract_records_and_trailing_text() {
        let registry = Registry::builtin();

        let servers = Fields::new().with(
            "servers",
            vec![Fields::new()
                .with("ip", 0x0100007Fu32)
                .with("port", 6121u16)
                .with("name", "Mirror")
                .with("users", 3u16)
                .with("state", 0u16)
                .with("property", 0u16)],
        );
        let frame = registry.build("account_server_info", &servers).unwrap();
        assert_eq!(frame.wire_len(), 4 + 43 + 32);
        let decoded = registry.extract(&frame).unwrap();
        assert_eq!(decoded.records("servers").unwrap(), servers.records("servers").unwrap());

        let room = Fields::new()
            .with("owner_id", 9u32)
            .with("room_id", 4u32)
            .with("limit", 20u16)
            .with("users", 1u16)
            .with("public", 1u8)
            .with("title", "party");
        let frame = registry.build("chat_info", &room).unwrap();
        assert_eq!(registry.extract(&frame).unwrap(), room);
    }

    #[test]
    fn test_build_unknown_name() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.build("no_such_message", &Fields::new()),
            Err(KoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_length_table_overrides_and_adds() {
        let mut registry = Registry::builtin();
        let applied = registry
            .apply_length_table(
                "# comment\n\
                 0064 55\n\
                 0A00 269\n\
                 0A01 -1\n\
                 \n\
                 007E 10\n",
            )
            .unwrap();
        assert_eq!(applied, 3);

        assert_eq!(
            registry.schema(MessageId(0x0A00)).unwrap().length,
            LengthRule::Fixed(269)
        );
        assert_eq!(
            registry.schema(MessageId(0x0A01)).unwrap().length,
            LengthRule::Variable
        );

        // Unchanged rule keeps the layout, changed rule becomes opaque
        assert_eq!(registry.schema(message_ids::MASTER_LOGIN).unwrap().fields.len(), 4);
        let sync = registry.schema(message_ids::SYNC).unwrap();
        assert_eq!(sync.length, LengthRule::Fixed(10));
        assert_eq!(sync.name, "sync");
        assert_eq!(registry.id_of("sync"), Some(message_ids::SYNC));
    }

    #[test]
    fn test_length_table_rejects_garbage() {
        let mut registry = Registry::builtin();
        assert!(registry.apply_length_table("zzzz 4\n").is_err());
        assert!(registry.apply_length_table("0064\n").is_err());
        assert!(registry.apply_length_table("0064 1\n").is_err());
    }

    #[test]
    fn test_load_length_table_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0B00 8").unwrap();
        writeln!(file, "0B01 -1").unwrap();

        let mut registry = Registry::new();
        assert_eq!(registry.load_length_table(file.path()).unwrap(), 2);
        assert!(registry.contains(MessageId(0x0B00)));
        assert_eq!(registry.id_of("unknown_0B01"), Some(MessageId(0x0B01)));
    }
}
