//! Lifecycle milestones
//!
//! A milestone is an upstream message that moves the session forward (or
//! rejects it). The [`MilestoneDetector`] maps message identifiers to
//! decoders, populated once at startup.

use std::collections::HashMap;

use bytes::Bytes;
use korelink_core::{AccountId, CharId, Endpoint, MessageId, Result, SessionTokens, Sex};
use korelink_protocol::{message_ids as ids, Fields, Frame, Registry};

/// A server offered by the master's login reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub endpoint: Endpoint,
    /// Raw server name as sent by the master
    pub name: Bytes,
    pub users: u16,
}

/// A character offered by the character server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterEntry {
    pub char_id: CharId,
    pub name: Bytes,
    pub base_level: u16,
    pub job: u16,
    pub slot: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    /// Challenge bytes to echo back (`gameguard_request`)
    ChallengeRequest { challenge: Bytes },

    /// Challenge outcome (`gameguard_grant`)
    ChallengeVerdict { verdict: u8 },

    /// Master accepted the login (`account_server_info`)
    LoginAccepted {
        account_id: AccountId,
        tokens: SessionTokens,
        sex: Sex,
        servers: Vec<ServerEntry>,
    },

    /// Character list (`received_characters`)
    CharactersReceived { characters: Vec<CharacterEntry> },

    /// Character chosen, map server named (`received_character_id_and_map`)
    CharacterSelected {
        char_id: CharId,
        map: Bytes,
        endpoint: Endpoint,
    },

    /// Map server acknowledged the account (`account_id`)
    AccountConfirmed { account_id: AccountId },

    /// Character is in the map (`map_loaded`)
    MapLoaded { x: u16, y: u16, dir: u8 },

    /// Login refused or session terminated by the server
    LoginRejected { message: MessageId, code: u8 },
}

impl Milestone {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChallengeRequest { .. } => "challenge_request",
            Self::ChallengeVerdict { .. } => "challenge_verdict",
            Self::LoginAccepted { .. } => "login_accepted",
            Self::CharactersReceived { .. } => "characters_received",
            Self::CharacterSelected { .. } => "character_selected",
            Self::AccountConfirmed { .. } => "account_confirmed",
            Self::MapLoaded { .. } => "map_loaded",
            Self::LoginRejected { .. } => "login_rejected",
        }
    }
}

type Decoder = fn(MessageId, &Fields) -> Result<Milestone>;

/// Identifier -> milestone decoder lookup
pub struct MilestoneDetector {
    decoders: HashMap<MessageId, Decoder>,
}

impl MilestoneDetector {
    pub fn new() -> Self {
        let mut decoders: HashMap<MessageId, Decoder> = HashMap::new();
        decoders.insert(ids::GAMEGUARD_REQUEST, challenge_request);
        decoders.insert(ids::GAMEGUARD_GRANT, challenge_verdict);
        decoders.insert(ids::ACCOUNT_SERVER_INFO, login_accepted);
        decoders.insert(ids::RECEIVED_CHARACTERS, characters_received);
        decoders.insert(ids::RECEIVED_CHARACTER_ID_AND_MAP, character_selected);
        decoders.insert(ids::ACCOUNT_ID, account_confirmed);
        decoders.insert(ids::MAP_LOADED, map_loaded);
        decoders.insert(ids::LOGIN_ERROR, login_rejected);
        decoders.insert(ids::LOGIN_ERROR_GAME_LOGIN_SERVER, login_rejected);
        decoders.insert(ids::ERRORS, login_rejected);
        Self { decoders }
    }

    pub fn is_milestone(&self, id: MessageId) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Decode `frame` into a milestone if its identifier is one
    pub fn detect(&self, registry: &Registry, frame: &Frame) -> Option<Result<Milestone>> {
        let decoder = self.decoders.get(&frame.id)?;
        Some(registry.extract(frame).and_then(|fields| decoder(frame.id, &fields)))
    }
}

impl Default for MilestoneDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn challenge_request(_: MessageId, fields: &Fields) -> Result<Milestone> {
    Ok(Milestone::ChallengeRequest {
        challenge: fields.bytes("challenge")?.clone(),
    })
}

fn challenge_verdict(_: MessageId, fields: &Fields) -> Result<Milestone> {
    Ok(Milestone::ChallengeVerdict {
        verdict: fields.int("verdict")? as u8,
    })
}

fn login_accepted(_: MessageId, fields: &Fields) -> Result<Milestone> {
    let servers = fields
        .records("servers")?
        .iter()
        .map(|server| {
            Ok(ServerEntry {
                endpoint: Endpoint::from_wire(server.int("ip")?, server.int("port")? as u16),
                name: server.text_bytes("name")?.clone(),
                users: server.int("users")? as u16,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Milestone::LoginAccepted {
        account_id: AccountId(fields.int("account_id")?),
        tokens: SessionTokens {
            session_id: fields.int("session_id")?,
            session_id2: fields.int("session_id2")?,
        },
        sex: Sex::from_u8(fields.int("sex")? as u8),
        servers,
    })
}

fn characters_received(_: MessageId, fields: &Fields) -> Result<Milestone> {
    let characters = fields
        .records("characters")?
        .iter()
        .map(|c| {
            Ok(CharacterEntry {
                char_id: CharId(c.int("char_id")?),
                name: c.text_bytes("name")?.clone(),
                base_level: c.int("base_level")? as u16,
                job: c.int("job")? as u16,
                slot: c.int("slot")? as u8,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Milestone::CharactersReceived { characters })
}

fn character_selected(_: MessageId, fields: &Fields) -> Result<Milestone> {
    Ok(Milestone::CharacterSelected {
        char_id: CharId(fields.int("char_id")?),
        map: fields.text_bytes("map")?.clone(),
        endpoint: Endpoint::from_wire(fields.int("map_ip")?, fields.int("map_port")? as u16),
    })
}

fn account_confirmed(_: MessageId, fields: &Fields) -> Result<Milestone> {
    Ok(Milestone::AccountConfirmed {
        account_id: AccountId(fields.int("account_id")?),
    })
}

fn map_loaded(_: MessageId, fields: &Fields) -> Result<Milestone> {
    Ok(Milestone::MapLoaded {
        x: fields.int("x")? as u16,
        y: fields.int("y")? as u16,
        dir: fields.int("dir")? as u8,
    })
}

fn login_rejected(message: MessageId, fields: &Fields) -> Result<Milestone> {
    Ok(Milestone::LoginRejected {
        message,
        code: fields.int("error")? as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use korelink_protocol::FieldValue;

    #[test]
    fn test_detects_login_accepted() {
        let registry = Registry::builtin();
        let frame = registry
            .build(
                "account_server_info",
                &Fields::new()
                    .with("session_id", 11u32)
                    .with("account_id", 2000001u32)
                    .with("session_id2", 22u32)
                    .with("sex", 0u8)
                    .with(
                        "servers",
                        vec![Fields::new()
                            .with("ip", Endpoint::new("127.0.0.1", 0).wire_ip())
                            .with("port", 6121u16)
                            .with("name", "Chaos")],
                    ),
            )
            .unwrap();

        let detector = MilestoneDetector::new();
        let milestone = detector.detect(&registry, &frame).unwrap().unwrap();
        match milestone {
            Milestone::LoginAccepted {
                account_id,
                tokens,
                sex,
                servers,
            } => {
                assert_eq!(account_id, AccountId(2000001));
                assert_eq!(tokens.session_id2, 22);
                assert_eq!(sex, Sex::Female);
                assert_eq!(servers[0].endpoint, Endpoint::new("127.0.0.1", 6121));
                assert_eq!(servers[0].name, "Chaos");
            }
            other => panic!("unexpected milestone {:?}", other),
        }
    }

    #[test]
    fn test_rejections_carry_source_message() {
        let registry = Registry::builtin();
        let frame = registry
            .build("errors", &Fields::new().with("error", 3u8))
            .unwrap();
        let milestone = MilestoneDetector::new().detect(&registry, &frame).unwrap().unwrap();
        assert_eq!(
            milestone,
            Milestone::LoginRejected {
                message: ids::ERRORS,
                code: 3
            }
        );
    }

    #[test]
    fn test_character_names_keep_raw_bytes() {
        let registry = Registry::builtin();
        let name: &[u8] = &[0xB1, 0xE8, 0xC3, 0xB6];
        let frame = registry
            .build(
                "received_characters",
                &Fields::new().with(
                    "characters",
                    vec![Fields::new()
                        .with("char_id", 150001u32)
                        .with("name", FieldValue::Text(Bytes::from_static(name)))],
                ),
            )
            .unwrap();

        match MilestoneDetector::new().detect(&registry, &frame).unwrap().unwrap() {
            Milestone::CharactersReceived { characters } => {
                assert_eq!(&characters[0].name[..], name);
            }
            other => panic!("unexpected milestone {:?}", other),
        }
    }

    #[test]
    fn test_non_milestone_frames_are_ignored() {
        let registry = Registry::builtin();
        let frame = registry
            .build("system_chat", &Fields::new().with("message", "hello"))
            .unwrap();
        assert!(MilestoneDetector::new().detect(&registry, &frame).is_none());
        assert!(!MilestoneDetector::new().is_milestone(ids::SYSTEM_CHAT));
    }
}
