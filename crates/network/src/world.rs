//! World state cache
//!
//! Absorbs upstream frames that describe the character's surroundings and
//! replays them as a snapshot for mirrored clients joining mid-session.
//! Every collection is keyed and ordered, so the same state always
//! synthesizes the same bytes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use korelink_core::Result;
use korelink_protocol::{message_ids as ids, FieldValue, Fields, Frame, Registry};
use tracing::trace;

/// Stat types a placeholder snapshot zeroes
pub const STANDARD_STATS: [u16; 8] = [
    0x0000, // speed
    0x0005, // hp
    0x0006, // max hp
    0x0007, // sp
    0x0008, // max sp
    0x000B, // base level
    0x0018, // weight
    0x0019, // max weight
];

/// An actor seen on the current map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorInfo {
    pub actor_id: u32,
    pub actor_type: u16,
    pub x: u16,
    pub y: u16,
    pub dir: u8,
    pub speed: u16,
}

impl ActorInfo {
    fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            actor_id: fields.int("actor_id")?,
            actor_type: fields.int("actor_type")? as u16,
            x: fields.int("x")? as u16,
            y: fields.int("y")? as u16,
            dir: fields.int("dir")? as u8,
            speed: fields.int("speed")? as u16,
        })
    }

    fn to_fields(self) -> Fields {
        Fields::new()
            .with("actor_id", self.actor_id)
            .with("actor_type", self.actor_type)
            .with("x", self.x)
            .with("y", self.y)
            .with("dir", self.dir)
            .with("speed", self.speed)
    }
}

/// Cached view of the upstream game state
pub struct WorldState {
    registry: Arc<Registry>,
    stats: BTreeMap<u16, u32>,
    stackable: BTreeMap<u16, Fields>,
    equipment: BTreeMap<u16, Fields>,
    actors: BTreeMap<u32, ActorInfo>,
    statuses: BTreeSet<(u32, u16)>,
    friends: Vec<Fields>,
    shops: BTreeMap<u32, Bytes>,
    rooms: BTreeMap<u32, Fields>,
    guild_membership: Option<u32>,
    guild: Option<Fields>,
}

impl WorldState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            stats: BTreeMap::new(),
            stackable: BTreeMap::new(),
            equipment: BTreeMap::new(),
            actors: BTreeMap::new(),
            statuses: BTreeSet::new(),
            friends: Vec::new(),
            shops: BTreeMap::new(),
            rooms: BTreeMap::new(),
            guild_membership: None,
            guild: None,
        }
    }

    /// Fold one upstream frame into the cache
    ///
    /// Returns `Ok(false)` for frames the cache does not track.
    pub fn absorb(&mut self, frame: &Frame) -> Result<bool> {
        let id = frame.id;
        let tracked = [
            ids::STAT_INFO,
            ids::INVENTORY_ITEMS_STACKABLE,
            ids::INVENTORY_ITEMS_NONSTACKABLE,
            ids::ACTOR_EXISTS,
            ids::ACTOR_DISAPPEARED,
            ids::ACTOR_STATUS_ACTIVE,
            ids::FRIEND_LIST,
            ids::VENDER_FOUND,
            ids::CHAT_INFO,
            ids::GUILD_MASTER_MEMBER,
            ids::GUILD_INFO,
        ];
        if !tracked.contains(&id) {
            return Ok(false);
        }

        let fields = self.registry.extract(frame)?;
        match id {
            ids::STAT_INFO => {
                self.stats
                    .insert(fields.int("stat")? as u16, fields.int("value")?);
            }
            ids::INVENTORY_ITEMS_STACKABLE => {
                for item in fields.records("items")? {
                    self.stackable.insert(item.int("index")? as u16, item.clone());
                }
            }
            ids::INVENTORY_ITEMS_NONSTACKABLE => {
                for item in fields.records("items")? {
                    self.equipment.insert(item.int("index")? as u16, item.clone());
                }
            }
            ids::ACTOR_EXISTS => {
                let actor = ActorInfo::from_fields(&fields)?;
                self.actors.insert(actor.actor_id, actor);
            }
            ids::ACTOR_DISAPPEARED => {
                let actor_id = fields.int("actor_id")?;
                self.actors.remove(&actor_id);
                self.statuses.retain(|(actor, _)| *actor != actor_id);
            }
            ids::ACTOR_STATUS_ACTIVE => {
                let key = (fields.int("actor_id")?, fields.int("status")? as u16);
                if fields.int("flag")? != 0 {
                    self.statuses.insert(key);
                } else {
                    self.statuses.remove(&key);
                }
            }
            ids::FRIEND_LIST => {
                self.friends = fields.records("friends")?.to_vec();
            }
            ids::VENDER_FOUND => {
                self.shops
                    .insert(fields.int("vendor_id")?, fields.text_bytes("title")?.clone());
            }
            ids::CHAT_INFO => {
                self.rooms.insert(fields.int("room_id")?, fields);
            }
            ids::GUILD_MASTER_MEMBER => {
                self.guild_membership = Some(fields.int("kind")?);
            }
            ids::GUILD_INFO => {
                self.guild = Some(fields);
            }
            _ => return Ok(false),
        }

        trace!("World absorbed {}", id);
        Ok(true)
    }

    /// Forget everything scoped to the current map
    pub fn clear_map(&mut self) {
        self.actors.clear();
        self.statuses.clear();
        self.shops.clear();
        self.rooms.clear();
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.clear_map();
        self.stats.clear();
        self.stackable.clear();
        self.equipment.clear();
        self.friends.clear();
        self.guild_membership = None;
        self.guild = None;
    }

    pub fn stat(&self, stat: u16) -> Option<u32> {
        self.stats.get(&stat).copied()
    }

    pub fn actor(&self, actor_id: u32) -> Option<&ActorInfo> {
        self.actors.get(&actor_id)
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn has_status(&self, actor_id: u32, status: u16) -> bool {
        self.statuses.contains(&(actor_id, status))
    }

    pub fn item_count(&self) -> usize {
        self.stackable.len() + self.equipment.len()
    }

    pub fn has_guild(&self) -> bool {
        self.guild.is_some()
    }

    /// Answer to a guild check, if the upstream already sent one
    pub fn guild_membership_frame(&self) -> Option<Result<Frame>> {
        let kind = self.guild_membership?;
        Some(
            self.registry
                .build("guild_master_member", &Fields::new().with("kind", kind)),
        )
    }

    /// Answer to a guild info request, if the upstream already sent one
    pub fn guild_info_frame(&self) -> Option<Result<Frame>> {
        self.guild
            .as_ref()
            .map(|guild| self.registry.build("guild_info", guild))
    }

    /// Replay the cached state as frames
    ///
    /// Order: stats, stackable inventory, non-stackable inventory, actors,
    /// statuses, friend list, shops, chat rooms.
    pub fn snapshot(&self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();

        for (&stat, &value) in &self.stats {
            let fields = Fields::new().with("stat", stat).with("value", value);
            frames.push(self.registry.build("stat_info", &fields)?);
        }

        let stackable: Vec<Fields> = self.stackable.values().cloned().collect();
        frames.push(
            self.registry
                .build("inventory_items_stackable", &Fields::new().with("items", stackable))?,
        );
        let equipment: Vec<Fields> = self.equipment.values().cloned().collect();
        frames.push(
            self.registry
                .build("inventory_items_nonstackable", &Fields::new().with("items", equipment))?,
        );

        for actor in self.actors.values() {
            frames.push(self.registry.build("actor_exists", &actor.to_fields())?);
        }

        for &(actor_id, status) in &self.statuses {
            let fields = Fields::new()
                .with("status", status)
                .with("actor_id", actor_id)
                .with("flag", 1u8);
            frames.push(self.registry.build("actor_status_active", &fields)?);
        }

        frames.push(
            self.registry
                .build("friend_list", &Fields::new().with("friends", self.friends.clone()))?,
        );

        for (&vendor_id, title) in &self.shops {
            let fields = Fields::new()
                .with("vendor_id", vendor_id)
                .with("title", FieldValue::Text(title.clone()));
            frames.push(self.registry.build("vender_found", &fields)?);
        }

        for room in self.rooms.values() {
            frames.push(self.registry.build("chat_info", room)?);
        }

        Ok(frames)
    }

    /// Neutral data for a client not yet bound to the live character
    pub fn placeholder_snapshot(&self) -> Result<Vec<Frame>> {
        let mut blank = WorldState::new(self.registry.clone());
        for stat in STANDARD_STATS {
            blank.stats.insert(stat, 0);
        }
        blank.snapshot()
    }
}
