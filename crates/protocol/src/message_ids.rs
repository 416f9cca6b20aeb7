//! Well-known message identifiers
//!
//! Names follow the built-in catalog in [`crate::registry`].

use korelink_core::MessageId;

// Login sequence (client -> server)
pub const MASTER_LOGIN: MessageId = MessageId(0x0064);
pub const GAME_LOGIN: MessageId = MessageId(0x0065);
pub const CHAR_SELECT: MessageId = MessageId(0x0066);
pub const MAP_LOGIN: MessageId = MessageId(0x0072);
pub const MAP_LOADED_ACK: MessageId = MessageId(0x007D);
pub const SYNC: MessageId = MessageId(0x007E);
pub const BAN_CHECK: MessageId = MessageId(0x0187);

// Login sequence (server -> client)
pub const ACCOUNT_SERVER_INFO: MessageId = MessageId(0x0069);
pub const LOGIN_ERROR: MessageId = MessageId(0x006A);
pub const RECEIVED_CHARACTERS: MessageId = MessageId(0x006B);
pub const LOGIN_ERROR_GAME_LOGIN_SERVER: MessageId = MessageId(0x006C);
pub const RECEIVED_CHARACTER_ID_AND_MAP: MessageId = MessageId(0x0071);
pub const MAP_LOADED: MessageId = MessageId(0x0073);
pub const ERRORS: MessageId = MessageId(0x0081);
pub const ACCOUNT_ID: MessageId = MessageId(0x0283);

// Challenge sub-protocol
pub const GAMEGUARD_REQUEST: MessageId = MessageId(0x0227);
pub const GAMEGUARD_REPLY: MessageId = MessageId(0x0228);
pub const GAMEGUARD_GRANT_REQUEST: MessageId = MessageId(0x0258);
pub const GAMEGUARD_GRANT: MessageId = MessageId(0x0259);

// In game
pub const ACTOR_EXISTS: MessageId = MessageId(0x0078);
pub const ACTOR_DISAPPEARED: MessageId = MessageId(0x0080);
pub const ACTOR_ACTION: MessageId = MessageId(0x0089);
pub const SYSTEM_CHAT: MessageId = MessageId(0x009A);
pub const INVENTORY_ITEMS_NONSTACKABLE: MessageId = MessageId(0x00A4);
pub const STAT_INFO: MessageId = MessageId(0x00B0);
pub const CHAT_INFO: MessageId = MessageId(0x00D7);
pub const PUBLIC_CHAT: MessageId = MessageId(0x00F3);
pub const VENDER_FOUND: MessageId = MessageId(0x0131);
pub const GUILD_CHECK: MessageId = MessageId(0x014D);
pub const GUILD_MASTER_MEMBER: MessageId = MessageId(0x014E);
pub const GUILD_INFO_REQUEST: MessageId = MessageId(0x014F);
pub const ACTOR_STATUS_ACTIVE: MessageId = MessageId(0x0196);
pub const GUILD_INFO: MessageId = MessageId(0x01B6);
pub const INVENTORY_ITEMS_STACKABLE: MessageId = MessageId(0x01EE);
pub const FRIEND_LIST: MessageId = MessageId(0x0201);
pub const INITIALIZE_MESSAGE_ID_ENCRYPTION: MessageId = MessageId(0x02AE);
