//! # Runtime Configuration
//!
//! Typed configuration for the upstream session and the mirror server.
//!
//! # Example
//!
//! ```rust
//! use korelink_core::Endpoint;
//! use korelink_network::{ServerDescriptor, SessionConfig};
//! use std::time::Duration;
//!
//! let config = SessionConfig {
//!     username: "alice".into(),
//!     password: "secret".into(),
//!     master: ServerDescriptor::new(vec![Endpoint::new("127.0.0.1", 6900)]),
//!     reconnect_delay: Duration::from_secs(5),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use korelink_core::{CharId, KoreError, Result, Sex};
use korelink_protocol::{CipherProfile, FramingPolicy};

use crate::descriptor::ServerDescriptor;

/// Server hop layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// Master server, then character server, then map server
    #[default]
    Standard,
    /// The master's login reply names the map server directly
    Direct,
}

/// What to do when the upstream drops while in game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InGameDisconnectPolicy {
    /// Go back to `Disconnected` and let the retry path rebuild the session
    #[default]
    Reconnect,
    /// Stop the whole process
    Exit,
}

/// How mirrored clients are grouped into replaceable slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
    /// One slot per peer IP address
    #[default]
    PerPeerAddress,
    /// A single slot shared by every peer
    Single,
}

/// Per-stage milestone deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Master server: challenge and login reply
    pub master: Duration,
    /// Character server: character list
    pub login: Duration,
    /// Character server: character id and map after selecting
    pub char_select: Duration,
    /// Map server: map loaded
    pub map: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            master: Duration::from_secs(12),
            login: Duration::from_secs(12),
            char_select: Duration::from_secs(12),
            map: Duration::from_secs(12),
        }
    }
}

/// Upstream session configuration
///
/// # Purpose
/// Everything the [`SessionStateMachine`](crate::SessionStateMachine) needs to
/// walk the login chain on its own: credentials, server selection, timeouts,
/// retry bounds and the cipher profile.
///
/// # Default Values
/// - 12-second milestone deadline per stage
/// - 5-second connect timeout, 5-second reconnect delay, unlimited retries
/// - 12-second keep-alive interval while in game
/// - No cipher, no challenge, standard topology
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Account name sent in the master login
    pub username: String,

    /// Account password sent in the master login
    pub password: String,

    /// Client version field of the master login
    pub client_version: u32,

    /// Master version field of the master login
    pub master_version: u8,

    /// Character slot selected on the character server
    pub char_slot: u8,

    /// Sex sent in game and map logins
    pub sex: Sex,

    /// Master server candidates and selection
    pub master: ServerDescriptor,

    /// Character server selection
    ///
    /// # Notes
    /// - Candidates are replaced by the list the master server returns
    /// - Only `index` and `override_endpoint` are taken from configuration
    pub char_server: ServerDescriptor,

    /// Force the map server instead of the one the character server names
    pub map_server_override: Option<korelink_core::Endpoint>,

    /// Server hop layout
    pub topology: Topology,

    /// Character played under [`Topology::Direct`]
    ///
    /// # Notes
    /// - The character server is skipped, so nothing else names the
    ///   character the map login is for
    pub direct_char_id: Option<CharId>,

    /// Run the challenge sub-protocol before the master login
    pub challenge: bool,

    /// Milestone deadlines
    pub timeouts: StageTimeouts,

    /// Upper bound for a single connect attempt
    pub connect_timeout: Duration,

    /// Fixed delay before an automatic reconnect
    pub reconnect_delay: Duration,

    /// Automatic reconnect attempts before giving up (`None` = unlimited)
    pub max_reconnect_attempts: Option<u32>,

    /// Keep-alive interval while in game
    pub sync_interval: Duration,

    /// Behavior on unexpected closure while in game
    pub ingame_disconnect: InGameDisconnectPolicy,

    /// Framing policy for the upstream stream
    pub framing_policy: FramingPolicy,

    /// Identifier obfuscation applied to frames sent upstream
    pub cipher: CipherProfile,

    /// `errors` (0x0081) codes that mean the cipher drifted
    pub desync_error_codes: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            client_version: 22,
            master_version: 1,
            char_slot: 0,
            sex: Sex::default(),
            master: ServerDescriptor::default(),
            char_server: ServerDescriptor::default(),
            map_server_override: None,
            topology: Topology::Standard,
            direct_char_id: None,
            challenge: false,
            timeouts: StageTimeouts::default(),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: None,
            sync_interval: Duration::from_secs(12),
            ingame_disconnect: InGameDisconnectPolicy::Reconnect,
            framing_policy: FramingPolicy::Disconnect,
            cipher: CipherProfile::None,
            desync_error_codes: vec![3],
        }
    }
}

impl SessionConfig {
    /// Validate the configuration
    ///
    /// # Checks
    /// - At least one master candidate or a master override
    /// - The master index points at a candidate
    /// - Credentials fit the master login layout (24 bytes each)
    /// - Non-zero connect timeout and sync interval
    /// - A character id when the topology is direct
    pub fn validate(&self) -> Result<()> {
        self.master.validate("master")?;

        if self.username.len() > 24 {
            return Err(KoreError::Configuration("username must be at most 24 bytes".into()));
        }
        if self.password.len() > 24 {
            return Err(KoreError::Configuration("password must be at most 24 bytes".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(KoreError::Configuration("connect_timeout must be > 0".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(KoreError::Configuration("sync_interval must be > 0".into()));
        }
        if self.topology == Topology::Direct && self.direct_char_id.is_none() {
            return Err(KoreError::Configuration("topology direct needs direct_char_id".into()));
        }
        if self.max_reconnect_attempts == Some(0) {
            tracing::warn!("max_reconnect_attempts is 0, automatic reconnection is disabled");
        }

        Ok(())
    }
}

/// Mirror server configuration
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Whether the mirror listener is started at all
    pub enabled: bool,

    /// Address and port the real client connects to
    ///
    /// # Default
    /// `127.0.0.1:6901`
    pub bind_address: SocketAddr,

    /// Keep mirrored clients connected while the upstream reconnects
    pub hold_on_disconnect: bool,

    /// Bind in-map provisional clients when the upstream map loads
    pub auto_bind: bool,

    /// Slot grouping for stale connection replacement
    pub slot_policy: SlotPolicy,

    /// Maximum concurrent mirrored clients
    pub max_clients: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 6901)),
            hold_on_disconnect: true,
            auto_bind: true,
            slot_policy: SlotPolicy::PerPeerAddress,
            max_clients: 4,
        }
    }
}

impl MirrorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.max_clients == 0 {
            return Err(KoreError::Configuration("mirror_max_clients must be > 0".into()));
        }
        Ok(())
    }
}
