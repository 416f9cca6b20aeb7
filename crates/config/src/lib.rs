//! Korelink Configuration Management
//!
//! Loads the agent configuration from a `key = value` text file.
//!
//! ```text
//! # korelink.txt
//! username = alice
//! password = secret
//! master = 127.0.0.1:6900
//! master = 10.0.0.2:6900
//! cipher = threekey
//! cipher_key1 = 0x01000000
//! mirror = true
//! ```
//!
//! Blank lines and `#` comments are ignored. `master` may repeat; each line
//! adds a candidate. Unknown keys are logged and skipped.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use korelink_core::{CharId, Endpoint, KoreError, MessageId, Sex};
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/korelink.txt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Line {line}: expected 'key = value', got '{text}'")]
    Syntax { line: usize, text: String },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Missing setting: {0}")]
    Missing(String),
}

impl From<ConfigError> for KoreError {
    fn from(e: ConfigError) -> Self {
        KoreError::Configuration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Server hop layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyKind {
    #[default]
    Standard,
    Direct,
}

/// Behavior when the upstream closes while in game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectAction {
    #[default]
    Reconnect,
    Exit,
}

/// Upstream framing error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    #[default]
    Disconnect,
    Resync,
}

/// Identifier obfuscation variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    #[default]
    None,
    Legacy,
    ThreeKey,
}

/// Mirror slot grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotMode {
    #[default]
    Peer,
    Single,
}

/// Complete agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // ========== Account ==========
    pub username: String,
    pub password: String,
    pub char_slot: u8,
    pub sex: Sex,
    pub client_version: u32,
    pub master_version: u8,

    // ========== Server selection ==========
    /// Master server candidates (one per `master` line)
    pub masters: Vec<Endpoint>,
    pub master_index: usize,
    pub master_override: Option<Endpoint>,
    pub char_server_index: usize,
    pub char_server_override: Option<Endpoint>,
    pub map_server_override: Option<Endpoint>,
    pub topology: TopologyKind,
    /// Character for the map login when `topology = direct`
    pub direct_char_id: Option<CharId>,
    pub challenge: bool,

    // ========== Timing (seconds) ==========
    pub timeout_master: u64,
    pub timeout_login: u64,
    pub timeout_char: u64,
    pub timeout_map: u64,
    pub connect_timeout: u64,
    pub reconnect_delay: u64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub sync_interval: u64,

    // ========== Failure policy ==========
    pub ingame_disconnect: DisconnectAction,
    pub framing_policy: FramingMode,

    // ========== Cipher ==========
    pub cipher: CipherKind,
    pub cipher_keys: [u32; 3],
    pub legacy_reseed_message: MessageId,
    pub threekey_reseed_message: Option<MessageId>,
    pub desync_error_codes: Vec<u8>,

    // ========== Mirror ==========
    pub mirror: bool,
    pub mirror_bind: SocketAddr,
    pub mirror_hold_on_disconnect: bool,
    pub mirror_auto_bind: bool,
    pub mirror_slot_policy: SlotMode,
    pub mirror_max_clients: usize,

    // ========== Runtime ==========
    /// External message length table
    pub recvpackets: Option<PathBuf>,
    pub tick_ms: u64,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            char_slot: 0,
            sex: Sex::default(),
            client_version: 22,
            master_version: 1,

            masters: Vec::new(),
            master_index: 0,
            master_override: None,
            char_server_index: 0,
            char_server_override: None,
            map_server_override: None,
            topology: TopologyKind::Standard,
            direct_char_id: None,
            challenge: false,

            timeout_master: 12,
            timeout_login: 12,
            timeout_char: 12,
            timeout_map: 12,
            connect_timeout: 5,
            reconnect_delay: 5,
            max_reconnect_attempts: None,
            sync_interval: 12,

            ingame_disconnect: DisconnectAction::Reconnect,
            framing_policy: FramingMode::Disconnect,

            cipher: CipherKind::None,
            cipher_keys: [0; 3],
            legacy_reseed_message: MessageId(0x02AE),
            threekey_reseed_message: None,
            desync_error_codes: vec![3],

            mirror: false,
            mirror_bind: SocketAddr::from(([127, 0, 0, 1], 6901)),
            mirror_hold_on_disconnect: true,
            mirror_auto_bind: true,
            mirror_slot_policy: SlotMode::Peer,
            mirror_max_clients: 4,

            recvpackets: None,
            tick_ms: 50,
            log_level: "info".into(),
        }
    }
}

impl AgentConfig {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load [`DEFAULT_CONFIG_PATH`]
    pub fn load_default() -> Result<Self> {
        Self::load_from_file(DEFAULT_CONFIG_PATH)
    }

    /// Parse configuration text without validating it
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(eq_pos) = line.find('=') else {
                return Err(ConfigError::Syntax {
                    line: index + 1,
                    text: line.to_string(),
                });
            };
            let key = line[..eq_pos].trim();
            let value = line[eq_pos + 1..].trim();
            config.parse_option(key, value)?;
        }

        Ok(config)
    }

    fn parse_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "username" => self.username = value.into(),
            "password" => self.password = value.into(),
            "char_slot" => self.char_slot = number(key, value)?,
            "sex" => {
                self.sex = match value.to_lowercase().as_str() {
                    "male" | "m" | "1" => Sex::Male,
                    "female" | "f" | "0" => Sex::Female,
                    _ => return Err(invalid(key, value)),
                }
            }
            "client_version" => self.client_version = number(key, value)?,
            "master_version" => self.master_version = number(key, value)?,

            "master" => self.masters.push(endpoint(key, value)?),
            "master_index" => self.master_index = number(key, value)?,
            "master_override" => self.master_override = optional_endpoint(key, value)?,
            "char_server_index" => self.char_server_index = number(key, value)?,
            "char_server_override" => self.char_server_override = optional_endpoint(key, value)?,
            "map_server_override" => self.map_server_override = optional_endpoint(key, value)?,
            "topology" => {
                self.topology = choice(key, value, &[
                    ("standard", TopologyKind::Standard),
                    ("direct", TopologyKind::Direct),
                ])?
            }
            "direct_char_id" => {
                self.direct_char_id = if value.is_empty() {
                    None
                } else {
                    Some(CharId(number(key, value)?))
                }
            }
            "challenge" => self.challenge = flag(key, value)?,

            "timeout_master" => self.timeout_master = number(key, value)?,
            "timeout_login" => self.timeout_login = number(key, value)?,
            "timeout_char" => self.timeout_char = number(key, value)?,
            "timeout_map" => self.timeout_map = number(key, value)?,
            "connect_timeout" => self.connect_timeout = number(key, value)?,
            "reconnect_delay" => self.reconnect_delay = number(key, value)?,
            "max_reconnect_attempts" => {
                self.max_reconnect_attempts = if value.eq_ignore_ascii_case("unlimited") {
                    None
                } else {
                    Some(number(key, value)?)
                }
            }
            "sync_interval" => self.sync_interval = number(key, value)?,

            "ingame_disconnect" => {
                self.ingame_disconnect = choice(key, value, &[
                    ("reconnect", DisconnectAction::Reconnect),
                    ("exit", DisconnectAction::Exit),
                ])?
            }
            "framing_policy" => {
                self.framing_policy = choice(key, value, &[
                    ("disconnect", FramingMode::Disconnect),
                    ("resync", FramingMode::Resync),
                ])?
            }

            "cipher" => {
                self.cipher = choice(key, value, &[
                    ("none", CipherKind::None),
                    ("legacy", CipherKind::Legacy),
                    ("threekey", CipherKind::ThreeKey),
                ])?
            }
            "cipher_key1" => self.cipher_keys[0] = hex(key, value)?,
            "cipher_key2" => self.cipher_keys[1] = hex(key, value)?,
            "cipher_key3" => self.cipher_keys[2] = hex(key, value)?,
            "legacy_reseed_message" => {
                self.legacy_reseed_message =
                    MessageId::from_hex(value).ok_or_else(|| invalid(key, value))?
            }
            "threekey_reseed_message" => {
                self.threekey_reseed_message = if value.is_empty() {
                    None
                } else {
                    Some(MessageId::from_hex(value).ok_or_else(|| invalid(key, value))?)
                }
            }
            "desync_error_codes" => {
                self.desync_error_codes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| number(key, s))
                    .collect::<Result<Vec<u8>>>()?;
            }

            "mirror" => self.mirror = flag(key, value)?,
            "mirror_bind" => self.mirror_bind = number(key, value)?,
            "mirror_hold_on_disconnect" => self.mirror_hold_on_disconnect = flag(key, value)?,
            "mirror_auto_bind" => self.mirror_auto_bind = flag(key, value)?,
            "mirror_slot_policy" => {
                self.mirror_slot_policy = choice(key, value, &[
                    ("peer", SlotMode::Peer),
                    ("single", SlotMode::Single),
                ])?
            }
            "mirror_max_clients" => self.mirror_max_clients = number(key, value)?,

            "recvpackets" => {
                self.recvpackets = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "tick_ms" => self.tick_ms = number(key, value)?,
            "log_level" => self.log_level = value.into(),

            _ => tracing::debug!("Unknown config option: {} = {}", key, value),
        }
        Ok(())
    }

    /// Check the settings the agent cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.masters.is_empty() && self.master_override.is_none() {
            return Err(ConfigError::Missing(
                "at least one 'master' or a 'master_override'".into(),
            ));
        }
        if self.master_override.is_none() && self.master_index >= self.masters.len() {
            return Err(invalid("master_index", &self.master_index.to_string()));
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing("username".into()));
        }
        if self.topology == TopologyKind::Direct && self.direct_char_id.is_none() {
            return Err(ConfigError::Missing("direct_char_id for topology direct".into()));
        }
        if self.tick_ms == 0 {
            return Err(invalid("tick_ms", "0"));
        }
        Ok(())
    }

    /// Log a configuration summary (credentials omitted)
    pub fn display(&self) {
        tracing::info!("Agent configuration:");
        tracing::info!("  Account: {} (slot {})", self.username, self.char_slot);
        match &self.master_override {
            Some(endpoint) => tracing::info!("  Master: {} (override)", endpoint),
            None => tracing::info!(
                "  Master: {} candidates, index {}",
                self.masters.len(),
                self.master_index
            ),
        }
        tracing::info!("  Topology: {:?}, challenge: {}", self.topology, self.challenge);
        tracing::info!(
            "  Timeouts: master {}s, login {}s, char {}s, map {}s",
            self.timeout_master,
            self.timeout_login,
            self.timeout_char,
            self.timeout_map
        );
        tracing::info!(
            "  Reconnect: every {}s, {} attempts",
            self.reconnect_delay,
            AttemptLimit(self.max_reconnect_attempts)
        );
        tracing::info!("  Cipher: {:?}", self.cipher);
        if self.mirror {
            tracing::info!(
                "  Mirror: {} (max {} clients, {:?} slots)",
                self.mirror_bind,
                self.mirror_max_clients,
                self.mirror_slot_policy
            );
        } else {
            tracing::info!("  Mirror: disabled");
        }
        if let Some(path) = &self.recvpackets {
            tracing::info!("  Length table: {}", path.display());
        }
    }
}

struct AttemptLimit(Option<u32>);

impl fmt::Display for AttemptLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(n) => write!(f, "{}", n),
            None => f.write_str("unlimited"),
        }
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(key, value))
}

fn flag(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn hex(key: &str, value: &str) -> Result<u32> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| invalid(key, value))
}

fn endpoint(key: &str, value: &str) -> Result<Endpoint> {
    value.parse().map_err(|_| invalid(key, value))
}

fn optional_endpoint(key: &str, value: &str) -> Result<Option<Endpoint>> {
    if value.is_empty() {
        return Ok(None);
    }
    endpoint(key, value).map(Some)
}

fn choice<T: Copy>(key: &str, value: &str, options: &[(&str, T)]) -> Result<T> {
    options
        .iter()
        .find(|(name, _)| value.eq_ignore_ascii_case(name))
        .map(|&(_, option)| option)
        .ok_or_else(|| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
# Account
username = alice
password = secret
char_slot = 2
sex = female

master = 127.0.0.1:6900
master = 10.0.0.2:6900
master_index = 1
topology = direct
direct_char_id = 150001
challenge = yes

timeout_map = 30
max_reconnect_attempts = 3

cipher = threekey
cipher_key1 = 0x01000000
cipher_key2 = 1
cipher_key3 = 3
threekey_reseed_message = 0x0436
desync_error_codes = 3, 15

mirror = true
mirror_bind = 0.0.0.0:6901
mirror_slot_policy = single
recvpackets = tables/recvpackets.txt
"#;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.legacy_reseed_message, MessageId(0x02AE));
        assert_eq!(config.max_reconnect_attempts, None);
        assert!(!config.mirror);
    }

    #[test]
    fn test_parse_sample_config() {
        let config = AgentConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.username, "alice");
        assert_eq!(config.char_slot, 2);
        assert_eq!(config.sex, Sex::Female);
        assert_eq!(
            config.masters,
            vec![Endpoint::new("127.0.0.1", 6900), Endpoint::new("10.0.0.2", 6900)]
        );
        assert_eq!(config.master_index, 1);
        assert_eq!(config.topology, TopologyKind::Direct);
        assert_eq!(config.direct_char_id, Some(CharId(150001)));
        assert!(config.challenge);
        assert_eq!(config.timeout_map, 30);
        assert_eq!(config.timeout_master, 12);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.cipher, CipherKind::ThreeKey);
        assert_eq!(config.cipher_keys, [0x0100_0000, 1, 3]);
        assert_eq!(config.threekey_reseed_message, Some(MessageId(0x0436)));
        assert_eq!(config.desync_error_codes, vec![3, 15]);
        assert!(config.mirror);
        assert_eq!(config.mirror_bind.port(), 6901);
        assert_eq!(config.mirror_slot_policy, SlotMode::Single);
        assert_eq!(config.recvpackets, Some(PathBuf::from("tables/recvpackets.txt")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AgentConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.masters.len(), 2);

        let missing = AgentConfig::load_from_file("/nonexistent/korelink.txt");
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_missing_master_is_configuration_error() {
        let config = AgentConfig::parse("username = alice\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
        assert!(matches!(KoreError::from(err), KoreError::Configuration(_)));
    }

    #[test]
    fn test_direct_topology_needs_character() {
        let config =
            AgentConfig::parse("username = alice\nmaster = 127.0.0.1:6900\ntopology = direct\n")
                .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            AgentConfig::parse("tick_ms = fast"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(AgentConfig::parse("cipher = rot13").is_err());
        assert!(AgentConfig::parse("master = nowhere").is_err());
        assert!(matches!(
            AgentConfig::parse("just some words"),
            Err(ConfigError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_unlimited_and_unknown_keys() {
        let config =
            AgentConfig::parse("max_reconnect_attempts = unlimited\nfavorite_color = blue\n")
                .unwrap();
        assert_eq!(config.max_reconnect_attempts, None);
    }
}
