//! Korelink - unattended game client with a local mirror server
//!
//! Usage: `korelink [config-file]` (defaults to `config/korelink.txt`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use korelink_config::{
    AgentConfig, CipherKind, DisconnectAction, FramingMode, SlotMode, TopologyKind,
    DEFAULT_CONFIG_PATH,
};
use korelink_network::{
    Agent, InGameDisconnectPolicy, MirrorConfig, ServerDescriptor, SessionConfig, SlotPolicy,
    StageTimeouts, Topology,
};
use korelink_protocol::{CipherProfile, FramingPolicy, Registry};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AgentConfig::load_from_file(&path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Korelink starting up");
    info!("Configuration loaded from {}", path);
    config.display();

    let mut registry = Registry::builtin();
    if let Some(table) = &config.recvpackets {
        let applied = registry
            .load_length_table(table)
            .with_context(|| format!("Failed to load length table {}", table.display()))?;
        info!("Applied {} length overrides from {}", applied, table.display());
    }

    let mut agent = Agent::new(
        session_config(&config),
        mirror_config(&config),
        Arc::new(registry),
        Duration::from_millis(config.tick_ms),
    )
    .await?;

    if let Err(e) = agent.run().await {
        error!("Agent error: {}", e);
        return Err(e.into());
    }

    info!("Agent shut down");
    Ok(())
}

fn session_config(config: &AgentConfig) -> SessionConfig {
    let mut master = ServerDescriptor::new(config.masters.clone()).with_index(config.master_index);
    if let Some(endpoint) = &config.master_override {
        master = master.with_override(endpoint.clone());
    }

    let mut char_server = ServerDescriptor::default().with_index(config.char_server_index);
    if let Some(endpoint) = &config.char_server_override {
        char_server = char_server.with_override(endpoint.clone());
    }

    SessionConfig {
        username: config.username.clone(),
        password: config.password.clone(),
        client_version: config.client_version,
        master_version: config.master_version,
        char_slot: config.char_slot,
        sex: config.sex,
        master,
        char_server,
        map_server_override: config.map_server_override.clone(),
        topology: match config.topology {
            TopologyKind::Standard => Topology::Standard,
            TopologyKind::Direct => Topology::Direct,
        },
        direct_char_id: config.direct_char_id,
        challenge: config.challenge,
        timeouts: StageTimeouts {
            master: Duration::from_secs(config.timeout_master),
            login: Duration::from_secs(config.timeout_login),
            char_select: Duration::from_secs(config.timeout_char),
            map: Duration::from_secs(config.timeout_map),
        },
        connect_timeout: Duration::from_secs(config.connect_timeout),
        reconnect_delay: Duration::from_secs(config.reconnect_delay),
        max_reconnect_attempts: config.max_reconnect_attempts,
        sync_interval: Duration::from_secs(config.sync_interval),
        ingame_disconnect: match config.ingame_disconnect {
            DisconnectAction::Reconnect => InGameDisconnectPolicy::Reconnect,
            DisconnectAction::Exit => InGameDisconnectPolicy::Exit,
        },
        framing_policy: match config.framing_policy {
            FramingMode::Disconnect => FramingPolicy::Disconnect,
            FramingMode::Resync => FramingPolicy::Resync,
        },
        cipher: cipher_profile(config),
        desync_error_codes: config.desync_error_codes.clone(),
    }
}

fn cipher_profile(config: &AgentConfig) -> CipherProfile {
    let [k1, k2, k3] = config.cipher_keys;
    match config.cipher {
        CipherKind::None => CipherProfile::None,
        CipherKind::Legacy => CipherProfile::Legacy {
            seed: k1,
            key2: k2,
            trigger: config.legacy_reseed_message,
        },
        CipherKind::ThreeKey => CipherProfile::ThreeKey {
            k1,
            k2,
            k3,
            reseed_message: config.threekey_reseed_message,
        },
    }
}

fn mirror_config(config: &AgentConfig) -> MirrorConfig {
    MirrorConfig {
        enabled: config.mirror,
        bind_address: config.mirror_bind,
        hold_on_disconnect: config.mirror_hold_on_disconnect,
        auto_bind: config.mirror_auto_bind,
        slot_policy: match config.mirror_slot_policy {
            SlotMode::Peer => SlotPolicy::PerPeerAddress,
            SlotMode::Single => SlotPolicy::Single,
        },
        max_clients: config.mirror_max_clients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use korelink_core::{Endpoint, MessageId};

    #[test]
    fn test_session_config_conversion() {
        let config = AgentConfig::parse(
            "username = alice\n\
             master = 10.0.0.1:6900\n\
             master = 10.0.0.2:6900\n\
             master_index = 1\n\
             char_server_override = 10.0.0.9:6121\n\
             timeout_char = 20\n\
             cipher = threekey\n\
             cipher_key1 = 01000000\n\
             cipher_key2 = 1\n\
             cipher_key3 = 3\n",
        )
        .unwrap();

        let session = session_config(&config);
        assert!(session.validate().is_ok());
        assert_eq!(session.master.select("master").unwrap(), Endpoint::new("10.0.0.2", 6900));
        assert_eq!(
            session.char_server.select("char").unwrap(),
            Endpoint::new("10.0.0.9", 6121)
        );
        assert_eq!(session.timeouts.char_select, Duration::from_secs(20));
        assert_eq!(
            session.cipher,
            CipherProfile::ThreeKey {
                k1: 0x0100_0000,
                k2: 1,
                k3: 3,
                reseed_message: None,
            }
        );
    }

    #[test]
    fn test_legacy_cipher_and_mirror_conversion() {
        let config = AgentConfig::parse(
            "cipher = legacy\n\
             cipher_key1 = 1234\n\
             legacy_reseed_message = 0x0200\n\
             mirror = yes\n\
             mirror_slot_policy = single\n",
        )
        .unwrap();

        assert_eq!(
            cipher_profile(&config),
            CipherProfile::Legacy {
                seed: 0x1234,
                key2: 0,
                trigger: MessageId(0x0200),
            }
        );
        let mirror = mirror_config(&config);
        assert!(mirror.enabled);
        assert_eq!(mirror.slot_policy, SlotPolicy::Single);
    }
}
