//! # Agent Driver
//!
//! Owns the upstream session, the optional mirror server, the world cache and
//! the hook registry, and advances them together once per tick.
//!
//! # Tick Order
//!
//! ```text
//! 1. Session tick (retry, read, hop, deadline, keep-alive, flush)
//! 2. World cache absorbs upstream frames
//! 3. Mirror reacts to session events (relay, snapshots, notices)
//! 4. Mirror accepts new clients
//! 5. Mirror reads clients; forwarded frames join the session queue
//! 6. Session and mirror flush
//! ```
//!
//! Upstream frames are always processed before mirrored-client frames.
//!
//! # Example
//!
//! ```rust,no_run
//! use korelink_network::{Agent, MirrorConfig, SessionConfig};
//! use korelink_protocol::Registry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(config: SessionConfig) -> korelink_core::Result<()> {
//! let registry = Arc::new(Registry::builtin());
//! let mut agent = Agent::new(
//!     config,
//!     MirrorConfig::default(),
//!     registry,
//!     Duration::from_millis(50),
//! )
//! .await?;
//! agent.run().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use korelink_core::Result;
use korelink_protocol::Registry;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{MirrorConfig, SessionConfig};
use crate::hooks::{HookRegistry, SharedHooks};
use crate::mirror::MirrorServer;
use crate::session::{SessionEvent, SessionStateMachine, Stage};
use crate::world::WorldState;

/// Whether the driver loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Exit,
}

pub struct Agent {
    session: SessionStateMachine,
    mirror: Option<MirrorServer>,
    world: WorldState,
    hooks: SharedHooks,
    tick_interval: Duration,
}

impl Agent {
    /// Validate the configuration and bind the mirror (if enabled)
    ///
    /// # Errors
    /// - `Configuration` if either configuration is invalid
    /// - `Connection` if the mirror cannot bind
    pub async fn new(
        session_config: SessionConfig,
        mirror_config: MirrorConfig,
        registry: Arc<Registry>,
        tick_interval: Duration,
    ) -> Result<Self> {
        session_config.validate()?;
        mirror_config.validate()?;

        let hooks = HookRegistry::shared();
        let mirror = if mirror_config.enabled {
            Some(MirrorServer::bind(mirror_config, registry.clone(), hooks.clone()).await?)
        } else {
            None
        };

        Ok(Self {
            session: SessionStateMachine::new(session_config, registry.clone(), hooks.clone()),
            mirror,
            world: WorldState::new(registry),
            hooks,
            tick_interval,
        })
    }

    /// Hook registry shared by the session and the mirror
    pub fn hooks(&self) -> SharedHooks {
        self.hooks.clone()
    }

    pub fn session(&self) -> &SessionStateMachine {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionStateMachine {
        &mut self.session
    }

    pub fn mirror(&self) -> Option<&MirrorServer> {
        self.mirror.as_ref()
    }

    pub fn mirror_mut(&mut self) -> Option<&mut MirrorServer> {
        self.mirror.as_mut()
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    /// First connect to the master server
    ///
    /// A failed attempt is left to the retry path; only errors that disable
    /// retrying are returned.
    pub async fn start(&mut self) -> Result<()> {
        match self.session.connect().await {
            Ok(()) => Ok(()),
            Err(e) if !self.session.auto_reconnect() => Err(e),
            Err(e) => {
                warn!("Initial connect failed: {}", e);
                Ok(())
            }
        }
    }

    /// Advance everything by one tick
    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        let events = self.session.tick(now).await;

        for event in &events {
            match event {
                SessionEvent::Frame { frame, .. } => {
                    if let Err(e) = self.world.absorb(frame) {
                        debug!("World cache skipped {}: {}", frame.id, e);
                    }
                }
                SessionEvent::StageChanged {
                    to: Stage::ConnectedChar,
                    ..
                } => self.world.clear_map(),
                // The next login starts from the master; nothing cached survives it
                SessionEvent::StageChanged {
                    to: Stage::Disconnected,
                    ..
                } => self.world.clear(),
                _ => {}
            }
        }

        if let Some(mirror) = self.mirror.as_mut() {
            for event in &events {
                mirror.on_session_event(event, &self.world);
            }
            mirror.accept_pending(self.session.cipher());
            for frame in mirror.poll_clients(&self.session, &self.world) {
                self.session.queue_outbound(frame);
            }
        }

        self.session.flush(now);
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.flush();
        }

        if self.session.exit_requested() {
            TickOutcome::Exit
        } else {
            TickOutcome::Continue
        }
    }

    /// Run until Ctrl-C or an exit-on-disconnect
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Agent running, tick every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.tick(Instant::now()).await == TickOutcome::Exit {
                        info!("Upstream closed while in game, exiting");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Close the upstream session and every mirrored client
    pub fn shutdown(&mut self) {
        self.session.disconnect("shutting down");
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InGameDisconnectPolicy, StageTimeouts};
    use crate::descriptor::ServerDescriptor;
    use crate::milestone::{Milestone, ServerEntry};
    use korelink_core::{AccountId, CharId, Endpoint, KoreError, SessionTokens, Sex};
    use korelink_protocol::{message_ids as ids, Fields, Frame};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn session_config(master: &Endpoint) -> SessionConfig {
        SessionConfig {
            username: "alice".into(),
            password: "secret".into(),
            master: ServerDescriptor::new(vec![master.clone()]),
            timeouts: StageTimeouts {
                master: Duration::from_secs(30),
                login: Duration::from_secs(30),
                char_select: Duration::from_secs(30),
                map: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    fn mirror_config() -> MirrorConfig {
        MirrorConfig {
            enabled: true,
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn tick_until(agent: &mut Agent, mut done: impl FnMut(&Agent) -> bool) {
        for _ in 0..400 {
            agent.tick(Instant::now()).await;
            if done(agent) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agent condition not reached");
    }

    /// Drive the agent into the game; returns the map server side
    async fn enter_game(agent: &mut Agent, listener: &TcpListener, endpoint: &Endpoint) -> TcpStream {
        agent.start().await.unwrap();
        let (_master, _) = listener.accept().await.unwrap();

        agent.session_mut().on_milestone(
            Milestone::LoginAccepted {
                account_id: AccountId(2000001),
                tokens: SessionTokens::default(),
                sex: Sex::Male,
                servers: vec![ServerEntry {
                    endpoint: endpoint.clone(),
                    name: "char".into(),
                    users: 0,
                }],
            },
            Instant::now(),
        );
        agent.tick(Instant::now()).await;
        let (_char, _) = listener.accept().await.unwrap();

        agent.session_mut().on_milestone(
            Milestone::CharacterSelected {
                char_id: CharId(150001),
                map: "prontera.gat".into(),
                endpoint: endpoint.clone(),
            },
            Instant::now(),
        );
        agent.tick(Instant::now()).await;
        let (mut map_server, _) = listener.accept().await.unwrap();
        assert_eq!(&read_exact(&mut map_server, 19).await[..2], &[0x72, 0x00]);

        agent
            .session_mut()
            .on_milestone(Milestone::MapLoaded { x: 150, y: 180, dir: 0 }, Instant::now());
        agent.tick(Instant::now()).await;
        assert_eq!(read_exact(&mut map_server, 2).await, vec![0x7D, 0x00]);
        map_server
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Agent::new(
            SessionConfig::default(),
            MirrorConfig::default(),
            Arc::new(Registry::builtin()),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(KoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_mirrored_client_joins_live_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let registry = Arc::new(Registry::builtin());
        let mut agent = Agent::new(
            session_config(&endpoint),
            mirror_config(),
            registry.clone(),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let mut map_server = enter_game(&mut agent, &listener, &endpoint).await;

        // Upstream state lands in the world cache
        let stat = registry
            .build("stat_info", &Fields::new().with("stat", 5u16).with("value", 400u32))
            .unwrap();
        map_server.write_all(&stat.to_bytes()).await.unwrap();
        tick_until(&mut agent, |a| a.world().stat(5) == Some(400)).await;

        // A real client attaches and reports its map as loaded
        let mirror_addr = agent.mirror().unwrap().local_addr().unwrap();
        let mut client = TcpStream::connect(mirror_addr).await.unwrap();
        tick_until(&mut agent, |a| a.mirror().unwrap().client_count() == 1).await;
        client
            .write_all(&Frame::empty(ids::MAP_LOADED_ACK).to_bytes())
            .await
            .unwrap();
        tick_until(&mut agent, |a| {
            a.mirror().unwrap().clients().all(|c| !c.is_provisional())
        })
        .await;

        // First snapshot frame is the live stat
        assert_eq!(read_exact(&mut client, 8).await, stat.to_bytes().to_vec());

        // Client chat goes upstream
        let chat = registry
            .build("public_chat", &Fields::new().with("message", "hello"))
            .unwrap();
        client.write_all(&chat.to_bytes()).await.unwrap();
        tick_until(&mut agent, |a| a.session().stats().frames_out >= 3).await;
        assert_eq!(
            read_exact(&mut map_server, chat.wire_len()).await,
            chat.to_bytes().to_vec()
        );
    }

    #[tokio::test]
    async fn test_disconnect_forgets_cached_world() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let registry = Arc::new(Registry::builtin());
        let mut agent = Agent::new(
            session_config(&endpoint),
            MirrorConfig::default(),
            registry.clone(),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let mut map_server = enter_game(&mut agent, &listener, &endpoint).await;

        let stat = registry
            .build("stat_info", &Fields::new().with("stat", 5u16).with("value", 400u32))
            .unwrap();
        map_server.write_all(&stat.to_bytes()).await.unwrap();
        tick_until(&mut agent, |a| a.world().stat(5) == Some(400)).await;

        drop(map_server);
        tick_until(&mut agent, |a| a.session().stage() == Stage::Disconnected).await;
        assert_eq!(agent.world().stat(5), None);
        let snapshot = agent.world().snapshot().unwrap();
        assert!(snapshot.iter().all(|f| f.id != ids::STAT_INFO));
    }

    #[tokio::test]
    async fn test_exit_policy_stops_the_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let mut agent = Agent::new(
            SessionConfig {
                ingame_disconnect: InGameDisconnectPolicy::Exit,
                ..session_config(&endpoint)
            },
            MirrorConfig::default(),
            Arc::new(Registry::builtin()),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        let map_server = enter_game(&mut agent, &listener, &endpoint).await;
        drop(map_server);

        let mut outcome = TickOutcome::Continue;
        for _ in 0..400 {
            outcome = agent.tick(Instant::now()).await;
            if outcome == TickOutcome::Exit {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(outcome, TickOutcome::Exit);
        assert!(agent.mirror().is_none());
    }
}
