//! # Upstream Session State Machine
//!
//! Drives one logical connection through the login chain:
//!
//! ```text
//! Disconnected -> ConnectedMaster -> ConnectedLogin -> ConnectedChar -> InGame
//!       ^                                                                 |
//!       +------------------- timeout / failure / closure -----------------+
//! ```
//!
//! With [`Topology::Direct`] the character server hop is skipped and the
//! machine goes from `ConnectedMaster` straight to `ConnectedChar`.
//!
//! # Tick model
//!
//! The machine owns the upstream socket and is advanced by [`tick`], which
//! never waits for data:
//!
//! 1. Reconnect if a retry is due
//! 2. Non-blocking read; frames feed milestone detection
//! 3. Complete a pending server hop (bounded connect)
//! 4. Enforce the stage deadline
//! 5. Keep-alive while in game
//! 6. Flush queued frames through the sending hooks and the cipher
//!
//! Everything that happened comes back as [`SessionEvent`]s in order.
//!
//! [`tick`]: SessionStateMachine::tick

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use korelink_core::{AccountId, CharId, Endpoint, KoreError, Result, SessionTokens, Sex};
use korelink_protocol::{
    message_ids as ids, Fields, Frame, FrameAssembler, FramingError, MessageCipher, Registry,
};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::{InGameDisconnectPolicy, SessionConfig, Topology};
use crate::descriptor::ServerDescriptor;
use crate::hooks::{Direction, HookEvent, SharedHooks};
use crate::milestone::{CharacterEntry, Milestone, MilestoneDetector};

/// Lifecycle stage of the upstream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Stage {
    #[default]
    Disconnected,
    ConnectedMaster,
    ConnectedLogin,
    ConnectedChar,
    InGame,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::ConnectedMaster => "ConnectedMaster",
            Self::ConnectedLogin => "ConnectedLogin",
            Self::ConnectedChar => "ConnectedChar",
            Self::InGame => "InGame",
        };
        f.write_str(name)
    }
}

/// Challenge sub-protocol progress on the master server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeState {
    #[default]
    NotRequired,
    Issued,
    AwaitingVerdict,
    Verified,
}

/// Why the session went back to `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// The server closed the socket or a read/write failed
    Closed,
    /// No milestone before the stage deadline
    Timeout,
    /// Login or challenge refused
    Rejected,
    /// The upstream byte stream could not be framed
    Framing,
    /// The server reported a cipher desync
    CipherDesync,
    /// A hop could not connect
    ConnectFailed,
    /// Requested by the operator
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StageChanged {
        from: Stage,
        to: Stage,
    },
    Milestone(Milestone),
    /// Every frame received from upstream, with the stage it arrived in
    Frame {
        frame: Frame,
        stage: Stage,
    },
    Disconnected {
        kind: DisconnectKind,
        reason: String,
        was_in_game: bool,
    },
    RetriesExhausted {
        attempts: u32,
    },
    /// In-game closure under the `Exit` policy
    ExitRequested,
}

/// Identifiers captured from milestones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionIdentity {
    pub account_id: AccountId,
    pub char_id: CharId,
    pub tokens: SessionTokens,
    pub sex: Sex,
    /// Raw map name from the character server
    pub map: Bytes,
    pub x: u16,
    pub y: u16,
    pub dir: u8,
    pub characters: Vec<CharacterEntry>,
}

impl SessionIdentity {
    /// The character the session plays, if the character list named it
    pub fn character(&self) -> Option<&CharacterEntry> {
        self.characters.iter().find(|c| c.char_id == self.char_id)
    }
}

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
}

struct Hop {
    stage: Stage,
    endpoint: Endpoint,
}

/// Owner of the upstream socket and the session lifecycle
pub struct SessionStateMachine {
    config: SessionConfig,
    registry: Arc<Registry>,
    hooks: SharedHooks,
    detector: MilestoneDetector,

    stage: Stage,
    challenge: ChallengeState,

    socket: Option<TcpStream>,
    assembler: FrameAssembler,
    cipher: MessageCipher,
    outbound: VecDeque<Frame>,
    write_buffer: BytesMut,

    char_servers: ServerDescriptor,
    pending_hop: Option<Hop>,

    deadline: Option<Instant>,
    next_attempt: Option<Instant>,
    reconnect_attempts: u32,
    auto_reconnect: bool,
    last_sync: Option<Instant>,
    exit_requested: bool,

    identity: SessionIdentity,
    stats: TrafficStats,
    epoch: Instant,
    events: Vec<SessionEvent>,
}

impl SessionStateMachine {
    pub fn new(config: SessionConfig, registry: Arc<Registry>, hooks: SharedHooks) -> Self {
        let assembler = FrameAssembler::new(registry.clone(), config.framing_policy);
        let cipher = MessageCipher::new(config.cipher.clone());
        let char_servers = config.char_server.clone();

        Self {
            config,
            registry,
            hooks,
            detector: MilestoneDetector::new(),
            stage: Stage::Disconnected,
            challenge: ChallengeState::NotRequired,
            socket: None,
            assembler,
            cipher,
            outbound: VecDeque::new(),
            write_buffer: BytesMut::with_capacity(8192),
            char_servers,
            pending_hop: None,
            deadline: None,
            next_attempt: None,
            reconnect_attempts: 0,
            auto_reconnect: false,
            last_sync: None,
            exit_requested: false,
            identity: SessionIdentity::default(),
            stats: TrafficStats::default(),
            epoch: Instant::now(),
            events: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn challenge_state(&self) -> ChallengeState {
        self.challenge
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    /// Cipher applied to frames sent upstream
    pub fn cipher(&self) -> &MessageCipher {
        &self.cipher
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Connect to the master server now
    ///
    /// Resets the reconnect counter and re-enables automatic reconnection.
    pub async fn connect(&mut self) -> Result<()> {
        let now = Instant::now();
        if self.stage != Stage::Disconnected || self.socket.is_some() {
            self.close_socket();
            self.pending_hop = None;
            self.transition(Stage::Disconnected);
        }
        self.reconnect_attempts = 0;
        self.auto_reconnect = true;
        self.next_attempt = None;
        self.connect_master(now).await
    }

    /// Close the session and stop reconnecting
    pub fn disconnect(&mut self, reason: &str) {
        self.auto_reconnect = false;
        self.next_attempt = None;
        if self.stage == Stage::Disconnected && self.socket.is_none() {
            return;
        }
        info!("Disconnecting: {}", reason);
        let was_in_game = self.stage == Stage::InGame;
        self.close_socket();
        self.pending_hop = None;
        self.deadline = None;
        self.emit_disconnected(DisconnectKind::Manual, reason.to_string(), was_in_game);
        self.transition(Stage::Disconnected);
    }

    /// Queue a frame for the upstream server
    ///
    /// The identifier is ciphered at transmission, after the sending hooks.
    pub fn queue_outbound(&mut self, frame: Frame) {
        self.outbound.push_back(frame);
    }

    /// Advance the session by one tick
    pub async fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        if self.stage == Stage::Disconnected && self.socket.is_none() && self.auto_reconnect {
            let due = self.next_attempt.map_or(true, |at| now >= at);
            if due {
                if let Err(e) = self.connect_master(now).await {
                    debug!("Reconnect attempt failed: {}", e);
                }
            }
        }

        if self.socket.is_some() {
            self.read_upstream(now);
        }

        if let Some(hop) = self.pending_hop.take() {
            self.complete_hop(hop, now).await;
        }

        if let Some(deadline) = self.deadline {
            if now >= deadline && self.stage != Stage::Disconnected {
                let reason = format!("no milestone in {} before the deadline", self.stage);
                self.fail(DisconnectKind::Timeout, reason, now);
            }
        }

        if self.stage == Stage::InGame {
            let due = self
                .last_sync
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.sync_interval);
            if due {
                let tick = self.client_tick(now);
                self.queue_built("sync", Fields::new().with("tick", tick), now);
                self.last_sync = Some(now);
            }
        }

        self.flush(now);
        std::mem::take(&mut self.events)
    }

    /// Feed a milestone into the machine
    ///
    /// Called by the built-in detector for every upstream milestone frame;
    /// external callers may use it to drive the machine directly.
    pub fn on_milestone(&mut self, milestone: Milestone, now: Instant) {
        debug!("Milestone {} in {}", milestone.name(), self.stage);
        self.hooks.lock().dispatch(&HookEvent::MilestoneReached(&milestone));
        self.events.push(SessionEvent::Milestone(milestone.clone()));

        match (milestone, self.stage) {
            (Milestone::ChallengeRequest { challenge }, Stage::ConnectedMaster)
                if self.challenge == ChallengeState::Issued =>
            {
                self.queue_built("gameguard_reply", Fields::new().with("answer", challenge), now);
                self.challenge = ChallengeState::AwaitingVerdict;
            }
            (Milestone::ChallengeVerdict { verdict }, Stage::ConnectedMaster)
                if self.challenge == ChallengeState::AwaitingVerdict =>
            {
                if verdict == 1 || verdict == 2 {
                    self.challenge = ChallengeState::Verified;
                    self.queue_master_login(now);
                } else {
                    self.fail(
                        DisconnectKind::Rejected,
                        format!("challenge rejected (verdict {})", verdict),
                        now,
                    );
                }
            }
            (
                Milestone::LoginAccepted {
                    account_id,
                    tokens,
                    sex,
                    servers,
                },
                Stage::ConnectedMaster,
            ) if matches!(
                self.challenge,
                ChallengeState::NotRequired | ChallengeState::Verified
            ) =>
            {
                if self.config.topology == Topology::Direct {
                    let Some(char_id) = self.config.direct_char_id else {
                        self.fail_with(
                            &KoreError::Configuration(
                                "direct topology needs direct_char_id".into(),
                            ),
                            now,
                        );
                        return;
                    };
                    self.identity.char_id = char_id;
                }
                self.identity.account_id = account_id;
                self.identity.tokens = tokens;
                self.identity.sex = sex;
                self.char_servers
                    .set_candidates(servers.into_iter().map(|s| s.endpoint).collect());

                let (stage, selected) = match self.config.topology {
                    Topology::Standard => {
                        (Stage::ConnectedLogin, self.char_servers.select("character"))
                    }
                    Topology::Direct => (
                        Stage::ConnectedChar,
                        match &self.config.map_server_override {
                            Some(endpoint) => Ok(endpoint.clone()),
                            None => self.char_servers.select("map"),
                        },
                    ),
                };
                match selected {
                    Ok(endpoint) => self.begin_hop(stage, endpoint),
                    Err(e) => self.fail(DisconnectKind::Rejected, e.to_string(), now),
                }
            }
            (Milestone::LoginAccepted { .. }, Stage::ConnectedMaster) => {
                warn!("Login accepted before the challenge completed; ignoring");
            }
            (Milestone::CharactersReceived { characters }, Stage::ConnectedLogin) => {
                info!("Received {} characters", characters.len());
                self.identity.characters = characters;
                let slot = self.config.char_slot;
                self.queue_built("char_select", Fields::new().with("slot", slot), now);
                self.deadline = Some(now + self.config.timeouts.char_select);
            }
            (
                Milestone::CharacterSelected {
                    char_id,
                    map,
                    endpoint,
                },
                Stage::ConnectedLogin,
            ) => {
                self.identity.char_id = char_id;
                self.identity.map = map;
                let endpoint = self.config.map_server_override.clone().unwrap_or(endpoint);
                self.begin_hop(Stage::ConnectedChar, endpoint);
            }
            (Milestone::AccountConfirmed { account_id }, _) => {
                if account_id != self.identity.account_id {
                    debug!("Map server confirmed account {:?}", account_id);
                }
            }
            (Milestone::MapLoaded { x, y, dir }, Stage::ConnectedChar) => {
                self.identity.x = x;
                self.identity.y = y;
                self.identity.dir = dir;
                self.transition(Stage::InGame);
                self.cipher.activate();
                self.deadline = None;
                self.reconnect_attempts = 0;
                self.last_sync = Some(now);
                self.queue_built("map_loaded_ack", Fields::new(), now);
                info!(
                    "In game on {} at ({}, {})",
                    String::from_utf8_lossy(&self.identity.map),
                    self.identity.x,
                    self.identity.y
                );
            }
            (Milestone::LoginRejected { message, code }, _) => {
                if message == ids::ERRORS && self.config.desync_error_codes.contains(&code) {
                    self.fail(
                        DisconnectKind::CipherDesync,
                        format!("server reported a cipher desync (code {})", code),
                        now,
                    );
                } else {
                    self.fail(
                        DisconnectKind::Rejected,
                        format!("{} with code {}", message, code),
                        now,
                    );
                }
            }
            (milestone, stage) => {
                debug!("Ignoring {} in {}", milestone.name(), stage);
            }
        }
    }

    /// Write queued frames to the upstream socket
    pub fn flush(&mut self, now: Instant) {
        if self.socket.is_none() {
            return;
        }

        while let Some(frame) = self.outbound.pop_front() {
            let id = frame.id;
            let sent = self.hooks.lock().before_send(Direction::Upstream, frame);
            let Some(frame) = sent else {
                debug!("Hook cancelled upstream frame {}", id);
                continue;
            };
            let wire_id = self.cipher.encrypt(frame.id);
            frame.write_to(&mut self.write_buffer, wire_id);
            self.stats.frames_out += 1;
            trace!("Upstream <- {} as {} ({} bytes)", frame.id, wire_id, frame.wire_len());
        }

        let mut failure = None;
        if let Some(socket) = self.socket.as_ref() {
            while !self.write_buffer.is_empty() {
                match socket.try_write(&self.write_buffer) {
                    Ok(0) => {
                        failure = Some("upstream socket accepted no bytes".to_string());
                        break;
                    }
                    Ok(n) => {
                        self.write_buffer.advance(n);
                        self.stats.bytes_out += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failure = Some(format!("write failed: {}", e));
                        break;
                    }
                }
            }
        }

        if let Some(reason) = failure {
            self.handle_closure(reason, now);
        }
    }

    async fn connect_master(&mut self, now: Instant) -> Result<()> {
        let endpoint = match self.config.master.select("master") {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("Cannot connect: {}", e);
                self.auto_reconnect = false;
                return Err(e);
            }
        };

        info!("Connecting to master server {}", endpoint);
        match self.open(&endpoint).await {
            Ok(stream) => {
                self.attach(stream);
                self.transition(Stage::ConnectedMaster);
                self.deadline = Some(now + self.config.timeouts.master);
                if self.config.challenge {
                    self.challenge = ChallengeState::Issued;
                    self.queue_built("gameguard_grant_request", Fields::new(), now);
                } else {
                    self.challenge = ChallengeState::NotRequired;
                    self.queue_master_login(now);
                }
                Ok(())
            }
            Err(e) => {
                self.fail_with(&e, now);
                Err(e)
            }
        }
    }

    async fn complete_hop(&mut self, hop: Hop, now: Instant) {
        info!("Connecting to {} server {}", hop.stage, hop.endpoint);
        match self.open(&hop.endpoint).await {
            Ok(stream) => {
                self.attach(stream);
                self.transition(hop.stage);
                match hop.stage {
                    Stage::ConnectedLogin => {
                        self.deadline = Some(now + self.config.timeouts.login);
                        let fields = Fields::new()
                            .with("account_id", self.identity.account_id.get())
                            .with("session_id", self.identity.tokens.session_id)
                            .with("session_id2", self.identity.tokens.session_id2)
                            .with("sex", self.config.sex.as_u8());
                        self.queue_built("game_login", fields, now);
                    }
                    Stage::ConnectedChar => {
                        self.deadline = Some(now + self.config.timeouts.map);
                        let fields = Fields::new()
                            .with("account_id", self.identity.account_id.get())
                            .with("char_id", self.identity.char_id.get())
                            .with("session_id", self.identity.tokens.session_id)
                            .with("tick", self.client_tick(now))
                            .with("sex", self.config.sex.as_u8());
                        self.queue_built("map_login", fields, now);
                    }
                    _ => {}
                }
            }
            Err(e) => self.fail_with(&e, now),
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| KoreError::Timeout(format!("connecting to {}", endpoint)))?
            .map_err(|e| KoreError::Connection(format!("connecting to {}: {}", endpoint, e)))?;

        stream.set_nodelay(true).map_err(|e| {
            KoreError::Connection(format!("Failed to set TCP_NODELAY: {}", e))
        })?;
        if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
            warn!("Failed to enable keepalive on {}: {}", endpoint, e);
        }

        Ok(stream)
    }

    fn attach(&mut self, stream: TcpStream) {
        self.close_socket();
        self.socket = Some(stream);
    }

    fn close_socket(&mut self) {
        self.socket = None;
        self.assembler.reset();
        self.write_buffer.clear();
        self.outbound.clear();
        // New epoch: legacy re-seeds from the old connection do not carry over
        self.cipher = MessageCipher::new(self.config.cipher.clone());
    }

    fn begin_hop(&mut self, stage: Stage, endpoint: Endpoint) {
        debug!("Leaving {} for {} at {}", self.stage, stage, endpoint);
        self.close_socket();
        self.deadline = None;
        self.pending_hop = Some(Hop { stage, endpoint });
    }

    fn read_upstream(&mut self, now: Instant) {
        let mut frames = Vec::new();
        let mut framing_error: Option<FramingError> = None;
        let mut closed: Option<String> = None;

        if let Some(socket) = self.socket.as_ref() {
            let mut buf = [0u8; 8192];
            loop {
                match socket.try_read(&mut buf) {
                    Ok(0) => {
                        closed = Some("connection closed by server".to_string());
                        break;
                    }
                    Ok(n) => {
                        self.stats.bytes_in += n as u64;
                        for result in self.assembler.feed(&buf[..n]) {
                            match result {
                                Ok(frame) => frames.push(frame),
                                Err(e) => {
                                    framing_error = Some(e);
                                    break;
                                }
                            }
                        }
                        if framing_error.is_some() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        closed = Some(format!("read failed: {}", e));
                        break;
                    }
                }
            }
        }

        for frame in frames {
            self.handle_frame(frame, now);
            if self.socket.is_none() || self.pending_hop.is_some() {
                return;
            }
        }

        if let Some(e) = framing_error {
            self.fail_with(&KoreError::from(e), now);
        } else if let Some(reason) = closed {
            self.handle_closure(reason, now);
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        self.stats.frames_in += 1;
        trace!("Upstream -> {} ({} bytes)", frame.id, frame.wire_len());

        if Some(frame.id) == self.cipher.legacy_trigger() {
            if frame.payload.len() >= 8 {
                let mut params = &frame.payload[..8];
                let seed = params.get_u32_le();
                let key2 = params.get_u32_le();
                self.cipher.reseed(seed, key2);
            } else {
                warn!("Short legacy re-seed message {}", frame.id);
            }
        }

        let detected = self.detector.detect(&self.registry, &frame);
        self.events.push(SessionEvent::Frame {
            frame,
            stage: self.stage,
        });

        match detected {
            Some(Ok(milestone)) => self.on_milestone(milestone, now),
            Some(Err(e)) => warn!("Malformed milestone frame: {}", e),
            None => {}
        }
    }

    fn handle_closure(&mut self, reason: String, now: Instant) {
        if self.stage == Stage::InGame
            && self.config.ingame_disconnect == InGameDisconnectPolicy::Exit
        {
            error!("Upstream closed while in game ({}); exiting", reason);
            self.close_socket();
            self.deadline = None;
            self.auto_reconnect = false;
            self.next_attempt = None;
            self.emit_disconnected(DisconnectKind::Closed, reason, true);
            self.transition(Stage::Disconnected);
            self.exit_requested = true;
            self.events.push(SessionEvent::ExitRequested);
            return;
        }
        self.fail(DisconnectKind::Closed, reason, now);
    }

    /// Tear down after `err`; errors the retry path cannot fix also stop retrying
    fn fail_with(&mut self, err: &KoreError, now: Instant) {
        let kind = match err {
            KoreError::CipherDesync(_) => DisconnectKind::CipherDesync,
            KoreError::Framing(_) => DisconnectKind::Framing,
            e if e.is_retryable() => DisconnectKind::ConnectFailed,
            _ => DisconnectKind::Rejected,
        };
        self.fail(kind, err.to_string(), now);

        if !err.forces_reset() && !err.is_retryable() && self.auto_reconnect {
            error!("{} will not go away by retrying; waiting for a manual connect", err);
            self.auto_reconnect = false;
            self.next_attempt = None;
        }
    }

    /// Tear down to `Disconnected` and schedule a retry
    fn fail(&mut self, kind: DisconnectKind, reason: String, now: Instant) {
        let was_in_game = self.stage == Stage::InGame;
        let was_connected =
            self.stage != Stage::Disconnected || self.socket.is_some() || self.pending_hop.is_some();
        warn!("Session failure in {} ({:?}): {}", self.stage, kind, reason);

        self.close_socket();
        self.pending_hop = None;
        self.deadline = None;
        self.last_sync = None;
        self.challenge = ChallengeState::NotRequired;
        if was_connected {
            self.emit_disconnected(kind, reason, was_in_game);
        }
        self.transition(Stage::Disconnected);

        self.reconnect_attempts += 1;
        match self.config.max_reconnect_attempts {
            Some(max) if self.reconnect_attempts > max => {
                error!(
                    "Giving up after {} failed attempts; waiting for a manual connect",
                    self.reconnect_attempts
                );
                self.auto_reconnect = false;
                self.next_attempt = None;
                self.events.push(SessionEvent::RetriesExhausted {
                    attempts: self.reconnect_attempts,
                });
            }
            _ => {
                let delay: Duration = self.config.reconnect_delay;
                self.next_attempt = Some(now + delay);
                info!(
                    "Reconnecting in {:?} (attempt {})",
                    delay, self.reconnect_attempts
                );
            }
        }
    }

    fn emit_disconnected(&mut self, kind: DisconnectKind, reason: String, was_in_game: bool) {
        self.hooks.lock().dispatch(&HookEvent::Disconnected { reason: &reason });
        self.events.push(SessionEvent::Disconnected {
            kind,
            reason,
            was_in_game,
        });
    }

    fn transition(&mut self, to: Stage) {
        if self.stage == to {
            return;
        }
        let from = self.stage;
        self.stage = to;
        info!("Session stage {} -> {}", from, to);
        self.hooks.lock().dispatch(&HookEvent::StageChanged { from, to });
        self.events.push(SessionEvent::StageChanged { from, to });
    }

    fn queue_master_login(&mut self, now: Instant) {
        let fields = Fields::new()
            .with("version", self.config.client_version)
            .with("username", self.config.username.as_str())
            .with("password", self.config.password.as_str())
            .with("master_version", self.config.master_version);
        self.queue_built("master_login", fields, now);
    }

    fn queue_built(&mut self, name: &str, fields: Fields, now: Instant) {
        match self.registry.build(name, &fields) {
            Ok(frame) => self.outbound.push_back(frame),
            Err(e) => {
                error!("Cannot build {}", name);
                self.fail_with(&e, now);
            }
        }
    }

    fn client_tick(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }
}
