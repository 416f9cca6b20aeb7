//! # Mirror Server
//!
//! Local listener that lets a real game client attach to the agent's
//! upstream session.
//!
//! # Architecture
//!
//! ```text
//! real client --> MirroredClientSession --> local handler table --+--> answered locally
//!                 (assembler + cipher)                            |
//!                                                                 +--> forwarded upstream
//! upstream frames (in game) --------------------------------------------> bound clients
//! ```
//!
//! The mirror plays the master, character and map servers for the client's
//! login chain, answering each step from the agent's own session identity and
//! advertising its own endpoint for every hop. Once the client reports its map
//! as loaded it is "in map" and receives a snapshot of the world cache.
//!
//! # Provisional Clients
//!
//! A client is provisional until it is bound to the live character. A
//! provisional client never causes a frame that needs a live character to be
//! forwarded, and receives placeholder snapshots instead of live ones.
//!
//! # Failure Isolation
//!
//! A malformed frame or a socket error closes only that client. Nothing here
//! propagates into the upstream session.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use futures::FutureExt;
use korelink_core::{ClientId, Endpoint, IdGenerator, KoreError, MessageId, Result};
use korelink_protocol::{
    message_ids as ids, FieldValue, Fields, Frame, FrameAssembler, FramingPolicy, MessageCipher,
    Registry,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

use crate::config::{MirrorConfig, SlotPolicy};
use crate::hooks::{Direction, HookEvent, SharedHooks};
use crate::milestone::{CharacterEntry, Milestone};
use crate::session::{SessionEvent, SessionStateMachine, Stage, TrafficStats};
use crate::world::WorldState;

/// Upstream frames that belong to the agent's own login chain
const RELAY_EXCLUDED: [MessageId; 9] = [
    ids::ACCOUNT_SERVER_INFO,
    ids::RECEIVED_CHARACTERS,
    ids::RECEIVED_CHARACTER_ID_AND_MAP,
    ids::MAP_LOADED,
    ids::ACCOUNT_ID,
    ids::GAMEGUARD_REQUEST,
    ids::GAMEGUARD_GRANT,
    ids::LOGIN_ERROR,
    ids::LOGIN_ERROR_GAME_LOGIN_SERVER,
];

/// Name the mirror gives itself in server lists
const MIRROR_NAME: &str = "korelink";

/// How far a mirrored client has come through the fake login chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientPhase {
    Connected,
    MasterLoggedIn,
    GameLoggedIn,
    CharSelected,
    MapLogin,
    InMap,
}

/// Replaceable connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Peer(IpAddr),
    Single,
}

/// Result of a local handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled here; never forwarded
    Answered,
    /// Let the forwarding rules decide
    Forward,
}

/// One real client attached to the mirror
pub struct MirroredClientSession {
    id: ClientId,
    peer: SocketAddr,
    slot: SlotKey,
    socket: TcpStream,
    assembler: FrameAssembler,
    cipher: MessageCipher,
    provisional: bool,
    phase: ClientPhase,
    outbound: VecDeque<Frame>,
    write_buffer: BytesMut,
    stats: TrafficStats,
}

impl MirroredClientSession {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional
    }

    pub fn is_in_map(&self) -> bool {
        self.phase == ClientPhase::InMap
    }

    /// Cipher the client applies to the identifiers it sends
    pub fn cipher(&self) -> &MessageCipher {
        &self.cipher
    }

    pub fn stats(&self) -> TrafficStats {
        self.stats
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    fn queue(&mut self, frame: Frame) {
        self.outbound.push_back(frame);
    }

    fn queue_all(&mut self, frames: Vec<Frame>) {
        self.outbound.extend(frames);
    }

    /// Drain the socket into the assembler; returns a close reason if the client is done
    fn fill(&mut self) -> Option<String> {
        let mut buf = [0u8; 4096];
        loop {
            match self.socket.try_read(&mut buf) {
                Ok(0) => return Some("connection closed by client".to_string()),
                Ok(n) => {
                    self.stats.bytes_in += n as u64;
                    self.assembler.push(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) => return Some(format!("read failed: {}", e)),
            }
        }
    }

    /// Next buffered frame under the cipher as it stands now
    fn next_frame(&mut self) -> Option<Result<Frame>> {
        let frame = match self.assembler.next_ciphered(&mut self.cipher)? {
            Ok(frame) => frame,
            Err(e) => {
                return Some(Err(KoreError::ProtocolViolation(format!(
                    "client {} sent a bad frame: {}",
                    self.id.get(),
                    e
                ))))
            }
        };
        self.stats.frames_in += 1;
        Some(Ok(frame))
    }
}

/// Everything a local handler may look at while answering a client
pub struct LocalContext<'a> {
    pub client: &'a mut MirroredClientSession,
    pub session: &'a SessionStateMachine,
    pub world: &'a WorldState,
    pub registry: &'a Registry,
    pub advertised: &'a Endpoint,
}

impl LocalContext<'_> {
    /// Build `name` and queue it for the client
    pub fn reply(&mut self, name: &str, fields: Fields) -> Result<()> {
        let frame = self.registry.build(name, &fields)?;
        self.client.queue(frame);
        Ok(())
    }

    fn reply_account_id(&mut self) -> Result<()> {
        let account_id = self.session.identity().account_id.get();
        self.reply("account_id", Fields::new().with("account_id", account_id))
    }
}

pub type LocalHandler = fn(&mut LocalContext<'_>, &Frame) -> Result<Disposition>;

/// Local listener for real clients
pub struct MirrorServer {
    config: MirrorConfig,
    registry: Arc<Registry>,
    hooks: SharedHooks,
    listener: TcpListener,
    advertised: Endpoint,
    clients: BTreeMap<ClientId, MirroredClientSession>,
    slots: HashMap<SlotKey, ClientId>,
    ids: IdGenerator,
    handlers: HashMap<MessageId, LocalHandler>,
}

impl MirrorServer {
    /// Bind the listener
    ///
    /// # Errors
    /// Returns a connection error if the bind address is unavailable.
    pub async fn bind(
        config: MirrorConfig,
        registry: Arc<Registry>,
        hooks: SharedHooks,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_address).await.map_err(|e| {
            KoreError::Connection(format!(
                "Failed to bind mirror to {}: {}",
                config.bind_address, e
            ))
        })?;
        let local = listener.local_addr()?;
        let ip = match local.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        let advertised = Endpoint::new(ip.to_string(), local.port());
        info!("Mirror listening on {} (advertised as {})", local, advertised);

        Ok(Self {
            config,
            registry,
            hooks,
            listener,
            advertised,
            clients: BTreeMap::new(),
            slots: HashMap::new(),
            ids: IdGenerator::new(),
            handlers: default_handlers(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Endpoint the mirror names in its fake server lists
    pub fn advertised(&self) -> &Endpoint {
        &self.advertised
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, id: ClientId) -> Option<&MirroredClientSession> {
        self.clients.get(&id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &MirroredClientSession> {
        self.clients.values()
    }

    /// Replace the local handler for `id`
    pub fn set_handler(&mut self, id: MessageId, handler: LocalHandler) {
        self.handlers.insert(id, handler);
    }

    /// Accept every connection waiting on the listener
    ///
    /// New clients get a fresh cipher with the upstream session's keys.
    pub fn accept_pending(&mut self, upstream_cipher: &MessageCipher) {
        while let Some(accepted) = self.listener.accept().now_or_never() {
            match accepted {
                Ok((socket, peer)) => self.admit(socket, peer, upstream_cipher),
                Err(e) => {
                    warn!("Mirror accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn admit(&mut self, socket: TcpStream, peer: SocketAddr, upstream_cipher: &MessageCipher) {
        let slot = match self.config.slot_policy {
            SlotPolicy::PerPeerAddress => SlotKey::Peer(peer.ip()),
            SlotPolicy::Single => SlotKey::Single,
        };
        if let Some(stale) = self.slots.get(&slot).copied() {
            self.close_client(stale, "replaced by a new connection");
        }

        if self.clients.len() >= self.config.max_clients {
            warn!(
                "Mirror connection from {} rejected: {} clients already attached",
                peer,
                self.clients.len()
            );
            return;
        }

        if let Err(e) = socket.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = ClientId(self.ids.get_available_id());
        let client = MirroredClientSession {
            id,
            peer,
            slot,
            socket,
            assembler: FrameAssembler::new(self.registry.clone(), FramingPolicy::Disconnect),
            cipher: upstream_cipher.fresh_epoch(),
            provisional: true,
            phase: ClientPhase::Connected,
            outbound: VecDeque::new(),
            write_buffer: BytesMut::with_capacity(4096),
            stats: TrafficStats::default(),
        };
        self.slots.insert(slot, id);
        self.clients.insert(id, client);
        info!("Mirror client {} connected from {}", id.get(), peer);
        self.hooks
            .lock()
            .dispatch(&HookEvent::MirrorClientAccepted { client: id, peer });
    }

    /// Read every client and route its frames
    ///
    /// Returns the frames to forward upstream, in client order.
    pub fn poll_clients(
        &mut self,
        session: &SessionStateMachine,
        world: &WorldState,
    ) -> Vec<Frame> {
        let mut forwarded = Vec::new();
        let mut closing = Vec::new();

        for (&id, client) in self.clients.iter_mut() {
            let closed = client.fill();

            // One frame at a time: a handler may switch the client's cipher
            // on before the next identifier is deciphered
            while let Some(next) = client.next_frame() {
                let frame = match next {
                    Ok(frame) => frame,
                    Err(e) => {
                        closing.push((id, e.to_string()));
                        break;
                    }
                };

                let disposition = match self.handlers.get(&frame.id) {
                    Some(handler) => {
                        let mut ctx = LocalContext {
                            client: &mut *client,
                            session,
                            world,
                            registry: &self.registry,
                            advertised: &self.advertised,
                        };
                        handler(&mut ctx, &frame)
                    }
                    None => Ok(Disposition::Forward),
                };

                match disposition {
                    Ok(Disposition::Answered) => {
                        trace!("Client {} {} answered locally", id.get(), frame.id);
                    }
                    Ok(Disposition::Forward) => {
                        if client.provisional && self.registry.requires_character(frame.id) {
                            debug!(
                                "Dropping {} from provisional client {}",
                                frame.id,
                                id.get()
                            );
                        } else if !client.is_in_map() || session.stage() != Stage::InGame {
                            debug!(
                                "Dropping {} from client {}: not in game",
                                frame.id,
                                id.get()
                            );
                        } else {
                            forwarded.push(frame);
                        }
                    }
                    Err(e) => {
                        closing.push((id, format!("handling {}: {}", frame.id, e)));
                        break;
                    }
                }
            }

            if let Some(reason) = closed {
                closing.push((id, reason));
            }
        }

        for (id, reason) in closing {
            self.close_client(id, &reason);
        }
        forwarded
    }

    /// React to what the upstream session just did
    pub fn on_session_event(&mut self, event: &SessionEvent, world: &WorldState) {
        match event {
            SessionEvent::Frame {
                frame,
                stage: Stage::InGame,
            } => {
                if RELAY_EXCLUDED.contains(&frame.id) {
                    return;
                }
                for client in self.clients.values_mut() {
                    if client.provisional || !client.is_in_map() {
                        continue;
                    }
                    if Some(frame.id) == client.cipher.legacy_trigger() && frame.payload.len() >= 8 {
                        let mut params = &frame.payload[..8];
                        let seed = params.get_u32_le();
                        let key2 = params.get_u32_le();
                        client.cipher.reseed(seed, key2);
                    }
                    client.queue(frame.clone());
                }
            }
            SessionEvent::Milestone(Milestone::MapLoaded { .. }) => {
                if self.config.auto_bind {
                    for client in self.clients.values_mut() {
                        if client.provisional && client.is_in_map() {
                            info!("Binding in-map client {}", client.id.get());
                            client.provisional = false;
                        }
                    }
                }
                self.send_snapshots(world);
            }
            SessionEvent::Disconnected { reason, .. } => {
                self.broadcast_status(&format!("Upstream disconnected: {}", reason));
                self.flush();
                if self.config.hold_on_disconnect {
                    for client in self.clients.values_mut() {
                        client.provisional = true;
                    }
                } else {
                    self.close_all("upstream disconnected");
                }
            }
            _ => {}
        }
    }

    fn send_snapshots(&mut self, world: &WorldState) {
        let live = match world.snapshot() {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Cannot synthesize snapshot: {}", e);
                return;
            }
        };
        let placeholder = world.placeholder_snapshot().unwrap_or_default();

        for client in self.clients.values_mut() {
            if !client.is_in_map() {
                continue;
            }
            if client.provisional {
                client.queue_all(placeholder.clone());
            } else {
                client.queue_all(live.clone());
            }
        }
    }

    /// Send a system message to every client
    pub fn broadcast_status(&mut self, text: &str) {
        let frame = match self
            .registry
            .build("system_chat", &Fields::new().with("message", text))
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot build status message: {}", e);
                return;
            }
        };
        for client in self.clients.values_mut() {
            client.queue(frame.clone());
        }
    }

    /// Queue a frame for one client
    pub fn send_to(&mut self, id: ClientId, frame: Frame) -> Result<()> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or_else(|| KoreError::NotFound(format!("mirror client {}", id.get())))?;
        client.queue(frame);
        Ok(())
    }

    /// Bind a client to the live character
    pub fn bind_client(&mut self, id: ClientId) -> Result<()> {
        self.set_provisional(id, false)
    }

    pub fn set_provisional(&mut self, id: ClientId, provisional: bool) -> Result<()> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or_else(|| KoreError::NotFound(format!("mirror client {}", id.get())))?;
        client.provisional = provisional;
        debug!("Client {} provisional={}", id.get(), provisional);
        Ok(())
    }

    /// Disconnect a client; returns whether it existed
    pub fn kick(&mut self, id: ClientId) -> bool {
        self.close_client(id, "kicked")
    }

    /// Write queued frames to every client
    pub fn flush(&mut self) {
        let mut closing = Vec::new();

        for (&id, client) in self.clients.iter_mut() {
            while let Some(frame) = client.outbound.pop_front() {
                let sent = self.hooks.lock().before_send(Direction::Client(id), frame);
                let Some(frame) = sent else {
                    continue;
                };
                frame.write_to(&mut client.write_buffer, frame.id);
                client.stats.frames_out += 1;
            }

            while !client.write_buffer.is_empty() {
                match client.socket.try_write(&client.write_buffer) {
                    Ok(0) => {
                        closing.push((id, "client socket accepted no bytes".to_string()));
                        break;
                    }
                    Ok(n) => {
                        client.write_buffer.advance(n);
                        client.stats.bytes_out += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        closing.push((id, format!("write failed: {}", e)));
                        break;
                    }
                }
            }
        }

        for (id, reason) in closing {
            self.close_client(id, &reason);
        }
    }

    /// Flush and close every client
    pub fn shutdown(&mut self) {
        self.flush();
        self.close_all("mirror shutting down");
    }

    fn close_all(&mut self, reason: &str) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.close_client(id, reason);
        }
    }

    fn close_client(&mut self, id: ClientId, reason: &str) -> bool {
        let Some(client) = self.clients.remove(&id) else {
            return false;
        };
        if self.slots.get(&client.slot) == Some(&id) {
            self.slots.remove(&client.slot);
        }
        self.ids.release(id.get());
        info!("Mirror client {} ({}) closed: {}", id.get(), client.peer, reason);
        self.hooks
            .lock()
            .dispatch(&HookEvent::MirrorClientClosed { client: id, reason });
        true
    }
}

fn default_handlers() -> HashMap<MessageId, LocalHandler> {
    let mut handlers: HashMap<MessageId, LocalHandler> = HashMap::new();
    handlers.insert(ids::MASTER_LOGIN, answer_master_login);
    handlers.insert(ids::GAME_LOGIN, answer_game_login);
    handlers.insert(ids::CHAR_SELECT, answer_char_select);
    handlers.insert(ids::MAP_LOGIN, answer_map_login);
    handlers.insert(ids::MAP_LOADED_ACK, client_in_map);
    handlers.insert(ids::SYNC, swallow);
    handlers.insert(ids::BAN_CHECK, swallow);
    handlers.insert(ids::GAMEGUARD_REPLY, swallow);
    handlers.insert(ids::GAMEGUARD_GRANT_REQUEST, answer_challenge);
    handlers.insert(ids::GUILD_CHECK, answer_guild_check);
    handlers.insert(ids::GUILD_INFO_REQUEST, answer_guild_info);
    handlers
}

fn swallow(_: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    Ok(Disposition::Answered)
}

fn answer_challenge(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    ctx.reply("gameguard_grant", Fields::new().with("verdict", 1u8))?;
    Ok(Disposition::Answered)
}

fn answer_master_login(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    let identity = ctx.session.identity();
    let server = Fields::new()
        .with("ip", ctx.advertised.wire_ip())
        .with("port", ctx.advertised.port)
        .with("name", MIRROR_NAME);
    let fields = Fields::new()
        .with("session_id", identity.tokens.session_id)
        .with("account_id", identity.account_id.get())
        .with("session_id2", identity.tokens.session_id2)
        .with("sex", identity.sex.as_u8())
        .with("servers", vec![server]);
    ctx.reply("account_server_info", fields)?;
    ctx.client.phase = ClientPhase::MasterLoggedIn;
    Ok(Disposition::Answered)
}

fn answer_game_login(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    let identity = ctx.session.identity();
    let character = identity.character().cloned().unwrap_or(CharacterEntry {
        char_id: identity.char_id,
        name: Bytes::from_static(MIRROR_NAME.as_bytes()),
        base_level: 1,
        job: 0,
        slot: 0,
    });
    let record = Fields::new()
        .with("char_id", character.char_id.get())
        .with("name", FieldValue::Text(character.name))
        .with("base_level", character.base_level)
        .with("job", character.job)
        .with("slot", character.slot);

    ctx.reply_account_id()?;
    ctx.reply("received_characters", Fields::new().with("characters", vec![record]))?;
    ctx.client.phase = ClientPhase::GameLoggedIn;
    Ok(Disposition::Answered)
}

fn answer_char_select(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    let identity = ctx.session.identity();
    let fields = Fields::new()
        .with("char_id", identity.char_id.get())
        .with("map", FieldValue::Text(identity.map.clone()))
        .with("map_ip", ctx.advertised.wire_ip())
        .with("map_port", ctx.advertised.port);
    ctx.reply("received_character_id_and_map", fields)?;
    ctx.client.phase = ClientPhase::CharSelected;
    Ok(Disposition::Answered)
}

fn answer_map_login(ctx: &mut LocalContext<'_>, frame: &Frame) -> Result<Disposition> {
    let tick = ctx
        .registry
        .extract(frame)
        .and_then(|fields| fields.int("tick"))
        .unwrap_or(0);
    let identity = ctx.session.identity();
    let fields = Fields::new()
        .with("tick", tick)
        .with("x", identity.x)
        .with("y", identity.y)
        .with("dir", identity.dir);

    ctx.reply_account_id()?;
    ctx.reply("map_loaded", fields)?;
    // The client obfuscates everything after the map login
    ctx.client.cipher.activate();
    ctx.client.phase = ClientPhase::MapLogin;
    Ok(Disposition::Answered)
}

fn client_in_map(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    ctx.client.phase = ClientPhase::InMap;
    let snapshot = if ctx.session.stage() == Stage::InGame {
        info!("Client {} in map; binding to the live character", ctx.client.id.get());
        ctx.client.provisional = false;
        ctx.world.snapshot()?
    } else {
        info!("Client {} in map while upstream is offline", ctx.client.id.get());
        ctx.world.placeholder_snapshot()?
    };
    ctx.client.queue_all(snapshot);
    Ok(Disposition::Answered)
}

fn answer_guild_check(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    match ctx.world.guild_membership_frame() {
        Some(frame) => {
            ctx.client.queue(frame?);
            Ok(Disposition::Answered)
        }
        None => Ok(Disposition::Forward),
    }
}

fn answer_guild_info(ctx: &mut LocalContext<'_>, _: &Frame) -> Result<Disposition> {
    match ctx.world.guild_info_frame() {
        Some(frame) => {
            ctx.client.queue(frame?);
            Ok(Disposition::Answered)
        }
        None => Ok(Disposition::Forward),
    }
}
