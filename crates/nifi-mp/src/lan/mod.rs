//! Networked transport: one instance per machine, peers connected in a full
//! mesh over QUIC.
//!
//! The host is always player 0. A joining client connects to the host, gets
//! its player ID in `ClientInit`, answers with `PlayerInfo`, and from then on
//! receives the whole player table whenever it changes. On each table update a
//! client dials every lower-numbered client it is not yet connected to;
//! higher-numbered clients dial it.
//!
//! Nothing here runs on its own schedule except the network tasks. Session
//! state only moves when the emulator thread calls [`MpTransport::process`]
//! or one of the receive functions, which drain the tasks' events.
//!
//! The blocking API must be called from plain threads, never from inside an
//! async runtime.

mod conn;
mod framing;
mod players;

pub use players::PlayerTable;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use nifi_proto::constants::{MAX_PLAYERS, MAX_RECV_PAYLOAD, REPLY_SLOT_SIZE, SESSION_NAME_LEN};
use nifi_proto::control::ControlMessage;
use nifi_proto::discovery::{DiscoveryBeacon, STATUS_IDLE, STATUS_PLAYING};
use nifi_proto::header::{PacketHeader, PacketKind, decode_packet};
use parking_lot::Mutex;
use quinn::{Connection, Endpoint};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::LanSettings;
use crate::discovery::{
    DiscoveryEntry, DiscoveryTable, MsClock, bind_broadcast_socket, run_advertiser, run_browser,
};
use crate::error::{LanError, MpError};
use crate::events::{EventHub, LanEvent};
use crate::membership::{ConnectedMask, InstanceId};
use crate::replies::{ReplyCollector, is_stale, reply_slot};
use crate::transport::{HostRecv, MpTransport, Received};

use conn::{
    CLOSE_NORMAL, CLOSE_PROTOCOL, CLOSE_REFUSED, CLOSE_SESSION_FULL, NetEvent, OutboundTx, PeerKey,
};

/// Ping values are refreshed every this many `process()` calls.
const PING_REFRESH_FRAMES: u32 = 60;

/// How much of the event stream a network poll services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Per-frame housekeeping: handle everything pending, never block.
    Idle,
    /// Looking for a regular frame without blocking.
    Misc,
    /// Waiting up to the receive timeout for a gameplay frame.
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Host,
    Client,
}

#[derive(Debug)]
struct PeerEntry {
    conn: Connection,
    outbound: OutboundTx,
    /// Player behind this connection, once known.
    player: Option<u8>,
    since: Instant,
}

#[derive(Debug)]
struct RxPacket {
    header: PacketHeader,
    payload: Bytes,
    peer: PeerKey,
    received: Instant,
}

struct Session {
    role: Role,
    handle: Handle,
    endpoint: Endpoint,
    net_tx: Sender<NetEvent>,
    net_rx: Receiver<NetEvent>,
    tasks: Vec<JoinHandle<()>>,
    /// What the host advertises on the discovery port.
    advert: Option<Arc<Mutex<DiscoveryBeacon>>>,
    peers: HashMap<PeerKey, PeerEntry>,
    remote_peers: [Option<PeerKey>; MAX_PLAYERS],
    /// Players we are currently dialing.
    dialing: u16,
    my_id: u8,
    connected: ConnectedMask,
    /// Player that sent the last CMD frame, and its connection.
    last_host: Option<(u8, PeerKey)>,
    rx_queue: VecDeque<RxPacket>,
    frame_count: u32,
}

impl Session {
    fn player_bit(id: u8) -> Option<InstanceId> {
        InstanceId::new(id as usize)
    }

    fn is_connected(&self, id: u8) -> bool {
        Self::player_bit(id).is_some_and(|i| self.connected.contains(i))
    }

    fn register(&mut self, key: PeerKey, conn: Connection, outbound: OutboundTx, player: Option<u8>) {
        if let Some(id) = player {
            self.remote_peers[id as usize] = Some(key);
        }
        self.peers.insert(
            key,
            PeerEntry {
                conn,
                outbound,
                player,
                since: Instant::now(),
            },
        );
    }

    fn broadcast_control(&self, msg: &ControlMessage) {
        let data = msg.encode();
        for peer in self.peers.values().filter(|p| p.player.is_some()) {
            conn::send_control(&peer.outbound, &data);
        }
    }

    fn shutdown(&mut self) {
        for peer in self.peers.values() {
            conn::close(&peer.conn, CLOSE_NORMAL, "session ended");
        }
        self.endpoint.close(quinn::VarInt::from_u32(CLOSE_NORMAL), b"session ended");
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct LanTransport {
    settings: LanSettings,
    runtime: Runtime,
    session: Mutex<Option<Session>>,
    players: Arc<Mutex<PlayerTable>>,
    discovery: Arc<Mutex<DiscoveryTable>>,
    browser: Mutex<Option<JoinHandle<()>>>,
    clock: MsClock,
    hub: Arc<EventHub>,
}

impl LanTransport {
    pub fn new(settings: LanSettings) -> Result<Self, LanError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("nifi-lan")
            .enable_all()
            .build()?;

        Ok(Self {
            discovery: Arc::new(Mutex::new(DiscoveryTable::new(settings.discovery_stale_ms))),
            settings,
            runtime,
            session: Mutex::new(None),
            players: Arc::new(Mutex::new(PlayerTable::new())),
            browser: Mutex::new(None),
            clock: MsClock::new(),
            hub: Arc::new(EventHub::new()),
        })
    }

    pub fn settings(&self) -> &LanSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> Receiver<LanEvent> {
        self.hub.subscribe()
    }

    /// Start listening for session beacons.
    pub fn start_discovery(&self) -> Result<(), LanError> {
        let mut browser = self.browser.lock();
        if browser.is_some() {
            return Ok(());
        }

        let socket = self.runtime.block_on(bind_broadcast_socket(
            self.settings.bind_addr,
            self.settings.discovery_port,
        ))?;
        self.discovery.lock().clear();

        info!(port = self.settings.discovery_port, "LAN discovery started");
        *browser = Some(self.runtime.spawn(run_browser(
            socket,
            self.discovery.clone(),
            self.clock,
            self.settings.protocol_version,
            self.settings.discovery_interval(),
            self.hub.clone(),
        )));
        Ok(())
    }

    pub fn end_discovery(&self) {
        if let Some(task) = self.browser.lock().take() {
            task.abort();
            info!("LAN discovery stopped");
        }
    }

    pub fn discovery_list(&self) -> BTreeMap<Ipv4Addr, DiscoveryEntry> {
        self.discovery.lock().snapshot()
    }

    pub fn is_active(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn is_host(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.role == Role::Host)
    }

    /// Players for display, addresses fixed up for the local view.
    pub fn player_list(&self) -> Vec<nifi_proto::control::PlayerRecord> {
        self.players.lock().snapshot()
    }

    pub fn num_players(&self) -> u8 {
        self.players.lock().num_players()
    }

    pub fn max_players(&self) -> u8 {
        self.players.lock().max_players()
    }

    pub fn my_id(&self) -> Option<u8> {
        self.session.lock().as_ref().map(|s| s.my_id)
    }

    /// Instances currently taking part in the lockstep exchange.
    pub fn connected_mask(&self) -> ConnectedMask {
        self.session
            .lock()
            .as_ref()
            .map_or(ConnectedMask::EMPTY, |s| s.connected)
    }

    /// Address of the session endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.endpoint.local_addr().ok())
    }

    fn new_session(&self, role: Role, port: u16) -> Result<Session, LanError> {
        let handle = self.runtime.handle().clone();
        let bind = SocketAddr::from((self.settings.bind_addr, port));
        let endpoint = conn::build_endpoint(&handle, bind)?;
        let (net_tx, net_rx) = crossbeam_channel::unbounded();
        let accept = handle.spawn(conn::run_accept_loop(endpoint.clone(), net_tx.clone()));

        Ok(Session {
            role,
            handle,
            endpoint,
            net_tx,
            net_rx,
            tasks: vec![accept],
            advert: None,
            peers: HashMap::new(),
            remote_peers: [None; MAX_PLAYERS],
            dialing: 0,
            my_id: 0,
            connected: ConnectedMask::EMPTY,
            last_host: None,
            rx_queue: VecDeque::new(),
            frame_count: 0,
        })
    }

    /// Host a session for up to `max_players` players (including us) and
    /// start advertising it.
    pub fn start_host(&self, name: &str, max_players: usize) -> Result<(), LanError> {
        if !(1..=MAX_PLAYERS).contains(&max_players) {
            return Err(LanError::InvalidPlayerCount(max_players));
        }
        let mut guard = self.session.lock();
        if guard.is_some() {
            return Err(LanError::AlreadyActive);
        }

        let mut session = self.new_session(Role::Host, self.settings.game_port)?;
        let port = session
            .endpoint
            .local_addr()
            .map_err(|e| LanError::Endpoint(e.to_string()))?
            .port();
        self.players.lock().start_host(name, max_players as u8, port);

        let advert = Arc::new(Mutex::new(DiscoveryBeacon {
            version: self.settings.protocol_version,
            tick: 0,
            session_name: session_name(name),
            num_players: 1,
            max_players: max_players as u8,
            status: STATUS_IDLE,
        }));
        match self.spawn_advertiser(&session, advert.clone()) {
            Ok(task) => {
                session.tasks.push(task);
                session.advert = Some(advert);
            }
            Err(e) => {
                session.shutdown();
                self.players.lock().clear();
                return Err(e);
            }
        }

        info!(%port, max_players, "LAN session hosted");
        *guard = Some(session);
        drop(guard);
        self.hub.emit(LanEvent::PlayerListChanged);
        Ok(())
    }

    fn spawn_advertiser(
        &self,
        session: &Session,
        advert: Arc<Mutex<DiscoveryBeacon>>,
    ) -> Result<JoinHandle<()>, LanError> {
        let socket = self
            .runtime
            .block_on(bind_broadcast_socket(self.settings.bind_addr, 0))?;
        let target = SocketAddr::from((self.settings.broadcast_addr, self.settings.discovery_port));
        Ok(session.handle.spawn(run_advertiser(
            socket,
            target,
            advert,
            self.clock,
            self.settings.discovery_interval(),
        )))
    }

    /// Join the session hosted at `host` (`"addr"` or `"addr:port"`). Blocks
    /// until the host assigned us an ID or the connect timeout expires.
    pub fn start_client(&self, name: &str, host: &str) -> Result<(), LanError> {
        let host_addr = resolve_host(host, self.settings.game_port)?;
        let SocketAddr::V4(host_v4) = host_addr else {
            return Err(LanError::BadAddress(host.to_string()));
        };

        let mut guard = self.session.lock();
        if guard.is_some() {
            return Err(LanError::AlreadyActive);
        }

        let mut session = self.new_session(Role::Client, self.settings.client_port)?;
        self.players.lock().start_client(name, *host_v4.ip());

        info!(host = %host_addr, "connecting to LAN host");
        conn::dial(
            &session.handle,
            &session.endpoint,
            host_addr,
            Some(0),
            self.settings.connect_timeout(),
            session.net_tx.clone(),
        );

        if let Err(e) = self.client_handshake(&mut session) {
            warn!(host = %host_addr, error = %e, "failed to join LAN session");
            session.shutdown();
            self.players.lock().clear();
            return Err(e);
        }

        info!(host = %host_addr, player_id = session.my_id, "joined LAN session");
        *guard = Some(session);
        drop(guard);
        self.hub.emit(LanEvent::PlayerListChanged);
        Ok(())
    }

    fn client_handshake(&self, s: &mut Session) -> Result<(), LanError> {
        let ours = self.settings.protocol_version;
        let deadline = Instant::now() + self.settings.connect_timeout();
        let mut host_key = None;

        loop {
            let event = s
                .net_rx
                .recv_deadline(deadline)
                .map_err(|_| LanError::Timeout)?;

            match event {
                NetEvent::Connected {
                    key,
                    conn,
                    outbound,
                    dialed: Some(0),
                } => {
                    host_key = Some(key);
                    s.register(key, conn, outbound, Some(0));
                }
                NetEvent::Connected { conn, .. } => {
                    conn::close(&conn, CLOSE_REFUSED, "not in a session yet");
                }
                NetEvent::ConnectFailed { reason, .. } => {
                    return Err(LanError::ConnectionFailed(reason));
                }
                NetEvent::Disconnected { key, code, reason } if Some(key) == host_key => {
                    return Err(match code {
                        Some(c) if c == CLOSE_SESSION_FULL as u64 => LanError::SessionFull,
                        Some(c) if c == CLOSE_PROTOCOL as u64 || c == CLOSE_REFUSED as u64 => {
                            LanError::Refused
                        }
                        _ => LanError::ConnectionFailed(reason),
                    });
                }
                NetEvent::Control { key, data } if Some(key) == host_key => {
                    let msg = match ControlMessage::decode(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(error = %e, "ignoring malformed control message");
                            continue;
                        }
                    };
                    let ControlMessage::ClientInit {
                        version,
                        assigned_id,
                        max_players,
                    } = msg
                    else {
                        debug!(opcode = ?msg.opcode(), "ignoring control message before init");
                        continue;
                    };

                    let host = s.peers.get(&key).ok_or(LanError::Refused)?;
                    if version != ours {
                        conn::close(&host.conn, CLOSE_PROTOCOL, "protocol version mismatch");
                        return Err(LanError::VersionMismatch {
                            ours,
                            theirs: version,
                        });
                    }
                    if max_players as usize > MAX_PLAYERS || assigned_id == 0 || assigned_id >= max_players {
                        conn::close(&host.conn, CLOSE_PROTOCOL, "bad client init");
                        return Err(LanError::Refused);
                    }

                    let mut me = self.players.lock().accept_init(assigned_id, max_players);
                    me.port = s.endpoint.local_addr().map(|a| a.port()).unwrap_or(0);
                    conn::send_control(
                        &host.outbound,
                        &ControlMessage::PlayerInfo {
                            version: ours,
                            player: me,
                        }
                        .encode(),
                    );
                    s.my_id = assigned_id;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Leave the current session, hosted or joined.
    pub fn end_session(&self) {
        let Some(mut session) = self.session.lock().take() else {
            return;
        };

        if session.is_connected(session.my_id) {
            session.broadcast_control(&ControlMessage::PlayerDisconnect);
        }
        session.shutdown();
        let endpoint = session.endpoint.clone();
        let _ = self.runtime.block_on(async move {
            tokio::time::timeout(Duration::from_millis(250), endpoint.wait_idle()).await
        });

        self.players.lock().clear();
        info!("LAN session ended");
        self.hub.emit(LanEvent::PlayerListChanged);
    }

    /// Service the event stream. See [`PollMode`].
    ///
    /// The session lock is only taken to look at the queue and to apply each
    /// event; waiting for the next event happens without it.
    pub fn poll_network(&self, mode: PollMode) {
        let net_rx = {
            let mut guard = self.session.lock();
            let Some(s) = guard.as_mut() else {
                return;
            };
            if self.frame_pending(s, mode) {
                return;
            }
            s.net_rx.clone()
        };

        let deadline = Instant::now() + self.settings.mp.recv_timeout();
        loop {
            let event = match mode {
                PollMode::Frame => net_rx.recv_deadline(deadline).ok(),
                PollMode::Misc | PollMode::Idle => net_rx.try_recv().ok(),
            };
            let Some(event) = event else {
                return;
            };

            let mut guard = self.session.lock();
            // The session ended (or was replaced) while we waited.
            let Some(s) = guard.as_mut().filter(|s| s.net_rx.same_channel(&net_rx)) else {
                return;
            };
            match event {
                // One frame per poll; draining further would consume frames
                // the caller is not ready for.
                NetEvent::Mp { key, data } => {
                    if self.enqueue_mp(s, key, data) {
                        return;
                    }
                }
                event => self.handle_event(s, event),
            }
        }
    }

    /// Age out old frames, then report whether the queue already holds what
    /// `mode` is looking for.
    fn frame_pending(&self, s: &mut Session, mode: PollMode) -> bool {
        let lifetime = self.settings.rx_lifetime();
        while let Some(front) = s.rx_queue.front() {
            if front.received.elapsed() > lifetime {
                s.rx_queue.pop_front();
                continue;
            }
            match mode {
                PollMode::Frame => return true,
                PollMode::Misc => {
                    if front.header.kind == PacketKind::Data {
                        return true;
                    }
                    // Lockstep frame nobody is blocking on anymore.
                    s.rx_queue.pop_front();
                }
                PollMode::Idle => {}
            }
            break;
        }
        false
    }

    /// Queue a gameplay frame. Returns false if it was dropped.
    fn enqueue_mp(&self, s: &mut Session, key: PeerKey, data: Bytes) -> bool {
        let (header, payload_len) = match decode_packet(&data) {
            Ok((header, payload)) => (header, payload.len()),
            Err(e) => {
                trace!(key, error = %e, "dropping malformed MP frame");
                return false;
            }
        };
        if header.sender_id == s.my_id as u32 {
            return false;
        }

        s.rx_queue.push_back(RxPacket {
            header,
            payload: data.slice(PacketHeader::LEN..PacketHeader::LEN + payload_len),
            peer: key,
            received: Instant::now(),
        });
        true
    }

    fn handle_event(&self, s: &mut Session, event: NetEvent) {
        match s.role {
            Role::Host => self.handle_host_event(s, event),
            Role::Client => self.handle_client_event(s, event),
        }
    }

    fn handle_host_event(&self, s: &mut Session, event: NetEvent) {
        match event {
            NetEvent::Connected {
                key,
                conn,
                outbound,
                dialed,
            } => {
                let addr = conn.remote_address();
                let SocketAddr::V4(v4) = addr else {
                    conn::close(&conn, CLOSE_REFUSED, "IPv4 only");
                    return;
                };
                if dialed.is_some() {
                    conn::close(&conn, CLOSE_NORMAL, "unexpected");
                    return;
                }

                let assigned = self.players.lock().assign_slot(v4);
                match assigned {
                    Ok(id) => {
                        let init = ControlMessage::ClientInit {
                            version: self.settings.protocol_version,
                            assigned_id: id,
                            max_players: self.players.lock().max_players(),
                        };
                        conn::send_control(&outbound, &init.encode());
                        s.register(key, conn, outbound, Some(id));
                        info!(%addr, player_id = id, "client connecting");
                        self.refresh_advert(s);
                        self.hub.emit(LanEvent::PlayerListChanged);
                    }
                    Err(e) => {
                        info!(%addr, error = %e, "refusing client");
                        conn::close(&conn, CLOSE_SESSION_FULL, "session full");
                    }
                }
            }
            NetEvent::Control { key, data } => {
                let Some(id) = s.peers.get(&key).and_then(|p| p.player) else {
                    return;
                };
                match ControlMessage::decode(&data) {
                    Ok(ControlMessage::PlayerInfo { version, player }) => {
                        let admitted = self.players.lock().admit(
                            id,
                            version,
                            self.settings.protocol_version,
                            &player,
                        );
                        match admitted {
                            Ok(()) => {
                                info!(player_id = id, name = %player.name, "player joined");
                                self.broadcast_player_list(s);
                                self.hub.emit(LanEvent::PlayerListChanged);
                            }
                            Err(e) => {
                                warn!(player_id = id, error = %e, "rejecting player");
                                if let Some(peer) = s.peers.get(&key) {
                                    conn::close(&peer.conn, CLOSE_PROTOCOL, "protocol mismatch");
                                }
                            }
                        }
                    }
                    Ok(msg) => Self::handle_membership(s, id, &msg),
                    Err(e) => debug!(player_id = id, error = %e, "ignoring malformed control message"),
                }
            }
            NetEvent::Disconnected { key, reason, .. } => {
                let Some(peer) = s.peers.remove(&key) else {
                    return;
                };
                let Some(id) = peer.player else {
                    return;
                };
                Self::forget_player(s, id);
                self.players.lock().remove(id);
                info!(player_id = id, %reason, "player left");
                self.broadcast_player_list(s);
                self.refresh_advert(s);
                self.hub.emit(LanEvent::PlayerListChanged);
            }
            NetEvent::ConnectFailed { addr, reason, .. } => {
                debug!(%addr, %reason, "connect failed");
            }
            NetEvent::Mp { .. } => {}
        }
    }

    fn handle_client_event(&self, s: &mut Session, event: NetEvent) {
        match event {
            NetEvent::Connected {
                key,
                conn,
                outbound,
                dialed: Some(id),
            } => {
                s.dialing &= !(1u16 << id);
                if s.remote_peers[id as usize].is_some() {
                    debug!(player_id = id, "already connected, dropping duplicate");
                    conn::close(&conn, CLOSE_NORMAL, "duplicate");
                    return;
                }
                info!(player_id = id, peer = %conn.remote_address(), "connected to peer");
                s.register(key, conn, outbound, Some(id));
            }
            NetEvent::Connected {
                key,
                conn,
                outbound,
                dialed: None,
            } => {
                let addr = conn.remote_address();
                let matched = self
                    .players
                    .lock()
                    .find_client(addr)
                    .filter(|id| s.remote_peers[*id as usize].is_none());
                match matched {
                    Some(id) => info!(player_id = id, peer = %addr, "peer connected to us"),
                    None => debug!(peer = %addr, "holding unmatched incoming connection"),
                }
                s.register(key, conn, outbound, matched);
            }
            NetEvent::ConnectFailed {
                dialed,
                addr,
                reason,
            } => {
                if let Some(id) = dialed {
                    s.dialing &= !(1u16 << id);
                }
                warn!(?dialed, %addr, %reason, "failed to connect to peer");
            }
            NetEvent::Disconnected { key, code, reason } => {
                let Some(peer) = s.peers.remove(&key) else {
                    return;
                };
                let Some(id) = peer.player else {
                    return;
                };
                Self::forget_player(s, id);
                self.players.lock().mark_disconnected(id);
                info!(player_id = id, ?code, %reason, "peer disconnected");
                self.hub.emit(LanEvent::PlayerListChanged);
                if id == 0 {
                    self.hub.emit(LanEvent::Disconnected {
                        reason: format!("host left: {reason}"),
                    });
                }
            }
            NetEvent::Control { key, data } => {
                let Some(id) = s.peers.get(&key).and_then(|p| p.player) else {
                    return;
                };
                match ControlMessage::decode(&data) {
                    Ok(ControlMessage::PlayerList {
                        num_players,
                        players,
                    }) if id == 0 => {
                        self.players.lock().apply_list(num_players, &players);
                        self.match_unassigned(s);
                        self.dial_new_clients(s);
                        self.hub.emit(LanEvent::PlayerListChanged);
                    }
                    Ok(msg) => Self::handle_membership(s, id, &msg),
                    Err(e) => debug!(player_id = id, error = %e, "ignoring malformed control message"),
                }
            }
            NetEvent::Mp { .. } => {}
        }
    }

    fn handle_membership(s: &mut Session, id: u8, msg: &ControlMessage) {
        let Some(inst) = Session::player_bit(id) else {
            return;
        };
        match msg {
            ControlMessage::PlayerConnect => {
                s.connected.insert(inst);
                debug!(player_id = id, connected = s.connected.bits(), "player entered exchange");
            }
            ControlMessage::PlayerDisconnect => {
                s.connected.remove(inst);
                debug!(player_id = id, connected = s.connected.bits(), "player left exchange");
            }
            other => debug!(player_id = id, opcode = ?other.opcode(), "ignoring control message"),
        }
    }

    fn forget_player(s: &mut Session, id: u8) {
        if let Some(inst) = Session::player_bit(id) {
            s.connected.remove(inst);
        }
        s.remote_peers[id as usize] = None;
    }

    /// Give held incoming connections a player, now that the table changed.
    fn match_unassigned(&self, s: &mut Session) {
        let players = self.players.lock();
        let mut taken = s.remote_peers;
        for (key, peer) in s.peers.iter_mut().filter(|(_, p)| p.player.is_none()) {
            let Some(id) = players
                .find_client(peer.conn.remote_address())
                .filter(|id| taken[*id as usize].is_none())
            else {
                continue;
            };
            info!(player_id = id, peer = %peer.conn.remote_address(), "peer connected to us");
            peer.player = Some(id);
            taken[id as usize] = Some(*key);
        }
        s.remote_peers = taken;
    }

    fn dial_new_clients(&self, s: &mut Session) {
        let targets = self.players.lock().clients_to_dial();
        for (id, addr) in targets {
            let bit = 1u16 << id;
            if s.remote_peers[id as usize].is_some() || s.dialing & bit != 0 {
                continue;
            }
            info!(player_id = id, peer = %addr, "connecting to peer");
            s.dialing |= bit;
            conn::dial(
                &s.handle,
                &s.endpoint,
                addr,
                Some(id),
                self.settings.connect_timeout(),
                s.net_tx.clone(),
            );
        }
    }

    fn broadcast_player_list(&self, s: &Session) {
        let msg = self.players.lock().list_message();
        s.broadcast_control(&msg);
    }

    fn refresh_advert(&self, s: &Session) {
        if let Some(advert) = &s.advert {
            let num_players = self.players.lock().num_players();
            advert.lock().num_players = num_players;
        }
    }

    fn set_advert_status(s: &Session, status: u8) {
        if let Some(advert) = &s.advert {
            advert.lock().status = status;
        }
    }

    /// Drop incoming connections nobody claimed within the connect timeout.
    fn prune_unassigned(&self, s: &mut Session) {
        let timeout = self.settings.connect_timeout();
        s.peers.retain(|_, peer| {
            let keep = peer.player.is_some() || peer.since.elapsed() < timeout;
            if !keep {
                debug!(peer = %peer.conn.remote_address(), "dropping unmatched connection");
                conn::close(&peer.conn, CLOSE_REFUSED, "unknown peer");
            }
            keep
        });
    }

    fn refresh_pings(&self, s: &Session) {
        let mut players = self.players.lock();
        for peer in s.peers.values() {
            if let Some(id) = peer.player {
                players.set_ping(id, peer.conn.rtt().as_millis() as u32);
            }
        }
    }

    fn send_generic(&self, kind: PacketKind, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        let max = self.settings.mp.max_frame_size;
        if data.len() > max {
            warn!(len = data.len(), max, "attempting to send frame too big");
            return Err(MpError::FrameTooLarge {
                len: data.len(),
                max,
            });
        }

        let guard = self.session.lock();
        let s = guard.as_ref().ok_or(MpError::NotActive)?;

        let header = PacketHeader::new(s.my_id as u32, kind, data.len() as u32, timestamp);
        let packet = Bytes::from(header.encode_packet(data));

        let host = match kind {
            PacketKind::Reply { .. } => s.last_host.and_then(|(_, key)| s.peers.get(&key)),
            _ => None,
        };
        match host {
            Some(peer) => conn::send_mp(&s.handle, &peer.conn, packet),
            None => {
                for peer in s.peers.values().filter(|p| p.player.is_some()) {
                    conn::send_mp(&s.handle, &peer.conn, packet.clone());
                }
            }
        }
        Ok(data.len())
    }

    fn recv_generic(&self, buf: &mut [u8], block: bool) -> Option<Received> {
        self.poll_network(if block { PollMode::Frame } else { PollMode::Misc });

        let mut guard = self.session.lock();
        let s = guard.as_mut()?;
        let packet = s.rx_queue.pop_front()?;

        let len = packet.payload.len().min(MAX_RECV_PAYLOAD).min(buf.len());
        buf[..len].copy_from_slice(&packet.payload[..len]);
        if packet.header.kind == PacketKind::Command {
            s.last_host = Some((packet.header.sender_id as u8, packet.peer));
        }

        Some(Received {
            len,
            timestamp: packet.header.timestamp,
            kind: packet.header.kind,
        })
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.end_session();
        self.end_discovery();
    }
}

/// The LAN transport runs one instance per process; the `inst` argument of
/// the trait methods is ignored and our player ID stands in for it.
impl MpTransport for LanTransport {
    fn process(&self) {
        self.poll_network(PollMode::Idle);

        let mut guard = self.session.lock();
        let Some(s) = guard.as_mut() else {
            return;
        };
        self.prune_unassigned(s);

        s.frame_count += 1;
        if s.frame_count >= PING_REFRESH_FRAMES {
            s.frame_count = 0;
            self.refresh_pings(s);
        }
    }

    fn begin(&self, _inst: InstanceId) {
        let mut guard = self.session.lock();
        let Some(s) = guard.as_mut() else {
            return;
        };
        if let Some(me) = Session::player_bit(s.my_id) {
            s.connected.insert(me);
        }
        s.last_host = None;
        s.broadcast_control(&ControlMessage::PlayerConnect);
        Self::set_advert_status(s, STATUS_PLAYING);
    }

    fn end(&self, _inst: InstanceId) {
        let mut guard = self.session.lock();
        let Some(s) = guard.as_mut() else {
            return;
        };
        if let Some(me) = Session::player_bit(s.my_id) {
            s.connected.remove(me);
        }
        s.broadcast_control(&ControlMessage::PlayerDisconnect);
        Self::set_advert_status(s, STATUS_IDLE);
    }

    fn send_packet(&self, _inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        self.send_generic(PacketKind::Data, data, timestamp)
    }

    fn recv_packet(&self, _inst: InstanceId, buf: &mut [u8]) -> Option<Received> {
        self.recv_generic(buf, false)
    }

    fn send_cmd(&self, _inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        self.send_generic(PacketKind::Command, data, timestamp)
    }

    fn send_reply(
        &self,
        _inst: InstanceId,
        data: &[u8],
        timestamp: u64,
        aid: u16,
    ) -> Result<usize, MpError> {
        self.send_generic(PacketKind::Reply { aid }, data, timestamp)
    }

    fn send_ack(&self, _inst: InstanceId, data: &[u8], timestamp: u64) -> Result<usize, MpError> {
        self.send_generic(PacketKind::Ack, data, timestamp)
    }

    fn recv_host_packet(&self, _inst: InstanceId, buf: &mut [u8]) -> HostRecv {
        let host_gone = self.session.lock().as_ref().is_some_and(|s| {
            s.last_host
                .is_some_and(|(host, _)| !s.is_connected(host))
        });
        if host_gone {
            return HostRecv::HostGone;
        }

        match self.recv_generic(buf, true) {
            Some(frame) => HostRecv::Frame(frame),
            None => HostRecv::Timeout,
        }
    }

    fn recv_replies(&self, _inst: InstanceId, buf: &mut [u8], timestamp: u64, aid_mask: u16) -> u16 {
        let mut collector = {
            let guard = self.session.lock();
            let Some(s) = guard.as_ref() else {
                return 0;
            };
            let Some(me) = Session::player_bit(s.my_id) else {
                return 0;
            };
            let collector = ReplyCollector::new(me, aid_mask);
            if collector.is_alone(s.connected.bits()) {
                return 0;
            }
            collector
        };
        let window = self.settings.mp.stale_reply_window;

        loop {
            self.poll_network(PollMode::Frame);

            let mut guard = self.session.lock();
            let Some(s) = guard.as_mut() else {
                return collector.aids();
            };
            let Some(packet) = s.rx_queue.pop_front() else {
                return collector.aids();
            };

            let PacketKind::Reply { aid } = packet.header.kind else {
                continue;
            };
            if is_stale(packet.header.timestamp, timestamp, window) {
                continue;
            }

            if !packet.payload.is_empty() {
                if let Some(slot) = reply_slot(aid, buf.len()) {
                    let len = packet.payload.len().min(REPLY_SLOT_SIZE);
                    buf[slot.start..slot.start + len].copy_from_slice(&packet.payload[..len]);
                    collector.record_aid(aid);
                }
            }

            collector.record_sender(packet.header.sender_id);
            if collector.is_complete(s.connected.bits()) {
                return collector.aids();
            }
        }
    }
}

fn session_name(player: &str) -> String {
    let mut name = format!("{player}'s game");
    let mut end = name.len().min(SESSION_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
    name
}

fn resolve_host(host: &str, default_port: u16) -> Result<SocketAddr, LanError> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    (host, default_port)
        .to_socket_addrs()
        .map_err(|e| LanError::BadAddress(format!("{host}: {e}")))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| LanError::BadAddress(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_is_clamped() {
        assert_eq!(session_name("Ness"), "Ness's game");
        assert_eq!(session_name(&"x".repeat(80)).len(), SESSION_NAME_LEN - 1);
    }

    #[test]
    fn resolves_literal_and_default_port() {
        assert_eq!(
            resolve_host("10.0.0.5:9000", 7064).unwrap(),
            "10.0.0.5:9000".parse().unwrap()
        );
        assert_eq!(
            resolve_host("10.0.0.5", 7064).unwrap(),
            "10.0.0.5:7064".parse().unwrap()
        );
    }
}
