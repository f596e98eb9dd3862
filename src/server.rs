//! The UDP endpoint (§4 item 5): owns the socket, drives discovery,
//! dispatches received packets into each peer's connection state
//! machine, and arms/retires the reliability timers.
//!
//! Concurrency model grounded on
//! `hdds::transport::tcp::io_thread::IoThread`: one `mio::Poll` loop on
//! a dedicated thread, commands in via a channel + `mio::Waker`, no
//! shared mutable state with any other thread (§5).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::address::{Address, Phy};
use crate::bus::{AdapterTag, MessageQueue};
use crate::config::{BridgeSettings, DiscoveryMode, Timeouts};
use crate::connection::{Connection, ConnectionState, IncomingSeq, PendingAck};
use crate::error::{NetworkError, ProtocolError};
use crate::packet::{
    Packet, PacketBody, PacketFamily, PacketKind, PacketType, Publication, PublishBody, MTU_BUDGET,
};

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const MAX_EVENTS: usize = 128;
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(250);
const MAX_DATAGRAM: usize = 65_507;
/// header + publication_id + total_blocks + block_n + entry count, the
/// fixed overhead `PublishBody::split` budgets around each block.
const HEADER_SIZE_WITH_COUNTERS: usize = crate::packet::HEADER_SIZE + 4 + 4 + 4 + 4;

pub enum ServerCommand {
    Stop,
    InjectPublish(Vec<Publication>),
}

/// Held by the bridge adapter; the only handle into the reactor thread.
pub struct ServerHandle {
    cmd_tx: Sender<ServerCommand>,
    waker: Arc<Waker>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn inject_publish(&self, publications: Vec<Publication>) {
        let _ = self.cmd_tx.send(ServerCommand::InjectPublish(publications));
        let _ = self.waker.wake();
    }

    pub fn stop(&mut self) {
        let _ = self.cmd_tx.send(ServerCommand::Stop);
        let _ = self.waker.wake();
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Ack(PacketKind),
    Discovery,
    Heartbeat,
    Rescan,
    PublishFlush,
}

struct TimerEntry {
    deadline: Instant,
    address: Address,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

pub struct Server {
    socket: MioUdpSocket,
    poll: Poll,
    phy: Phy,
    bind_port: u16,
    send_port: u16,
    settings: BridgeSettings,
    connections: HashMap<Address, Connection>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    queue: Arc<MessageQueue>,
    tag: AdapterTag,
    cmd_rx: Receiver<ServerCommand>,
    running: Arc<AtomicBool>,
    publication_seq: u32,
    subscription_seq: u32,
    recv_buf: [u8; MAX_DATAGRAM],
    /// Publications accumulated from `inject_publish` calls, batched
    /// per §4.6 until `delay` ms elapses or MTU would be exceeded.
    pending_publications: Vec<Publication>,
    publish_flush_armed: bool,
}

/// Builds and binds the UDP socket: plain for unicast/multicast,
/// `SO_BROADCAST` + `SO_REUSEADDR` for broadcast mode, multicast group
/// joined at the configured TTL for multicast mode.
fn build_socket(phy: &Phy, bind_port: u16, mode: &DiscoveryMode) -> Result<MioUdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(NetworkError::SetupFailed)?;
    socket.set_reuse_address(true).map_err(NetworkError::SetupFailed)?;

    let bind_ip = if phy.is_any() {
        Ipv4Addr::UNSPECIFIED
    } else {
        phy.ip_addr()
    };
    let bind_addr = SocketAddrV4::new(bind_ip, bind_port);
    socket
        .bind(&bind_addr.into())
        .map_err(NetworkError::SetupFailed)?;
    socket.set_nonblocking(true).map_err(NetworkError::SetupFailed)?;

    match mode {
        DiscoveryMode::Broadcast => {
            socket.set_broadcast(true).map_err(NetworkError::SetupFailed)?;
        }
        DiscoveryMode::Multicast { group, hops, .. } => {
            let group_addr: Ipv4Addr = group
                .parse()
                .map_err(|_| NetworkError::SetupFailed(io::Error::new(ErrorKind::InvalidInput, "bad multicast group")))?;
            socket
                .join_multicast_v4(&group_addr, &bind_ip)
                .map_err(NetworkError::SetupFailed)?;
            socket
                .set_multicast_ttl_v4(u32::from(*hops))
                .map_err(NetworkError::SetupFailed)?;
            socket.set_multicast_loop_v4(true).map_err(NetworkError::SetupFailed)?;
        }
        DiscoveryMode::Unicast { .. } => {}
    }

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(MioUdpSocket::from_std(std_socket))
}

impl Server {
    pub fn new(
        phy: Phy,
        bind_port: u16,
        settings: BridgeSettings,
        queue: Arc<MessageQueue>,
        tag: AdapterTag,
    ) -> Result<(Self, ServerHandle), NetworkError> {
        let send_port = settings.send_port.unwrap_or(bind_port);
        let mut socket = build_socket(&phy, bind_port, &settings.discovery)?;

        let poll = Poll::new().map_err(NetworkError::SetupFailed)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(NetworkError::SetupFailed)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(NetworkError::SetupFailed)?);

        let (cmd_tx, cmd_rx) = channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let mut connections = HashMap::new();
        let mut timers = BinaryHeap::new();
        let heartbeat_ms = settings.timeouts.heartbeat;
        for address in initial_peers(&phy, send_port, bind_port, &settings.discovery) {
            connections.insert(address, Connection::new(address));
            timers.push(Reverse(TimerEntry {
                deadline: Instant::now(),
                address,
                kind: TimerKind::Discovery,
            }));
            timers.push(Reverse(TimerEntry {
                deadline: Instant::now() + Duration::from_millis(heartbeat_ms),
                address,
                kind: TimerKind::Heartbeat,
            }));
        }
        timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + Duration::from_millis(settings.timeouts.rescan),
            address: Address::empty(),
            kind: TimerKind::Rescan,
        }));

        let server = Self {
            socket,
            poll,
            phy,
            bind_port,
            send_port,
            settings,
            connections,
            timers,
            queue,
            tag,
            cmd_rx,
            running: Arc::clone(&running),
            publication_seq: 0,
            subscription_seq: 0,
            recv_buf: [0u8; MAX_DATAGRAM],
            pending_publications: Vec::new(),
            publish_flush_armed: false,
        };

        let handle = ServerHandle {
            cmd_tx,
            waker,
            join: None,
        };
        Ok((server, handle))
    }

    /// Spawns the reactor thread and returns the join handle alongside
    /// the caller's control handle.
    pub fn spawn(mut self, mut handle: ServerHandle, name: String) -> ServerHandle {
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .expect("failed to spawn bridge reactor thread");
        handle.join = Some(join);
        handle
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            let timeout = self
                .timers
                .peek()
                .map(|Reverse(t)| t.deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(HOUSEKEEPING_TICK)
                .min(HOUSEKEEPING_TICK);

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != ErrorKind::Interrupted {
                    log::error!("bridge poll failed: {e}");
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    SOCKET_TOKEN => self.drain_socket(),
                    WAKER_TOKEN => self.drain_commands(),
                    _ => {}
                }
            }

            self.fire_due_timers();
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                ServerCommand::Stop => self.running.store(false, Ordering::Relaxed),
                ServerCommand::InjectPublish(publications) => self.inject_publish(publications),
            }
        }
    }

    fn drain_socket(&mut self) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("bridge receive error: {e}");
                    break;
                }
            };
            let SocketAddr::V4(from_v4) = from else {
                continue;
            };
            let peer = Address::from_ipv4(*from_v4.ip(), from_v4.port());
            if self.is_self_loopback(peer) {
                continue;
            }
            let datagram = self.recv_buf[..len].to_vec();
            self.handle_datagram(peer, &datagram);
        }
    }

    /// Self-loopback suppression (§4.5): skip our own `(ip, port)`
    /// unless it's the loopback address, which supports single-host
    /// multi-process testing.
    fn is_self_loopback(&self, peer: Address) -> bool {
        if peer.is_loopback() {
            return false;
        }
        !self.phy.is_any() && peer.ip == self.phy.ip && peer.port == self.bind_port
    }

    fn handle_datagram(&mut self, peer: Address, datagram: &[u8]) {
        let packet = match Packet::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                log::error!("protocol error from {peer}: {e}");
                return;
            }
        };

        let is_new_peer = !self.connections.contains_key(&peer);
        let conn = self
            .connections
            .entry(peer)
            .or_insert_with(|| Connection::new(peer));
        if is_new_peer {
            self.timers.push(Reverse(TimerEntry {
                deadline: Instant::now() + Duration::from_millis(self.settings.timeouts.heartbeat),
                address: peer,
                kind: TimerKind::Heartbeat,
            }));
        }

        if !conn.state.accepts(packet.header.packet_type) {
            let err = ProtocolError::InvalidPacketSequence {
                kind: packet.header.packet_type.kind.name(),
                sender: peer.to_string(),
            };
            log::error!("{err} (state {:?})", conn.state);
            return;
        }

        if matches!(packet.header.packet_type.family, PacketFamily::Normal) {
            match conn.check_incoming_seq(packet.header.packet_type.kind, packet.header.sequence_number) {
                Ok(IncomingSeq::Fresh) => {}
                Ok(IncomingSeq::Duplicate) => {
                    // ACK was lost; re-acknowledge without advancing state.
                    self.send_ack(peer, packet.header.packet_type.kind, packet.header.sequence_number);
                    return;
                }
                Err(e) => {
                    log::error!("{e}");
                    return;
                }
            }
        }

        self.dispatch(peer, packet);
    }

    fn dispatch(&mut self, peer: Address, packet: Packet) {
        match (packet.header.packet_type.family, packet.header.packet_type.kind, &packet.body) {
            (PacketFamily::Normal, PacketKind::Probe, PacketBody::Probe { ip, port }) => {
                self.handle_probe(peer, packet.header.sequence_number, *ip, *port);
            }
            (PacketFamily::Normal, PacketKind::Heartbeat, PacketBody::Heartbeat(body)) => {
                self.handle_heartbeat(peer, packet.header.sequence_number, body.clone());
            }
            (PacketFamily::Normal, PacketKind::Subscribe, PacketBody::Subscribe(_)) => {
                self.handle_subscribe_like(peer, packet.header.sequence_number, PacketKind::Subscribe);
            }
            (PacketFamily::Normal, PacketKind::Unsubscribe, PacketBody::Unsubscribe(_)) => {
                self.handle_subscribe_like(peer, packet.header.sequence_number, PacketKind::Unsubscribe);
            }
            (PacketFamily::Normal, PacketKind::Publish, PacketBody::Publish(body)) => {
                self.handle_publish(peer, packet.header.sequence_number, body.clone());
            }
            (PacketFamily::Normal, PacketKind::Disconnect, PacketBody::Disconnect) => {
                self.handle_disconnect(peer, packet.header.sequence_number);
            }
            (PacketFamily::Ack, kind, _) => self.handle_ack(peer, kind),
            (PacketFamily::Nack, kind, _) => self.handle_nack(peer, kind),
            _ => {}
        }
    }

    fn timeouts(&self) -> &Timeouts {
        &self.settings.timeouts
    }

    fn arm_ack_timer(&mut self, peer: Address, kind: PacketKind) {
        let ms = if matches!(kind, PacketKind::Probe) {
            self.timeouts().discovery
        } else {
            self.timeouts().acknowledge
        };
        let deadline = Instant::now() + Duration::from_millis(ms);
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.pending_ack = Some(PendingAck {
                kind,
                sequence_number: conn.last_sent_seq_n,
                deadline,
            });
        }
        self.timers.push(Reverse(TimerEntry {
            deadline,
            address: peer,
            kind: TimerKind::Ack(kind),
        }));
    }

    fn handle_probe(&mut self, peer: Address, seq: u32, _ip: u32, _port: u16) {
        let conn = self.connections.get_mut(&peer).expect("just inserted");
        conn.record_incoming(PacketType::normal(PacketKind::Probe), seq);
        let was_discovery_requested = conn.state == ConnectionState::DiscoveryRequested;
        conn.state = ConnectionState::Discovered;
        if !was_discovery_requested {
            // undiscovered/disconnected peer probing us: simultaneous-open
            // tie-break leaves both sides acting as responder (§4.3).
        }
        let seq = conn.next_send_seq();
        self.send(peer, Packet::empty(PacketFamily::Ack, PacketKind::Probe, seq));
    }

    fn handle_heartbeat(&mut self, peer: Address, seq: u32, _body: crate::packet::HeartbeatBody) {
        let conn = self.connections.get_mut(&peer).expect("just inserted");
        conn.record_incoming(PacketType::normal(PacketKind::Heartbeat), seq);
        conn.last_heartbeat_received = Some(Instant::now());
        let ack_seq = conn.next_send_seq();
        self.send(peer, Packet::empty(PacketFamily::Ack, PacketKind::Heartbeat, ack_seq));
    }

    fn handle_subscribe_like(&mut self, peer: Address, seq: u32, kind: PacketKind) {
        let conn = self.connections.get_mut(&peer).expect("just inserted");
        conn.record_incoming(PacketType::normal(kind), seq);
        let ack_seq = conn.next_send_seq();
        self.send(peer, Packet::empty(PacketFamily::Ack, kind, ack_seq));
    }

    fn handle_publish(&mut self, peer: Address, seq: u32, body: crate::packet::PublishBody) {
        let conn = self.connections.get_mut(&peer).expect("just inserted");
        conn.record_incoming(PacketType::normal(PacketKind::Publish), seq);
        let ack_seq = conn.next_send_seq();
        for publication in body.publications {
            self.queue.push(self.tag, publication);
        }
        self.send(peer, Packet::empty(PacketFamily::Ack, PacketKind::Publish, ack_seq));
    }

    fn handle_disconnect(&mut self, peer: Address, seq: u32) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.record_incoming(PacketType::normal(PacketKind::Disconnect), seq);
            let ack_seq = conn.next_send_seq();
            self.send(peer, Packet::empty(PacketFamily::Ack, PacketKind::Disconnect, ack_seq));
            conn.disconnect();
        }
    }

    fn handle_ack(&mut self, peer: Address, kind: PacketKind) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        if !conn.ack_matches_outstanding(kind) && conn.state != ConnectionState::DiscoveryRequested {
            return;
        }
        conn.nack_counts.reset(kind);
        if matches!(conn.pending_ack, Some(p) if p.kind == kind) {
            conn.pending_ack = None;
        }
        if matches!(kind, PacketKind::Probe) && conn.state == ConnectionState::DiscoveryRequested {
            conn.state = ConnectionState::Discovered;
        }
    }

    fn handle_nack(&mut self, peer: Address, kind: PacketKind) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        let count = conn.nack_counts.bump(kind);
        if count >= self.settings.max_nacks {
            conn.disconnect();
            log::error!("peer {peer} exceeded nack budget for `{}`, disconnecting", kind.name());
        }
    }

    /// Sends the generic nack for `kind` after an unacknowledged send,
    /// re-arming the ack timer; past `max_nacks` the peer disconnects.
    /// Probes have no nack variant, so a probe timeout is retried as a
    /// fresh probe instead (§4.2).
    fn retry_or_disconnect(&mut self, peer: Address, kind: PacketKind) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        let count = conn.nack_counts.bump(kind);
        if count >= self.settings.max_nacks {
            conn.disconnect();
            log::error!("peer {peer} exceeded nack budget for `{}`, disconnecting", kind.name());
            return;
        }
        if matches!(kind, PacketKind::Probe) {
            self.send_probe(peer);
            return;
        }
        if let Ok(nack_type) = PacketType::nack(kind) {
            let seq = conn.last_sent_seq_n;
            self.send(peer, Packet::empty(nack_type.family, nack_type.kind, seq));
        }
        self.arm_ack_timer(peer, kind);
    }

    fn send_ack(&mut self, peer: Address, kind: PacketKind, seq: u32) {
        self.send(peer, Packet::empty(PacketFamily::Ack, kind, seq));
    }

    fn send(&mut self, peer: Address, packet: Packet) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.record_outgoing(packet.header.packet_type);
        }
        let dest = SocketAddr::V4(SocketAddrV4::new(peer.ipv4(), peer.port));
        if let Err(e) = self.socket.send_to(&packet.raw, dest) {
            if e.kind() != ErrorKind::WouldBlock {
                log::warn!("bridge send to {peer} failed: {e}");
            }
        }
    }

    /// Buffers an outbound publication batch (§4.6): flushes right
    /// away if the pending batch would exceed the MTU budget once this
    /// one is added, otherwise arms a one-shot `delay`-ms flush timer
    /// if none is already pending.
    fn inject_publish(&mut self, publications: Vec<Publication>) {
        const FIXED_PREFIX: usize = HEADER_SIZE_WITH_COUNTERS;
        let mut pending_len: usize =
            FIXED_PREFIX + self.pending_publications.iter().map(Publication::encoded_len).sum::<usize>();

        for publication in publications {
            let added_len = publication.encoded_len();
            if !self.pending_publications.is_empty() && pending_len + added_len > MTU_BUDGET {
                self.flush_pending_publish();
                pending_len = FIXED_PREFIX;
            }
            pending_len += added_len;
            self.pending_publications.push(publication);
        }

        if !self.pending_publications.is_empty() && !self.publish_flush_armed {
            self.publish_flush_armed = true;
            self.timers.push(Reverse(TimerEntry {
                deadline: Instant::now() + Duration::from_millis(self.timeouts().delay),
                address: Address::empty(),
                kind: TimerKind::PublishFlush,
            }));
        }
    }

    fn flush_pending_publish(&mut self) {
        self.publish_flush_armed = false;
        if self.pending_publications.is_empty() {
            return;
        }
        let publications = std::mem::take(&mut self.pending_publications);
        self.broadcast_publish(publications);
    }

    fn broadcast_publish(&mut self, publications: Vec<Publication>) {
        self.publication_seq = self.publication_seq.wrapping_add(1);
        let blocks = PublishBody::split(self.publication_seq, publications);
        let peers: Vec<Address> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Discovered)
            .map(|(a, _)| *a)
            .collect();
        for peer in peers {
            for block in &blocks {
                let conn = self.connections.get_mut(&peer).expect("peer just listed");
                let seq = conn.next_send_seq();
                self.send(peer, Packet::publish(seq, block.clone()));
                self.arm_ack_timer(peer, PacketKind::Publish);
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.timers.pop().expect("just peeked");
            self.handle_timer(entry);
        }
    }

    fn handle_timer(&mut self, entry: TimerEntry) {
        match entry.kind {
            TimerKind::Ack(kind) => {
                let still_pending = self
                    .connections
                    .get(&entry.address)
                    .map(|c| matches!(c.pending_ack, Some(p) if p.kind == kind))
                    .unwrap_or(false);
                if still_pending {
                    self.retry_or_disconnect(entry.address, kind);
                }
            }
            TimerKind::Discovery => self.send_probe(entry.address),
            TimerKind::Heartbeat => self.heartbeat_tick(entry.address),
            TimerKind::Rescan => self.rescan(),
            TimerKind::PublishFlush => self.flush_pending_publish(),
        }
    }

    fn send_probe(&mut self, peer: Address) {
        let send_ip = if self.phy.is_any() { 0 } else { self.phy.ip };
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        let seq = conn.next_send_seq();
        if conn.state == ConnectionState::Undiscovered || conn.state == ConnectionState::Disconnected {
            conn.state = ConnectionState::DiscoveryRequested;
        }
        self.send(peer, Packet::probe(seq, send_ip, self.send_port));
        self.arm_ack_timer(peer, PacketKind::Probe);
    }

    /// Fires every `heartbeat` ms per peer (§4.4): emits our own
    /// heartbeat if the peer is `discovered`, then checks whether the
    /// peer's heartbeats have gone stale beyond
    /// `heartbeat + acknowledge * max_nacks` ms.
    fn heartbeat_tick(&mut self, peer: Address) {
        if self
            .connections
            .get(&peer)
            .map(|c| c.state == ConnectionState::Discovered)
            .unwrap_or(false)
        {
            self.send_heartbeat(peer);
        }

        let threshold = Duration::from_millis(
            self.timeouts().heartbeat + self.timeouts().acknowledge * u64::from(self.settings.max_nacks),
        );
        if let Some(conn) = self.connections.get_mut(&peer) {
            let stale = conn
                .last_heartbeat_received
                .map(|t| t.elapsed() > threshold)
                .unwrap_or(conn.state == ConnectionState::Discovered);
            if stale {
                conn.disconnect();
            }
        }
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + Duration::from_millis(self.timeouts().heartbeat),
            address: peer,
            kind: TimerKind::Heartbeat,
        }));
    }

    /// Sends a `heartbeat` carrying our current set of discovered
    /// peers, enabling transitive discovery (§4.2).
    fn send_heartbeat(&mut self, peer: Address) {
        let peers: Vec<crate::packet::PeerEntry> = self
            .connections
            .iter()
            .filter(|(addr, c)| **addr != peer && c.state == ConnectionState::Discovered)
            .map(|(addr, _)| crate::packet::PeerEntry {
                ip: addr.ip,
                port: addr.port,
            })
            .collect();
        let body = crate::packet::HeartbeatBody {
            interval_ms: self.timeouts().heartbeat as u32,
            peers,
        };
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        let seq = conn.next_send_seq();
        self.send(peer, Packet::heartbeat(seq, body));
        self.arm_ack_timer(peer, PacketKind::Heartbeat);
    }

    /// Re-issues `probe` to peers still undiscovered or disconnected,
    /// every `rescan` ms in unicast mode (§4.4).
    fn rescan(&mut self) {
        if matches!(self.settings.discovery, DiscoveryMode::Unicast { .. }) {
            let stale: Vec<Address> = self
                .connections
                .iter()
                .filter(|(_, c)| matches!(c.state, ConnectionState::Undiscovered | ConnectionState::Disconnected))
                .map(|(a, _)| *a)
                .collect();
            for peer in stale {
                self.send_probe(peer);
            }
        }
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + Duration::from_millis(self.timeouts().rescan),
            address: Address::empty(),
            kind: TimerKind::Rescan,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AdapterTag;
    use crate::config::{BridgeSettings, DiscoveryMode, Timeouts};

    fn test_server() -> Server {
        let phy = Phy::any();
        let settings = BridgeSettings {
            discovery: DiscoveryMode::Unicast {
                endpoints: None,
                from: None,
                to: None,
            },
            send_port: None,
            timeouts: Timeouts {
                delay: 50,
                ..Timeouts::default()
            },
            max_nacks: 3,
        };
        let queue = Arc::new(MessageQueue::new(8));
        let (server, _handle) = Server::new(phy, 0, settings, queue, AdapterTag(0))
            .expect("binding an ephemeral port should never fail");
        server
    }

    fn publication(payload_len: usize) -> Publication {
        Publication {
            origin_ip: 0,
            origin_port: 0,
            qos: 0,
            topic: "x/y".into(),
            origin_client_id: "test".into(),
            payload: vec![0u8; payload_len],
        }
    }

    #[test]
    fn inject_publish_buffers_and_arms_flush_timer() {
        let mut server = test_server();
        server.inject_publish(vec![publication(8)]);
        assert_eq!(server.pending_publications.len(), 1);
        assert!(server.publish_flush_armed);
        assert!(server
            .timers
            .iter()
            .any(|entry| matches!(entry.0.kind, TimerKind::PublishFlush)));
    }

    #[test]
    fn inject_publish_flushes_immediately_past_mtu_budget() {
        let mut server = test_server();
        server.inject_publish(vec![publication(MTU_BUDGET)]);
        server.inject_publish(vec![publication(MTU_BUDGET)]);
        assert!(server.pending_publications.len() <= 1);
    }

    #[test]
    fn publish_flush_timer_drains_pending_batch() {
        let mut server = test_server();
        server.inject_publish(vec![publication(8)]);
        server.flush_pending_publish();
        assert!(server.pending_publications.is_empty());
        assert!(!server.publish_flush_armed);
    }

    /// Scenario 1 (§8), responder half: a fresh peer's `probe` carries
    /// the undiscovered connection straight to `discovered` once we
    /// answer with `probe_ack` — no real second process needed since a
    /// bound UDP socket can send to any address without a listener.
    #[test]
    fn discovery_handshake_transitions_peer_to_discovered_on_incoming_probe() {
        let mut server = test_server();
        let peer = Address::from_ipv4(Ipv4Addr::new(127, 0, 0, 2), 9000);
        let probe = Packet::probe(1, u32::from(Ipv4Addr::new(127, 0, 0, 2)), 9000);

        server.handle_datagram(peer, &probe.raw);

        let conn = server.connections.get(&peer).expect("peer inserted on first datagram");
        assert_eq!(conn.state, ConnectionState::Discovered);
        assert_eq!(conn.last_recv_seq_n, 1);
    }

    /// Scenario 1 (§8), initiator half: our own `probe` followed by the
    /// matching `probe_ack` completes the handshake from
    /// `discovery_requested`.
    #[test]
    fn probe_ack_completes_discovery_requested_handshake() {
        let mut server = test_server();
        let peer = Address::from_ipv4(Ipv4Addr::new(127, 0, 0, 3), 9000);
        server.connections.insert(peer, Connection::new(peer));

        server.send_probe(peer);
        assert_eq!(
            server.connections.get(&peer).unwrap().state,
            ConnectionState::DiscoveryRequested
        );

        let ack = Packet::empty(PacketFamily::Ack, PacketKind::Probe, 1);
        server.handle_datagram(peer, &ack.raw);
        assert_eq!(server.connections.get(&peer).unwrap().state, ConnectionState::Discovered);
    }

    /// Scenario 2 (§8): an ack timer firing while `pending_ack` still
    /// names the send it was armed for emits a nack and re-arms the
    /// timer, without waiting for any real second process to go quiet.
    #[test]
    fn lost_ack_retry_emits_nack_and_rearms_timer() {
        let mut server = test_server();
        let peer = Address::from_ipv4(Ipv4Addr::new(127, 0, 0, 5), 9000);
        let mut conn = Connection::new(peer);
        conn.state = ConnectionState::Discovered;
        server.connections.insert(peer, conn);

        server.send_heartbeat(peer);
        let armed_seq = server.connections.get(&peer).unwrap().last_sent_seq_n;
        assert!(matches!(
            server.connections.get(&peer).unwrap().pending_ack,
            Some(p) if p.kind == PacketKind::Heartbeat && p.sequence_number == armed_seq
        ));

        server.handle_timer(TimerEntry {
            deadline: Instant::now(),
            address: peer,
            kind: TimerKind::Ack(PacketKind::Heartbeat),
        });

        let conn = server.connections.get(&peer).unwrap();
        assert_eq!(conn.nack_counts.count(PacketKind::Heartbeat), 1);
        assert!(matches!(
            conn.pending_ack,
            Some(p) if p.kind == PacketKind::Heartbeat
        ));
    }

    /// Scenario 2 (§8), probe half: since `probe` has no nack variant, a
    /// lost probe ack is retried as a fresh probe rather than a nack.
    #[test]
    fn lost_probe_ack_is_retried_as_fresh_probe() {
        let mut server = test_server();
        let peer = Address::from_ipv4(Ipv4Addr::new(127, 0, 0, 6), 9000);
        server.connections.insert(peer, Connection::new(peer));

        server.send_probe(peer);
        let first_seq = server.connections.get(&peer).unwrap().last_sent_seq_n;

        server.handle_timer(TimerEntry {
            deadline: Instant::now(),
            address: peer,
            kind: TimerKind::Ack(PacketKind::Probe),
        });

        let conn = server.connections.get(&peer).unwrap();
        assert_eq!(conn.nack_counts.count(PacketKind::Probe), 1);
        assert!(conn.last_sent_seq_n > first_seq);
        assert!(matches!(conn.pending_ack, Some(p) if p.kind == PacketKind::Probe));
    }

    /// Scenario 3 (§8): a `publish` older than the last accepted
    /// sequence number is dropped without moving `last_recv_seq_n`.
    #[test]
    fn out_of_order_publish_is_dropped_without_state_change() {
        let mut server = test_server();
        let peer = Address::from_ipv4(Ipv4Addr::new(127, 0, 0, 4), 9000);
        let mut conn = Connection::new(peer);
        conn.state = ConnectionState::Discovered;
        conn.record_incoming(PacketType::normal(PacketKind::Publish), 10);
        server.connections.insert(peer, conn);

        let stale = Packet::publish(
            7,
            PublishBody {
                publication_id: 1,
                total_blocks: 1,
                block_n: 0,
                publications: Vec::new(),
            },
        );
        server.handle_datagram(peer, &stale.raw);

        assert_eq!(server.connections.get(&peer).unwrap().last_recv_seq_n, 10);
    }
}

/// Builds the initial peer address set for discovery, per §4.5. Unicast
/// and broadcast peers are addressed at `send_port`; a multicast group
/// is addressed at its own configured port, defaulting to `bind_port`
/// (the listening port) when unset.
fn initial_peers(phy: &Phy, send_port: u16, bind_port: u16, mode: &DiscoveryMode) -> Vec<Address> {
    let port = send_port;
    match mode {
        DiscoveryMode::Unicast { endpoints, from, to } => {
            if let Some(list) = endpoints {
                list.iter()
                    .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
                    .map(|ip| Address::from_ipv4(ip, port))
                    .collect()
            } else if let (Some(from), Some(to)) = (from, to) {
                match (from.parse::<Ipv4Addr>(), to.parse::<Ipv4Addr>()) {
                    (Ok(from), Ok(to)) => {
                        let start = u32::from(from);
                        let end = u32::from(to);
                        (start..=end)
                            .map(|ip| Address::from_ipv4(Ipv4Addr::from(ip), port))
                            .collect()
                    }
                    _ => Vec::new(),
                }
            } else if !phy.is_any() {
                (phy.host_min()..=phy.host_max())
                    .map(|ip| Address::from_ipv4(Ipv4Addr::from(ip), port))
                    .collect()
            } else {
                Vec::new()
            }
        }
        DiscoveryMode::Multicast { group, port, .. } => group
            .parse::<Ipv4Addr>()
            .map(|ip| vec![Address::from_ipv4(ip, port.unwrap_or(bind_port))])
            .unwrap_or_default(),
        DiscoveryMode::Broadcast => {
            if phy.is_any() {
                Vec::new()
            } else {
                vec![Address::from_ipv4(phy.broadcast_addr(), port)]
            }
        }
    }
}
