//! # Host
//!
//! The socket owner and protocol driver. A host binds one UDP socket, keeps
//! the peer slot table, and advances every state machine from inside
//! [`Host::service`] — the single place where I/O, timers and transitions
//! happen. No threads are spawned; the caller decides the cadence.
//!
//! Datagram flow: receive → optional raw-intercept hook → optional checksum
//! validation → demultiplex by target peer id → per-command dispatch into
//! the peer/channel state machines → zero or more queued [`Event`]s, drained
//! one per call.

use std::net::UdpSocket;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use quanta::Instant;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::channel::{ChannelDelivery, PendingReliable, ReliableItem, ReliableOutcome};
use crate::error::{Error, Result};
use crate::event::{Event, NotifyCode};
use crate::packet::{Packet, PacketFlags};
use crate::peer::{Peer, PeerHandle, PeerState};
use crate::stats::{HostStats, PeerStats};
use crate::throttle::ThrottleConfig;
use crate::wire::{
    patch_checksum, seq_after, seq_distance, AckBody, Command, CommandKind, ConnectBody,
    DatagramHeader, FramedCommand, VerifyConnectBody, CHECKSUM_SIZE, COMMAND_HEADER_SIZE,
    CONNECTION_CHANNEL, DATAGRAM_HEADER_SIZE, DEFAULT_MTU, MAX_MTU, MIN_MTU, PEER_ID_NONE,
    PROTOCOL_VERSION, RELIABLE_WINDOW,
};

/// Largest peer table a host may be configured with.
pub const MAX_PEERS: usize = 0xFFF;
/// Largest channel count per peer.
pub const MAX_CHANNELS: u8 = 0xFF;

/// Default socket receive buffer hint.
const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
/// Retransmission backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Raw-datagram inspection hook. Returning `true` marks the datagram
/// consumed: protocol parsing is skipped entirely.
pub type InterceptHook = Box<dyn FnMut(&Address, &[u8]) -> bool + Send>;

/// Datagram digest hook, applied to outgoing datagrams (checksum slot
/// zeroed) and validated on incoming ones. A mismatch drops the datagram
/// silently.
pub type ChecksumHook = Box<dyn Fn(&[u8]) -> u64 + Send>;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Host construction parameters.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Local bind address. The default binds `::` on an ephemeral port.
    pub address: Address,
    /// Maximum simultaneous peers, `0..=4095`. Zero accepts no connections.
    pub peer_limit: usize,
    /// Channels per peer, `1..=255`. Zero selects the maximum.
    pub channel_limit: u8,
    /// Inbound bandwidth in bytes/sec, advisory. Zero is unlimited.
    pub incoming_bandwidth: u32,
    /// Outbound bandwidth budget in bytes/sec. Zero is unlimited.
    pub outgoing_bandwidth: u32,
    /// Socket receive buffer size hint.
    pub buffer_size: usize,
    /// Cap on concurrent connections from one address. Zero is unlimited.
    pub max_duplicate_peers: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            address: Address::any(),
            peer_limit: 32,
            channel_limit: 1,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_duplicate_peers: 0,
        }
    }
}

// ─── Host ────────────────────────────────────────────────────────────────────

enum Route {
    /// Connectionless datagram (connects and handshake rejects).
    Connectionless,
    /// Datagram for an allocated, address-verified slot.
    Slot(usize),
    /// Unroutable; the datagram is dropped.
    Drop,
}

/// A bound transport endpoint owning its peers and socket.
pub struct Host {
    socket: UdpSocket,
    is_v6: bool,
    local_address: Address,
    peer_limit: usize,
    channel_limit: u8,
    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    max_duplicate_peers: u16,
    peers: Slab<Peer>,
    generations: Vec<u32>,
    events: std::collections::VecDeque<Event>,
    intercept: Option<InterceptHook>,
    checksum: Option<ChecksumHook>,
    refuse_connections: bool,
    start: Instant,
    counters: HostStats,
    recv_buf: Vec<u8>,
    /// Token bucket for the outgoing bandwidth budget, in bytes.
    bw_tokens: f64,
    bw_refilled: Instant,
}

impl Host {
    /// Bind a UDP socket and stand up an empty peer table.
    ///
    /// A failed bind surfaces as [`Error::BindFailed`], distinguishable from
    /// other socket faults.
    pub fn new(config: HostConfig) -> Result<Self> {
        if config.peer_limit > MAX_PEERS {
            return Err(Error::InvalidConfig("peer_limit exceeds 4095"));
        }
        let channel_limit = if config.channel_limit == 0 {
            MAX_CHANNELS
        } else {
            config.channel_limit
        };

        let bind_addr = if config.address.is_v4() {
            config.address.to_socket_addr()
        } else {
            config.address.to_socket_addr_v6()
        };
        let domain = if bind_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if domain == Domain::IPV6 {
            // Dual-stack: accept IPv4-mapped senders on the same socket.
            let _ = socket.set_only_v6(false);
        }
        let _ = socket.set_recv_buffer_size(config.buffer_size);
        socket.bind(&bind_addr.into()).map_err(|e| Error::BindFailed {
            addr: bind_addr.to_string(),
            source: e,
        })?;
        let socket: UdpSocket = socket.into();
        let local_address = Address::from(socket.local_addr()?);
        debug!(%local_address, peer_limit = config.peer_limit, "host bound");

        let now = Instant::now();
        Ok(Host {
            socket,
            is_v6: domain == Domain::IPV6,
            local_address,
            peer_limit: config.peer_limit,
            channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            max_duplicate_peers: config.max_duplicate_peers,
            peers: Slab::new(),
            generations: Vec::new(),
            events: std::collections::VecDeque::new(),
            intercept: None,
            checksum: None,
            refuse_connections: false,
            start: now,
            counters: HostStats::default(),
            recv_buf: vec![0; 65536],
            // The bucket starts full so the first flush is never starved.
            bw_tokens: f64::from(config.outgoing_bandwidth),
            bw_refilled: now,
        })
    }

    /// The bound local address, useful after binding an ephemeral port.
    pub fn socket_address(&self) -> Address {
        self.local_address
    }

    /// Install or clear the raw-intercept hook.
    pub fn set_intercept(&mut self, hook: Option<InterceptHook>) {
        self.intercept = hook;
    }

    /// Install or clear the datagram checksum hook.
    pub fn set_checksum(&mut self, hook: Option<ChecksumHook>) {
        self.checksum = hook;
    }

    /// Refuse new incoming connections while keeping existing peers alive.
    pub fn prevent_connections(&mut self, refuse: bool) {
        self.refuse_connections = refuse;
    }

    /// Aggregate host counters.
    pub fn stats(&self) -> HostStats {
        let mut stats = self.counters;
        stats.peers_connected = self
            .peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .count();
        stats.peers_allocated = self.peers.len();
        stats
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Configured `(incoming, outgoing)` bandwidth limits in bytes/sec.
    pub fn bandwidth_limits(&self) -> (u32, u32) {
        (self.incoming_bandwidth, self.outgoing_bandwidth)
    }

    /// Reconfigure the bandwidth limits. Zero means unlimited. The outgoing
    /// budget applies from the next flush.
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
    }

    /// Change the channel count offered to future incoming connections.
    /// Existing peers keep the count negotiated at handshake time.
    pub fn set_channel_limit(&mut self, limit: u8) {
        self.channel_limit = if limit == 0 { MAX_CHANNELS } else { limit };
    }

    // ─── Handle validation ───────────────────────────────────────────────────

    fn slot_of(&self, handle: PeerHandle) -> Result<usize> {
        let index = handle.index as usize;
        if self.generations.get(index) == Some(&handle.generation) && self.peers.contains(index) {
            Ok(index)
        } else {
            Err(Error::StalePeer)
        }
    }

    fn peer_ref(&self, handle: PeerHandle) -> Result<&Peer> {
        let index = self.slot_of(handle)?;
        self.peers.get(index).ok_or(Error::StalePeer)
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> Result<&mut Peer> {
        let index = self.slot_of(handle)?;
        self.peers.get_mut(index).ok_or(Error::StalePeer)
    }

    fn allocate_peer(
        &mut self,
        address: Address,
        channel_count: u8,
        connect_id: u32,
        now: Instant,
    ) -> PeerHandle {
        let entry = self.peers.vacant_entry();
        let index = entry.key();
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 1);
        }
        let handle = PeerHandle {
            index: index as u32,
            generation: self.generations[index],
        };
        entry.insert(Peer::new(handle, address, channel_count, connect_id, now));
        handle
    }

    fn reclaim(&mut self, handle: PeerHandle) {
        if let Ok(index) = self.slot_of(handle) {
            self.peers.remove(index);
            self.generations[index] = self.generations[index].wrapping_add(1);
        }
    }

    // ─── Peer accessors ──────────────────────────────────────────────────────

    pub fn peer_state(&self, handle: PeerHandle) -> Result<PeerState> {
        Ok(self.peer_ref(handle)?.state)
    }

    pub fn peer_address(&self, handle: PeerHandle) -> Result<Address> {
        Ok(self.peer_ref(handle)?.address)
    }

    pub fn peer_round_trip_time(&self, handle: PeerHandle) -> Result<Duration> {
        Ok(self.peer_ref(handle)?.rtt.rtt())
    }

    pub fn peer_mtu(&self, handle: PeerHandle) -> Result<u16> {
        Ok(self.peer_ref(handle)?.mtu)
    }

    pub fn peer_stats(&self, handle: PeerHandle) -> Result<PeerStats> {
        Ok(self.peer_ref(handle)?.stats())
    }

    pub fn peer_user_data(&self, handle: PeerHandle) -> Result<u64> {
        Ok(self.peer_ref(handle)?.user_data)
    }

    pub fn set_peer_user_data(&mut self, handle: PeerHandle, value: u64) -> Result<()> {
        self.peer_mut(handle)?.user_data = value;
        Ok(())
    }

    pub fn set_ping_interval(&mut self, handle: PeerHandle, interval: Duration) -> Result<()> {
        self.peer_mut(handle)?.ping_interval = interval;
        Ok(())
    }

    pub fn set_timeout(
        &mut self,
        handle: PeerHandle,
        limit: u32,
        minimum: Duration,
        maximum: Duration,
    ) -> Result<()> {
        self.peer_mut(handle)?.set_timeout(limit, minimum, maximum);
        Ok(())
    }

    /// Retune the peer's throttle and propagate the parameters to the remote.
    pub fn configure_throttle(&mut self, handle: PeerHandle, config: ThrottleConfig) -> Result<()> {
        let now = Instant::now();
        let peer = self.peer_mut(handle)?;
        peer.throttle.configure(config);
        let rto = peer.rtt.rto();
        let seq = peer.connection.next_sequence();
        peer.connection.enqueue(
            CONNECTION_CHANNEL,
            seq,
            Command::ThrottleConfigure(config.to_wire()),
            None,
            now,
            rto,
        );
        Ok(())
    }

    // ─── Connection management ───────────────────────────────────────────────

    /// Start an outgoing connection. The handshake completes asynchronously;
    /// a `Connect` event is produced once the peer reaches `Connected`.
    pub fn connect(&mut self, address: Address, channel_count: u8, data: u32) -> Result<PeerHandle> {
        if channel_count == 0 {
            return Err(Error::InvalidArgument("channel_count must be nonzero"));
        }
        if self.peers.len() >= self.peer_limit {
            return Err(Error::InvalidArgument("no free peer slot"));
        }
        let channel_count = channel_count.min(self.channel_limit);
        let now = Instant::now();
        let connect_id: u32 = rand::random();
        let handle = self.allocate_peer(address, channel_count, connect_id, now);
        let index = handle.index as usize;
        if let Some(peer) = self.peers.get_mut(index) {
            peer.state = PeerState::Connecting;
            peer.connect_data = data;
            let rto = peer.rtt.rto();
            let seq = peer.connection.next_sequence();
            peer.connection.enqueue(
                CONNECTION_CHANNEL,
                seq,
                Command::Connect(ConnectBody {
                    version: PROTOCOL_VERSION,
                    outgoing_peer_id: handle.index as u16,
                    connect_id,
                    channel_count,
                    mtu: DEFAULT_MTU,
                    data,
                }),
                None,
                now,
                rto,
            );
        }
        self.flush_peer_at(index, now);
        Ok(handle)
    }

    /// Graceful disconnect: queued reliable data is delivered first, then the
    /// teardown goes out and a `Disconnect` event is produced once the remote
    /// acknowledges it.
    pub fn disconnect(&mut self, handle: PeerHandle, data: u32) -> Result<()> {
        let now = Instant::now();
        let index = self.slot_of(handle)?;
        let Some(peer) = self.peers.get_mut(index) else {
            return Err(Error::StalePeer);
        };
        if !peer.state.is_active() {
            return Err(Error::PeerNotConnected);
        }
        peer.state = PeerState::Disconnecting;
        peer.event_data = data;
        if peer.data_drained() {
            Self::queue_disconnect(peer, now);
        }
        self.flush_peer_at(index, now);
        Ok(())
    }

    /// Put the teardown `Disconnect` on the wire. Callers must ensure the
    /// data outboxes have drained first.
    fn queue_disconnect(peer: &mut Peer, now: Instant) {
        peer.disconnect_queued = true;
        let data = peer.event_data;
        let rto = peer.rtt.rto();
        let seq = peer.connection.next_sequence();
        peer.connection.enqueue(
            CONNECTION_CHANNEL,
            seq,
            Command::Disconnect { data },
            None,
            now,
            rto,
        );
    }

    /// Immediate disconnect: one unacknowledged notification is sent and the
    /// slot is reclaimed at once. No local event is produced.
    pub fn disconnect_now(&mut self, handle: PeerHandle, data: u32) -> Result<()> {
        let now = Instant::now();
        let index = self.slot_of(handle)?;
        let sent_time = Self::clock_ms(self.start, now);
        if let Some(peer) = self.peers.get_mut(index) {
            if peer.state.is_active() {
                let seq = peer.connection.next_sequence();
                let commands = [FramedCommand::connection(seq, Command::Disconnect { data })];
                let dest = if self.is_v6 {
                    peer.address.to_socket_addr_v6()
                } else {
                    peer.address.to_socket_addr()
                };
                let _ = Self::transmit_commands(
                    &self.socket,
                    &self.checksum,
                    dest,
                    peer.remote_peer_id,
                    sent_time,
                    &commands,
                    peer.mtu as usize,
                );
            }
        }
        self.reclaim(handle);
        Ok(())
    }

    /// Deferred disconnect: teardown begins once every outgoing queue drains.
    pub fn disconnect_later(&mut self, handle: PeerHandle, data: u32) -> Result<()> {
        let peer = self.peer_mut(handle)?;
        if !peer.state.is_active() {
            return Err(Error::PeerNotConnected);
        }
        peer.state = PeerState::DisconnectLater;
        peer.event_data = data;
        Ok(())
    }

    /// Forcibly drop all peer state without notifying the remote side.
    pub fn reset_peer(&mut self, handle: PeerHandle) -> Result<()> {
        self.peer_mut(handle)?.reset();
        self.reclaim(handle);
        Ok(())
    }

    /// Send a manual keep-alive ping.
    pub fn ping(&mut self, handle: PeerHandle) -> Result<()> {
        let now = Instant::now();
        let peer = self.peer_mut(handle)?;
        if !peer.state.can_send() {
            return Err(Error::PeerNotConnected);
        }
        let rto = peer.rtt.rto();
        let seq = peer.connection.next_sequence();
        peer.connection
            .enqueue(CONNECTION_CHANNEL, seq, Command::Ping, None, now, rto);
        Ok(())
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    /// Queue a packet for delivery on a channel. The delivery class follows
    /// the packet's flags; oversized payloads are fragmented.
    pub fn send(&mut self, handle: PeerHandle, channel_id: u8, packet: &Packet) -> Result<()> {
        let payload = packet.payload()?;
        let flags = packet.flags()?;
        let now = Instant::now();
        let index = self.slot_of(handle)?;
        let Some(peer) = self.peers.get_mut(index) else {
            return Err(Error::StalePeer);
        };
        if !peer.state.can_send() {
            return Err(Error::PeerNotConnected);
        }
        if channel_id as usize >= peer.channels.len() {
            return Err(Error::InvalidArgument("channel id out of range"));
        }

        let overhead = DATAGRAM_HEADER_SIZE + CHECKSUM_SIZE + COMMAND_HEADER_SIZE;
        let single_max = peer.mtu as usize - overhead - 2;
        let fragment_max = peer.mtu as usize - overhead - 20;
        let rto = peer.rtt.rto();

        if flags.contains(PacketFlags::UNSEQUENCED) {
            if payload.len() > single_max {
                // Unsequenced traffic only fragments with the explicit opt-in.
                if !flags.contains(PacketFlags::UNRELIABLE_FRAGMENTED) {
                    return Err(Error::InvalidArgument("unsequenced payload exceeds MTU"));
                }
                Self::enqueue_fragments(
                    peer, channel_id, &payload, fragment_max, true, packet, now, rto,
                )?;
            } else {
                let seq = peer.next_unsequenced();
                peer.outgoing_unreliable.push(FramedCommand {
                    channel_id,
                    sequence: seq,
                    command: Command::SendUnsequenced { payload },
                });
            }
        } else if flags.contains(PacketFlags::RELIABLE) {
            if payload.len() <= single_max {
                let channel = &mut peer.channels[channel_id as usize];
                let seq = channel.outbox.next_sequence();
                channel.outbox.enqueue(
                    channel_id,
                    seq,
                    Command::SendReliable { payload },
                    Some(packet.clone()),
                    now,
                    rto,
                );
            } else {
                Self::enqueue_fragments(
                    peer, channel_id, &payload, fragment_max, false, packet, now, rto,
                )?;
            }
        } else {
            // Unreliable class: subject to the congestion gate.
            if !flags.contains(PacketFlags::UNTHROTTLED) {
                let mut rng = rand::rng();
                if !peer.throttle.gate(&mut rng) {
                    trace!(peer = handle.index, "unreliable send shed by throttle");
                    return Ok(());
                }
            }
            if payload.len() <= single_max {
                let channel = &mut peer.channels[channel_id as usize];
                let seq = channel.next_unreliable_sequence();
                peer.outgoing_unreliable.push(FramedCommand {
                    channel_id,
                    sequence: seq,
                    command: Command::SendUnreliable { payload },
                });
            } else if flags.contains(PacketFlags::UNRELIABLE_FRAGMENTED) {
                Self::enqueue_fragments(
                    peer, channel_id, &payload, fragment_max, true, packet, now, rto,
                )?;
            } else {
                // Oversized without the unreliable-fragment opt-in falls back
                // to reliable fragmentation.
                Self::enqueue_fragments(
                    peer, channel_id, &payload, fragment_max, false, packet, now, rto,
                )?;
            }
        }

        if flags.contains(PacketFlags::INSTANT) {
            self.flush_peer_at(index, now);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_fragments(
        peer: &mut Peer,
        channel_id: u8,
        payload: &bytes::Bytes,
        fragment_max: usize,
        unreliable: bool,
        packet: &Packet,
        now: Instant,
        rto: Duration,
    ) -> Result<()> {
        if fragment_max == 0 {
            return Err(Error::InvalidArgument("MTU too small for fragmentation"));
        }
        let total = payload.len();
        let count = total.div_ceil(fragment_max);
        if count > u16::MAX as usize {
            return Err(Error::InvalidArgument("payload needs too many fragments"));
        }

        let channel = &mut peer.channels[channel_id as usize];
        let group = if unreliable {
            channel.next_unreliable_sequence()
        } else {
            0 // assigned from the first fragment's reliable sequence below
        };
        let mut start_sequence = group;
        let mut staged = Vec::new();
        for number in 0..count {
            let offset = number * fragment_max;
            let end = (offset + fragment_max).min(total);
            let body = crate::wire::FragmentBody {
                start_sequence,
                fragment_count: count as u32,
                fragment_number: number as u32,
                total_length: total as u32,
                fragment_offset: offset as u32,
                payload: payload.slice(offset..end),
            };
            if unreliable {
                staged.push(FramedCommand {
                    channel_id,
                    sequence: group,
                    command: Command::SendUnreliableFragment(body),
                });
            } else {
                let seq = channel.outbox.next_sequence();
                if number == 0 {
                    start_sequence = seq;
                }
                let body = crate::wire::FragmentBody {
                    start_sequence,
                    ..body
                };
                channel.outbox.enqueue(
                    channel_id,
                    seq,
                    Command::SendFragment(body),
                    Some(packet.clone()),
                    now,
                    rto,
                );
            }
        }
        peer.outgoing_unreliable.extend(staged);
        Ok(())
    }

    /// Send to every connected peer. Per-peer failures are ignored.
    pub fn broadcast(&mut self, channel_id: u8, packet: &Packet) {
        self.broadcast_filtered(channel_id, packet, |_| true);
    }

    /// Broadcast excluding one peer.
    pub fn broadcast_excluding(&mut self, channel_id: u8, packet: &Packet, except: PeerHandle) {
        self.broadcast_filtered(channel_id, packet, |h| h != except);
    }

    /// Broadcast to a selected subset.
    pub fn broadcast_selected(&mut self, channel_id: u8, packet: &Packet, peers: &[PeerHandle]) {
        self.broadcast_filtered(channel_id, packet, |h| peers.contains(&h));
    }

    fn broadcast_filtered(
        &mut self,
        channel_id: u8,
        packet: &Packet,
        mut include: impl FnMut(PeerHandle) -> bool,
    ) {
        let targets: Vec<PeerHandle> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state.can_send())
            .map(|(_, p)| p.handle)
            .collect();
        for handle in targets {
            if include(handle) {
                if let Err(e) = self.send(handle, channel_id, packet) {
                    trace!(peer = handle.index, error = %e, "broadcast send skipped");
                }
            }
        }
    }

    /// Send raw bytes outside the protocol, sharing the host's socket.
    pub fn send_raw(&self, address: &Address, data: &[u8]) -> Result<()> {
        let dest = if self.is_v6 {
            address.to_socket_addr_v6()
        } else {
            address.to_socket_addr()
        };
        self.socket.send_to(data, dest)?;
        Ok(())
    }

    // ─── Service loop ────────────────────────────────────────────────────────

    /// One bounded service step: drain a queued event if any, advance timers,
    /// flush outgoing data, then poll the socket for at most one datagram,
    /// blocking up to `timeout`.
    pub fn service(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if let Some(event) = self.dispatch_event() {
            return Ok(Some(event));
        }
        let now = Instant::now();
        self.drive_timers(now);
        self.flush_all(now);
        if let Some(event) = self.dispatch_event() {
            return Ok(Some(event));
        }
        if let Some((sender, len)) = self.poll_socket(timeout)? {
            self.handle_datagram(sender, len);
            self.flush_all(Instant::now());
        }
        Ok(self.dispatch_event())
    }

    /// Drain one already-queued event without performing socket I/O.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_event()
    }

    /// Force immediate transmission of all queued outgoing data.
    pub fn flush(&mut self) {
        self.flush_all(Instant::now());
    }

    fn dispatch_event(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        match &event {
            Event::Connect { peer, .. } => {
                // Dispatching the connect completes the handshake locally.
                if let Ok(p) = self.peer_mut(*peer) {
                    if matches!(
                        p.state,
                        PeerState::ConnectionPending | PeerState::ConnectionSucceeded
                    ) {
                        p.state = PeerState::Connected;
                    }
                }
            }
            Event::Disconnect { peer, .. } | Event::Timeout { peer } | Event::Notify { peer, .. } => {
                self.reclaim(*peer);
            }
            Event::Receive { .. } => {}
        }
        Some(event)
    }

    fn clock_ms(start: Instant, now: Instant) -> u16 {
        now.duration_since(start).as_millis() as u16
    }

    fn drive_timers(&mut self, now: Instant) {
        let indices: Vec<usize> = self.peers.iter().map(|(i, _)| i).collect();
        for index in indices {
            let Some(peer) = self.peers.get_mut(index) else {
                continue;
            };
            peer.throttle.tick(now);

            if peer.state.is_active() && peer.timed_out(now) {
                debug!(peer = index, state = ?peer.state, "peer timed out");
                let handle = peer.handle;
                peer.state = PeerState::Zombie;
                peer.connection.clear();
                for channel in &mut peer.channels {
                    channel.reset();
                }
                self.events.push_back(Event::Timeout { peer: handle });
                continue;
            }

            if peer.state == PeerState::DisconnectLater && peer.outgoing_drained() {
                peer.state = PeerState::Disconnecting;
            }
            if peer.state == PeerState::Disconnecting
                && !peer.disconnect_queued
                && peer.data_drained()
            {
                Self::queue_disconnect(peer, now);
            }

            if peer.ping_due(now) {
                let rto = peer.rtt.rto();
                let seq = peer.connection.next_sequence();
                peer.connection
                    .enqueue(CONNECTION_CHANNEL, seq, Command::Ping, None, now, rto);
            }
        }
    }

    fn flush_all(&mut self, now: Instant) {
        let indices: Vec<usize> = self.peers.iter().map(|(i, _)| i).collect();
        for index in indices {
            self.flush_peer_at(index, now);
        }
    }

    fn flush_peer_at(&mut self, index: usize, now: Instant) {
        // Replenish the bandwidth budget. An exhausted budget holds back
        // protocol and data commands; acks still go out below, so the remote
        // is never starved into a timeout.
        let mut budget_exhausted = false;
        if self.outgoing_bandwidth > 0 {
            let elapsed = now.duration_since(self.bw_refilled).as_secs_f64();
            let cap = f64::from(self.outgoing_bandwidth);
            self.bw_tokens = (self.bw_tokens + elapsed * cap).min(cap);
            self.bw_refilled = now;
            budget_exhausted = self.bw_tokens <= 0.0;
        }

        let sent_time = Self::clock_ms(self.start, now);
        let Some(peer) = self.peers.get_mut(index) else {
            return;
        };

        let mut commands: Vec<FramedCommand> = Vec::new();
        for (channel_id, sequence, echo) in peer.pending_acks.drain(..) {
            commands.push(FramedCommand {
                channel_id,
                sequence: 0,
                command: Command::Ack(AckBody {
                    sequence,
                    sent_time: echo,
                }),
            });
        }

        if budget_exhausted {
            if commands.is_empty() {
                return;
            }
            Self::transmit_to_peer(
                &self.socket,
                &self.checksum,
                self.is_v6,
                peer,
                &mut self.counters,
                sent_time,
                &commands,
                now,
                index,
            );
            return;
        }

        for pending in peer.connection.pending_mut() {
            if let Some(retry) = transmission_due(pending, now) {
                if retry {
                    peer.counters.packets_lost += 1;
                    peer.throttle.record_lost();
                } else {
                    peer.throttle.record_sent();
                }
                commands.push(FramedCommand {
                    channel_id: pending.channel_id,
                    sequence: pending.sequence,
                    command: pending.command.clone(),
                });
            }
        }
        for channel in &mut peer.channels {
            // Hold transmissions outside the receiver's reliable window; the
            // window advances as the oldest entries are acknowledged.
            let Some(window_base) = channel.outbox.pending().next().map(|p| p.sequence) else {
                continue;
            };
            for pending in channel.outbox.pending_mut() {
                if seq_distance(pending.sequence, window_base) >= RELIABLE_WINDOW {
                    break;
                }
                if let Some(retry) = transmission_due(pending, now) {
                    if retry {
                        peer.counters.packets_lost += 1;
                        peer.throttle.record_lost();
                    } else {
                        peer.throttle.record_sent();
                    }
                    commands.push(FramedCommand {
                        channel_id: pending.channel_id,
                        sequence: pending.sequence,
                        command: pending.command.clone(),
                    });
                }
            }
        }
        commands.extend(peer.outgoing_unreliable.drain(..));

        if commands.is_empty() {
            return;
        }
        let bytes = Self::transmit_to_peer(
            &self.socket,
            &self.checksum,
            self.is_v6,
            peer,
            &mut self.counters,
            sent_time,
            &commands,
            now,
            index,
        );
        if self.outgoing_bandwidth > 0 {
            self.bw_tokens -= bytes as f64;
        }
    }

    /// Put a command batch on the wire for one peer and update the counters.
    /// Returns the bytes written, zero on a transmit failure.
    #[allow(clippy::too_many_arguments)]
    fn transmit_to_peer(
        socket: &UdpSocket,
        checksum: &Option<ChecksumHook>,
        is_v6: bool,
        peer: &mut Peer,
        counters: &mut HostStats,
        sent_time: u16,
        commands: &[FramedCommand],
        now: Instant,
        index: usize,
    ) -> u64 {
        let dest = if is_v6 {
            peer.address.to_socket_addr_v6()
        } else {
            peer.address.to_socket_addr()
        };
        match Self::transmit_commands(
            socket,
            checksum,
            dest,
            peer.remote_peer_id,
            sent_time,
            commands,
            peer.mtu as usize,
        ) {
            Ok((datagrams, bytes)) => {
                peer.last_send = now;
                peer.counters.packets_sent += datagrams;
                peer.counters.bytes_sent += bytes;
                counters.packets_sent += datagrams;
                counters.bytes_sent += bytes;
                bytes
            }
            Err(e) => {
                warn!(peer = index, error = %e, "datagram transmit failed");
                0
            }
        }
    }

    /// Encode and send a command batch, splitting into MTU-sized datagrams.
    fn transmit_commands(
        socket: &UdpSocket,
        checksum: &Option<ChecksumHook>,
        dest: std::net::SocketAddr,
        peer_id: u16,
        sent_time: u16,
        commands: &[FramedCommand],
        mtu: usize,
    ) -> std::io::Result<(u64, u64)> {
        let header = DatagramHeader {
            peer_id,
            sent_time,
            has_checksum: checksum.is_some(),
        };
        let mut datagrams = 0u64;
        let mut bytes = 0u64;
        let mut buf = BytesMut::with_capacity(mtu);
        let header_len = header.encoded_len();
        header.encode(&mut buf);

        for command in commands {
            if buf.len() > header_len && buf.len() + command.encoded_len() > mtu {
                bytes += Self::finalize_and_send(socket, checksum, dest, &mut buf)? as u64;
                datagrams += 1;
                header.encode(&mut buf);
            }
            command.encode(&mut buf);
        }
        if buf.len() > header_len {
            bytes += Self::finalize_and_send(socket, checksum, dest, &mut buf)? as u64;
            datagrams += 1;
        }
        Ok((datagrams, bytes))
    }

    fn finalize_and_send(
        socket: &UdpSocket,
        checksum: &Option<ChecksumHook>,
        dest: std::net::SocketAddr,
        buf: &mut BytesMut,
    ) -> std::io::Result<usize> {
        if let Some(hash) = checksum {
            let digest = hash(&buf[..]);
            patch_checksum(&mut buf[..], digest);
        }
        let len = buf.len();
        socket.send_to(&buf[..], dest)?;
        buf.clear();
        Ok(len)
    }

    // ─── Receiving ───────────────────────────────────────────────────────────

    fn poll_socket(&mut self, timeout: Duration) -> Result<Option<(Address, usize)>> {
        let result = if timeout.is_zero() {
            self.socket.set_nonblocking(true)?;
            let r = self.socket.recv_from(&mut self.recv_buf);
            self.socket.set_nonblocking(false)?;
            r
        } else {
            self.socket.set_read_timeout(Some(timeout))?;
            self.socket.recv_from(&mut self.recv_buf)
        };
        match result {
            Ok((len, sender)) => Ok(Some((Address::from(sender), len))),
            Err(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                // ICMP port-unreachable from a departed peer; not fatal.
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset => Ok(None),
                _ => Err(Error::Io(e)),
            },
        }
    }

    fn handle_datagram(&mut self, sender: Address, len: usize) {
        self.counters.packets_received += 1;
        self.counters.bytes_received += len as u64;

        if let Some(hook) = self.intercept.as_mut() {
            if hook(&sender, &self.recv_buf[..len]) {
                trace!(%sender, len, "datagram consumed by intercept hook");
                return;
            }
        }

        let data = self.recv_buf[..len].to_vec();
        let mut cursor: &[u8] = &data;
        let Some((header, checksum)) = DatagramHeader::decode(&mut cursor) else {
            trace!(%sender, len, "malformed datagram dropped");
            return;
        };
        if let Some(hash) = self.checksum.as_ref() {
            if !header.has_checksum {
                return;
            }
            let mut zeroed = data.clone();
            patch_checksum(&mut zeroed, 0);
            if hash(&zeroed) != checksum {
                trace!(%sender, "checksum mismatch, datagram dropped");
                return;
            }
        }

        let route = self.route(header.peer_id, &sender);
        let slot = match route {
            Route::Drop => return,
            Route::Connectionless => None,
            Route::Slot(index) => {
                if let Some(peer) = self.peers.get_mut(index) {
                    peer.last_receive = Instant::now();
                    peer.counters.bytes_received += len as u64;
                }
                Some(index)
            }
        };

        while cursor.has_remaining() {
            let Some(command) = FramedCommand::decode(&mut cursor) else {
                trace!(%sender, "truncated command, rest of datagram dropped");
                break;
            };
            self.handle_command(slot, sender, header.sent_time, command);
        }
    }

    fn route(&self, peer_id: u16, sender: &Address) -> Route {
        if peer_id == PEER_ID_NONE {
            return Route::Connectionless;
        }
        let index = peer_id as usize;
        match self.peers.get(index) {
            Some(peer) if peer.address == *sender => Route::Slot(index),
            _ => Route::Drop,
        }
    }

    fn handle_command(
        &mut self,
        slot: Option<usize>,
        sender: Address,
        sent_time: u16,
        framed: FramedCommand,
    ) {
        let Some(index) = slot else {
            if let Command::Connect(body) = framed.command {
                self.handle_connect(sender, framed.sequence, sent_time, body);
            }
            return;
        };

        let now = Instant::now();
        let now_ms = Self::clock_ms(self.start, now);
        let Some(peer) = self.peers.get_mut(index) else {
            return;
        };
        let handle = peer.handle;
        let kind = framed.command.kind();

        // Connection-level reliable commands carry their own dedup watermark;
        // retransmissions of already-processed sequences are re-acked only.
        // Data-channel commands are acked inside their own arms, once the
        // channel has actually accepted them.
        if kind.wants_ack() && framed.channel_id == CONNECTION_CHANNEL {
            peer.queue_ack(framed.channel_id, framed.sequence, sent_time);
            if !seq_after(framed.sequence, peer.incoming_connection_seq) {
                return;
            }
            peer.incoming_connection_seq = framed.sequence;
        }

        match framed.command {
            Command::Connect(_) => {} // connects are never routed to a slot
            Command::VerifyConnect(body) => {
                if !matches!(
                    peer.state,
                    PeerState::Connecting | PeerState::AcknowledgingConnect
                ) || body.connect_id != peer.connect_id
                {
                    return;
                }
                peer.remote_peer_id = body.outgoing_peer_id;
                peer.channels.truncate(body.channel_count.max(1) as usize);
                peer.mtu = body.mtu.clamp(MIN_MTU, MAX_MTU);
                peer.state = PeerState::ConnectionSucceeded;
                self.events.push_back(Event::Connect {
                    peer: handle,
                    data: 0,
                });
            }
            Command::Ack(body) => {
                let acked = if framed.channel_id == CONNECTION_CHANNEL {
                    peer.connection.ack(body.sequence)
                } else {
                    match peer.channels.get_mut(framed.channel_id as usize) {
                        Some(channel) => channel.outbox.ack(body.sequence),
                        None => None,
                    }
                };
                let Some(acked) = acked else {
                    return;
                };
                if acked.retries == 0 {
                    let rtt_ms = now_ms.wrapping_sub(body.sent_time);
                    peer.rtt.sample(Duration::from_millis(u64::from(rtt_ms)));
                }
                match acked.command.kind() {
                    CommandKind::Connect => {
                        if peer.state == PeerState::Connecting {
                            peer.state = PeerState::AcknowledgingConnect;
                        }
                    }
                    CommandKind::VerifyConnect => {
                        if peer.state == PeerState::AcknowledgingConnect {
                            peer.state = PeerState::ConnectionPending;
                            let data = peer.connect_data;
                            self.events.push_back(Event::Connect { peer: handle, data });
                        }
                    }
                    CommandKind::Disconnect => {
                        if peer.state == PeerState::Disconnecting {
                            peer.state = PeerState::Zombie;
                            let data = peer.event_data;
                            self.events
                                .push_back(Event::Disconnect { peer: handle, data });
                        }
                    }
                    _ => {}
                }
            }
            Command::Ping => {}
            Command::Disconnect { data } => {
                if peer.state.is_active() {
                    peer.state = PeerState::AcknowledgingDisconnect;
                    self.events
                        .push_back(Event::Disconnect { peer: handle, data });
                }
            }
            Command::ConnectionsExceeded => {
                if matches!(
                    peer.state,
                    PeerState::Connecting | PeerState::AcknowledgingConnect
                ) {
                    peer.state = PeerState::Zombie;
                    peer.connection.clear();
                    self.events.push_back(Event::Notify {
                        peer: handle,
                        code: NotifyCode::ConnectionsExceeded,
                    });
                }
            }
            Command::ThrottleConfigure(body) => {
                peer.throttle.apply_wire(body);
            }
            Command::SendReliable { payload } => {
                // Not acked while undeliverable: the sender keeps
                // retransmitting until the state or window admits it.
                if !peer.state.can_send() {
                    return;
                }
                let Some(channel) = peer.channel_mut(framed.channel_id) else {
                    return;
                };
                let mut delivered = Vec::new();
                let outcome =
                    channel.on_reliable(framed.sequence, ReliableItem::Message(payload), &mut delivered);
                if outcome != ReliableOutcome::OutOfWindow {
                    peer.queue_ack(framed.channel_id, framed.sequence, sent_time);
                }
                Self::push_deliveries(&mut self.events, handle, framed.channel_id, delivered);
            }
            Command::SendFragment(body) => {
                if !peer.state.can_send() {
                    return;
                }
                let Some(channel) = peer.channel_mut(framed.channel_id) else {
                    return;
                };
                let mut delivered = Vec::new();
                let outcome =
                    channel.on_reliable(framed.sequence, ReliableItem::Fragment(body), &mut delivered);
                if outcome != ReliableOutcome::OutOfWindow {
                    peer.queue_ack(framed.channel_id, framed.sequence, sent_time);
                }
                Self::push_deliveries(&mut self.events, handle, framed.channel_id, delivered);
            }
            Command::SendUnreliable { payload } => {
                if !peer.state.can_send() {
                    return;
                }
                let Some(channel) = peer.channel_mut(framed.channel_id) else {
                    return;
                };
                let mut delivered = Vec::new();
                channel.on_unreliable(framed.sequence, payload, &mut delivered);
                Self::push_deliveries(&mut self.events, handle, framed.channel_id, delivered);
            }
            Command::SendUnreliableFragment(body) => {
                if !peer.state.can_send() {
                    return;
                }
                let Some(channel) = peer.channel_mut(framed.channel_id) else {
                    return;
                };
                let mut delivered = Vec::new();
                channel.on_unreliable_fragment(body, &mut delivered);
                Self::push_deliveries(&mut self.events, handle, framed.channel_id, delivered);
            }
            Command::SendUnsequenced { payload } => {
                if !peer.state.can_send() {
                    return;
                }
                if peer.admit_unsequenced(framed.sequence) {
                    self.events.push_back(Event::Receive {
                        peer: handle,
                        channel_id: framed.channel_id,
                        packet: Packet::received(payload, PacketFlags::UNSEQUENCED),
                    });
                }
            }
        }
    }

    fn push_deliveries(
        events: &mut std::collections::VecDeque<Event>,
        handle: PeerHandle,
        channel_id: u8,
        delivered: Vec<ChannelDelivery>,
    ) {
        for delivery in delivered {
            let flags = if delivery.reliable {
                PacketFlags::RELIABLE
            } else {
                PacketFlags::NONE
            };
            events.push_back(Event::Receive {
                peer: handle,
                channel_id,
                packet: Packet::received(delivery.payload, flags),
            });
        }
    }

    fn handle_connect(&mut self, sender: Address, sequence: u16, sent_time: u16, body: ConnectBody) {
        if body.version != PROTOCOL_VERSION {
            debug!(%sender, version = body.version, "connect with mismatched protocol version");
            return;
        }
        // Retransmitted connect for an already-allocated slot: re-ack only.
        for (_, peer) in self.peers.iter_mut() {
            if peer.address == sender && peer.connect_id == body.connect_id {
                peer.queue_ack(CONNECTION_CHANNEL, sequence, sent_time);
                return;
            }
        }

        let duplicates = self
            .peers
            .iter()
            .filter(|(_, p)| p.address.same_host(&sender))
            .count();
        let refused = self.refuse_connections
            || self.peers.len() >= self.peer_limit
            || (self.max_duplicate_peers > 0 && duplicates >= self.max_duplicate_peers as usize);
        if refused {
            debug!(%sender, allocated = self.peers.len(), "connection refused");
            let commands = [FramedCommand::connection(0, Command::ConnectionsExceeded)];
            let dest = if self.is_v6 {
                sender.to_socket_addr_v6()
            } else {
                sender.to_socket_addr()
            };
            let sent = Self::clock_ms(self.start, Instant::now());
            let _ = Self::transmit_commands(
                &self.socket,
                &self.checksum,
                dest,
                body.outgoing_peer_id,
                sent,
                &commands,
                DEFAULT_MTU as usize,
            );
            return;
        }

        let now = Instant::now();
        let channel_count = body.channel_count.min(self.channel_limit).max(1);
        let mtu = body.mtu.clamp(MIN_MTU, MAX_MTU);
        let handle = self.allocate_peer(sender, channel_count, body.connect_id, now);
        let index = handle.index as usize;
        if let Some(peer) = self.peers.get_mut(index) {
            peer.state = PeerState::AcknowledgingConnect;
            peer.remote_peer_id = body.outgoing_peer_id;
            peer.mtu = mtu;
            peer.connect_data = body.data;
            peer.incoming_connection_seq = sequence;
            peer.queue_ack(CONNECTION_CHANNEL, sequence, sent_time);
            let rto = peer.rtt.rto();
            let seq = peer.connection.next_sequence();
            peer.connection.enqueue(
                CONNECTION_CHANNEL,
                seq,
                Command::VerifyConnect(VerifyConnectBody {
                    outgoing_peer_id: handle.index as u16,
                    connect_id: body.connect_id,
                    channel_count,
                    mtu,
                }),
                None,
                now,
                rto,
            );
        }
        debug!(%sender, peer = index, channel_count, "incoming connection pending");
        self.flush_peer_at(index, now);
    }
}

/// Check whether a pending reliable command should go on the wire now, and
/// advance its retransmission bookkeeping if so. Returns `Some(true)` for a
/// retransmission, `Some(false)` for a first transmission.
fn transmission_due(pending: &mut PendingReliable, now: Instant) -> Option<bool> {
    match pending.last_sent {
        None => {
            pending.last_sent = Some(now);
            Some(false)
        }
        Some(at) if now.duration_since(at) >= pending.rto => {
            pending.last_sent = Some(now);
            pending.retries += 1;
            pending.rto = (pending.rto * 2).min(MAX_BACKOFF);
            Some(true)
        }
        _ => None,
    }
}
