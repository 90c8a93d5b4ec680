//! # Peers
//!
//! One remote endpoint: the connection state machine, RTT estimation,
//! congestion throttle, channel array and timeout accounting. The peer is a
//! pure state holder; every transition is driven by the host's service loop.
//!
//! Externally a peer is addressed through a generation-tagged [`PeerHandle`]
//! into the host's slot table. A handle outliving its slot fails validation
//! with a stale-handle error instead of touching a recycled peer.

use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

use crate::address::Address;
use crate::channel::{Channel, ReliableOutbox};
use crate::stats::PeerStats;
use crate::throttle::{Throttle, ThrottleConfig};
use crate::wire::{seq_after, seq_distance, FramedCommand, DEFAULT_MTU};

/// Default interval between keep-alive pings on an idle connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(500);
/// Default retry count after which elapsed time is checked against the
/// minimum timeout.
pub const DEFAULT_TIMEOUT_LIMIT: u32 = 32;
/// Default lower bound before a retried command may declare the peer dead.
pub const DEFAULT_TIMEOUT_MINIMUM: Duration = Duration::from_millis(5000);
/// Default hard deadline for any unacknowledged command.
pub const DEFAULT_TIMEOUT_MAXIMUM: Duration = Duration::from_millis(30_000);

/// Size of the unsequenced dedup window, in groups.
const UNSEQUENCED_WINDOW: u16 = 1024;

// ─── Handle ──────────────────────────────────────────────────────────────────

/// A generation-tagged reference into a host's peer table.
///
/// Handles stay valid until the peer's slot is reclaimed; afterwards every
/// operation through the handle reports `StalePeer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PeerHandle {
    /// Slot index within the owning host, also the peer id on the wire.
    pub fn id(&self) -> u32 {
        self.index
    }
}

// ─── State machine ───────────────────────────────────────────────────────────

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    /// Slot exists but no connection was ever attempted.
    Uninitialized,
    /// Terminal resting state after slot reclamation.
    Disconnected,
    /// Outgoing connect sent, awaiting acknowledgment.
    Connecting,
    /// Incoming connect received, verify reply in flight.
    AcknowledgingConnect,
    /// Verify reply acknowledged, waiting for the final confirmation round.
    ConnectionPending,
    /// Verify received on the initiating side, confirmation in flight.
    ConnectionSucceeded,
    /// Fully established.
    Connected,
    /// Graceful teardown deferred until the outgoing queue drains.
    DisconnectLater,
    /// Disconnect command in flight.
    Disconnecting,
    /// Remote-initiated disconnect being acknowledged.
    AcknowledgingDisconnect,
    /// Failed or torn down, awaiting slot reclamation.
    Zombie,
}

impl PeerState {
    /// Whether application data may be sent in this state.
    pub fn can_send(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }

    /// Whether the handshake is still in progress.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            PeerState::Connecting
                | PeerState::AcknowledgingConnect
                | PeerState::ConnectionPending
                | PeerState::ConnectionSucceeded
        )
    }

    /// Whether the slot holds any live protocol state.
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            PeerState::Uninitialized | PeerState::Disconnected | PeerState::Zombie
        )
    }
}

// ─── RTT estimation ──────────────────────────────────────────────────────────

/// Smoothed round-trip estimator (RFC 6298 weights).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

/// Retransmission timeout before the first sample.
const INITIAL_RTO: Duration = Duration::from_millis(500);
const MIN_RTO: Duration = Duration::from_millis(100);
const MAX_RTO: Duration = Duration::from_millis(5000);

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }
}

impl RttEstimator {
    /// Fold in one sample from an unretransmitted command.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
    }

    pub fn rtt(&self) -> Duration {
        self.srtt.unwrap_or(Duration::ZERO)
    }

    /// Current retransmission timeout: `SRTT + 4 * RTTVAR`, clamped.
    pub fn rto(&self) -> Duration {
        match self.srtt {
            None => INITIAL_RTO,
            Some(srtt) => (srtt + 4 * self.rttvar).clamp(MIN_RTO, MAX_RTO),
        }
    }
}

// ─── Unsequenced dedup window ────────────────────────────────────────────────

/// Sliding 1024-entry bitmap deduplicating unsequenced groups.
#[derive(Debug)]
struct UnsequencedWindowState {
    highest: u16,
    bits: [u64; (UNSEQUENCED_WINDOW / 64) as usize],
}

impl UnsequencedWindowState {
    fn new() -> Self {
        UnsequencedWindowState {
            highest: 0,
            bits: [0; (UNSEQUENCED_WINDOW / 64) as usize],
        }
    }

    fn bit(seq: u16) -> (usize, u64) {
        let slot = seq % UNSEQUENCED_WINDOW;
        ((slot / 64) as usize, 1u64 << (slot % 64))
    }

    /// Whether the group should be delivered. Duplicates within the window
    /// and groups older than the window are refused.
    fn admit(&mut self, seq: u16) -> bool {
        if seq_after(seq, self.highest) {
            let advance = seq_distance(seq, self.highest);
            if advance >= UNSEQUENCED_WINDOW {
                self.bits = [0; (UNSEQUENCED_WINDOW / 64) as usize];
            } else {
                // Clear the slots being re-entered by the window's leading edge.
                let mut s = self.highest.wrapping_add(1);
                while s != seq {
                    let (word, mask) = Self::bit(s);
                    self.bits[word] &= !mask;
                    s = s.wrapping_add(1);
                }
                let (word, mask) = Self::bit(seq);
                self.bits[word] &= !mask;
            }
            self.highest = seq;
            let (word, mask) = Self::bit(seq);
            self.bits[word] |= mask;
            true
        } else {
            if seq_distance(self.highest, seq) >= UNSEQUENCED_WINDOW {
                return false;
            }
            let (word, mask) = Self::bit(seq);
            if self.bits[word] & mask != 0 {
                return false;
            }
            self.bits[word] |= mask;
            true
        }
    }
}

// ─── Counters ────────────────────────────────────────────────────────────────

/// Per-peer delivery counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PeerCounters {
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ─── Peer ────────────────────────────────────────────────────────────────────

/// Internal peer record owned by the host's slot table.
#[derive(Debug)]
pub(crate) struct Peer {
    pub handle: PeerHandle,
    pub state: PeerState,
    pub address: Address,
    /// Correlates handshake rounds; random per connection attempt.
    pub connect_id: u32,
    /// Our slot id in the remote host's table.
    pub remote_peer_id: u16,
    pub channels: Vec<Channel>,
    /// Connection-level reliable commands (handshake, ping, disconnect).
    pub connection: ReliableOutbox,
    /// Highest connection-level reliable sequence processed from the remote.
    pub incoming_connection_seq: u16,
    pub rtt: RttEstimator,
    pub throttle: Throttle,
    pub mtu: u16,
    unsequenced_in: UnsequencedWindowState,
    pub next_unsequenced_out: u16,
    /// Acks owed to the remote, drained into the next outgoing datagram.
    pub pending_acks: Vec<(u8, u16, u16)>,
    /// Unreliable-class commands staged for the next flush; never retransmitted.
    pub outgoing_unreliable: Vec<FramedCommand>,
    pub ping_interval: Duration,
    pub timeout_limit: u32,
    pub timeout_minimum: Duration,
    pub timeout_maximum: Duration,
    pub counters: PeerCounters,
    pub user_data: u64,
    pub last_receive: Instant,
    pub last_send: Instant,
    /// Data carried by an outgoing connect, surfaced remotely.
    pub connect_data: u32,
    /// Data carried by a disconnect, surfaced in the Disconnect event.
    pub event_data: u32,
    /// Whether the teardown `Disconnect` command has been queued; it waits
    /// for the data outboxes to drain first.
    pub disconnect_queued: bool,
}

impl Peer {
    pub fn new(
        handle: PeerHandle,
        address: Address,
        channel_count: u8,
        connect_id: u32,
        now: Instant,
    ) -> Self {
        Peer {
            handle,
            state: PeerState::Uninitialized,
            address,
            connect_id,
            remote_peer_id: crate::wire::PEER_ID_NONE,
            channels: (0..channel_count).map(Channel::new).collect(),
            connection: ReliableOutbox::default(),
            incoming_connection_seq: 0,
            rtt: RttEstimator::default(),
            throttle: Throttle::new(ThrottleConfig::default(), now),
            mtu: DEFAULT_MTU,
            unsequenced_in: UnsequencedWindowState::new(),
            next_unsequenced_out: 0,
            pending_acks: Vec::new(),
            outgoing_unreliable: Vec::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            timeout_limit: DEFAULT_TIMEOUT_LIMIT,
            timeout_minimum: DEFAULT_TIMEOUT_MINIMUM,
            timeout_maximum: DEFAULT_TIMEOUT_MAXIMUM,
            counters: PeerCounters::default(),
            user_data: 0,
            last_receive: now,
            last_send: now,
            connect_data: 0,
            event_data: 0,
            disconnect_queued: false,
        }
    }

    pub fn channel_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.channels.get_mut(id as usize)
    }

    /// Assign the next outgoing unsequenced group number.
    pub fn next_unsequenced(&mut self) -> u16 {
        self.next_unsequenced_out = self.next_unsequenced_out.wrapping_add(1);
        self.next_unsequenced_out
    }

    /// Dedup an incoming unsequenced group.
    pub fn admit_unsequenced(&mut self, seq: u16) -> bool {
        self.unsequenced_in.admit(seq)
    }

    pub fn queue_ack(&mut self, channel_id: u8, sequence: u16, sent_time: u16) {
        self.pending_acks.push((channel_id, sequence, sent_time));
    }

    /// Whether any reliable command has exhausted its retry budget.
    pub fn timed_out(&self, now: Instant) -> bool {
        let exhausted = |queued_at: Instant, retries: u32| {
            let elapsed = now.duration_since(queued_at);
            (retries >= self.timeout_limit && elapsed >= self.timeout_minimum)
                || elapsed >= self.timeout_maximum
        };
        self.connection
            .pending()
            .any(|p| exhausted(p.queued_at, p.retries))
            || self
                .channels
                .iter()
                .any(|c| c.outbox.pending().any(|p| exhausted(p.queued_at, p.retries)))
    }

    /// Whether every outgoing queue has drained (graceful-disconnect gate).
    pub fn outgoing_drained(&self) -> bool {
        self.connection.is_empty()
            && self.outgoing_unreliable.is_empty()
            && self.channels.iter().all(|c| c.outbox.is_empty())
    }

    /// Whether every data-channel queue has drained. The connection-level
    /// outbox is excluded so a pending ping cannot stall teardown.
    pub fn data_drained(&self) -> bool {
        self.outgoing_unreliable.is_empty() && self.channels.iter().all(|c| c.outbox.is_empty())
    }

    /// Whether an idle keep-alive ping is due.
    pub fn ping_due(&self, now: Instant) -> bool {
        self.state == PeerState::Connected
            && now.duration_since(self.last_send) >= self.ping_interval
            && self.connection.is_empty()
    }

    /// Drop every queue and timer and park the slot, without notifying the
    /// remote side.
    pub fn reset(&mut self) {
        self.state = PeerState::Disconnected;
        self.disconnect_queued = false;
        self.connection.clear();
        self.pending_acks.clear();
        self.outgoing_unreliable.clear();
        for channel in &mut self.channels {
            channel.reset();
        }
    }

    pub fn set_timeout(&mut self, limit: u32, minimum: Duration, maximum: Duration) {
        self.timeout_limit = limit;
        self.timeout_minimum = minimum;
        self.timeout_maximum = maximum;
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            state: self.state,
            packets_sent: self.counters.packets_sent,
            packets_lost: self.counters.packets_lost,
            bytes_sent: self.counters.bytes_sent,
            bytes_received: self.counters.bytes_received,
            rtt: self.rtt.rtt(),
            throttle: self.throttle.value(),
            mtu: self.mtu,
            pending_reliable: self.connection.len()
                + self.channels.iter().map(|c| c.outbox.len()).sum::<usize>(),
        }
    }
}
