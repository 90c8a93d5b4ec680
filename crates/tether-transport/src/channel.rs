//! # Channels
//!
//! Per-(peer, channel-id) sequencing state: independent reliable and
//! unreliable sub-streams, a reorder buffer for early reliable arrivals,
//! fragment reassembly for oversized messages, and the reliable outbox that
//! holds commands in flight until acknowledged.
//!
//! Channels are pure state machines. They never touch the socket or the
//! clock beyond timestamps handed in by the service loop.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use tracing::trace;

use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::wire::{seq_after, seq_distance, Command, FragmentBody, RELIABLE_WINDOW};

// ─── Reliable outbox ─────────────────────────────────────────────────────────

/// A reliable command in flight, kept until its ack arrives.
#[derive(Debug)]
pub(crate) struct PendingReliable {
    pub sequence: u16,
    pub channel_id: u8,
    pub command: Command,
    /// Keeps the application's packet referenced while unacknowledged.
    pub packet: Option<Packet>,
    pub queued_at: Instant,
    pub last_sent: Option<Instant>,
    pub rto: Duration,
    pub retries: u32,
}

/// Outgoing reliable sequence space plus its unacknowledged queue. Used by
/// every channel and, separately, by the peer's connection-level commands.
#[derive(Debug, Default)]
pub(crate) struct ReliableOutbox {
    next_sequence: u16,
    pending: VecDeque<PendingReliable>,
}

impl ReliableOutbox {
    /// Assign the next outgoing reliable sequence number (starts at 1).
    pub fn next_sequence(&mut self) -> u16 {
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.next_sequence
    }

    pub fn enqueue(
        &mut self,
        channel_id: u8,
        sequence: u16,
        command: Command,
        packet: Option<Packet>,
        now: Instant,
        rto: Duration,
    ) {
        self.pending.push_back(PendingReliable {
            sequence,
            channel_id,
            command,
            packet,
            queued_at: now,
            last_sent: None,
            rto,
            retries: 0,
        });
    }

    /// Remove the entry matching an acknowledgment. Returns it so the caller
    /// can sample RTT from an unretransmitted command.
    pub fn ack(&mut self, sequence: u16) -> Option<PendingReliable> {
        let idx = self.pending.iter().position(|p| p.sequence == sequence)?;
        self.pending.remove(idx)
    }

    pub fn pending_mut(&mut self) -> impl Iterator<Item = &mut PendingReliable> {
        self.pending.iter_mut()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingReliable> {
        self.pending.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ─── Fragment reassembly ─────────────────────────────────────────────────────

/// In-progress reassembly of one fragmented message.
#[derive(Debug)]
struct FragmentAssembly {
    start_sequence: u16,
    fragment_count: u32,
    received: Vec<bool>,
    received_count: u32,
    buffer: Vec<u8>,
}

impl FragmentAssembly {
    fn new(body: &FragmentBody) -> Option<Self> {
        let total = body.total_length as usize;
        if total > MAX_PACKET_SIZE || body.fragment_count == 0 || body.fragment_count > 1 << 16 {
            return None;
        }
        Some(FragmentAssembly {
            start_sequence: body.start_sequence,
            fragment_count: body.fragment_count,
            received: vec![false; body.fragment_count as usize],
            received_count: 0,
            buffer: vec![0; total],
        })
    }

    /// Copy a fragment into place. Returns the assembled message once every
    /// fragment of the group has arrived.
    fn insert(&mut self, body: &FragmentBody) -> Option<Bytes> {
        if body.fragment_count != self.fragment_count
            || body.fragment_number >= self.fragment_count
            || body.total_length as usize != self.buffer.len()
        {
            return None;
        }
        let offset = body.fragment_offset as usize;
        let end = offset.checked_add(body.payload.len())?;
        if end > self.buffer.len() {
            return None;
        }
        let slot = &mut self.received[body.fragment_number as usize];
        if !*slot {
            *slot = true;
            self.received_count += 1;
            self.buffer[offset..end].copy_from_slice(&body.payload);
        }
        if self.received_count == self.fragment_count {
            Some(Bytes::from(std::mem::take(&mut self.buffer)))
        } else {
            None
        }
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// An item traveling the ordered reliable stream.
#[derive(Debug)]
pub(crate) enum ReliableItem {
    Message(Bytes),
    Fragment(FragmentBody),
}

/// How an incoming reliable command was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReliableOutcome {
    /// In order (possibly unblocking buffered successors).
    Delivered,
    /// Ahead of the expected sequence; held in the reorder buffer.
    Buffered,
    /// Duplicate or stale; dropped, but still acknowledged.
    Duplicate,
    /// Beyond the reliable window; dropped without acknowledgment.
    OutOfWindow,
}

/// A message ready for the application, produced by channel processing.
#[derive(Debug)]
pub(crate) struct ChannelDelivery {
    pub payload: Bytes,
    pub reliable: bool,
}

/// One ordered sub-stream of a peer's connection.
#[derive(Debug)]
pub(crate) struct Channel {
    id: u8,
    pub(crate) outbox: ReliableOutbox,
    next_unreliable_out: u16,
    /// Next reliable sequence expected from the remote.
    expected_reliable: u16,
    reorder: BTreeMap<u16, ReliableItem>,
    /// Highest unreliable sequence seen from the remote.
    last_unreliable_in: u16,
    reliable_assembly: Option<FragmentAssembly>,
    unreliable_assembly: Option<FragmentAssembly>,
}

impl Channel {
    pub fn new(id: u8) -> Self {
        Channel {
            id,
            outbox: ReliableOutbox::default(),
            next_unreliable_out: 0,
            expected_reliable: 1,
            reorder: BTreeMap::new(),
            last_unreliable_in: 0,
            reliable_assembly: None,
            unreliable_assembly: None,
        }
    }

    pub fn next_unreliable_sequence(&mut self) -> u16 {
        self.next_unreliable_out = self.next_unreliable_out.wrapping_add(1);
        self.next_unreliable_out
    }

    /// Process an incoming reliable item, appending any application-ready
    /// messages to `out` in delivery order.
    pub fn on_reliable(
        &mut self,
        sequence: u16,
        item: ReliableItem,
        out: &mut Vec<ChannelDelivery>,
    ) -> ReliableOutcome {
        let expected = self.expected_reliable;
        if sequence == expected {
            self.deliver(item, out);
            self.expected_reliable = self.expected_reliable.wrapping_add(1);
            self.drain_reorder(out);
            ReliableOutcome::Delivered
        } else if seq_after(sequence, expected) {
            if seq_distance(sequence, expected) >= RELIABLE_WINDOW {
                trace!(channel = self.id, sequence, expected, "reliable out of window");
                return ReliableOutcome::OutOfWindow;
            }
            self.reorder.entry(sequence).or_insert(item);
            ReliableOutcome::Buffered
        } else {
            ReliableOutcome::Duplicate
        }
    }

    fn drain_reorder(&mut self, out: &mut Vec<ChannelDelivery>) {
        while let Some(item) = self.reorder.remove(&self.expected_reliable) {
            self.deliver(item, out);
            self.expected_reliable = self.expected_reliable.wrapping_add(1);
        }
    }

    fn deliver(&mut self, item: ReliableItem, out: &mut Vec<ChannelDelivery>) {
        match item {
            ReliableItem::Message(payload) => out.push(ChannelDelivery {
                payload,
                reliable: true,
            }),
            ReliableItem::Fragment(body) => {
                let stale = match &self.reliable_assembly {
                    Some(asm) => asm.start_sequence != body.start_sequence,
                    None => true,
                };
                if stale {
                    self.reliable_assembly = FragmentAssembly::new(&body);
                }
                if let Some(asm) = self.reliable_assembly.as_mut() {
                    if let Some(payload) = asm.insert(&body) {
                        self.reliable_assembly = None;
                        out.push(ChannelDelivery {
                            payload,
                            reliable: true,
                        });
                    }
                }
            }
        }
    }

    /// Process an incoming unreliable message. Stale sequences are dropped.
    pub fn on_unreliable(
        &mut self,
        sequence: u16,
        payload: Bytes,
        out: &mut Vec<ChannelDelivery>,
    ) {
        if !seq_after(sequence, self.last_unreliable_in) {
            return;
        }
        self.last_unreliable_in = sequence;
        out.push(ChannelDelivery {
            payload,
            reliable: false,
        });
    }

    /// Process an unreliable fragment. A newer group supersedes an incomplete
    /// one; a dropped fragment therefore drops its whole message.
    pub fn on_unreliable_fragment(
        &mut self,
        body: FragmentBody,
        out: &mut Vec<ChannelDelivery>,
    ) {
        if !seq_after(body.start_sequence, self.last_unreliable_in)
            && body.start_sequence != self.last_unreliable_in
        {
            return;
        }
        let superseded = match &self.unreliable_assembly {
            Some(asm) => seq_after(body.start_sequence, asm.start_sequence),
            None => true,
        };
        if superseded {
            self.unreliable_assembly = FragmentAssembly::new(&body);
            self.last_unreliable_in = body.start_sequence;
        }
        let matches_group = self
            .unreliable_assembly
            .as_ref()
            .is_some_and(|asm| asm.start_sequence == body.start_sequence);
        if !matches_group {
            return;
        }
        if let Some(asm) = self.unreliable_assembly.as_mut() {
            if let Some(payload) = asm.insert(&body) {
                self.unreliable_assembly = None;
                out.push(ChannelDelivery {
                    payload,
                    reliable: false,
                });
            }
        }
    }

    /// Drop all in-flight and buffered state, keeping sequence counters.
    pub fn reset(&mut self) {
        self.outbox.clear();
        self.reorder.clear();
        self.reliable_assembly = None;
        self.unreliable_assembly = None;
    }
}
