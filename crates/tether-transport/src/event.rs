//! # Events
//!
//! The tagged results of service steps, drained one per call.

use crate::packet::Packet;
use crate::peer::PeerHandle;

/// Out-of-band signals distinct from data, connect and disconnect events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyCode {
    /// The remote host is at capacity and refused the connection attempt.
    ConnectionsExceeded,
}

/// One externally visible outcome of a service step.
#[derive(Debug)]
pub enum Event {
    /// A connection handshake completed; the peer is now `Connected`.
    Connect {
        peer: PeerHandle,
        /// Opaque value the remote supplied with its connect request, zero
        /// for outgoing connections.
        data: u32,
    },
    /// The remote disconnected, gracefully or by request.
    Disconnect {
        peer: PeerHandle,
        /// Opaque value carried by the disconnect command.
        data: u32,
    },
    /// A message arrived on a channel.
    Receive {
        peer: PeerHandle,
        channel_id: u8,
        packet: Packet,
    },
    /// The peer stopped acknowledging and was declared failed.
    Timeout { peer: PeerHandle },
    /// An out-of-band protocol signal.
    Notify { peer: PeerHandle, code: NotifyCode },
}

impl Event {
    /// The peer this event concerns.
    pub fn peer(&self) -> PeerHandle {
        match self {
            Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::Receive { peer, .. }
            | Event::Timeout { peer }
            | Event::Notify { peer, .. } => *peer,
        }
    }
}
