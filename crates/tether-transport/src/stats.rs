//! # Statistics
//!
//! Serializable snapshots of host and peer counters, taken on demand.

use std::time::Duration;

use serde::Serialize;

use crate::peer::PeerState;

/// Aggregate counters for a host.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HostStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Peers currently in the `Connected` state.
    pub peers_connected: usize,
    /// Allocated peer slots, connected or not.
    pub peers_allocated: usize,
}

/// Snapshot of one peer's delivery state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PeerStats {
    pub state: PeerState,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Smoothed round-trip time.
    #[serde(with = "duration_ms")]
    pub rtt: Duration,
    /// Current congestion throttle value.
    pub throttle: u32,
    pub mtu: u16,
    /// Reliable commands awaiting acknowledgment across all outboxes.
    pub pending_reliable: usize,
}

mod duration_ms {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
