//! # tether-transport
//!
//! A connection-oriented, message-based transport over UDP: hosts own a
//! socket and a peer table, peers carry independent channels with
//! per-message delivery classes (reliable-ordered, unreliable-sequenced,
//! unsequenced), oversized messages fragment transparently, and a
//! congestion throttle sheds best-effort traffic under observed loss.
//!
//! The core is single-threaded and poll-driven: all I/O, timers and state
//! transitions happen inside [`Host::service`] on whichever thread the
//! caller chooses. No threads are spawned and nothing blocks except the
//! bounded socket poll.
//!
//! ## Module map
//!
//! | Module     | Purpose                                             |
//! |------------|-----------------------------------------------------|
//! | `address`  | Endpoint addresses, IPv4-mapped IPv6 representation |
//! | `packet`   | Shared payload buffers and delivery flags           |
//! | `wire`     | Datagram framing and typed protocol commands        |
//! | `channel`  | Sequencing, reordering, fragment reassembly         |
//! | `peer`     | Connection state machine, RTT, timeouts             |
//! | `throttle` | Loss-driven send-probability scale                  |
//! | `host`     | Socket ownership, service loop, event queue         |
//! | `event`    | Service step results                                |
//! | `stats`    | Serializable counter snapshots                      |
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_transport::{Address, Event, Host, HostConfig, Packet, PacketFlags};
//!
//! # fn main() -> tether_transport::Result<()> {
//! let mut host = Host::new(HostConfig {
//!     address: Address::new("127.0.0.1", 0).unwrap(),
//!     ..HostConfig::default()
//! })?;
//! let server = Address::new("127.0.0.1", 9050).unwrap();
//! let peer = host.connect(server, 2, 0)?;
//!
//! loop {
//!     match host.service(Duration::from_millis(15))? {
//!         Some(Event::Connect { .. }) => {
//!             let packet = Packet::new(b"hello".to_vec(), PacketFlags::RELIABLE)?;
//!             host.send(peer, 0, &packet)?;
//!         }
//!         Some(Event::Receive { packet, .. }) => {
//!             println!("got {} bytes", packet.len()?);
//!         }
//!         _ => {}
//!     }
//! }
//! # }
//! ```

pub mod address;
mod channel;
pub mod error;
pub mod event;
pub mod host;
pub mod packet;
pub mod peer;
pub mod stats;
pub mod throttle;
mod wire;

pub use address::Address;
pub use error::{Error, Result};
pub use event::{Event, NotifyCode};
pub use host::{ChecksumHook, Host, HostConfig, InterceptHook, MAX_CHANNELS, MAX_PEERS};
pub use packet::{Packet, PacketFlags, MAX_PACKET_SIZE};
pub use peer::{
    PeerHandle, PeerState, DEFAULT_PING_INTERVAL, DEFAULT_TIMEOUT_LIMIT, DEFAULT_TIMEOUT_MAXIMUM,
    DEFAULT_TIMEOUT_MINIMUM,
};
pub use stats::{HostStats, PeerStats};
pub use throttle::ThrottleConfig;

use std::fmt;

/// Core version triple, reported to companion builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const CURRENT: Version = Version {
        major: 2,
        minor: 3,
        patch: 1,
    };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The version this crate was built as.
pub fn linked_version() -> Version {
    Version::CURRENT
}

/// Refuse to run against a companion build expecting an incompatible core:
/// the major version must match and the core must be at least as new as the
/// required minor/patch.
pub fn ensure_compatible(required: Version) -> Result<()> {
    let core = Version::CURRENT;
    let compatible = core.major == required.major
        && (core.minor, core.patch) >= (required.minor, required.patch);
    if compatible {
        Ok(())
    } else {
        Err(Error::VersionMismatch { core, required })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_formats_as_triple() {
        assert_eq!(Version::CURRENT.to_string(), "2.3.1");
        assert_eq!(linked_version(), Version::CURRENT);
    }

    #[test]
    fn compatibility_rules() {
        assert!(ensure_compatible(Version::CURRENT).is_ok());
        assert!(ensure_compatible(Version {
            minor: 0,
            ..Version::CURRENT
        })
        .is_ok());
        assert!(ensure_compatible(Version {
            major: 3,
            ..Version::CURRENT
        })
        .is_err());
        assert!(ensure_compatible(Version {
            minor: 9,
            ..Version::CURRENT
        })
        .is_err());
    }
}
