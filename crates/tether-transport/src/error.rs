//! Error types for the tether transport core.
//!
//! Configuration and usage mistakes fail synchronously at the call site.
//! Protocol-level conditions (loss, timeouts, rejected handshakes, checksum
//! mismatches) never surface here — they are events or silent drops.

use std::io;

/// Errors returned by host, peer and packet operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Out-of-range configuration value, caught before any I/O.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The UDP socket could not be bound to the requested address.
    #[error("socket bind failed for {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A socket operation failed outside of bind.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// An invalid argument was passed by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The peer handle refers to a slot that was reclaimed.
    #[error("stale peer handle")]
    StalePeer,

    /// The operation requires a connected peer.
    #[error("peer is not connected")]
    PeerNotConnected,

    /// The packet was disposed or never created.
    #[error("packet not created")]
    PacketNotCreated,

    /// The companion build was compiled against an incompatible core version.
    #[error("version mismatch: core is {core}, companion requires {required}")]
    VersionMismatch {
        core: crate::Version,
        required: crate::Version,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error indicates a failed socket bind, the most common
    /// operational fault when standing up a host.
    pub fn is_bind_failure(&self) -> bool {
        matches!(self, Error::BindFailed { .. })
    }
}
