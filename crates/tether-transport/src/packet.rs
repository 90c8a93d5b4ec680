//! # Packets
//!
//! An immutable-once-created payload buffer with delivery-flag metadata.
//!
//! A `Packet` is a cheap handle over a shared buffer. Handing it to a send
//! or broadcast operation transfers a reference to the transport core, which
//! keeps it alive while it sits on a retransmission queue and releases it
//! after acknowledgment (reliable) or immediately after the datagram is
//! written (unreliable). The free callback, if set, fires exactly once when
//! the last reference drops.

use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{Error, Result};

/// Largest accepted payload: 32 MiB.
pub const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

// ─── Flags ──────────────────────────────────────────────────────────────────

/// Delivery-class flags attached to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// Best-effort sequenced delivery (no flags).
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Guaranteed in-order delivery with retransmission.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    /// Best-effort delivery that bypasses sequencing entirely.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);
    /// The caller retains buffer ownership; the core never copies it.
    pub const NO_ALLOCATE: PacketFlags = PacketFlags(1 << 2);
    /// Allow fragmentation of oversized unreliable payloads.
    pub const UNRELIABLE_FRAGMENTED: PacketFlags = PacketFlags(1 << 3);
    /// Bypass flush batching — transmit at the next opportunity.
    pub const INSTANT: PacketFlags = PacketFlags(1 << 4);
    /// Exempt from the congestion throttle gate.
    pub const UNTHROTTLED: PacketFlags = PacketFlags(1 << 5);

    /// Whether all flags in `other` are set.
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation (wire form).
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Reconstruct from raw bits, dropping unknown bits.
    pub fn from_bits_truncate(bits: u32) -> Self {
        PacketFlags(bits & 0x3F)
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

// ─── Packet ─────────────────────────────────────────────────────────────────

type FreeCallback = Box<dyn FnOnce() + Send>;

struct PacketInner {
    data: Bytes,
    flags: PacketFlags,
    free_callback: Mutex<Option<FreeCallback>>,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.free_callback.get_mut() {
            if let Some(cb) = slot.take() {
                cb();
            }
        }
    }
}

/// A reference-counted payload with delivery metadata.
///
/// Clones share the same buffer. `dispose` releases this handle's reference
/// and is idempotent; accessing a disposed packet is a usage error.
pub struct Packet {
    inner: Option<Arc<PacketInner>>,
}

impl Packet {
    /// Create a packet from an owned buffer.
    pub fn new(data: impl Into<Bytes>, flags: PacketFlags) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_PACKET_SIZE {
            return Err(Error::InvalidArgument("payload exceeds MAX_PACKET_SIZE"));
        }
        Ok(Packet {
            inner: Some(Arc::new(PacketInner {
                data,
                flags,
                free_callback: Mutex::new(None),
            })),
        })
    }

    /// Create a packet over a sub-range of a shared buffer without copying.
    pub fn from_range(buf: &Bytes, offset: usize, length: usize, flags: PacketFlags) -> Result<Self> {
        let end = offset
            .checked_add(length)
            .ok_or(Error::InvalidArgument("offset + length overflows"))?;
        if end > buf.len() {
            return Err(Error::InvalidArgument("offset + length exceeds buffer"));
        }
        Packet::new(buf.slice(offset..end), flags)
    }

    /// Create a packet over a static buffer. The core never copies the
    /// bytes, matching the no-allocate contract.
    pub fn from_static(data: &'static [u8], flags: PacketFlags) -> Result<Self> {
        Packet::new(Bytes::from_static(data), flags | PacketFlags::NO_ALLOCATE)
    }

    /// Wrap a received payload for delivery to the application.
    pub(crate) fn received(data: Bytes, flags: PacketFlags) -> Self {
        Packet {
            inner: Some(Arc::new(PacketInner {
                data,
                flags,
                free_callback: Mutex::new(None),
            })),
        }
    }

    /// Whether this handle still refers to a live packet.
    pub fn is_set(&self) -> bool {
        self.inner.is_some()
    }

    /// Release this handle's reference. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        self.inner = None;
    }

    /// The payload bytes.
    pub fn data(&self) -> Result<&[u8]> {
        self.inner
            .as_deref()
            .map(|i| &i.data[..])
            .ok_or(Error::PacketNotCreated)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> Result<usize> {
        self.inner
            .as_deref()
            .map(|i| i.data.len())
            .ok_or(Error::PacketNotCreated)
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|l| l == 0)
    }

    /// The delivery flags.
    pub fn flags(&self) -> Result<PacketFlags> {
        self.inner
            .as_deref()
            .map(|i| i.flags)
            .ok_or(Error::PacketNotCreated)
    }

    /// Whether any other handle (for example a retransmission queue entry)
    /// still references the payload.
    pub fn has_references(&self) -> Result<bool> {
        self.inner
            .as_ref()
            .map(|i| Arc::strong_count(i) > 1)
            .ok_or(Error::PacketNotCreated)
    }

    /// Register a callback fired exactly once when the last reference to the
    /// payload is released.
    pub fn set_free_callback(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        let inner = self.inner.as_deref().ok_or(Error::PacketNotCreated)?;
        if let Ok(mut slot) = inner.free_callback.lock() {
            *slot = Some(Box::new(callback));
        }
        Ok(())
    }

    /// Shared view of the payload for the wire encoder.
    pub(crate) fn payload(&self) -> Result<Bytes> {
        self.inner
            .as_deref()
            .map(|i| i.data.clone())
            .ok_or(Error::PacketNotCreated)
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        Packet {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.as_deref() {
            Some(inner) => f
                .debug_struct("Packet")
                .field("len", &inner.data.len())
                .field("flags", &inner.flags)
                .finish(),
            None => f.write_str("Packet(disposed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn create_and_read() {
        let pkt = Packet::new(b"hello".to_vec(), PacketFlags::RELIABLE).unwrap();
        assert_eq!(pkt.data().unwrap(), b"hello");
        assert_eq!(pkt.len().unwrap(), 5);
        assert!(pkt.flags().unwrap().contains(PacketFlags::RELIABLE));
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut pkt = Packet::new(b"x".to_vec(), PacketFlags::NONE).unwrap();
        pkt.dispose();
        pkt.dispose();
        assert!(!pkt.is_set());
        assert!(matches!(pkt.data(), Err(Error::PacketNotCreated)));
        assert!(matches!(pkt.len(), Err(Error::PacketNotCreated)));
    }

    #[test]
    fn range_bounds_checked() {
        let buf = Bytes::from_static(b"++Hello World++");
        let pkt = Packet::from_range(&buf, 2, 11, PacketFlags::NONE).unwrap();
        assert_eq!(pkt.data().unwrap(), b"Hello World");

        assert!(Packet::from_range(&buf, 10, 10, PacketFlags::NONE).is_err());
        assert!(Packet::from_range(&buf, usize::MAX, 2, PacketFlags::NONE).is_err());
    }

    #[test]
    fn references_tracked_across_clones() {
        let pkt = Packet::new(b"shared".to_vec(), PacketFlags::RELIABLE).unwrap();
        assert!(!pkt.has_references().unwrap());

        let engine_ref = pkt.clone();
        assert!(pkt.has_references().unwrap());

        drop(engine_ref);
        assert!(!pkt.has_references().unwrap());
    }

    #[test]
    fn free_callback_fires_once_on_last_release() {
        static FIRED: AtomicU32 = AtomicU32::new(0);

        let pkt = Packet::new(b"cb".to_vec(), PacketFlags::NONE).unwrap();
        pkt.set_free_callback(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let clone = pkt.clone();
        drop(pkt);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0, "still referenced");
        drop(clone);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_payload_rejected() {
        let data = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(Packet::new(data, PacketFlags::NONE).is_err());
    }

    #[test]
    fn flags_roundtrip_bits() {
        let flags = PacketFlags::RELIABLE | PacketFlags::INSTANT;
        assert_eq!(PacketFlags::from_bits_truncate(flags.bits()), flags);
        assert!(flags.contains(PacketFlags::RELIABLE));
        assert!(!flags.contains(PacketFlags::UNSEQUENCED));
    }
}
