//! # Tether Wire Format
//!
//! Lightweight datagram framing for the transport protocol.
//!
//! ## Datagram layout
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|C|  resv   |        Target Peer ID (16)    |  Sent Time ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  ... (16)     |      Checksum (64, present when C=1)  ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! followed by one or more commands, each a 4-byte command header
//! (kind, channel, sequence) plus a typed body. Several commands are batched
//! per datagram up to the peer MTU.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version carried in the datagram flags and the connect handshake.
pub const PROTOCOL_VERSION: u8 = 2;

/// Target peer id for connectionless datagrams (initial connects, rejects).
pub const PEER_ID_NONE: u16 = 0xFFFF;

/// Channel id for connection-level commands (handshake, ping, disconnect).
pub const CONNECTION_CHANNEL: u8 = 0xFF;

/// Datagram header size without checksum.
pub const DATAGRAM_HEADER_SIZE: usize = 5;

/// Byte offset of the checksum slot within a datagram.
pub const CHECKSUM_OFFSET: usize = DATAGRAM_HEADER_SIZE;

/// Size of the optional checksum slot.
pub const CHECKSUM_SIZE: usize = 8;

/// Command header size (kind + channel + sequence).
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Incoming reliable sequences further than this ahead of the next expected
/// sequence are discarded (reliable window rule).
pub const RELIABLE_WINDOW: u16 = 0x1000;

/// Default, minimum and maximum MTU negotiated for a peer.
pub const DEFAULT_MTU: u16 = 1400;
pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 4096;

// ─── Sequence arithmetic ─────────────────────────────────────────────────────

/// Whether sequence `a` comes after `b` in the wrapping u16 space.
#[inline]
pub fn seq_after(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Forward distance from `b` to `a` in the wrapping u16 space.
#[inline]
pub fn seq_distance(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b)
}

// ─── Datagram header ─────────────────────────────────────────────────────────

/// Header present on every tether datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Slot id of the receiving peer, or [`PEER_ID_NONE`].
    pub peer_id: u16,
    /// Low 16 bits of the sender's millisecond clock.
    pub sent_time: u16,
    /// Whether an 8-byte checksum slot follows the fixed header.
    pub has_checksum: bool,
}

impl DatagramHeader {
    /// Encode into a buffer. When `has_checksum` is set an all-zero checksum
    /// slot is emitted; the caller patches it after computing the digest.
    pub fn encode(&self, buf: &mut BytesMut) {
        let flags = (PROTOCOL_VERSION & 0x03) << 6 | ((self.has_checksum as u8) << 5);
        buf.put_u8(flags);
        buf.put_u16(self.peer_id);
        buf.put_u16(self.sent_time);
        if self.has_checksum {
            buf.put_u64(0);
        }
    }

    /// Decode from a buffer. Returns `None` for short datagrams or version
    /// mismatches. On success also returns the checksum value (zero when the
    /// slot is absent).
    pub fn decode(buf: &mut impl Buf) -> Option<(Self, u64)> {
        if buf.remaining() < DATAGRAM_HEADER_SIZE {
            return None;
        }
        let flags = buf.get_u8();
        if (flags >> 6) & 0x03 != PROTOCOL_VERSION & 0x03 {
            return None;
        }
        let has_checksum = (flags >> 5) & 1 == 1;
        let peer_id = buf.get_u16();
        let sent_time = buf.get_u16();
        let checksum = if has_checksum {
            if buf.remaining() < CHECKSUM_SIZE {
                return None;
            }
            buf.get_u64()
        } else {
            0
        };
        Some((
            DatagramHeader {
                peer_id,
                sent_time,
                has_checksum,
            },
            checksum,
        ))
    }

    /// Encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_SIZE + if self.has_checksum { CHECKSUM_SIZE } else { 0 }
    }
}

/// Overwrite the checksum slot of an encoded datagram in place.
pub fn patch_checksum(datagram: &mut [u8], checksum: u64) {
    let slot = &mut datagram[CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_SIZE];
    slot.copy_from_slice(&checksum.to_be_bytes());
}

// ─── Command kinds ───────────────────────────────────────────────────────────

/// Protocol command discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    Connect = 0x01,
    VerifyConnect = 0x02,
    Ack = 0x03,
    Ping = 0x04,
    Disconnect = 0x05,
    ConnectionsExceeded = 0x06,
    SendReliable = 0x07,
    SendUnreliable = 0x08,
    SendUnsequenced = 0x09,
    SendFragment = 0x0A,
    SendUnreliableFragment = 0x0B,
    ThrottleConfigure = 0x0C,
}

impl CommandKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(CommandKind::Connect),
            0x02 => Some(CommandKind::VerifyConnect),
            0x03 => Some(CommandKind::Ack),
            0x04 => Some(CommandKind::Ping),
            0x05 => Some(CommandKind::Disconnect),
            0x06 => Some(CommandKind::ConnectionsExceeded),
            0x07 => Some(CommandKind::SendReliable),
            0x08 => Some(CommandKind::SendUnreliable),
            0x09 => Some(CommandKind::SendUnsequenced),
            0x0A => Some(CommandKind::SendFragment),
            0x0B => Some(CommandKind::SendUnreliableFragment),
            0x0C => Some(CommandKind::ThrottleConfigure),
            _ => None,
        }
    }

    /// Whether the receiver must acknowledge this command.
    pub fn wants_ack(self) -> bool {
        matches!(
            self,
            CommandKind::Connect
                | CommandKind::VerifyConnect
                | CommandKind::Ping
                | CommandKind::Disconnect
                | CommandKind::SendReliable
                | CommandKind::SendFragment
                | CommandKind::ThrottleConfigure
        )
    }
}

// ─── Command bodies ──────────────────────────────────────────────────────────

/// Connection request, sent connectionless until verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    /// Protocol version of the initiator.
    pub version: u8,
    /// Slot id the initiator allocated for this connection.
    pub outgoing_peer_id: u16,
    /// Random id correlating retransmitted connects and the verify reply.
    pub connect_id: u32,
    /// Requested channel count (1..=255).
    pub channel_count: u8,
    /// Initiator's MTU.
    pub mtu: u16,
    /// Opaque user data surfaced in the acceptor's Connect event.
    pub data: u32,
}

/// Handshake acceptance, carrying the negotiated parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyConnectBody {
    /// Slot id the acceptor allocated for this connection.
    pub outgoing_peer_id: u16,
    /// Echo of the connect id.
    pub connect_id: u32,
    /// Negotiated channel count.
    pub channel_count: u8,
    /// Negotiated MTU.
    pub mtu: u16,
}

/// Acknowledgment of one reliable command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBody {
    /// Sequence number being acknowledged (in the channel named by the
    /// command header).
    pub sequence: u16,
    /// Echo of the acknowledged datagram's sent time.
    pub sent_time: u16,
}

/// Fragment of an oversized message. Reliable and unreliable fragments share
/// this layout; the command kind selects the semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBody {
    /// Sequence number of the group's first fragment (group id).
    pub start_sequence: u16,
    /// Total fragments in the group.
    pub fragment_count: u32,
    /// Index of this fragment within the group.
    pub fragment_number: u32,
    /// Total reassembled length.
    pub total_length: u32,
    /// Byte offset of this fragment within the message.
    pub fragment_offset: u32,
    /// Fragment payload.
    pub payload: Bytes,
}

/// Remote throttle parameter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleBody {
    pub interval_ms: u32,
    pub acceleration: u32,
    pub deceleration: u32,
    pub threshold_permille: u32,
}

/// A decoded protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(ConnectBody),
    VerifyConnect(VerifyConnectBody),
    Ack(AckBody),
    Ping,
    Disconnect { data: u32 },
    ConnectionsExceeded,
    SendReliable { payload: Bytes },
    SendUnreliable { payload: Bytes },
    SendUnsequenced { payload: Bytes },
    SendFragment(FragmentBody),
    SendUnreliableFragment(FragmentBody),
    ThrottleConfigure(ThrottleBody),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Connect(_) => CommandKind::Connect,
            Command::VerifyConnect(_) => CommandKind::VerifyConnect,
            Command::Ack(_) => CommandKind::Ack,
            Command::Ping => CommandKind::Ping,
            Command::Disconnect { .. } => CommandKind::Disconnect,
            Command::ConnectionsExceeded => CommandKind::ConnectionsExceeded,
            Command::SendReliable { .. } => CommandKind::SendReliable,
            Command::SendUnreliable { .. } => CommandKind::SendUnreliable,
            Command::SendUnsequenced { .. } => CommandKind::SendUnsequenced,
            Command::SendFragment(_) => CommandKind::SendFragment,
            Command::SendUnreliableFragment(_) => CommandKind::SendUnreliableFragment,
            Command::ThrottleConfigure(_) => CommandKind::ThrottleConfigure,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Command::Connect(_) => 1 + 2 + 4 + 1 + 2 + 4,
            Command::VerifyConnect(_) => 2 + 4 + 1 + 2,
            Command::Ack(_) => 2 + 2,
            Command::Ping => 0,
            Command::Disconnect { .. } => 4,
            Command::ConnectionsExceeded => 0,
            Command::SendReliable { payload }
            | Command::SendUnreliable { payload }
            | Command::SendUnsequenced { payload } => 2 + payload.len(),
            Command::SendFragment(f) | Command::SendUnreliableFragment(f) => {
                2 + 4 + 4 + 4 + 4 + 2 + f.payload.len()
            }
            Command::ThrottleConfigure(_) => 4 * 4,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Command::Connect(c) => {
                buf.put_u8(c.version);
                buf.put_u16(c.outgoing_peer_id);
                buf.put_u32(c.connect_id);
                buf.put_u8(c.channel_count);
                buf.put_u16(c.mtu);
                buf.put_u32(c.data);
            }
            Command::VerifyConnect(v) => {
                buf.put_u16(v.outgoing_peer_id);
                buf.put_u32(v.connect_id);
                buf.put_u8(v.channel_count);
                buf.put_u16(v.mtu);
            }
            Command::Ack(a) => {
                buf.put_u16(a.sequence);
                buf.put_u16(a.sent_time);
            }
            Command::Ping | Command::ConnectionsExceeded => {}
            Command::Disconnect { data } => {
                buf.put_u32(*data);
            }
            Command::SendReliable { payload }
            | Command::SendUnreliable { payload }
            | Command::SendUnsequenced { payload } => {
                buf.put_u16(payload.len() as u16);
                buf.extend_from_slice(payload);
            }
            Command::SendFragment(f) | Command::SendUnreliableFragment(f) => {
                buf.put_u16(f.start_sequence);
                buf.put_u32(f.fragment_count);
                buf.put_u32(f.fragment_number);
                buf.put_u32(f.total_length);
                buf.put_u32(f.fragment_offset);
                buf.put_u16(f.payload.len() as u16);
                buf.extend_from_slice(&f.payload);
            }
            Command::ThrottleConfigure(t) => {
                buf.put_u32(t.interval_ms);
                buf.put_u32(t.acceleration);
                buf.put_u32(t.deceleration);
                buf.put_u32(t.threshold_permille);
            }
        }
    }

    fn decode_body(kind: CommandKind, buf: &mut impl Buf) -> Option<Command> {
        match kind {
            CommandKind::Connect => {
                if buf.remaining() < 14 {
                    return None;
                }
                Some(Command::Connect(ConnectBody {
                    version: buf.get_u8(),
                    outgoing_peer_id: buf.get_u16(),
                    connect_id: buf.get_u32(),
                    channel_count: buf.get_u8(),
                    mtu: buf.get_u16(),
                    data: buf.get_u32(),
                }))
            }
            CommandKind::VerifyConnect => {
                if buf.remaining() < 9 {
                    return None;
                }
                Some(Command::VerifyConnect(VerifyConnectBody {
                    outgoing_peer_id: buf.get_u16(),
                    connect_id: buf.get_u32(),
                    channel_count: buf.get_u8(),
                    mtu: buf.get_u16(),
                }))
            }
            CommandKind::Ack => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(Command::Ack(AckBody {
                    sequence: buf.get_u16(),
                    sent_time: buf.get_u16(),
                }))
            }
            CommandKind::Ping => Some(Command::Ping),
            CommandKind::Disconnect => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(Command::Disconnect {
                    data: buf.get_u32(),
                })
            }
            CommandKind::ConnectionsExceeded => Some(Command::ConnectionsExceeded),
            CommandKind::SendReliable
            | CommandKind::SendUnreliable
            | CommandKind::SendUnsequenced => {
                let payload = decode_payload(buf)?;
                Some(match kind {
                    CommandKind::SendReliable => Command::SendReliable { payload },
                    CommandKind::SendUnreliable => Command::SendUnreliable { payload },
                    _ => Command::SendUnsequenced { payload },
                })
            }
            CommandKind::SendFragment | CommandKind::SendUnreliableFragment => {
                if buf.remaining() < 18 {
                    return None;
                }
                let start_sequence = buf.get_u16();
                let fragment_count = buf.get_u32();
                let fragment_number = buf.get_u32();
                let total_length = buf.get_u32();
                let fragment_offset = buf.get_u32();
                let payload = decode_payload(buf)?;
                let body = FragmentBody {
                    start_sequence,
                    fragment_count,
                    fragment_number,
                    total_length,
                    fragment_offset,
                    payload,
                };
                Some(if kind == CommandKind::SendFragment {
                    Command::SendFragment(body)
                } else {
                    Command::SendUnreliableFragment(body)
                })
            }
            CommandKind::ThrottleConfigure => {
                if buf.remaining() < 16 {
                    return None;
                }
                Some(Command::ThrottleConfigure(ThrottleBody {
                    interval_ms: buf.get_u32(),
                    acceleration: buf.get_u32(),
                    deceleration: buf.get_u32(),
                    threshold_permille: buf.get_u32(),
                }))
            }
        }
    }
}

fn decode_payload(buf: &mut impl Buf) -> Option<Bytes> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len))
}

// ─── Framed command ──────────────────────────────────────────────────────────

/// A command together with its addressing header (channel + sequence).
///
/// `sequence` is the command's number in the sequence space it travels in:
/// the channel's reliable space for acknowledged commands, the unreliable
/// space for `SendUnreliable`, the unsequenced group for `SendUnsequenced`,
/// and zero for acks and connectionless notifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedCommand {
    pub channel_id: u8,
    pub sequence: u16,
    pub command: Command,
}

impl FramedCommand {
    /// Connection-level framing helper.
    pub fn connection(sequence: u16, command: Command) -> Self {
        FramedCommand {
            channel_id: CONNECTION_CHANNEL,
            sequence,
            command,
        }
    }

    /// Total encoded size, command header included.
    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_SIZE + self.command.body_len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command.kind() as u8);
        buf.put_u8(self.channel_id);
        buf.put_u16(self.sequence);
        self.command.encode_body(buf);
    }

    /// Decode one framed command. Returns `None` on truncation or an
    /// unknown command kind, which drops the rest of the datagram.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < COMMAND_HEADER_SIZE {
            return None;
        }
        let kind = CommandKind::from_byte(buf.get_u8())?;
        let channel_id = buf.get_u8();
        let sequence = buf.get_u16();
        let command = Command::decode_body(kind, buf)?;
        Some(FramedCommand {
            channel_id,
            sequence,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(cmd: FramedCommand) -> FramedCommand {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(buf.len(), cmd.encoded_len(), "encoded_len mismatch");
        FramedCommand::decode(&mut buf.freeze()).expect("decode")
    }

    #[test]
    fn datagram_header_roundtrip() {
        let hdr = DatagramHeader {
            peer_id: 7,
            sent_time: 0xBEEF,
            has_checksum: false,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), hdr.encoded_len());
        let (decoded, checksum) = DatagramHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(checksum, 0);
    }

    #[test]
    fn datagram_checksum_slot_patches() {
        let hdr = DatagramHeader {
            peer_id: PEER_ID_NONE,
            sent_time: 1,
            has_checksum: true,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        patch_checksum(&mut buf, 0xDEAD_BEEF_CAFE_F00D);
        let (decoded, checksum) = DatagramHeader::decode(&mut buf.freeze()).unwrap();
        assert!(decoded.has_checksum);
        assert_eq!(checksum, 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn version_mismatch_rejected() {
        let hdr = DatagramHeader {
            peer_id: 0,
            sent_time: 0,
            has_checksum: false,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        buf[0] ^= 0xC0; // flip the version bits
        assert!(DatagramHeader::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn connect_roundtrip() {
        let cmd = FramedCommand::connection(
            1,
            Command::Connect(ConnectBody {
                version: PROTOCOL_VERSION,
                outgoing_peer_id: 3,
                connect_id: 0xA1B2C3D4,
                channel_count: 2,
                mtu: DEFAULT_MTU,
                data: 42,
            }),
        );
        assert_eq!(roundtrip(cmd.clone()), cmd);
    }

    #[test]
    fn verify_connect_roundtrip() {
        let cmd = FramedCommand::connection(
            1,
            Command::VerifyConnect(VerifyConnectBody {
                outgoing_peer_id: 9,
                connect_id: 77,
                channel_count: 4,
                mtu: 1200,
            }),
        );
        assert_eq!(roundtrip(cmd.clone()), cmd);
    }

    #[test]
    fn data_commands_roundtrip() {
        for cmd in [
            Command::SendReliable {
                payload: Bytes::from_static(b"Hello"),
            },
            Command::SendUnreliable {
                payload: Bytes::from_static(b"lossy"),
            },
            Command::SendUnsequenced {
                payload: Bytes::from_static(b""),
            },
        ] {
            let framed = FramedCommand {
                channel_id: 0,
                sequence: 100,
                command: cmd,
            };
            assert_eq!(roundtrip(framed.clone()), framed);
        }
    }

    #[test]
    fn fragment_roundtrip() {
        let cmd = FramedCommand {
            channel_id: 3,
            sequence: 11,
            command: Command::SendFragment(FragmentBody {
                start_sequence: 10,
                fragment_count: 4,
                fragment_number: 1,
                total_length: 5000,
                fragment_offset: 1300,
                payload: Bytes::from(vec![0xAB; 1300]),
            }),
        };
        assert_eq!(roundtrip(cmd.clone()), cmd);
    }

    #[test]
    fn truncated_command_rejected() {
        let cmd = FramedCommand {
            channel_id: 0,
            sequence: 5,
            command: Command::SendReliable {
                payload: Bytes::from_static(b"truncate me"),
            },
        };
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        for cut in 1..buf.len() {
            let mut short = Bytes::copy_from_slice(&buf[..cut]);
            assert!(
                FramedCommand::decode(&mut short).is_none(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7F);
        buf.put_u8(0);
        buf.put_u16(0);
        assert!(FramedCommand::decode(&mut buf.freeze()).is_none());
    }

    #[test]
    fn wants_ack_classification() {
        assert!(CommandKind::SendReliable.wants_ack());
        assert!(CommandKind::Connect.wants_ack());
        assert!(CommandKind::Ping.wants_ack());
        assert!(!CommandKind::Ack.wants_ack());
        assert!(!CommandKind::SendUnsequenced.wants_ack());
        assert!(!CommandKind::ConnectionsExceeded.wants_ack());
    }

    #[test]
    fn sequence_ordering() {
        assert!(seq_after(2, 1));
        assert!(!seq_after(1, 2));
        assert!(!seq_after(5, 5));
        // wrap
        assert!(seq_after(2, 0xFFFE));
        assert!(!seq_after(0xFFFE, 2));
    }

    proptest! {
        #[test]
        fn proptest_header_roundtrip(peer_id: u16, sent_time: u16, has_checksum: bool) {
            let hdr = DatagramHeader { peer_id, sent_time, has_checksum };
            let mut buf = BytesMut::new();
            hdr.encode(&mut buf);
            let (decoded, _) = DatagramHeader::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, hdr);
        }

        #[test]
        fn proptest_reliable_payload_roundtrip(
            channel_id: u8,
            sequence: u16,
            payload in proptest::collection::vec(any::<u8>(), 0..2048)
        ) {
            let framed = FramedCommand {
                channel_id,
                sequence,
                command: Command::SendReliable { payload: Bytes::from(payload) },
            };
            let mut buf = BytesMut::new();
            framed.encode(&mut buf);
            let decoded = FramedCommand::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, framed);
        }
    }
}
