//! meshwire wire format — fixed on-wire layouts for discovery and sessions.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire format; integers are big-endian.
//!
//! All types are #[repr(C, packed)] and use zerocopy derives for
//! allocation-free serialization. Variable-length payloads (Hello, network
//! snapshots) are JSON and live next to the code that owns them.

use std::time::{SystemTime, UNIX_EPOCH};

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::ECIES_OVERHEAD;
use crate::identity::{Endpoint, Node, NodeId};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Session protocol version carried in Hello.
pub const PROTOCOL_VERSION: u32 = 5;

/// Discovery protocol version carried in Ping.
pub const DISCOVERY_VERSION: u32 = 4;

/// Largest discovery datagram we send or accept.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Seconds a discovery packet stays valid after it is sent.
pub const PACKET_EXPIRATION_SECS: u64 = 60;

/// Neighbours entries per datagram. 98 + 9 + 12 * 84 = 1115 bytes.
pub const MAX_NEIGHBOURS_PER_PACKET: usize = 12;

/// Largest frame body the 24-bit size field can describe.
pub const MAX_FRAME_SIZE: usize = 0x00ff_ffff;

pub const FRAME_HEADER_SIZE: usize = 16;
pub const FRAME_MAC_SIZE: usize = 16;

/// First message id available to capabilities. Ids below are the base protocol.
pub const USER_MESSAGE_BASE: u16 = 0x10;

pub const AUTH_SIZE: usize = std::mem::size_of::<AuthBody>() + ECIES_OVERHEAD;
pub const ACK_SIZE: usize = std::mem::size_of::<AckBody>() + ECIES_OVERHEAD;

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EndpointWire {
    /// IPv6 address, or IPv4 mapped into IPv6.
    pub address: [u8; 16],
    pub udp_port: U16<NetworkEndian>,
    pub tcp_port: U16<NetworkEndian>,
}

assert_eq_size!(EndpointWire, [u8; 20]);

impl From<&Endpoint> for EndpointWire {
    fn from(e: &Endpoint) -> Self {
        Self {
            address: e.address_octets(),
            udp_port: U16::new(e.udp_port),
            tcp_port: U16::new(e.tcp_port),
        }
    }
}

impl From<&EndpointWire> for Endpoint {
    fn from(w: &EndpointWire) -> Self {
        Endpoint::from_octets(w.address, w.udp_port.get(), w.tcp_port.get())
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Discovery packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Ping = 0x01,
    Pong = 0x02,
    FindNode = 0x03,
    Neighbours = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x03 => Ok(Self::FindNode),
            0x04 => Ok(Self::Neighbours),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Prefix of every discovery datagram.
///
/// `hash = keccak(signature || type || payload)`,
/// `signature = sign(keccak(type || payload))`.
///
/// Wire size: 98 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    pub hash: [u8; 32],
    pub signature: [u8; 65],
    pub packet_type: u8,
}

assert_eq_size!(PacketHeader, [u8; 98]);

pub const PACKET_HEADER_SIZE: usize = std::mem::size_of::<PacketHeader>();

/// Wire size: 52 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PingWire {
    pub version: U32<NetworkEndian>,
    /// The sender's own idea of its endpoint.
    pub from: EndpointWire,
    /// The endpoint the ping was sent to.
    pub to: EndpointWire,
    pub expiration: U64<NetworkEndian>,
}

assert_eq_size!(PingWire, [u8; 52]);

/// Wire size: 60 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PongWire {
    /// Where the answering node saw the ping come from.
    pub to: EndpointWire,
    /// Hash of the ping being answered.
    pub echo: [u8; 32],
    pub expiration: U64<NetworkEndian>,
}

assert_eq_size!(PongWire, [u8; 60]);

/// Wire size: 72 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FindNodeWire {
    pub target: [u8; 64],
    pub expiration: U64<NetworkEndian>,
}

assert_eq_size!(FindNodeWire, [u8; 72]);

/// Followed by `count` × `NeighbourWire`.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct NeighboursHeader {
    pub expiration: U64<NetworkEndian>,
    pub count: u8,
}

assert_eq_size!(NeighboursHeader, [u8; 9]);

/// Wire size: 84 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct NeighbourWire {
    pub id: [u8; 64],
    pub endpoint: EndpointWire,
}

assert_eq_size!(NeighbourWire, [u8; 84]);

impl From<&Node> for NeighbourWire {
    fn from(n: &Node) -> Self {
        Self {
            id: n.id.0,
            endpoint: EndpointWire::from(&n.endpoint),
        }
    }
}

impl From<&NeighbourWire> for Node {
    fn from(w: &NeighbourWire) -> Self {
        let endpoint = w.endpoint;
        Node::new(NodeId(w.id), Endpoint::from(&endpoint))
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Plaintext of the initiator's auth message, ECIES-sealed to the responder.
///
/// Wire size: 194 bytes (307 once sealed).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AuthBody {
    /// Ephemeral-key signature over `static_shared XOR nonce`.
    pub signature: [u8; 65],
    /// keccak of the initiator's ephemeral public key.
    pub ephemeral_hash: [u8; 32],
    /// Initiator's static public key.
    pub public_key: [u8; 64],
    pub nonce: [u8; 32],
    /// Reserved, zero.
    pub token_flag: u8,
}

assert_eq_size!(AuthBody, [u8; 194]);

/// Plaintext of the responder's ack, ECIES-sealed to the initiator.
///
/// Wire size: 97 bytes (210 once sealed).
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AckBody {
    pub ephemeral_public: [u8; 64],
    pub nonce: [u8; 32],
    /// Reserved, zero.
    pub token_flag: u8,
}

assert_eq_size!(AckBody, [u8; 97]);

// ── Frame ─────────────────────────────────────────────────────────────────────

/// Plaintext frame header, encrypted as one AES block.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Body length before padding, 24-bit big-endian.
    pub size: [u8; 3],
    /// 1-based index of the capability the body belongs to; 0 = base protocol.
    pub capability_hint: U16<NetworkEndian>,
    pub reserved: [u8; 11],
}

assert_eq_size!(FrameHeader, [u8; 16]);

impl FrameHeader {
    pub fn new(size: usize, capability_hint: u16) -> Result<Self, WireError> {
        if size > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(size));
        }
        let be = (size as u32).to_be_bytes();
        Ok(Self {
            size: [be[1], be[2], be[3]],
            capability_hint: U16::new(capability_hint),
            reserved: [0u8; 11],
        })
    }

    pub fn body_size(&self) -> usize {
        u32::from_be_bytes([0, self.size[0], self.size[1], self.size[2]]) as usize
    }
}

/// Bytes a body of `size` occupies once padded to the AES block size.
pub fn padded_len(size: usize) -> usize {
    (size + 15) & !15
}

// ── Time ──────────────────────────────────────────────────────────────────────

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Expiration timestamp for a packet sent now.
pub fn expiration() -> u64 {
    unix_now() + PACKET_EXPIRATION_SECS
}

pub fn is_expired(expiration: u64) -> bool {
    expiration < unix_now()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("buffer too short: need {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },
    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),
    #[error("frame of {0} bytes exceeds the 24-bit size field")]
    FrameTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_handshake_sizes() {
        assert_eq!(AUTH_SIZE, 307);
        assert_eq!(ACK_SIZE, 210);
    }

    #[test]
    fn neighbours_fit_in_one_packet() {
        let max = PACKET_HEADER_SIZE
            + std::mem::size_of::<NeighboursHeader>()
            + MAX_NEIGHBOURS_PER_PACKET * std::mem::size_of::<NeighbourWire>();
        assert!(max <= MAX_PACKET_SIZE);
    }

    #[test]
    fn endpoint_wire_is_big_endian() {
        let e = Endpoint::new("1.2.3.4".parse().unwrap(), 0x1234, 0x5678);
        let w = EndpointWire::from(&e);
        let bytes = w.as_bytes();
        assert_eq!(&bytes[10..16], &[0xff, 0xff, 1, 2, 3, 4]);
        assert_eq!(&bytes[16..20], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(Endpoint::from(&w), e);
    }

    #[test]
    fn packet_type_rejects_unknown() {
        assert_eq!(PacketType::try_from(3).unwrap(), PacketType::FindNode);
        assert!(matches!(PacketType::try_from(9), Err(WireError::UnknownPacketType(9))));
    }

    #[test]
    fn frame_header_size_field() {
        let h = FrameHeader::new(0x01_02_03, 2).unwrap();
        assert_eq!(h.size, [1, 2, 3]);
        assert_eq!(h.body_size(), 0x01_02_03);
        assert_eq!(h.capability_hint.get(), 2);
        assert!(FrameHeader::new(MAX_FRAME_SIZE + 1, 0).is_err());
    }

    #[test]
    fn padding_rounds_up_to_block() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 16);
        assert_eq!(padded_len(16), 16);
        assert_eq!(padded_len(17), 32);
    }

    #[test]
    fn truncated_header_does_not_parse() {
        assert!(PacketHeader::read_from_prefix(&[0u8; 97][..]).is_none());
        assert!(PingWire::read_from(&[0u8; 52][..]).is_some());
    }
}
