//! Discovery datagrams: signing, hashing and parsing.
//!
//! Layout: `hash(32) || signature(65) || type(1) || payload`. The hash
//! covers everything after it; the signature covers `keccak(type || payload)`
//! and yields the sender's id on recovery.

use meshwire_core::crypto::{keccak256, recover, Keypair};
use meshwire_core::wire::{
    is_expired, EndpointWire, FindNodeWire, NeighbourWire, NeighboursHeader, PacketHeader,
    PacketType, PingWire, PongWire, WireError, MAX_NEIGHBOURS_PER_PACKET, MAX_PACKET_SIZE,
    PACKET_HEADER_SIZE,
};
use meshwire_core::{Endpoint, Node, NodeId};
use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, FromBytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub echo: [u8; 32],
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: NodeId,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    pub nodes: Vec<Node>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbours(Neighbours),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Ping(_) => PacketType::Ping,
            Packet::Pong(_) => PacketType::Pong,
            Packet::FindNode(_) => PacketType::FindNode,
            Packet::Neighbours(_) => PacketType::Neighbours,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(p) => p.expiration,
            Packet::Pong(p) => p.expiration,
            Packet::FindNode(p) => p.expiration,
            Packet::Neighbours(p) => p.expiration,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, PacketError> {
        Ok(match self {
            Packet::Ping(p) => PingWire {
                version: U32::new(p.version),
                from: EndpointWire::from(&p.from),
                to: EndpointWire::from(&p.to),
                expiration: U64::new(p.expiration),
            }
            .as_bytes()
            .to_vec(),
            Packet::Pong(p) => PongWire {
                to: EndpointWire::from(&p.to),
                echo: p.echo,
                expiration: U64::new(p.expiration),
            }
            .as_bytes()
            .to_vec(),
            Packet::FindNode(p) => FindNodeWire {
                target: p.target.0,
                expiration: U64::new(p.expiration),
            }
            .as_bytes()
            .to_vec(),
            Packet::Neighbours(p) => {
                if p.nodes.len() > MAX_NEIGHBOURS_PER_PACKET {
                    return Err(PacketError::TooManyNeighbours(p.nodes.len()));
                }
                let header = NeighboursHeader {
                    expiration: U64::new(p.expiration),
                    count: p.nodes.len() as u8,
                };
                let mut out = header.as_bytes().to_vec();
                for node in &p.nodes {
                    out.extend_from_slice(NeighbourWire::from(node).as_bytes());
                }
                out
            }
        })
    }
}

/// Split a reply into as many Neighbours packets as the size limit needs.
pub fn neighbours_packets(nodes: &[Node], expiration: u64) -> Vec<Packet> {
    nodes
        .chunks(MAX_NEIGHBOURS_PER_PACKET)
        .map(|chunk| {
            Packet::Neighbours(Neighbours {
                nodes: chunk.to_vec(),
                expiration,
            })
        })
        .collect()
}

// ── Encode ────────────────────────────────────────────────────────────────────

pub struct Encoded {
    pub bytes: Vec<u8>,
    /// Hash a Pong must echo to answer this packet.
    pub hash: [u8; 32],
}

pub fn encode(keypair: &Keypair, packet: &Packet) -> Result<Encoded, PacketError> {
    let mut signed = Vec::with_capacity(MAX_PACKET_SIZE);
    signed.push(packet.packet_type() as u8);
    signed.extend_from_slice(&packet.payload()?);

    let signature = keypair.sign(&keccak256(&signed));

    let mut bytes = Vec::with_capacity(PACKET_HEADER_SIZE + signed.len());
    bytes.extend_from_slice(&[0u8; 32]);
    bytes.extend_from_slice(&signature);
    bytes.extend_from_slice(&signed);
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(bytes.len()));
    }

    let hash = keccak256(&bytes[32..]);
    bytes[..32].copy_from_slice(&hash);
    Ok(Encoded { bytes, hash })
}

// ── Decode ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Received {
    pub sender: NodeId,
    pub hash: [u8; 32],
    pub packet: Packet,
}

/// Recover the id that signed `signed` (= `type || payload`).
pub fn authenticate(signature: &[u8; 65], signed: &[u8]) -> Result<NodeId, PacketError> {
    recover(signature, &keccak256(signed)).map_err(|_| PacketError::BadSignature)
}

/// Parse and verify a datagram. Expired packets are rejected.
pub fn decode(datagram: &[u8]) -> Result<Received, PacketError> {
    if datagram.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge(datagram.len()));
    }
    let header = PacketHeader::read_from_prefix(datagram).ok_or(WireError::TooShort {
        expected: PACKET_HEADER_SIZE,
        got: datagram.len(),
    })?;

    if keccak256(&datagram[32..]) != header.hash {
        return Err(PacketError::BadHash);
    }

    let packet_type = PacketType::try_from(header.packet_type)?;
    let sender = authenticate(&header.signature, &datagram[PACKET_HEADER_SIZE - 1..])?;
    let payload = &datagram[PACKET_HEADER_SIZE..];

    let packet = match packet_type {
        PacketType::Ping => {
            let w = PingWire::read_from(payload).ok_or(PacketError::Malformed("ping"))?;
            let (from, to) = (w.from, w.to);
            Packet::Ping(Ping {
                version: w.version.get(),
                from: Endpoint::from(&from),
                to: Endpoint::from(&to),
                expiration: w.expiration.get(),
            })
        }
        PacketType::Pong => {
            let w = PongWire::read_from(payload).ok_or(PacketError::Malformed("pong"))?;
            let to = w.to;
            Packet::Pong(Pong {
                to: Endpoint::from(&to),
                echo: w.echo,
                expiration: w.expiration.get(),
            })
        }
        PacketType::FindNode => {
            let w = FindNodeWire::read_from(payload).ok_or(PacketError::Malformed("findnode"))?;
            Packet::FindNode(FindNode {
                target: NodeId(w.target),
                expiration: w.expiration.get(),
            })
        }
        PacketType::Neighbours => {
            let h = NeighboursHeader::read_from_prefix(payload)
                .ok_or(PacketError::Malformed("neighbours"))?;
            let count = h.count as usize;
            if count > MAX_NEIGHBOURS_PER_PACKET {
                return Err(PacketError::TooManyNeighbours(count));
            }
            let entries = &payload[std::mem::size_of::<NeighboursHeader>()..];
            let entry_size = std::mem::size_of::<NeighbourWire>();
            if entries.len() != count * entry_size {
                return Err(PacketError::Malformed("neighbours"));
            }
            let nodes = entries
                .chunks_exact(entry_size)
                .filter_map(NeighbourWire::read_from)
                .map(|w| Node::from(&w))
                .collect();
            Packet::Neighbours(Neighbours {
                nodes,
                expiration: h.expiration.get(),
            })
        }
    };

    if is_expired(packet.expiration()) {
        return Err(PacketError::Expired);
    }

    Ok(Received {
        sender,
        hash: header.hash,
        packet,
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("datagram of {0} bytes exceeds the packet limit")]
    TooLarge(usize),
    #[error("hash does not match contents")]
    BadHash,
    #[error("signature does not recover a public key")]
    BadSignature,
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error("packet expired")]
    Expired,
    #[error("{0} neighbours exceed the per-packet limit")]
    TooManyNeighbours(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwire_core::wire::{expiration, unix_now};

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1".parse().unwrap(), port, port)
    }

    fn ping() -> Packet {
        Packet::Ping(Ping {
            version: 4,
            from: ep(1000),
            to: ep(2000),
            expiration: expiration(),
        })
    }

    #[test]
    fn ping_decodes_with_sender_and_hash() {
        let kp = Keypair::generate();
        let packet = ping();
        let enc = encode(&kp, &packet).unwrap();
        let rx = decode(&enc.bytes).unwrap();
        assert_eq!(rx.sender, kp.id());
        assert_eq!(rx.hash, enc.hash);
        assert_eq!(rx.packet, packet);
    }

    #[test]
    fn neighbours_are_split_and_parsed() {
        let kp = Keypair::generate();
        let nodes: Vec<Node> = (0..30u16)
            .map(|i| Node::new(Keypair::generate().id(), ep(3000 + i)))
            .collect();
        let packets = neighbours_packets(&nodes, expiration());
        assert_eq!(packets.len(), 3);

        let mut seen = Vec::new();
        for p in &packets {
            let enc = encode(&kp, p).unwrap();
            assert!(enc.bytes.len() <= MAX_PACKET_SIZE);
            match decode(&enc.bytes).unwrap().packet {
                Packet::Neighbours(n) => seen.extend(n.nodes),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, nodes);
    }

    #[test]
    fn flipped_payload_byte_fails_hash() {
        let kp = Keypair::generate();
        let mut bytes = encode(&kp, &ping()).unwrap().bytes;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(PacketError::BadHash)));
    }

    #[test]
    fn resigned_packet_authenticates_as_the_new_signer() {
        let victim = Keypair::generate();
        let forger = Keypair::generate();
        let mut bytes = encode(&victim, &ping()).unwrap().bytes;

        let sig = forger.sign(&keccak256(&bytes[PACKET_HEADER_SIZE - 1..]));
        bytes[32..97].copy_from_slice(&sig);
        let hash = keccak256(&bytes[32..]);
        bytes[..32].copy_from_slice(&hash);

        let rx = decode(&bytes).unwrap();
        assert_eq!(rx.sender, forger.id());
        assert_ne!(rx.sender, victim.id());
    }

    #[test]
    fn expired_packet_is_dropped() {
        let kp = Keypair::generate();
        let stale = Packet::FindNode(FindNode {
            target: kp.id(),
            expiration: unix_now() - 5,
        });
        let enc = encode(&kp, &stale).unwrap();
        assert!(matches!(decode(&enc.bytes), Err(PacketError::Expired)));
    }

    #[test]
    fn unknown_type_and_short_input_are_errors() {
        let kp = Keypair::generate();
        let mut bytes = encode(&kp, &ping()).unwrap().bytes;
        bytes[97] = 0x09;
        let hash = keccak256(&bytes[32..]);
        bytes[..32].copy_from_slice(&hash);
        assert!(matches!(
            decode(&bytes),
            Err(PacketError::Wire(WireError::UnknownPacketType(9)))
        ));

        assert!(decode(&[0u8; 20]).is_err());
        assert!(matches!(decode(&vec![0u8; 2000]), Err(PacketError::TooLarge(2000))));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let kp = Keypair::generate();
        let mut signed = vec![PacketType::Pong as u8];
        signed.extend_from_slice(&[0u8; 10]);
        let sig = kp.sign(&keccak256(&signed));
        let mut bytes = vec![0u8; 32];
        bytes.extend_from_slice(&sig);
        bytes.extend_from_slice(&signed);
        let hash = keccak256(&bytes[32..]);
        bytes[..32].copy_from_slice(&hash);
        assert!(matches!(decode(&bytes), Err(PacketError::Malformed("pong"))));
    }
}
