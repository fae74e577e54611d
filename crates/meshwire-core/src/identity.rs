//! Node identity and endpoint model.
//!
//! A node is named by its secp256k1 public key (64 bytes, uncompressed, no
//! 0x04 tag) and reached through an `Endpoint`: one IP address plus the UDP
//! port used for discovery and the TCP port used for sessions.
//!
//! Everything here is a plain value type. Parsing never panics; wrong-length
//! or malformed input comes back as an `IdentityError`.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::keccak256;

// ── NodeId ────────────────────────────────────────────────────────────────────

/// Public key of a node: the 64 bytes of an uncompressed secp256k1 point.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 64]);

impl NodeId {
    pub const LEN: usize = 64;

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| IdentityError::WrongLength {
            expected: Self::LEN,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn from_public_key(key: &secp256k1::PublicKey) -> Self {
        let full = key.serialize_uncompressed();
        let mut id = [0u8; 64];
        id.copy_from_slice(&full[1..]);
        Self(id)
    }

    /// Rebuild the curve point. Fails for ids that are not on the curve.
    pub fn to_public_key(&self) -> Result<secp256k1::PublicKey, IdentityError> {
        let mut full = [0u8; 65];
        full[0] = 0x04;
        full[1..].copy_from_slice(&self.0);
        secp256k1::PublicKey::from_slice(&full).map_err(|_| IdentityError::InvalidPublicKey)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// The all-zero id never names a real node.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", self.short())
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| IdentityError::InvalidHex)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Distance ──────────────────────────────────────────────────────────────────

/// Log2 distance between two ids: the index of the highest set bit of
/// `keccak(a) XOR keccak(b)`, plus one. Identical ids are at distance 0.
pub fn distance(a: &NodeId, b: &NodeId) -> u32 {
    let ha = keccak256(&a.0);
    let hb = keccak256(&b.0);
    for (i, (x, y)) in ha.iter().zip(hb.iter()).enumerate() {
        let d = x ^ y;
        if d != 0 {
            return (32 - i as u32) * 8 - d.leading_zeros();
        }
    }
    0
}

/// Orders `a` and `b` by XOR closeness of their hashes to `target`'s hash.
pub fn closer_to(target: &[u8; 32], a: &NodeId, b: &NodeId) -> Ordering {
    let ha = keccak256(&a.0);
    let hb = keccak256(&b.0);
    for i in 0..32 {
        let da = ha[i] ^ target[i];
        let db = hb[i] ^ target[i];
        if da != db {
            return da.cmp(&db);
        }
    }
    Ordering::Equal
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// Where a node can be reached. Two endpoints are equal only when address,
/// UDP port and TCP port all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            address,
            udp_port,
            tcp_port,
        }
    }

    /// The zero endpoint. Never reachable.
    pub fn unspecified() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }

    /// Endpoint observed from a UDP source address.
    pub fn from_udp(addr: SocketAddr, tcp_port: u16) -> Self {
        Self::new(canonical_ip(addr.ip()), addr.port(), tcp_port)
    }

    pub fn is_specified(&self) -> bool {
        !self.address.is_unspecified()
    }

    /// A specified address with both ports set.
    pub fn is_reachable(&self) -> bool {
        self.is_specified() && self.udp_port != 0 && self.tcp_port != 0
    }

    /// Globally routable: not loopback, private, link-local or unspecified.
    pub fn is_public(&self) -> bool {
        match canonical_ip(self.address) {
            IpAddr::V4(v4) => {
                !(v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
                    || v4.is_documentation())
            }
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                !(v6.is_loopback()
                    || v6.is_unspecified()
                    || (first & 0xffc0) == 0xfe80
                    || (first & 0xfe00) == 0xfc00)
            }
        }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }

    /// 16-byte form used on the wire; IPv4 is mapped into IPv6.
    pub fn address_octets(&self) -> [u8; 16] {
        match self.address {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    pub fn from_octets(octets: [u8; 16], udp_port: u16, tcp_port: u16) -> Self {
        Self::new(canonical_ip(IpAddr::V6(Ipv6Addr::from(octets))), udp_port, tcp_port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(v4) => write!(f, "{}:{}/{}", v4, self.udp_port, self.tcp_port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}/{}", v6, self.udp_port, self.tcp_port),
        }
    }
}

/// Unwrap IPv4-mapped IPv6 addresses so equal hosts compare equal.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// A node's identity together with the endpoint it was last known at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub endpoint: Endpoint,
}

impl Node {
    pub fn new(id: NodeId, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }
}

/// `enode://<hex id>@<ip>:<tcp port>[?discport=<udp port>]`
impl FromStr for Node {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || IdentityError::BadUrl(s.to_string());
        let rest = s.strip_prefix("enode://").ok_or_else(bad)?;
        let (id, host) = rest.split_once('@').ok_or_else(bad)?;
        let id: NodeId = id.parse()?;

        let (addr, query) = match host.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (host, None),
        };
        let socket: SocketAddr = addr.parse().map_err(|_| bad())?;

        let mut udp_port = socket.port();
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(v) = pair.strip_prefix("discport=") {
                    udp_port = v.parse().map_err(|_| bad())?;
                }
            }
        }

        Ok(Node::new(
            id,
            Endpoint::new(canonical_ip(socket.ip()), udp_port, socket.port()),
        ))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enode://{}@{}", self.id, self.endpoint.tcp_addr())?;
        if self.endpoint.udp_port != self.endpoint.tcp_port {
            write!(f, "?discport={}", self.endpoint.udp_port)?;
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("wrong length: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("invalid hex")]
    InvalidHex,
    #[error("not a valid secp256k1 public key")]
    InvalidPublicKey,
    #[error("malformed node url: {0}")]
    BadUrl(String),
}
