//! Capabilities — sub-protocols multiplexed over a session.
//!
//! A capability is registered with the host before it starts. On every new
//! session the host intersects the local and remote capability lists,
//! keeps the highest mutual version per name, sorts the result by name and
//! assigns each entry a contiguous block of absolute message ids starting
//! at `USER_MESSAGE_BASE`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use meshwire_core::wire::USER_MESSAGE_BASE;
use meshwire_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::host::{HostCommand, HostShared, PeerSessionInfo};
use crate::frame::MAX_PAYLOAD_SIZE;
use crate::session::{DisconnectReason, QueueError};

/// A sub-protocol. Callbacks for one peer are never run concurrently and
/// messages arrive in the order the peer sent them.
pub trait Capability: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn version(&self) -> u32;
    /// Number of message ids this capability uses, starting at 0.
    fn message_count(&self) -> u16;

    fn on_connect(&self, _peer: &NodeId, _host: &CapabilityHost) {}

    fn on_disconnect(&self, _peer: &NodeId, _reason: DisconnectReason) {}

    /// Handle one message. `message_id` is relative to the capability.
    /// An error disconnects the peer with `BadProtocol`.
    fn interpret(
        &self,
        peer: &NodeId,
        message_id: u16,
        payload: &[u8],
        host: &CapabilityHost,
    ) -> anyhow::Result<()>;
}

/// Name and version as advertised in Hello.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapDesc {
    pub name: String,
    pub version: u32,
}

impl CapDesc {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for CapDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

// ── Negotiation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCap {
    pub desc: CapDesc,
    /// First absolute message id.
    pub offset: u16,
    pub message_count: u16,
    /// 1-based position, carried in the frame header.
    pub hint: u16,
}

impl NegotiatedCap {
    pub fn contains(&self, message_id: u16) -> bool {
        message_id >= self.offset && message_id - self.offset < self.message_count
    }
}

/// The capability table of one session. Fixed for the session's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    caps: Vec<NegotiatedCap>,
}

impl Negotiated {
    /// `local` carries message counts; `remote` is the peer's Hello list.
    pub fn new(local: &[(CapDesc, u16)], remote: &[CapDesc]) -> Self {
        let mut best: BTreeMap<&str, (u32, u16)> = BTreeMap::new();
        for (desc, count) in local {
            if !remote.contains(desc) {
                continue;
            }
            let entry = best.entry(desc.name.as_str()).or_insert((desc.version, *count));
            if desc.version > entry.0 {
                *entry = (desc.version, *count);
            }
        }

        // BTreeMap iteration is already sorted by name.
        let mut offset = USER_MESSAGE_BASE;
        let mut caps = Vec::with_capacity(best.len());
        for (i, (name, (version, count))) in best.into_iter().enumerate() {
            caps.push(NegotiatedCap {
                desc: CapDesc::new(name, version),
                offset,
                message_count: count,
                hint: i as u16 + 1,
            });
            offset = offset.saturating_add(count);
        }
        Self { caps }
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NegotiatedCap> {
        self.caps.iter()
    }

    /// Capability owning an absolute message id.
    pub fn route(&self, message_id: u16) -> Option<&NegotiatedCap> {
        self.caps.iter().find(|c| c.contains(message_id))
    }

    pub fn by_hint(&self, hint: u16) -> Option<&NegotiatedCap> {
        let index = usize::from(hint).checked_sub(1)?;
        self.caps.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&NegotiatedCap> {
        self.caps.iter().find(|c| c.desc.name == name)
    }

    pub fn descs(&self) -> Vec<CapDesc> {
        self.caps.iter().map(|c| c.desc.clone()).collect()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Registered capabilities keyed by name and version.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    caps: BTreeMap<CapDesc, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cap: Arc<dyn Capability>) -> Result<CapDesc, CapabilityError> {
        let desc = CapDesc::new(cap.name(), cap.version());
        if desc.name.is_empty() {
            return Err(CapabilityError::EmptyName);
        }
        if self.caps.contains_key(&desc) {
            return Err(CapabilityError::AlreadyRegistered(desc));
        }
        self.caps.insert(desc.clone(), cap);
        Ok(desc)
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    /// What we put in our Hello.
    pub fn advertised(&self) -> Vec<CapDesc> {
        self.caps.keys().cloned().collect()
    }

    pub fn negotiate(&self, remote: &[CapDesc]) -> Negotiated {
        let local: Vec<(CapDesc, u16)> = self
            .caps
            .iter()
            .map(|(desc, cap)| (desc.clone(), cap.message_count()))
            .collect();
        Negotiated::new(&local, remote)
    }

    pub fn get(&self, desc: &CapDesc) -> Option<Arc<dyn Capability>> {
        self.caps.get(desc).cloned()
    }
}

// ── Host access ───────────────────────────────────────────────────────────────

/// A capability's view of the host. Cheap to clone.
#[derive(Clone)]
pub struct CapabilityHost {
    name: Arc<str>,
    shared: Arc<HostShared>,
}

impl CapabilityHost {
    pub(crate) fn new(name: &str, shared: Arc<HostShared>) -> Self {
        Self {
            name: Arc::from(name),
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `payload` as message `message_id` (relative) of this capability.
    /// Never waits: a peer that is not keeping up yields `Backlogged`.
    pub fn send(
        &self,
        peer: &NodeId,
        message_id: u16,
        payload: impl Into<Bytes>,
    ) -> Result<(), CapabilityError> {
        let payload: Bytes = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CapabilityError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let session = self
            .shared
            .sessions
            .get(peer)
            .ok_or(CapabilityError::NotConnected(*peer))?;
        let cap = session
            .negotiated
            .by_name(&self.name)
            .ok_or_else(|| CapabilityError::NotNegotiated(self.name.to_string()))?;
        if message_id >= cap.message_count {
            return Err(CapabilityError::MessageOutOfRange {
                id: message_id,
                count: cap.message_count,
            });
        }
        session
            .handle
            .send(cap.offset + message_id, cap.hint, &payload)
            .map_err(|e| match e {
                QueueError::Full => CapabilityError::Backlogged(*peer),
                QueueError::Closed => CapabilityError::NotConnected(*peer),
                QueueError::TooLarge(size) => CapabilityError::PayloadTooLarge {
                    size,
                    max: MAX_PAYLOAD_SIZE,
                },
            })
    }

    pub fn disconnect(&self, peer: &NodeId, reason: DisconnectReason) {
        if let Some(session) = self.shared.sessions.get(peer) {
            session.handle.disconnect(reason);
        }
    }

    /// Adjust the peer's rating. Non-negative deltas also clear its failure count.
    pub fn add_rating(&self, peer: &NodeId, delta: i32) {
        self.shared.command(HostCommand::AddRating(*peer, delta));
    }

    pub fn peer_info(&self, peer: &NodeId) -> Option<PeerSessionInfo> {
        self.shared.sessions.get(peer).map(|s| s.info.clone())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability {0} is already registered")]
    AlreadyRegistered(CapDesc),
    #[error("capability name must not be empty")]
    EmptyName,
    #[error("no session with {0}")]
    NotConnected(NodeId),
    #[error("capability {0} was not negotiated with this peer")]
    NotNegotiated(String),
    #[error("message id {id} outside capability range 0..{count}")]
    MessageOutOfRange { id: u16, count: u16 },
    #[error("payload of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("outbound queue to {0} is full")]
    Backlogged(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(name: &str, version: u32) -> CapDesc {
        CapDesc::new(name, version)
    }

    #[test]
    fn offsets_agree_on_both_sides() {
        let a = [(d("test", 2), 2)];
        let b = [(d("test", 2), 2), (d("other", 1), 3)];

        let from_a = Negotiated::new(&a, &[d("test", 2), d("other", 1)]);
        let from_b = Negotiated::new(&b, &[d("test", 2)]);

        assert_eq!(from_a, from_b);
        assert_eq!(from_a.len(), 1);
        let test = from_a.by_name("test").unwrap();
        assert_eq!(test.offset, USER_MESSAGE_BASE);
        assert_eq!(test.hint, 1);
        assert!(from_a.by_name("other").is_none());
    }

    #[test]
    fn offsets_accumulate_in_name_order() {
        let local = [(d("zeta", 1), 4), (d("alpha", 1), 3), (d("mid", 1), 1)];
        let remote = [d("mid", 1), d("zeta", 1), d("alpha", 1)];
        let n = Negotiated::new(&local, &remote);

        let names: Vec<_> = n.iter().map(|c| c.desc.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(n.by_name("alpha").unwrap().offset, 0x10);
        assert_eq!(n.by_name("mid").unwrap().offset, 0x13);
        assert_eq!(n.by_name("zeta").unwrap().offset, 0x14);
        assert_eq!(n.by_hint(3).unwrap().desc.name, "zeta");
        assert!(n.by_hint(0).is_none());
    }

    #[test]
    fn highest_mutual_version_wins() {
        let local = [(d("eth", 62), 8), (d("eth", 63), 17), (d("eth", 64), 20)];
        let remote = [d("eth", 62), d("eth", 63)];
        let n = Negotiated::new(&local, &remote);
        let eth = n.by_name("eth").unwrap();
        assert_eq!(eth.desc.version, 63);
        assert_eq!(eth.message_count, 17);
    }

    #[test]
    fn no_overlap_is_empty() {
        let n = Negotiated::new(&[(d("a", 1), 1)], &[d("a", 2), d("b", 1)]);
        assert!(n.is_empty());
    }

    #[test]
    fn routing_covers_exact_ranges() {
        let n = Negotiated::new(&[(d("a", 1), 2), (d("b", 1), 1)], &[d("a", 1), d("b", 1)]);
        assert!(n.route(0x0f).is_none());
        assert_eq!(n.route(0x10).unwrap().desc.name, "a");
        assert_eq!(n.route(0x11).unwrap().desc.name, "a");
        assert_eq!(n.route(0x12).unwrap().desc.name, "b");
        assert!(n.route(0x13).is_none());
    }

    struct Dummy(&'static str, u32);

    impl Capability for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn version(&self) -> u32 {
            self.1
        }
        fn message_count(&self) -> u16 {
            1
        }
        fn interpret(&self, _: &NodeId, _: u16, _: &[u8], _: &CapabilityHost) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_rejects_duplicates_and_keeps_versions_apart() {
        let mut r = CapabilityRegistry::new();
        r.register(Arc::new(Dummy("x", 1))).unwrap();
        r.register(Arc::new(Dummy("x", 2))).unwrap();
        assert!(matches!(
            r.register(Arc::new(Dummy("x", 1))),
            Err(CapabilityError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            r.register(Arc::new(Dummy("", 1))),
            Err(CapabilityError::EmptyName)
        ));
        assert_eq!(r.advertised(), vec![d("x", 1), d("x", 2)]);
        assert_eq!(r.negotiate(&[d("x", 2)]).by_name("x").unwrap().desc.version, 2);
    }

    #[test]
    fn oversized_payload_is_refused_before_lookup() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let host = CapabilityHost::new("x", Arc::new(HostShared::new(tx)));
        let peer = meshwire_core::crypto::Keypair::generate().id();

        assert!(matches!(
            host.send(&peer, 0, vec![0u8; MAX_PAYLOAD_SIZE + 1]),
            Err(CapabilityError::PayloadTooLarge { size, max })
                if size == MAX_PAYLOAD_SIZE + 1 && max == MAX_PAYLOAD_SIZE
        ));
        assert!(matches!(
            host.send(&peer, 0, vec![0u8; 16]),
            Err(CapabilityError::NotConnected(p)) if p == peer
        ));
    }
}
