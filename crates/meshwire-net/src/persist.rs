//! Network blob — node secret and known peers, saved across restarts.
//!
//! ```json
//! { "version": 5, "secret": "<hex>",
//!   "nodes": [ { "id": "<hex>", "endpoint": {..}, "required": false,
//!                "reputation": { "last_connected": 0, ... } } ] }
//! ```
//!
//! Reputation is only written for peers seen in the last 48 hours and for
//! required peers.

use meshwire_core::crypto::{CryptoError, Keypair};
use meshwire_core::wire::PROTOCOL_VERSION;
use meshwire_core::{Endpoint, Node, NodeId};
use serde::{Deserialize, Serialize};

use crate::peer::Peer;
use crate::session::DisconnectReason;

const REPUTATION_WINDOW_SECS: u64 = 48 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Blob {
    version: u32,
    secret: String,
    nodes: Vec<SavedNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedNode {
    id: NodeId,
    endpoint: Endpoint,
    #[serde(default)]
    required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reputation: Option<Reputation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reputation {
    last_connected: u64,
    last_attempted: u64,
    failed_attempts: u32,
    /// Disconnect reason byte.
    last_disconnect: Option<u8>,
    score: i32,
    rating: i32,
}

impl Reputation {
    fn of(peer: &Peer) -> Self {
        Self {
            last_connected: peer.last_connected.unwrap_or(0),
            last_attempted: peer.last_attempted.unwrap_or(0),
            failed_attempts: peer.failed_attempts,
            last_disconnect: peer.last_disconnect.map(DisconnectReason::as_byte),
            score: peer.score,
            rating: peer.rating,
        }
    }

    fn apply(&self, peer: &mut Peer) {
        peer.last_connected = (self.last_connected != 0).then_some(self.last_connected);
        peer.last_attempted = (self.last_attempted != 0).then_some(self.last_attempted);
        peer.failed_attempts = self.failed_attempts;
        peer.last_disconnect = self.last_disconnect.and_then(DisconnectReason::from_byte);
        peer.score = self.score;
        peer.rating = self.rating;
    }
}

/// Serialize the identity and the peers worth remembering.
pub fn save<'a>(
    keypair: &Keypair,
    peers: impl IntoIterator<Item = &'a Peer>,
    now: u64,
) -> Result<Vec<u8>, PersistError> {
    let own = keypair.id();
    let nodes = peers
        .into_iter()
        .filter(|p| p.node.id != own && (p.required || p.node.endpoint.is_reachable()))
        .map(|p| {
            let recent = p
                .last_connected
                .is_some_and(|at| now.saturating_sub(at) < REPUTATION_WINDOW_SECS);
            SavedNode {
                id: p.node.id,
                endpoint: p.node.endpoint,
                required: p.required,
                reputation: (recent || p.required).then(|| Reputation::of(p)),
            }
        })
        .collect();

    let blob = Blob {
        version: PROTOCOL_VERSION,
        secret: hex::encode(&keypair.secret_bytes()[..]),
        nodes,
    };
    Ok(serde_json::to_vec_pretty(&blob)?)
}

pub struct Restored {
    pub keypair: Keypair,
    pub peers: Vec<Peer>,
}

pub fn restore(bytes: &[u8]) -> Result<Restored, PersistError> {
    let blob: Blob = serde_json::from_slice(bytes)?;
    if blob.version < PROTOCOL_VERSION.saturating_sub(1) {
        return Err(PersistError::Version(blob.version));
    }
    let secret = zeroize::Zeroizing::new(
        hex::decode(blob.secret.trim()).map_err(|_| PersistError::BadSecret)?,
    );
    let keypair = Keypair::from_secret_bytes(&secret)?;
    let own = keypair.id();

    let peers = blob
        .nodes
        .into_iter()
        .filter(|n| n.id != own && !n.id.is_zero())
        .map(|n| {
            let mut peer = Peer::new(Node::new(n.id, n.endpoint), n.required);
            if let Some(rep) = &n.reputation {
                rep.apply(&mut peer);
            }
            peer
        })
        .collect();

    Ok(Restored { keypair, peers })
}

/// `restore`, falling back to a fresh identity and no peers.
pub fn restore_or_fresh(bytes: Option<&[u8]>) -> Restored {
    let Some(bytes) = bytes.filter(|b| !b.is_empty()) else {
        return Restored {
            keypair: Keypair::generate(),
            peers: Vec::new(),
        };
    };
    match restore(bytes) {
        Ok(r) => {
            tracing::info!(node = %r.keypair.id().short(), peers = r.peers.len(), "network restored");
            r
        }
        Err(e) => {
            tracing::warn!(error = %e, "ignoring saved network, starting with a fresh identity");
            Restored {
                keypair: Keypair::generate(),
                peers: Vec::new(),
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("saved network version {0} is too old")]
    Version(u32),
    #[error("secret is not valid hex")]
    BadSecret,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn peer(byte: u8, required: bool) -> Peer {
        let endpoint = Endpoint::new(format!("10.0.0.{byte}").parse().unwrap(), 30303, 30303);
        Peer::new(Node::new(NodeId([byte; 64]), endpoint), required)
    }

    #[test]
    fn identity_and_peers_survive_a_round_trip() {
        let keypair = Keypair::generate();
        let mut recent = peer(1, false);
        recent.last_connected = Some(NOW - 60);
        recent.last_attempted = Some(NOW - 61);
        recent.rating = 7;
        recent.last_disconnect = Some(DisconnectReason::ClientQuit);
        let stale = {
            let mut p = peer(2, false);
            p.last_connected = Some(NOW - REPUTATION_WINDOW_SECS - 1);
            p.rating = 3;
            p
        };
        let required = peer(3, true);

        let bytes = save(&keypair, [&recent, &stale, &required], NOW).unwrap();
        let restored = restore(&bytes).unwrap();

        assert_eq!(restored.keypair.id(), keypair.id());
        assert_eq!(restored.peers.len(), 3);
        assert_eq!(restored.peers[0], recent);
        // Stale peers come back without reputation.
        assert_eq!(restored.peers[1], peer(2, false));
        assert!(restored.peers[2].required);
    }

    #[test]
    fn own_id_and_unreachable_optional_peers_are_not_saved() {
        let keypair = Keypair::generate();
        let here = Endpoint::new("10.0.0.9".parse().unwrap(), 1, 1);
        let own = Peer::new(Node::new(keypair.id(), here), false);
        let nowhere = Peer::new(Node::new(NodeId([4; 64]), Endpoint::unspecified()), false);
        let bytes = save(&keypair, [&own, &nowhere], NOW).unwrap();
        assert!(restore(&bytes).unwrap().peers.is_empty());
    }

    #[test]
    fn corrupt_blob_falls_back_to_fresh_identity() {
        let a = restore_or_fresh(Some(&b"{ not json"[..]));
        let b = restore_or_fresh(Some(&b"{ not json"[..]));
        assert!(a.peers.is_empty());
        assert_ne!(a.keypair.id(), b.keypair.id());
        assert!(restore_or_fresh(None).peers.is_empty());
    }

    #[test]
    fn old_versions_are_rejected() {
        let keypair = Keypair::generate();
        let bytes = save(&keypair, Vec::<&Peer>::new(), NOW).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["version"] = serde_json::json!(PROTOCOL_VERSION - 2);
        let old = serde_json::to_vec(&value).unwrap();
        assert!(matches!(restore(&old), Err(PersistError::Version(_))));

        value["version"] = serde_json::json!(PROTOCOL_VERSION - 1);
        let previous = serde_json::to_vec(&value).unwrap();
        assert_eq!(restore(&previous).unwrap().keypair.id(), keypair.id());
    }

    #[test]
    fn bad_secret_is_an_error() {
        let blob = format!(r#"{{"version":{PROTOCOL_VERSION},"secret":"zz","nodes":[]}}"#);
        assert!(matches!(restore(blob.as_bytes()), Err(PersistError::BadSecret)));
    }
}
