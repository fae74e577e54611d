//! Peer records — what the host remembers about a node between sessions.
//!
//! Times are unix seconds so records survive a restart unchanged.

use meshwire_core::Node;

use crate::session::DisconnectReason;

/// Reconnection delay for required peers.
const REQUIRED_FALLBACK_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node: Node,
    pub required: bool,
    pub last_connected: Option<u64>,
    pub last_attempted: Option<u64>,
    pub failed_attempts: u32,
    pub last_disconnect: Option<DisconnectReason>,
    pub score: i32,
    pub rating: i32,
}

impl Peer {
    pub fn new(node: Node, required: bool) -> Self {
        Self {
            node,
            required,
            last_connected: None,
            last_attempted: None,
            failed_attempts: 0,
            last_disconnect: None,
            score: 0,
            rating: 0,
        }
    }

    /// Seconds to wait after the last attempt before dialing again.
    pub fn fallback_seconds(&self) -> u64 {
        if self.required {
            return REQUIRED_FALLBACK_SECS;
        }
        let n = u64::from(self.failed_attempts);
        match self.last_disconnect {
            Some(DisconnectReason::BadProtocol) => 30 * (n + 1),
            Some(DisconnectReason::UselessPeer | DisconnectReason::TooManyPeers) => 25 * (n + 1),
            Some(DisconnectReason::ClientQuit) => 15 * (n + 1),
            _ if n < 5 => 5 * n.max(1),
            _ if n < 15 => 25 + 10 * (n - 5),
            _ => 125 + 20 * (n - 15),
        }
    }

    /// Optional peers that told us, one way or another, not to come back.
    pub fn is_useless(&self) -> bool {
        if self.required {
            return false;
        }
        match self.last_disconnect {
            Some(reason) if reason.is_permanent() => true,
            Some(DisconnectReason::BadProtocol | DisconnectReason::UselessPeer) => {
                self.failed_attempts > 1
            }
            _ => false,
        }
    }

    pub fn should_reconnect(&self, now: u64) -> bool {
        if self.is_useless() || !self.node.endpoint.is_reachable() {
            return false;
        }
        match self.last_attempted {
            None => true,
            Some(at) => now.saturating_sub(at) >= self.fallback_seconds(),
        }
    }

    /// A dial is starting. Counts as a failure until a session proves otherwise.
    pub fn note_attempt(&mut self, now: u64) {
        self.last_attempted = Some(now);
        self.failed_attempts = self.failed_attempts.saturating_add(1);
    }

    pub fn note_dial_failed(&mut self) {
        self.last_disconnect = Some(DisconnectReason::TcpError);
    }

    /// A session started. Counts as the latest attempt.
    pub fn note_connected(&mut self, now: u64) {
        self.last_connected = Some(now);
        self.last_attempted = Some(self.last_attempted.map_or(now, |at| at.max(now)));
        self.last_disconnect = None;
    }

    pub fn note_disconnect(&mut self, reason: DisconnectReason) {
        self.last_disconnect = Some(reason);
        self.rating /= 2;
        self.score /= 2;
    }

    pub fn add_rating(&mut self, delta: i32) {
        self.rating = self.rating.saturating_add(delta);
        self.score = self.score.saturating_add(delta);
        if delta >= 0 {
            self.failed_attempts = 0;
        }
    }
}
