//! Node table — the discovery protocol as a synchronous state machine.
//!
//! The table never touches a socket. Incoming datagrams, timer ticks and
//! commands go in; datagrams to send come out as `Outgoing`, and changes
//! the host cares about are queued as `DiscoveryEvent`s.
//!
//! A node is only trusted after it answered one of our Pings with a Pong
//! echoing that Ping's hash. Until then it is pending: it is not returned in
//! Neighbours, its FindNode requests are ignored, and it is not reported.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshwire_core::config::TimeoutConfig;
use meshwire_core::crypto::{keccak256, Keypair};
use meshwire_core::identity::closer_to;
use meshwire_core::wire::{expiration, DISCOVERY_VERSION};
use meshwire_core::{Endpoint, Node, NodeId};
use rand::RngCore;

use super::packet::{self, FindNode, Packet, PacketError, Ping, Pong};
use crate::endpoint::EndpointTracker;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long a Ping or FindNode waits for its answer.
    pub request_timeout: Duration,
    /// Extra Pings sent to a silent node before it is dropped.
    pub ping_retries: u8,
    /// Interval between random lookups and liveness re-checks.
    pub refresh_interval: Duration,
    pub tick_interval: Duration,
    /// Nodes returned per FindNode.
    pub bucket_size: usize,
    /// Concurrent FindNode requests per lookup round.
    pub alpha: usize,
    pub max_lookup_rounds: usize,
    pub table_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            ping_retries: 2,
            refresh_interval: Duration::from_millis(7_200),
            tick_interval: Duration::from_millis(100),
            bucket_size: 16,
            alpha: 3,
            max_lookup_rounds: 8,
            table_capacity: 1024,
        }
    }
}

impl From<&TimeoutConfig> for DiscoveryConfig {
    fn from(t: &TimeoutConfig) -> Self {
        let request_timeout = Duration::from_millis(t.discovery_request_ms);
        Self {
            request_timeout,
            ping_retries: t.discovery_retries,
            refresh_interval: Duration::from_millis(t.discovery_refresh_ms),
            tick_interval: (request_timeout / 4).max(Duration::from_millis(10)),
            ..Self::default()
        }
    }
}

/// What the host hears from discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A node proved its endpoint.
    NodeAdded(Node),
    /// A previously added node stopped answering.
    NodeDropped(NodeId),
}

#[derive(Debug)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Active,
}

struct NodeEntry {
    node: Node,
    state: EntryState,
    last_seen: Option<Instant>,
}

#[derive(Clone, Copy)]
enum PingReason {
    /// First contact: the answer activates the node.
    Verify,
    /// Periodic liveness check of an active node.
    Revalidate,
    /// Table full: if the pinged node stays silent, `replacement` takes its place.
    Evict { replacement: Node },
}

struct PendingPing {
    node: Node,
    sent_at: Instant,
    attempts: u8,
    reason: PingReason,
}

struct Lookup {
    target: NodeId,
    target_hash: [u8; 32],
    queried: HashSet<NodeId>,
    rounds: usize,
    next_round: Instant,
}

pub struct NodeTable {
    keypair: Arc<Keypair>,
    local: Endpoint,
    config: DiscoveryConfig,
    tracker: Arc<EndpointTracker>,
    entries: HashMap<NodeId, NodeEntry>,
    /// Outstanding Pings by packet hash.
    pings: HashMap<[u8; 32], PendingPing>,
    /// Node → hash of its outstanding Ping.
    pinging: HashMap<NodeId, [u8; 32]>,
    /// Nodes we sent FindNode to, and when.
    finds: HashMap<NodeId, Instant>,
    lookups: Vec<Lookup>,
    events: Vec<DiscoveryEvent>,
}

impl NodeTable {
    pub fn new(
        keypair: Arc<Keypair>,
        local: Endpoint,
        config: DiscoveryConfig,
        tracker: Arc<EndpointTracker>,
    ) -> Self {
        Self {
            keypair,
            local,
            config,
            tracker,
            entries: HashMap::new(),
            pings: HashMap::new(),
            pinging: HashMap::new(),
            finds: HashMap::new(),
            lookups: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.keypair.id()
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn set_local_endpoint(&mut self, endpoint: Endpoint) {
        self.local = endpoint;
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.state == EntryState::Active)
    }

    /// Active nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Active)
            .map(|e| e.node)
            .collect()
    }

    /// Up to `count` active nodes closest to `target`.
    pub fn nearest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        self.nearest_to_hash(&keccak256(&target.0), count, |_| true)
    }

    fn nearest_to_hash(
        &self,
        target: &[u8; 32],
        count: usize,
        keep: impl Fn(&NodeId) -> bool,
    ) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Active && keep(&e.node.id))
            .map(|e| e.node)
            .collect();
        nodes.sort_by(|a, b| closer_to(target, &a.id, &b.id));
        nodes.truncate(count);
        nodes
    }

    pub fn drain_events(&mut self) -> Vec<DiscoveryEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Learn about a node. Unknown nodes are pinged; they join the table
    /// once they answer.
    pub fn add_node(&mut self, node: Node, now: Instant) -> Vec<Outgoing> {
        if node.id == self.local_id() || !node.endpoint.is_reachable() {
            return Vec::new();
        }

        if let Some(entry) = self.entries.get(&node.id) {
            if entry.node.endpoint == node.endpoint || entry.state == EntryState::Pending {
                return Vec::new();
            }
            // Known node at a new endpoint: prove the new one before using it.
            tracing::debug!(node = %node.id.short(), endpoint = %node.endpoint, "endpoint changed, re-verifying");
            return self.ping(node, PingReason::Verify, 0, now).into_iter().collect();
        }

        if self.entries.len() >= self.config.table_capacity {
            let oldest = self
                .entries
                .values()
                .filter(|e| e.state == EntryState::Active && !self.pinging.contains_key(&e.node.id))
                .min_by_key(|e| e.last_seen)
                .map(|e| e.node);
            return match oldest {
                Some(oldest) => self
                    .ping(oldest, PingReason::Evict { replacement: node }, 0, now)
                    .into_iter()
                    .collect(),
                None => Vec::new(),
            };
        }

        self.entries.insert(
            node.id,
            NodeEntry {
                node,
                state: EntryState::Pending,
                last_seen: None,
            },
        );
        self.ping(node, PingReason::Verify, 0, now).into_iter().collect()
    }

    /// Start an iterative lookup for nodes near `target`.
    pub fn lookup(&mut self, target: &NodeId, now: Instant) -> Vec<Outgoing> {
        self.lookups.push(Lookup {
            target: *target,
            target_hash: keccak256(&target.0),
            queried: HashSet::new(),
            rounds: 0,
            next_round: now,
        });
        self.run_lookups(now)
    }

    /// Random lookup plus a liveness check of the stalest active node.
    pub fn refresh(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut target = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut target);
        let mut out = self.lookup(&NodeId(target), now);

        let stalest = self
            .entries
            .values()
            .filter(|e| e.state == EntryState::Active && !self.pinging.contains_key(&e.node.id))
            .min_by_key(|e| e.last_seen)
            .map(|e| e.node);
        if let Some(node) = stalest {
            out.extend(self.ping(node, PingReason::Revalidate, 0, now));
        }
        out
    }

    fn ping(&mut self, node: Node, reason: PingReason, attempts: u8, now: Instant) -> Option<Outgoing> {
        if attempts == 0 && self.pinging.contains_key(&node.id) {
            return None;
        }
        let packet = Packet::Ping(Ping {
            version: DISCOVERY_VERSION,
            from: self.local,
            to: node.endpoint,
            expiration: expiration(),
        });
        let encoded = self.encode(&packet)?;

        if let Some(old) = self.pinging.insert(node.id, encoded.hash) {
            self.pings.remove(&old);
        }
        self.pings.insert(
            encoded.hash,
            PendingPing {
                node,
                sent_at: now,
                attempts,
                reason,
            },
        );
        tracing::trace!(node = %node.id.short(), to = %node.endpoint, attempts, "ping");
        Some(Outgoing {
            to: node.endpoint.udp_addr(),
            bytes: encoded.bytes,
        })
    }

    fn encode(&self, packet: &Packet) -> Option<packet::Encoded> {
        match packet::encode(&self.keypair, packet) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode discovery packet");
                None
            }
        }
    }

    // ── Incoming ──────────────────────────────────────────────────────────────

    pub fn handle_datagram(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<Outgoing>, PacketError> {
        let rx = packet::decode(datagram)?;
        if rx.sender == self.local_id() {
            return Ok(Vec::new());
        }

        Ok(match rx.packet {
            Packet::Ping(ping) => self.on_ping(from, rx.sender, rx.hash, ping, now),
            Packet::Pong(pong) => self.on_pong(from, rx.sender, pong, now),
            Packet::FindNode(find) => self.on_find_node(from, rx.sender, find),
            Packet::Neighbours(n) => self.on_neighbours(rx.sender, n.nodes, now),
        })
    }

    fn on_ping(
        &mut self,
        from: SocketAddr,
        sender: NodeId,
        hash: [u8; 32],
        ping: Ping,
        now: Instant,
    ) -> Vec<Outgoing> {
        let observed = Endpoint::from_udp(from, ping.from.tcp_port);
        let pong = Packet::Pong(Pong {
            to: observed,
            echo: hash,
            expiration: expiration(),
        });

        let mut out: Vec<Outgoing> = self
            .encode(&pong)
            .map(|e| Outgoing { to: from, bytes: e.bytes })
            .into_iter()
            .collect();
        out.extend(self.add_node(Node::new(sender, observed), now));
        out
    }

    fn on_pong(&mut self, from: SocketAddr, sender: NodeId, pong: Pong, now: Instant) -> Vec<Outgoing> {
        let pending = match self.pings.remove(&pong.echo) {
            Some(p) if p.node.id == sender => p,
            Some(p) => {
                self.pings.insert(pong.echo, p);
                tracing::debug!(%from, "pong echo belongs to another node");
                return Vec::new();
            }
            None => {
                tracing::trace!(%from, "unsolicited pong");
                return Vec::new();
            }
        };
        self.pinging.remove(&sender);

        let source = Endpoint::from_udp(from, pending.node.endpoint.tcp_port);
        let votes = self.tracker.add_endpoint_statement(source, pong.to);
        tracing::trace!(observed = %pong.to, votes, "endpoint statement");

        match pending.reason {
            PingReason::Verify => {
                let node = pending.node;
                let entry = self.entries.entry(node.id).or_insert(NodeEntry {
                    node,
                    state: EntryState::Pending,
                    last_seen: None,
                });
                let was_active = entry.state == EntryState::Active;
                entry.node = node;
                entry.state = EntryState::Active;
                entry.last_seen = Some(now);
                if !was_active {
                    tracing::debug!(node = %node.id.short(), endpoint = %node.endpoint, "node verified");
                }
                self.events.push(DiscoveryEvent::NodeAdded(node));
            }
            PingReason::Revalidate | PingReason::Evict { .. } => {
                if let Some(entry) = self.entries.get_mut(&sender) {
                    entry.last_seen = Some(now);
                }
            }
        }
        Vec::new()
    }

    fn on_find_node(&mut self, from: SocketAddr, sender: NodeId, find: FindNode) -> Vec<Outgoing> {
        if !self.is_active(&sender) {
            tracing::trace!(%from, "findnode from unverified node");
            return Vec::new();
        }
        let nearest = self.nearest_to_hash(&keccak256(&find.target.0), self.config.bucket_size, |id| {
            *id != sender
        });
        packet::neighbours_packets(&nearest, expiration())
            .iter()
            .filter_map(|p| self.encode(p))
            .map(|e| Outgoing { to: from, bytes: e.bytes })
            .collect()
    }

    fn on_neighbours(&mut self, sender: NodeId, nodes: Vec<Node>, now: Instant) -> Vec<Outgoing> {
        let solicited = self
            .finds
            .get(&sender)
            .is_some_and(|at| now.saturating_duration_since(*at) <= self.config.request_timeout);
        if !solicited {
            tracing::trace!(node = %sender.short(), "unsolicited neighbours");
            return Vec::new();
        }
        let mut out = Vec::new();
        for node in nodes {
            if !self.entries.contains_key(&node.id) {
                out.extend(self.add_node(node, now));
            }
        }
        out
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Expire requests, retry silent Pings and advance lookups.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let timeout = self.config.request_timeout;
        let expired: Vec<[u8; 32]> = self
            .pings
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(hash, _)| *hash)
            .collect();

        let mut out = Vec::new();
        for hash in expired {
            let Some(pending) = self.pings.remove(&hash) else {
                continue;
            };
            if self.pinging.get(&pending.node.id) == Some(&hash) {
                self.pinging.remove(&pending.node.id);
            }
            if pending.attempts < self.config.ping_retries {
                out.extend(self.ping(pending.node, pending.reason, pending.attempts + 1, now));
            } else {
                out.extend(self.unreachable(pending, now));
            }
        }

        self.finds
            .retain(|_, at| now.saturating_duration_since(*at) <= timeout);
        out.extend(self.run_lookups(now));
        out
    }

    fn unreachable(&mut self, pending: PendingPing, now: Instant) -> Vec<Outgoing> {
        let id = pending.node.id;
        tracing::debug!(node = %id.short(), endpoint = %pending.node.endpoint, "node unreachable");

        match pending.reason {
            PingReason::Verify => {
                // A new endpoint for an active node failing leaves the old one in place.
                let pending_entry = self
                    .entries
                    .get(&id)
                    .is_some_and(|e| e.state == EntryState::Pending);
                if pending_entry {
                    self.entries.remove(&id);
                }
                Vec::new()
            }
            PingReason::Revalidate => {
                self.drop_node(&id);
                Vec::new()
            }
            PingReason::Evict { replacement } => {
                self.drop_node(&id);
                self.add_node(replacement, now)
            }
        }
    }

    fn drop_node(&mut self, id: &NodeId) {
        if let Some(entry) = self.entries.remove(id) {
            if entry.state == EntryState::Active {
                self.events.push(DiscoveryEvent::NodeDropped(*id));
            }
        }
    }

    fn run_lookups(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let mut lookups = std::mem::take(&mut self.lookups);

        lookups.retain_mut(|lookup| {
            if lookup.next_round > now {
                return true;
            }
            if lookup.rounds >= self.config.max_lookup_rounds {
                return false;
            }
            let candidates = self.nearest_to_hash(&lookup.target_hash, self.config.alpha, |id| {
                !lookup.queried.contains(id)
            });
            if candidates.is_empty() {
                return false;
            }
            for node in candidates {
                lookup.queried.insert(node.id);
                let find = Packet::FindNode(FindNode {
                    target: lookup.target,
                    expiration: expiration(),
                });
                if let Some(e) = self.encode(&find) {
                    self.finds.insert(node.id, now);
                    out.push(Outgoing {
                        to: node.endpoint.udp_addr(),
                        bytes: e.bytes,
                    });
                }
            }
            lookup.rounds += 1;
            lookup.next_round = now + self.config.request_timeout;
            true
        });

        self.lookups = lookups;
        out
    }
}
