//! Host — owns the listener, discovery and every session.
//!
//! `Host` is the caller-facing handle. Once started, a single host task is
//! the only writer of the session map and the peer table; everything else
//! talks to it over channels and reads the shared snapshots.
//!
//! Connection lifecycle:
//!   1. dial (or accept) → handshake → Hello exchange, in a connection task
//!   2. admission checks in the host task; rejected peers get a Disconnect
//!   3. accepted peers get a session task, tracked by a generational id
//!   4. the session reports `Closed` once; stale reports are ignored

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use meshwire_core::config::MeshwireConfig;
use meshwire_core::crypto::Keypair;
use meshwire_core::wire::{unix_now, PROTOCOL_VERSION};
use meshwire_core::{Endpoint, Node, NodeId};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::capability::{
    CapDesc, Capability, CapabilityError, CapabilityHost, CapabilityRegistry, Negotiated,
};
use crate::discovery::{DiscoveryCommand, DiscoveryConfig, DiscoveryEvent, DiscoveryHandle, NodeTable};
use crate::endpoint::{EndpointTracker, TrackerConfig};
use crate::frame::{self, EgressCoder, IngressCoder};
use crate::handshake;
use crate::peer::Peer;
use crate::persist::{self, PersistError};
use crate::session::{
    self, DisconnectReason, Hello, KeepAlive, SessionEvent, SessionHandle, SessionId,
    SessionParams,
};

/// Handshakes allowed in flight at once; further inbound connections are dropped.
const MAX_PENDING_CONNECTIONS: usize = 64;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_address: IpAddr,
    /// 0 binds TCP and UDP to independent OS-assigned ports.
    pub listen_port: u16,
    pub public_ip: Option<IpAddr>,
    pub upnp: bool,
    pub ideal_peers: usize,
    pub peer_stretch: usize,
    pub hermit: bool,
    pub discovery: bool,
    pub client_id: String,
    /// Bounds handshake plus Hello.
    pub handshake_timeout: Duration,
    pub keepalive: KeepAlive,
    pub shutdown_grace: Duration,
    pub maintenance_interval: Duration,
    pub discovery_config: DiscoveryConfig,
    pub tracker: TrackerConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 30303,
            public_ip: None,
            upnp: false,
            ideal_peers: 11,
            peer_stretch: 7,
            hermit: false,
            discovery: true,
            client_id: format!("meshwire/{}", env!("CARGO_PKG_VERSION")),
            handshake_timeout: Duration::from_secs(5),
            keepalive: KeepAlive {
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(10),
            },
            shutdown_grace: Duration::from_secs(2),
            maintenance_interval: Duration::from_millis(500),
            discovery_config: DiscoveryConfig::default(),
            tracker: TrackerConfig {
                min_votes: 3,
                max_age: Duration::from_secs(600),
            },
        }
    }
}

impl HostConfig {
    pub fn from_config(c: &MeshwireConfig) -> Result<Self, HostError> {
        let listen_address = c
            .network
            .listen_address
            .parse()
            .map_err(|_| HostError::InvalidAddress(c.network.listen_address.clone()))?;
        let public_ip = match c.network.public_ip.trim() {
            "" => None,
            ip => Some(ip.parse().map_err(|_| HostError::InvalidAddress(ip.to_string()))?),
        };
        let t = &c.timeouts;
        Ok(Self {
            listen_address,
            listen_port: c.network.listen_port,
            public_ip,
            upnp: c.network.upnp,
            ideal_peers: c.network.ideal_peers as usize,
            peer_stretch: c.network.peer_stretch.max(1) as usize,
            hermit: c.network.hermit,
            discovery: c.network.discovery,
            client_id: c.network.client_id.clone(),
            handshake_timeout: Duration::from_millis(t.handshake_ms),
            keepalive: KeepAlive {
                interval: Duration::from_secs(t.ping_interval_secs),
                timeout: Duration::from_secs(t.ping_timeout_secs),
            },
            shutdown_grace: Duration::from_millis(t.shutdown_grace_ms),
            discovery_config: DiscoveryConfig::from(t),
            tracker: TrackerConfig::from(&c.endpoint),
            ..Self::default()
        })
    }

    fn runs_discovery(&self) -> bool {
        self.discovery && !self.hermit
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// A connected peer, as reported by `Host::peers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSessionInfo {
    pub id: NodeId,
    pub client_id: String,
    pub remote_addr: SocketAddr,
    pub listen_port: u16,
    pub capabilities: Vec<CapDesc>,
    pub protocol_version: u32,
    pub rating: i32,
    /// Unix seconds.
    pub connected_at: u64,
}

pub(crate) struct SessionEntry {
    pub(crate) handle: SessionHandle,
    pub(crate) negotiated: Arc<Negotiated>,
    pub(crate) info: PeerSessionInfo,
    outbound: bool,
}

#[derive(Debug)]
pub(crate) enum HostCommand {
    AddNode(Node),
    RequirePeer(Node),
    AddRating(NodeId, i32),
    Disconnect(NodeId, DisconnectReason),
}

/// State readable from any thread; written only by the host task.
pub(crate) struct HostShared {
    pub(crate) sessions: DashMap<NodeId, SessionEntry>,
    pub(crate) peers: RwLock<HashMap<NodeId, Peer>>,
    endpoint: RwLock<Endpoint>,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl HostShared {
    pub(crate) fn new(commands: mpsc::UnboundedSender<HostCommand>) -> Self {
        Self {
            sessions: DashMap::new(),
            peers: RwLock::new(HashMap::new()),
            endpoint: RwLock::new(Endpoint::unspecified()),
            commands,
        }
    }

    pub(crate) fn command(&self, cmd: HostCommand) {
        if self.commands.send(cmd).is_err() {
            tracing::debug!("host is not running");
        }
    }
}

// ── Host handle ───────────────────────────────────────────────────────────────

struct Running {
    task: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

pub struct Host {
    config: HostConfig,
    keypair: Arc<Keypair>,
    registry: CapabilityRegistry,
    cap_hosts: HashMap<String, CapabilityHost>,
    shared: Arc<HostShared>,
    commands: Option<mpsc::UnboundedReceiver<HostCommand>>,
    ports: Option<(u16, u16)>,
    running: Option<Running>,
}

impl Host {
    /// Create a host, reusing the identity and peers in `saved` when it is a
    /// valid network blob.
    pub fn new(config: HostConfig, saved: Option<&[u8]>) -> Self {
        let restored = persist::restore_or_fresh(saved);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let shared = Arc::new(HostShared::new(commands_tx));
        {
            let mut peers = shared.peers.write();
            for peer in restored.peers {
                peers.insert(peer.node.id, peer);
            }
        }
        Self {
            config,
            keypair: Arc::new(restored.keypair),
            registry: CapabilityRegistry::new(),
            cap_hosts: HashMap::new(),
            shared,
            commands: Some(commands),
            ports: None,
            running: None,
        }
    }

    /// Register a capability. Only allowed before `start`.
    pub fn register(&mut self, cap: Arc<dyn Capability>) -> Result<CapabilityHost, HostError> {
        if self.commands.is_none() {
            return Err(HostError::AlreadyStarted);
        }
        let desc = self.registry.register(cap)?;
        let host = self
            .cap_hosts
            .entry(desc.name.clone())
            .or_insert_with(|| CapabilityHost::new(&desc.name, self.shared.clone()))
            .clone();
        tracing::debug!(capability = %desc, "capability registered");
        Ok(host)
    }

    pub async fn start(&mut self) -> Result<(), HostError> {
        if self.commands.is_none() {
            return Err(HostError::AlreadyStarted);
        }
        let config = self.config.clone();

        let listener = bind_tcp(SocketAddr::new(config.listen_address, config.listen_port))?;
        let tcp_port = listener.local_addr()?.port();

        let (discovery_tx, discovery_events) = mpsc::unbounded_channel();
        let tracker = Arc::new(EndpointTracker::new(config.tracker));
        let mut udp_port = tcp_port;
        let mut discovery = None;
        if config.runs_discovery() {
            let socket = bind_udp(SocketAddr::new(config.listen_address, config.listen_port))?;
            udp_port = socket.local_addr()?.port();
            let local = Endpoint::new(config.listen_address, udp_port, tcp_port);
            let table = NodeTable::new(
                self.keypair.clone(),
                local,
                config.discovery_config.clone(),
                tracker.clone(),
            );
            discovery = Some(DiscoveryHandle::spawn(socket, table, tracker.clone(), discovery_tx));
        }

        if config.upnp {
            tracing::warn!("upnp port mapping is not supported, continuing without it");
        }

        let advertised = Endpoint::new(
            config.public_ip.unwrap_or(config.listen_address),
            udp_port,
            tcp_port,
        );
        *self.shared.endpoint.write() = advertised;
        if let (Some(d), Some(ip)) = (&discovery, config.public_ip) {
            d.send(DiscoveryCommand::SetLocalEndpoint(Endpoint::new(ip, udp_port, tcp_port)));
        }

        let hello = Hello {
            protocol_version: PROTOCOL_VERSION,
            client_id: config.client_id.clone(),
            capabilities: self.registry.advertised(),
            listen_port: tcp_port,
            node_id: self.keypair.id(),
        };

        let commands = self.commands.take().ok_or(HostError::AlreadyStarted)?;
        let (session_events_tx, session_events) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = HostTask {
            config,
            keypair: self.keypair.clone(),
            registry: self.registry.clone(),
            cap_hosts: self.cap_hosts.clone(),
            shared: self.shared.clone(),
            listener: Some(listener),
            discovery,
            discovery_events,
            tracker,
            commands,
            session_events_tx,
            session_events,
            connections: JoinSet::new(),
            dialing: HashSet::new(),
            next_session: 0,
            hello,
            ports: (udp_port, tcp_port),
            shutdown: shutdown_rx,
        };

        tracing::info!(
            node = %self.keypair.id().short(),
            endpoint = %advertised,
            "host started"
        );
        let task = tokio::spawn(async move {
            if let Err(e) = task.run().await {
                tracing::error!(error = %e, "host task failed");
            }
        });

        self.ports = Some((udp_port, tcp_port));
        self.running = Some(Running { task, shutdown });
        Ok(())
    }

    /// Disconnect everyone, stop discovery and release the sockets.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if let Err(e) = running.task.await {
            tracing::warn!(error = %e, "host task panicked");
        }
    }

    pub fn id(&self) -> NodeId {
        self.keypair.id()
    }

    /// The endpoint we tell other nodes about.
    pub fn endpoint(&self) -> Endpoint {
        *self.shared.endpoint.read()
    }

    /// Bound TCP port, once started.
    pub fn listen_port(&self) -> Option<u16> {
        self.ports.map(|(_, tcp)| tcp)
    }

    pub fn node(&self) -> Node {
        Node::new(self.id(), self.endpoint())
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Introduce a node. With discovery on it is verified first.
    pub fn add_node(&self, node: Node) {
        self.shared.command(HostCommand::AddNode(node));
    }

    /// Keep a connection to `node` at all times, even in hermit mode.
    pub fn require_peer(&self, node: Node) {
        self.shared.command(HostCommand::RequirePeer(node));
    }

    pub fn disconnect(&self, peer: &NodeId, reason: DisconnectReason) {
        self.shared.command(HostCommand::Disconnect(*peer, reason));
    }

    pub fn peer_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Connected peers, highest rated first.
    pub fn peers(&self) -> Vec<PeerSessionInfo> {
        let mut out: Vec<PeerSessionInfo> =
            self.shared.sessions.iter().map(|e| e.info.clone()).collect();
        {
            let peers = self.shared.peers.read();
            for info in &mut out {
                info.rating = peers.get(&info.id).map_or(0, |p| p.rating);
            }
        }
        out.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.id.cmp(&b.id)));
        out
    }

    /// Known peers, connected or not.
    pub fn known_peers(&self) -> Vec<Node> {
        self.shared.peers.read().values().map(|p| p.node).collect()
    }

    /// Identity and peer table as a blob for `Host::new`.
    pub fn save_network(&self) -> Result<Vec<u8>, HostError> {
        let peers = self.shared.peers.read();
        Ok(persist::save(&self.keypair, peers.values(), unix_now())?)
    }
}

// ── Host task ─────────────────────────────────────────────────────────────────

struct Established {
    remote: NodeId,
    addr: SocketAddr,
    outbound: bool,
    hello: Hello,
    reader: FramedRead<OwnedReadHalf, IngressCoder>,
    writer: FramedWrite<OwnedWriteHalf, EgressCoder>,
}

enum Attempt {
    Dial(NodeId),
    Accept(SocketAddr),
}

struct HostTask {
    config: HostConfig,
    keypair: Arc<Keypair>,
    registry: CapabilityRegistry,
    cap_hosts: HashMap<String, CapabilityHost>,
    shared: Arc<HostShared>,
    listener: Option<TcpListener>,
    discovery: Option<DiscoveryHandle>,
    discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    tracker: Arc<EndpointTracker>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    session_events_tx: mpsc::UnboundedSender<SessionEvent>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    connections: JoinSet<(Attempt, anyhow::Result<Established>)>,
    /// Outbound attempts in flight.
    dialing: HashSet<NodeId>,
    next_session: u64,
    hello: Hello,
    /// (udp, tcp)
    ports: (u16, u16),
    shutdown: oneshot::Receiver<()>,
}

async fn accept_from(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

impl HostTask {
    async fn run(mut self) -> anyhow::Result<()> {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let known: Vec<Node> = self.shared.peers.read().values().map(|p| p.node).collect();
        if let Some(d) = &self.discovery {
            for node in known {
                d.send(DiscoveryCommand::AddNode(node));
            }
        }

        let discovering = self.discovery.is_some();
        loop {
            tokio::select! {
                _ = &mut self.shutdown => break,

                accepted = accept_from(&self.listener) => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },

                Some(cmd) = self.commands.recv() => self.on_command(cmd),

                Some(event) = self.session_events.recv() => self.on_session_event(event),

                Some(event) = self.discovery_events.recv(), if discovering => {
                    self.on_discovery_event(event);
                }

                Some(joined) = self.connections.join_next() => match joined {
                    Ok((attempt, result)) => self.on_connection(attempt, result),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::warn!(error = %e, "connection task panicked"),
                },

                _ = maintenance.tick() => self.maintain(),
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(mut self) {
        tracing::info!("host shutting down");

        // Stop accepting and abandon attempts in flight.
        drop(self.listener.take());
        self.connections.abort_all();
        while self.connections.join_next().await.is_some() {}
        self.dialing.clear();

        let handles: Vec<SessionHandle> =
            self.shared.sessions.iter().map(|e| e.handle.clone()).collect();
        for handle in &handles {
            handle.disconnect(DisconnectReason::ClientQuit);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !self.shared.sessions.is_empty() {
            match tokio::time::timeout_at(deadline, self.session_events.recv()).await {
                Ok(Some(event)) => self.on_session_event(event),
                Ok(None) | Err(_) => break,
            }
        }
        let lingering = self.shared.sessions.len();
        if lingering > 0 {
            tracing::warn!(sessions = lingering, "sessions did not close within the grace period");
            self.shared.sessions.clear();
        }

        if let Some(d) = self.discovery.take() {
            d.stop().await;
        }
        tracing::info!("host stopped");
    }

    // ── Inputs ────────────────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::AddNode(node) => {
                if node.id == self.keypair.id() {
                    return;
                }
                match &self.discovery {
                    Some(d) => d.send(DiscoveryCommand::AddNode(node)),
                    None => {
                        self.shared
                            .peers
                            .write()
                            .entry(node.id)
                            .or_insert_with(|| Peer::new(node, false));
                    }
                }
            }
            HostCommand::RequirePeer(node) => {
                if node.id == self.keypair.id() {
                    tracing::warn!("refusing to require ourselves as a peer");
                    return;
                }
                {
                    let mut peers = self.shared.peers.write();
                    let peer = peers.entry(node.id).or_insert_with(|| Peer::new(node, true));
                    peer.required = true;
                    if node.endpoint.is_reachable() {
                        peer.node.endpoint = node.endpoint;
                    }
                }
                if let Some(d) = &self.discovery {
                    d.send(DiscoveryCommand::AddNode(node));
                }
                tracing::debug!(peer = %node.id.short(), "peer required");
                self.maintain();
            }
            HostCommand::AddRating(id, delta) => {
                if let Some(p) = self.shared.peers.write().get_mut(&id) {
                    p.add_rating(delta);
                }
            }
            HostCommand::Disconnect(id, reason) => {
                if let Some(entry) = self.shared.sessions.get(&id) {
                    entry.handle.disconnect(reason);
                }
            }
        }
    }

    fn on_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::NodeAdded(node) => {
                let mut peers = self.shared.peers.write();
                let peer = peers.entry(node.id).or_insert_with(|| Peer::new(node, false));
                if !peer.required || !peer.node.endpoint.is_reachable() {
                    peer.node.endpoint = node.endpoint;
                }
                tracing::debug!(peer = %node.id.short(), endpoint = %node.endpoint, "node discovered");
            }
            DiscoveryEvent::NodeDropped(id) => {
                if self.shared.sessions.contains_key(&id) {
                    return;
                }
                let mut peers = self.shared.peers.write();
                if peers.get(&id).is_some_and(|p| !p.required) {
                    peers.remove(&id);
                }
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let SessionEvent::Closed { id, node, reason } = event;
        if self
            .shared
            .sessions
            .remove_if(&node, |_, entry| entry.handle.id == id)
            .is_none()
        {
            tracing::trace!(session = %id, "ignoring close of a replaced session");
            return;
        }
        if let Some(p) = self.shared.peers.write().get_mut(&node) {
            p.note_disconnect(reason);
        }
        tracing::info!(peer = %node.short(), session = %id, %reason, remaining = self.shared.sessions.len(), "session closed");
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.connections.len() >= MAX_PENDING_CONNECTIONS {
            tracing::debug!(%addr, "too many pending connections, dropping");
            return;
        }
        tracing::trace!(%addr, "inbound connection");
        let keypair = self.keypair.clone();
        let hello = self.hello.clone();
        let timeout = self.config.handshake_timeout;
        self.connections.spawn(async move {
            let result = bounded(timeout, accept(stream, addr, keypair, hello)).await;
            (Attempt::Accept(addr), result)
        });
    }

    fn dial(&mut self, node: Node) {
        if !self.dialing.insert(node.id) {
            return;
        }
        if let Some(p) = self.shared.peers.write().get_mut(&node.id) {
            p.note_attempt(unix_now());
        }
        tracing::debug!(peer = %node.id.short(), addr = %node.endpoint.tcp_addr(), "dialing");
        let keypair = self.keypair.clone();
        let hello = self.hello.clone();
        let timeout = self.config.handshake_timeout;
        self.connections.spawn(async move {
            let result = bounded(timeout, connect(node, keypair, hello)).await;
            (Attempt::Dial(node.id), result)
        });
    }

    fn on_connection(&mut self, attempt: Attempt, result: anyhow::Result<Established>) {
        if let Attempt::Dial(id) = &attempt {
            self.dialing.remove(id);
        }
        match result {
            Ok(est) => self.admit(est),
            Err(e) => match attempt {
                Attempt::Dial(id) => {
                    tracing::debug!(peer = %id.short(), error = %e, "dial failed");
                    if let Some(p) = self.shared.peers.write().get_mut(&id) {
                        p.note_dial_failed();
                    }
                }
                Attempt::Accept(addr) => {
                    tracing::debug!(%addr, error = %e, "inbound handshake failed");
                }
            },
        }
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    fn has_slot(&self, outbound: bool) -> bool {
        let connected = self.shared.sessions.len();
        if outbound {
            connected < self.config.ideal_peers + self.required_connected()
        } else {
            connected < self.config.ideal_peers * self.config.peer_stretch
        }
    }

    fn required_connected(&self) -> usize {
        let live: Vec<NodeId> = self.shared.sessions.iter().map(|e| *e.key()).collect();
        let peers = self.shared.peers.read();
        live.iter()
            .filter(|id| peers.get(id).is_some_and(|p| p.required))
            .count()
    }

    fn admit(&mut self, est: Established) {
        let own = self.keypair.id();
        let remote = est.remote;
        let negotiated = self.registry.negotiate(&est.hello.capabilities);
        let required = self
            .shared
            .peers
            .read()
            .get(&remote)
            .is_some_and(|p| p.required);
        let existing = self
            .shared
            .sessions
            .get(&remote)
            .map(|e| (e.handle.clone(), e.outbound));

        // Two connections to one peer: both sides keep the one dialed by
        // the lower node id.
        let mut replaces = None;
        let duplicate = match &existing {
            Some((handle, existing_outbound)) => {
                let initiator = |outbound: bool| if outbound { own } else { remote };
                if initiator(est.outbound) < initiator(*existing_outbound) {
                    replaces = Some(handle.clone());
                    false
                } else {
                    true
                }
            }
            None => false,
        };

        let verdict = check_admission(&Admission {
            own: &own,
            remote: &remote,
            hello: &est.hello,
            negotiated: &negotiated,
            hermit: self.config.hermit,
            required,
            duplicate,
            has_slot: replaces.is_some() || self.has_slot(est.outbound),
        });

        if let Err(reason) = verdict {
            tracing::debug!(peer = %remote.short(), addr = %est.addr, %reason, "rejecting peer");
            if reason != DisconnectReason::DuplicatePeer {
                if let Some(p) = self.shared.peers.write().get_mut(&remote) {
                    p.note_disconnect(reason);
                }
            }
            let mut writer = est.writer;
            tokio::spawn(async move {
                session::reject(&mut writer, reason).await;
            });
            return;
        }

        if let Some(old) = replaces {
            tracing::debug!(peer = %remote.short(), session = %old.id, "replacing duplicate session");
            old.disconnect(DisconnectReason::DuplicatePeer);
        }
        self.start_session(est, negotiated);
    }

    fn start_session(&mut self, est: Established, negotiated: Negotiated) {
        self.next_session += 1;
        let id = SessionId(self.next_session);
        let negotiated = Arc::new(negotiated);
        let now = unix_now();

        let handlers = negotiated
            .iter()
            .filter_map(|cap| {
                let handler = self.registry.get(&cap.desc)?;
                let host = self.cap_hosts.get(&cap.desc.name)?.clone();
                Some((handler, host))
            })
            .collect::<Vec<_>>();
        if handlers.len() != negotiated.len() {
            tracing::error!(peer = %est.remote.short(), "negotiated capability without a handler");
            return;
        }

        let info = PeerSessionInfo {
            id: est.remote,
            client_id: est.hello.client_id.clone(),
            remote_addr: est.addr,
            listen_port: est.hello.listen_port,
            capabilities: negotiated.descs(),
            protocol_version: est.hello.protocol_version,
            rating: 0,
            connected_at: now,
        };

        {
            let mut peers = self.shared.peers.write();
            let observed = Endpoint::new(
                est.addr.ip(),
                est.hello.listen_port,
                est.hello.listen_port,
            );
            let peer = peers
                .entry(est.remote)
                .or_insert_with(|| Peer::new(Node::new(est.remote, observed), false));
            if !peer.node.endpoint.is_reachable() && observed.is_reachable() {
                peer.node.endpoint = observed;
            }
            peer.note_connected(now);
        }

        let params = SessionParams {
            id,
            remote: est.remote,
            negotiated: negotiated.clone(),
            handlers,
            keepalive: self.config.keepalive,
            events: self.session_events_tx.clone(),
        };
        // Hold the map entry until the session is recorded so callbacks that
        // look the peer up from `on_connect` always find it.
        let entry = self.shared.sessions.entry(est.remote);
        let handle = session::spawn(params, est.reader, est.writer);
        tracing::info!(
            peer = %est.remote.short(),
            session = %id,
            addr = %est.addr,
            outbound = est.outbound,
            client = %info.client_id,
            "session established"
        );
        entry.insert(SessionEntry {
            handle,
            negotiated,
            info,
            outbound: est.outbound,
        });
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    fn maintain(&mut self) {
        self.update_endpoint();

        let now = unix_now();
        let live: HashSet<NodeId> = self.shared.sessions.iter().map(|e| *e.key()).collect();
        let mut required_connected = 0;
        let mut required = Vec::new();
        let mut optional = Vec::new();
        {
            let peers = self.shared.peers.read();
            for p in peers.values() {
                let connected = live.contains(&p.node.id);
                if connected && p.required {
                    required_connected += 1;
                } else if !connected
                    && !self.dialing.contains(&p.node.id)
                    && p.should_reconnect(now)
                    && (p.required || !self.config.hermit)
                {
                    if p.required {
                        required.push(p.node);
                    } else {
                        optional.push((p.rating, p.node));
                    }
                }
            }
        }

        for node in required {
            self.dial(node);
        }
        if self.config.hermit {
            return;
        }

        optional.sort_by(|a, b| b.0.cmp(&a.0));
        let max_slots = self.config.ideal_peers + required_connected;
        let mut occupied = live.len() + self.dialing.len();
        for (_, node) in optional {
            if occupied >= max_slots {
                break;
            }
            self.dial(node);
            occupied += 1;
        }
    }

    fn update_endpoint(&mut self) {
        if self.config.public_ip.is_some() {
            return;
        }
        let Some(observed) = self.tracker.authoritative_endpoint() else {
            return;
        };
        let (udp, tcp) = self.ports;
        let advertised = Endpoint::new(observed.address, udp, tcp);
        let changed = {
            let mut current = self.shared.endpoint.write();
            let changed = *current != advertised;
            *current = advertised;
            changed
        };
        if changed {
            tracing::info!(endpoint = %advertised, "public endpoint learned");
            if let Some(d) = &self.discovery {
                d.send(DiscoveryCommand::SetLocalEndpoint(advertised));
            }
        }
    }
}

// ── Connection tasks ──────────────────────────────────────────────────────────

/// Run a connection attempt, failing with `HandshakeError::Timeout` after `limit`.
async fn bounded<T>(
    limit: Duration,
    attempt: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    tokio::time::timeout(limit, attempt)
        .await
        .unwrap_or_else(|_| Err(handshake::HandshakeError::Timeout.into()))
}

async fn connect(node: Node, keypair: Arc<Keypair>, hello: Hello) -> anyhow::Result<Established> {
    let addr = node.endpoint.tcp_addr();
    let mut stream = TcpStream::connect(addr).await.context("connect")?;
    stream.set_nodelay(true)?;
    let secrets = handshake::initiate(&mut stream, &keypair, &node.id)
        .await
        .context("handshake")?;
    finish(stream, addr, true, secrets, &hello).await
}

async fn accept(
    mut stream: TcpStream,
    addr: SocketAddr,
    keypair: Arc<Keypair>,
    hello: Hello,
) -> anyhow::Result<Established> {
    stream.set_nodelay(true)?;
    let secrets = handshake::respond(&mut stream, &keypair)
        .await
        .context("handshake")?;
    finish(stream, addr, false, secrets, &hello).await
}

async fn finish(
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    secrets: handshake::Secrets,
    hello: &Hello,
) -> anyhow::Result<Established> {
    let remote = secrets.remote;
    let (egress, ingress) = frame::split(secrets);
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, ingress);
    let mut writer = FramedWrite::new(w, egress);
    let remote_hello = session::exchange_hello(&mut reader, &mut writer, hello)
        .await
        .context("hello")?;
    Ok(Established {
        remote,
        addr,
        outbound,
        hello: remote_hello,
        reader,
        writer,
    })
}

// ── Admission ─────────────────────────────────────────────────────────────────

struct Admission<'a> {
    own: &'a NodeId,
    remote: &'a NodeId,
    hello: &'a Hello,
    negotiated: &'a Negotiated,
    hermit: bool,
    required: bool,
    duplicate: bool,
    has_slot: bool,
}

fn check_admission(a: &Admission<'_>) -> Result<(), DisconnectReason> {
    if a.remote == a.own {
        return Err(DisconnectReason::LocalIdentity);
    }
    if a.hello.node_id != *a.remote {
        return Err(DisconnectReason::UnexpectedIdentity);
    }
    if a.hello.protocol_version < PROTOCOL_VERSION.saturating_sub(1) {
        return Err(DisconnectReason::IncompatibleProtocol);
    }
    if a.negotiated.is_empty() {
        return Err(DisconnectReason::UselessPeer);
    }
    if a.hermit && !a.required {
        return Err(DisconnectReason::UnexpectedIdentity);
    }
    if a.duplicate {
        return Err(DisconnectReason::DuplicatePeer);
    }
    if !a.has_slot && !a.required {
        return Err(DisconnectReason::TooManyPeers);
    }
    Ok(())
}

// ── Sockets ───────────────────────────────────────────────────────────────────

fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, HostError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| HostError::Bind(addr, e))?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, HostError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| HostError::Bind(addr, e))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host already started")]
    AlreadyStarted,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}
