//! meshwire integration test harness.
//!
//! Every test runs real hosts over loopback TCP with OS-assigned ports and
//! discovery turned off, so tests can run in parallel.
//!
//!   cargo test --test integration

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use meshwire_core::NodeId;
use meshwire_net::{
    Capability, CapabilityError, CapabilityHost, DisconnectReason, Host, HostConfig,
    MAX_PAYLOAD_SIZE,
};
use parking_lot::Mutex;

mod delivery;
mod persistence;
mod policy;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Loopback host with fast timers.
pub fn test_config() -> HostConfig {
    HostConfig {
        listen_address: IpAddr::from([127, 0, 0, 1]),
        listen_port: 0,
        discovery: false,
        handshake_timeout: Duration::from_secs(3),
        shutdown_grace: Duration::from_millis(500),
        maintenance_interval: Duration::from_millis(50),
        ..HostConfig::default()
    }
}

/// Start a host with the given capabilities.
pub async fn start_host(
    config: HostConfig,
    saved: Option<&[u8]>,
    caps: &[Arc<Recorder>],
) -> Result<Host> {
    let mut host = Host::new(config, saved);
    for cap in caps {
        host.register(cap.clone() as Arc<dyn Capability>)?;
    }
    host.start().await?;
    Ok(host)
}

/// Poll `check` until it holds or `within` elapses.
pub async fn wait_for(within: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {within:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Records everything it is told. Optionally sends `burst` numbered
/// messages (id 0, big-endian u32 index padded to `size`) to each new peer.
pub struct Recorder {
    name: String,
    version: u32,
    burst: u32,
    size: usize,
    pub received: Mutex<Vec<(NodeId, u16, Vec<u8>)>>,
    pub connected: Mutex<Vec<NodeId>>,
    pub disconnected: Mutex<Vec<(NodeId, DisconnectReason)>>,
}

impl Recorder {
    pub fn new(name: &str, version: u32) -> Arc<Self> {
        Self::sending(name, version, 0)
    }

    pub fn sending(name: &str, version: u32, burst: u32) -> Arc<Self> {
        Self::sending_sized(name, version, burst, 4)
    }

    pub fn sending_sized(name: &str, version: u32, burst: u32, size: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            version,
            burst,
            size: size.max(4),
            received: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
        })
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }
}

/// Payload of the `index`-th burst message.
pub fn numbered(index: u32, size: usize) -> Vec<u8> {
    let mut payload = vec![0x5a; size.max(4)];
    payload[..4].copy_from_slice(&index.to_be_bytes());
    payload
}

impl Capability for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn message_count(&self) -> u16 {
        2
    }

    fn on_connect(&self, peer: &NodeId, host: &CapabilityHost) {
        self.connected.lock().push(*peer);
        for i in 0..self.burst {
            if let Err(e) = host.send(peer, 0, numbered(i, self.size)) {
                panic!("send {i} failed: {e}");
            }
        }
    }

    fn on_disconnect(&self, peer: &NodeId, reason: DisconnectReason) {
        self.disconnected.lock().push((*peer, reason));
    }

    fn interpret(
        &self,
        peer: &NodeId,
        message_id: u16,
        payload: &[u8],
        _host: &CapabilityHost,
    ) -> anyhow::Result<()> {
        self.received.lock().push((*peer, message_id, payload.to_vec()));
        Ok(())
    }
}
