//! meshwired — standalone meshwire node.
//!
//! Runs a host with a single `echo` capability, keeps the configured
//! required peers connected and saves the network blob on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meshwire_core::config::MeshwireConfig;
use meshwire_core::NodeId;
use meshwire_net::{Capability, CapabilityHost, Host, HostConfig};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Message 0 is a request, message 1 its reply with the same payload.
struct Echo;

impl Capability for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn version(&self) -> u32 {
        1
    }

    fn message_count(&self) -> u16 {
        2
    }

    fn on_connect(&self, peer: &NodeId, host: &CapabilityHost) {
        if let Some(info) = host.peer_info(peer) {
            tracing::info!(peer = %peer.short(), client = %info.client_id, addr = %info.remote_addr, "echo peer connected");
        }
    }

    fn interpret(
        &self,
        peer: &NodeId,
        message_id: u16,
        payload: &[u8],
        host: &CapabilityHost,
    ) -> anyhow::Result<()> {
        match message_id {
            0 => host.send(peer, 1, payload.to_vec())?,
            1 => {
                tracing::debug!(peer = %peer.short(), len = payload.len(), "echo reply");
                host.add_rating(peer, 1);
            }
            other => anyhow::bail!("unknown echo message {other}"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = MeshwireConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshwireConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshwireConfig::default()
    });

    let network_path = config.identity.network_path.clone();
    let saved = match std::fs::read(&network_path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %network_path.display(), error = %e, "failed to read saved network");
            None
        }
    };

    let host_config = HostConfig::from_config(&config)?;
    let mut host = Host::new(host_config, saved.as_deref());
    host.register(Arc::new(Echo))?;

    for node in config.required_nodes()? {
        host.require_peer(node);
    }

    host.start().await?;
    tracing::info!(node = %host.node(), "meshwired running");

    let mut snapshot = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = snapshot.tick() => {
                let peers = host.peers();
                tracing::info!(
                    peers = peers.len(),
                    known = host.known_peers().len(),
                    endpoint = %host.endpoint(),
                    "status"
                );
                for p in peers {
                    tracing::debug!(peer = %p.id.short(), rating = p.rating, client = %p.client_id, "connected");
                }
            }
        }
    }

    host.stop().await;

    let blob = host.save_network()?;
    if let Some(dir) = network_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(&network_path, blob)
        .with_context(|| format!("failed to write {}", network_path.display()))?;
    tracing::info!(path = %network_path.display(), "network saved");
    Ok(())
}
