//! Discovery service — drives a `NodeTable` from a UDP socket.
//!
//! One task owns the socket and the table. Datagrams, host commands and
//! timers are handled in a single select loop; table events are forwarded
//! to the host after every step.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use meshwire_core::wire::MAX_PACKET_SIZE;
use meshwire_core::{Endpoint, Node, NodeId};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::table::{DiscoveryEvent, NodeTable, Outgoing};
use crate::endpoint::EndpointTracker;

#[derive(Debug)]
pub enum DiscoveryCommand {
    AddNode(Node),
    Lookup(NodeId),
    SetLocalEndpoint(Endpoint),
    Snapshot(oneshot::Sender<Vec<Node>>),
}

pub struct DiscoveryService {
    socket: UdpSocket,
    table: NodeTable,
    tracker: Arc<EndpointTracker>,
    commands: mpsc::UnboundedReceiver<DiscoveryCommand>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl DiscoveryService {
    pub fn new(
        socket: UdpSocket,
        table: NodeTable,
        tracker: Arc<EndpointTracker>,
        commands: mpsc::UnboundedReceiver<DiscoveryCommand>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            table,
            tracker,
            commands,
            events,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        // One spare byte so oversized datagrams are seen as such.
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        let mut tick = tokio::time::interval(self.table.config().tick_interval);
        let mut refresh = tokio::time::interval(self.table.config().refresh_interval);

        tracing::info!(
            node = %self.table.local_id().short(),
            endpoint = %self.table.local_endpoint(),
            "discovery started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "discovery recv_from failed");
                            continue;
                        }
                    };
                    match self.table.handle_datagram(from, &buf[..len], Instant::now()) {
                        Ok(out) => self.send_all(out).await,
                        Err(e) => tracing::debug!(%from, error = %e, "dropped discovery packet"),
                    }
                }

                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!("discovery command channel closed");
                        return Ok(());
                    };
                    self.handle_command(cmd).await;
                }

                _ = tick.tick() => {
                    let out = self.table.tick(Instant::now());
                    self.send_all(out).await;
                    self.tracker.collect_expired();
                }

                _ = refresh.tick() => {
                    let out = self.table.refresh(Instant::now());
                    self.send_all(out).await;
                }
            }

            for event in self.table.drain_events() {
                if self.events.send(event).is_err() {
                    tracing::debug!("discovery event receiver gone");
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: DiscoveryCommand) {
        let now = Instant::now();
        match cmd {
            DiscoveryCommand::AddNode(node) => {
                let out = self.table.add_node(node, now);
                self.send_all(out).await;
            }
            DiscoveryCommand::Lookup(target) => {
                let out = self.table.lookup(&target, now);
                self.send_all(out).await;
            }
            DiscoveryCommand::SetLocalEndpoint(endpoint) => {
                tracing::info!(%endpoint, "advertised endpoint updated");
                self.table.set_local_endpoint(endpoint);
            }
            DiscoveryCommand::Snapshot(reply) => {
                let _ = reply.send(self.table.nodes());
            }
        }
    }

    async fn send_all(&self, out: Vec<Outgoing>) {
        for o in out {
            if let Err(e) = self.socket.send_to(&o.bytes, o.to).await {
                tracing::debug!(to = %o.to, error = %e, "discovery send failed");
            }
        }
    }
}

/// Handle to a running discovery task.
pub struct DiscoveryHandle {
    commands: mpsc::UnboundedSender<DiscoveryCommand>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Spawn the service. Events go to `events`.
    pub fn spawn(
        socket: UdpSocket,
        table: NodeTable,
        tracker: Arc<EndpointTracker>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let service =
            DiscoveryService::new(socket, table, tracker, commands_rx, events, shutdown_rx);
        let task = tokio::spawn(async move {
            if let Err(e) = service.run().await {
                tracing::error!(error = %e, "discovery failed");
            }
        });
        Self {
            commands,
            shutdown,
            task,
        }
    }

    pub fn send(&self, cmd: DiscoveryCommand) {
        if self.commands.send(cmd).is_err() {
            tracing::debug!("discovery is not running");
        }
    }

    pub async fn snapshot(&self) -> Vec<Node> {
        let (tx, rx) = oneshot::channel();
        self.send(DiscoveryCommand::Snapshot(tx));
        rx.await.unwrap_or_default()
    }

    /// Stop the task and wait for it to release the socket.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "discovery task panicked");
        }
    }
}
