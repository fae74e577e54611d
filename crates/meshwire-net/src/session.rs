//! Session — a live, authenticated connection to one peer.
//!
//! After the handshake and the Hello exchange, a session runs as its own
//! task: it decodes frames, answers base-protocol control messages, routes
//! capability messages by absolute id and keeps the link alive with pings.
//! Outbound frames go through a bounded outbox to a writer task that owns
//! the write half, so a peer that stops reading never stalls our reads.
//!
//! Capability callbacks are run by a separate dispatcher task, one at a
//! time and in arrival order. Once the session starts disconnecting
//! nothing more is dispatched. The host is told about the close exactly
//! once, after the socket is released and `on_disconnect` has run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use meshwire_core::wire::USER_MESSAGE_BASE;
use meshwire_core::NodeId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::capability::{CapDesc, Capability, CapabilityHost, Negotiated};
use crate::frame::{EgressCoder, Frame, FrameError, IngressCoder, MAX_PAYLOAD_SIZE};

// ── Base protocol ─────────────────────────────────────────────────────────────

pub const HELLO: u16 = 0x00;
pub const DISCONNECT: u16 = 0x01;
pub const PING: u16 = 0x02;
pub const PONG: u16 = 0x03;

/// Base protocol frames carry hint 0.
const BASE_HINT: u16 = 0;

/// Upper bound on writing a farewell Disconnect to a peer.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames queued for a session's writer before `send` reports `Full`.
pub const OUTBOX_CAPACITY: usize = 4096;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    TcpError = 0x01,
    BadProtocol = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    DuplicatePeer = 0x05,
    IncompatibleProtocol = 0x06,
    NullIdentity = 0x07,
    ClientQuit = 0x08,
    UnexpectedIdentity = 0x09,
    LocalIdentity = 0x0a,
    PingTimeout = 0x0b,
    UserReason = 0x10,
}

impl DisconnectReason {
    pub fn from_byte(b: u8) -> Option<Self> {
        use DisconnectReason::*;
        Some(match b {
            0x00 => DisconnectRequested,
            0x01 => TcpError,
            0x02 => BadProtocol,
            0x03 => UselessPeer,
            0x04 => TooManyPeers,
            0x05 => DuplicatePeer,
            0x06 => IncompatibleProtocol,
            0x07 => NullIdentity,
            0x08 => ClientQuit,
            0x09 => UnexpectedIdentity,
            0x0a => LocalIdentity,
            0x0b => PingTimeout,
            0x10 => UserReason,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Reasons after which an optional peer is not dialed again.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            DisconnectReason::DuplicatePeer
                | DisconnectReason::IncompatibleProtocol
                | DisconnectReason::NullIdentity
                | DisconnectReason::UnexpectedIdentity
                | DisconnectReason::LocalIdentity
        )
    }

    fn from_payload(payload: &[u8]) -> Self {
        payload
            .first()
            .and_then(|b| Self::from_byte(*b))
            .unwrap_or(DisconnectReason::DisconnectRequested)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::DisconnectRequested => "disconnect requested",
            DisconnectReason::TcpError => "tcp error",
            DisconnectReason::BadProtocol => "bad protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::DuplicatePeer => "duplicate peer",
            DisconnectReason::IncompatibleProtocol => "incompatible protocol",
            DisconnectReason::NullIdentity => "null identity",
            DisconnectReason::ClientQuit => "client quit",
            DisconnectReason::UnexpectedIdentity => "unexpected identity",
            DisconnectReason::LocalIdentity => "local identity",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::UserReason => "user reason",
        };
        f.write_str(s)
    }
}

fn disconnect_frame(reason: DisconnectReason) -> Frame {
    Frame::new(BASE_HINT, DISCONNECT, &[reason.as_byte()])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub client_id: String,
    pub capabilities: Vec<CapDesc>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

impl Hello {
    fn to_frame(&self) -> Result<Frame, SessionError> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::new(BASE_HINT, HELLO, &payload))
    }
}

/// Send our Hello and wait for the peer's. The caller bounds this with the
/// handshake timeout.
pub async fn exchange_hello<R, W>(
    reader: &mut FramedRead<R, IngressCoder>,
    writer: &mut FramedWrite<W, EgressCoder>,
    local: &Hello,
) -> Result<Hello, SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.send(local.to_frame()?).await?;

    let frame = reader.next().await.ok_or(SessionError::Closed)??;
    if frame.capability_hint != BASE_HINT {
        return Err(SessionError::Protocol("hello on a capability channel"));
    }
    match frame.message_id() {
        Some(HELLO) => Ok(serde_json::from_slice(&frame.payload())?),
        Some(DISCONNECT) => Err(SessionError::Disconnected(DisconnectReason::from_payload(
            &frame.payload(),
        ))),
        _ => Err(SessionError::Protocol("expected hello")),
    }
}

/// Tell a peer we will not keep the connection. Best effort.
pub async fn reject<W>(writer: &mut FramedWrite<W, EgressCoder>, reason: DisconnectReason)
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(GOODBYE_TIMEOUT, writer.send(disconnect_frame(reason))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "failed to send disconnect"),
        Err(_) => tracing::debug!("timed out sending disconnect"),
    }
}

// ── Handles and events ────────────────────────────────────────────────────────

/// Generational session id; never reused within one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Closed {
        id: SessionId,
        node: NodeId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub interval: Duration,
    pub timeout: Duration,
}

impl KeepAlive {
    fn check_period(&self) -> Duration {
        (self.interval.min(self.timeout) / 2).max(Duration::from_millis(10))
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub remote: NodeId,
    outbox: mpsc::Sender<Frame>,
    disconnects: mpsc::UnboundedSender<DisconnectReason>,
    active: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Queue a frame for the writer. `message_id` is absolute.
    pub fn send(&self, message_id: u16, hint: u16, payload: &[u8]) -> Result<(), QueueError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(QueueError::TooLarge(payload.len()));
        }
        if !self.is_active() {
            return Err(QueueError::Closed);
        }
        match self.outbox.try_send(Frame::new(hint, message_id, payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.disconnects.send(reason);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote.short())
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct SessionParams {
    pub id: SessionId,
    pub remote: NodeId,
    pub negotiated: Arc<Negotiated>,
    /// Indexed by capability hint − 1.
    pub handlers: Vec<(Arc<dyn Capability>, CapabilityHost)>,
    pub keepalive: KeepAlive,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Start the session, writer and dispatcher tasks.
pub fn spawn<R, W>(
    params: SessionParams,
    reader: FramedRead<R, IngressCoder>,
    writer: FramedWrite<W, EgressCoder>,
) -> SessionHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let SessionParams {
        id,
        remote,
        negotiated,
        handlers,
        keepalive,
        events,
    } = params;

    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let (disconnects, disconnects_rx) = mpsc::unbounded_channel();
    let (dispatch, dispatch_rx) = mpsc::unbounded_channel();
    let (goodbye, goodbye_rx) = oneshot::channel();
    let active = Arc::new(AtomicBool::new(true));

    let dispatcher = Dispatcher {
        remote,
        handlers,
        active: active.clone(),
        queue: dispatch_rx,
        disconnects: disconnects.clone(),
    };
    let writer = Writer {
        sink: writer,
        outbox: outbox_rx,
        goodbye: goodbye_rx,
    };
    let mut session = Session {
        id,
        remote,
        negotiated,
        reader,
        outbox: outbox.clone(),
        disconnects: disconnects_rx,
        dispatch,
        active: active.clone(),
        keepalive,
    };

    tokio::spawn(async move {
        let dispatcher = tokio::spawn(dispatcher.run());
        let mut writer = tokio::spawn(writer.run());

        let reason = session.run(&mut writer, goodbye).await;
        session.active.store(false, Ordering::Release);
        let Session { dispatch, .. } = session;
        let _ = dispatch.send(Dispatch::Closed(reason));
        drop(dispatch);
        if let Err(e) = dispatcher.await {
            tracing::warn!(peer = %remote.short(), error = %e, "capability dispatcher panicked");
        }

        tracing::debug!(peer = %remote.short(), session = %id, %reason, "session task finished");
        let _ = events.send(SessionEvent::Closed {
            id,
            node: remote,
            reason,
        });
    });

    SessionHandle {
        id,
        remote,
        outbox,
        disconnects,
        active,
    }
}

// ── Session task ──────────────────────────────────────────────────────────────

enum Dispatch {
    Message {
        index: usize,
        message_id: u16,
        payload: Bytes,
    },
    Closed(DisconnectReason),
}

/// How a session ends.
enum Close {
    /// Tell the peer why before closing.
    Notify(DisconnectReason),
    /// The peer already knows, or the link is gone.
    Quiet(DisconnectReason),
}

type WriterTask = JoinHandle<Result<(), FrameError>>;

/// Reads frames and watches the link. Never waits on the socket's write side.
struct Session<R> {
    id: SessionId,
    remote: NodeId,
    negotiated: Arc<Negotiated>,
    reader: FramedRead<R, IngressCoder>,
    outbox: mpsc::Sender<Frame>,
    disconnects: mpsc::UnboundedReceiver<DisconnectReason>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    active: Arc<AtomicBool>,
    keepalive: KeepAlive,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(
        &mut self,
        writer: &mut WriterTask,
        goodbye: oneshot::Sender<DisconnectReason>,
    ) -> DisconnectReason {
        let close = self.drive(writer).await;
        self.active.store(false, Ordering::Release);
        match close {
            Close::Notify(reason) => {
                let _ = goodbye.send(reason);
                match tokio::time::timeout(GOODBYE_TIMEOUT, &mut *writer).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => {
                        tracing::debug!(peer = %self.remote.short(), error = %e, "failed to send disconnect");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(peer = %self.remote.short(), error = %e, "session writer panicked");
                    }
                    Err(_) => {
                        tracing::debug!(peer = %self.remote.short(), "timed out sending disconnect");
                        writer.abort();
                    }
                }
                reason
            }
            Close::Quiet(reason) => {
                writer.abort();
                reason
            }
        }
    }

    async fn drive(&mut self, writer: &mut WriterTask) -> Close {
        let mut keepalive = tokio::time::interval(self.keepalive.check_period());
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();
        let mut ping_sent = false;

        loop {
            tokio::select! {
                frame = self.reader.next() => {
                    let frame = match frame {
                        Some(Ok(f)) => f,
                        Some(Err(FrameError::Io(e))) => {
                            tracing::debug!(peer = %self.remote.short(), error = %e, "session read failed");
                            return Close::Quiet(DisconnectReason::TcpError);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(peer = %self.remote.short(), error = %e, "rejecting frame");
                            return Close::Notify(DisconnectReason::BadProtocol);
                        }
                        None => return Close::Quiet(DisconnectReason::TcpError),
                    };
                    last_inbound = Instant::now();
                    ping_sent = false;
                    if let Err(close) = self.on_frame(frame) {
                        return close;
                    }
                }

                reason = self.disconnects.recv() => {
                    let reason = reason.unwrap_or(DisconnectReason::ClientQuit);
                    tracing::debug!(peer = %self.remote.short(), %reason, "disconnecting");
                    return Close::Notify(reason);
                }

                written = &mut *writer => {
                    match written {
                        Ok(Err(e)) => {
                            tracing::debug!(peer = %self.remote.short(), error = %e, "session write failed");
                        }
                        Ok(Ok(())) => {}
                        Err(e) => {
                            tracing::warn!(peer = %self.remote.short(), error = %e, "session writer panicked");
                        }
                    }
                    return Close::Quiet(DisconnectReason::TcpError);
                }

                _ = keepalive.tick() => {
                    let silent = last_inbound.elapsed();
                    if silent >= self.keepalive.interval + self.keepalive.timeout {
                        tracing::debug!(peer = %self.remote.short(), "ping timeout");
                        return Close::Notify(DisconnectReason::PingTimeout);
                    }
                    if silent >= self.keepalive.interval && !ping_sent {
                        ping_sent = self.control(PING);
                    }
                }
            }
        }
    }

    /// Queue a base-protocol frame. A full outbox drops it: frames already
    /// queued reach the peer first and count as traffic.
    fn control(&self, message_id: u16) -> bool {
        self.outbox
            .try_send(Frame::new(BASE_HINT, message_id, &[]))
            .is_ok()
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), Close> {
        let Some(id) = frame.message_id() else {
            return Err(Close::Notify(DisconnectReason::BadProtocol));
        };

        if frame.capability_hint == BASE_HINT {
            if id >= USER_MESSAGE_BASE {
                return Err(Close::Notify(DisconnectReason::BadProtocol));
            }
            return match id {
                HELLO => {
                    tracing::debug!(peer = %self.remote.short(), "duplicate hello");
                    Err(Close::Notify(DisconnectReason::BadProtocol))
                }
                DISCONNECT => {
                    let reason = DisconnectReason::from_payload(&frame.payload());
                    tracing::debug!(peer = %self.remote.short(), %reason, "peer disconnected");
                    Err(Close::Quiet(reason))
                }
                PING => {
                    self.control(PONG);
                    Ok(())
                }
                PONG => Ok(()),
                other => {
                    tracing::trace!(peer = %self.remote.short(), id = other, "ignoring base message");
                    Ok(())
                }
            };
        }

        let Some(cap) = self.negotiated.route(id) else {
            tracing::debug!(peer = %self.remote.short(), id, "message id outside negotiated ranges");
            return Err(Close::Notify(DisconnectReason::BadProtocol));
        };
        if cap.hint != frame.capability_hint {
            tracing::debug!(
                peer = %self.remote.short(),
                id,
                hint = frame.capability_hint,
                "capability hint does not match message id"
            );
            return Err(Close::Notify(DisconnectReason::BadProtocol));
        }

        let msg = Dispatch::Message {
            index: usize::from(cap.hint) - 1,
            message_id: id - cap.offset,
            payload: frame.payload(),
        };
        if self.dispatch.send(msg).is_err() {
            tracing::warn!(session = %self.id, "dispatcher gone");
            return Err(Close::Notify(DisconnectReason::ClientQuit));
        }
        Ok(())
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// Owns the write half. Encodes queued frames in order and, once told to,
/// flushes what is already queued followed by a Disconnect.
struct Writer<W> {
    sink: FramedWrite<W, EgressCoder>,
    outbox: mpsc::Receiver<Frame>,
    goodbye: oneshot::Receiver<DisconnectReason>,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) -> Result<(), FrameError> {
        loop {
            tokio::select! {
                biased;

                reason = &mut self.goodbye => {
                    let Ok(reason) = reason else {
                        return Ok(());
                    };
                    while let Ok(frame) = self.outbox.try_recv() {
                        self.sink.feed(frame).await?;
                    }
                    self.sink.send(disconnect_frame(reason)).await?;
                    return Ok(());
                }

                frame = self.outbox.recv() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    self.sink.feed(frame).await?;
                    while let Ok(frame) = self.outbox.try_recv() {
                        self.sink.feed(frame).await?;
                    }
                    self.sink.flush().await?;
                }
            }
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

struct Dispatcher {
    remote: NodeId,
    handlers: Vec<(Arc<dyn Capability>, CapabilityHost)>,
    active: Arc<AtomicBool>,
    queue: mpsc::UnboundedReceiver<Dispatch>,
    disconnects: mpsc::UnboundedSender<DisconnectReason>,
}

impl Dispatcher {
    async fn run(mut self) {
        for (cap, host) in self.handlers.clone() {
            let peer = self.remote;
            let joined =
                tokio::task::spawn_blocking(move || cap.on_connect(&peer, &host)).await;
            if let Err(e) = joined {
                tracing::warn!(peer = %peer.short(), error = %e, "on_connect panicked");
            }
        }

        while let Some(item) = self.queue.recv().await {
            match item {
                Dispatch::Message {
                    index,
                    message_id,
                    payload,
                } => {
                    if !self.active.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Err(e) = self.interpret(index, message_id, payload).await {
                        tracing::warn!(
                            peer = %self.remote.short(),
                            message_id,
                            error = %e,
                            "capability rejected message"
                        );
                        let _ = self.disconnects.send(DisconnectReason::BadProtocol);
                    }
                }
                Dispatch::Closed(reason) => {
                    self.closed(reason).await;
                    return;
                }
            }
        }
    }

    async fn interpret(&self, index: usize, message_id: u16, payload: Bytes) -> anyhow::Result<()> {
        let Some((cap, host)) = self.handlers.get(index).cloned() else {
            anyhow::bail!("no handler at index {index}");
        };
        let peer = self.remote;
        tokio::task::spawn_blocking(move || cap.interpret(&peer, message_id, &payload, &host))
            .await?
    }

    async fn closed(&self, reason: DisconnectReason) {
        for (cap, _) in self.handlers.iter().cloned() {
            let peer = self.remote;
            let joined =
                tokio::task::spawn_blocking(move || cap.on_disconnect(&peer, reason)).await;
            if let Err(e) = joined {
                tracing::warn!(peer = %peer.short(), error = %e, "on_disconnect panicked");
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("invalid hello: {0}")]
    Hello(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("peer disconnected: {0}")]
    Disconnected(DisconnectReason),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("session is closed")]
    Closed,
    #[error("session outbox is full")]
    Full,
    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),
}
