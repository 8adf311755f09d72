//! Relay: one client WebSocket paired with one upstream TCP connection.
//!
//! DESIGN
//! ======
//! A relay is a single task that runs its two directions concurrently, each
//! with its own halves of the two connections:
//! - Client message → payload bytes + `\n` → upstream
//! - Upstream chunk → UTF-8 text → one client message
//!
//! A direction only waits on its own write, so an upstream that echoes
//! while the client is still sending cannot wedge the relay. Whichever
//! direction ends first (close, EOF, or transport error) moves the
//! `Teardown` state machine out of `Active`; the other direction is dropped,
//! the relay closes the side that is still open exactly once and returns a
//! `RelaySummary`. Nothing escapes the relay: every failure becomes a
//! `CloseReason`.
//!
//! LIFECYCLE
//! =========
//! 1. Dial upstream while still listening to the client. Payloads arriving
//!    before the dial completes are queued (up to `MAX_PENDING_BYTES`) and
//!    flushed in order once connected; a client close during the dial drops
//!    the pending attempt.
//! 2. Pump both directions until one ends.
//! 3. Teardown → close whichever side is still open → summary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::UpstreamAddr;

/// Upstream read size. Each successful read becomes one client message.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Delimiter appended to every client payload on its way upstream.
pub const UPSTREAM_DELIMITER: u8 = b'\n';

/// Most bytes queued for upstream while the dial is still pending.
pub const MAX_PENDING_BYTES: usize = 1 << 20;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream still connecting after {limit} queued bytes")]
    Backlog { limit: usize },
    #[error("upstream transport error: {0}")]
    Upstream(#[from] std::io::Error),
    #[error("client transport error: {0}")]
    Client(#[from] axum::Error),
}

/// Why a relay left `Active`. The first trigger wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    ClientError(String),
    UpstreamError(String),
    ConnectFailed(String),
}

impl CloseReason {
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::ClientClosed | Self::UpstreamClosed)
    }

    /// True when the client side is already gone and must not be closed again.
    fn client_gone(&self) -> bool {
        matches!(self, Self::ClientClosed | Self::ClientError(_))
    }

    /// True when there is no live upstream socket left to shut down.
    fn upstream_gone(&self) -> bool {
        matches!(self, Self::UpstreamClosed | Self::UpstreamError(_) | Self::ConnectFailed(_))
    }
}

impl From<RelayError> for CloseReason {
    fn from(err: RelayError) -> Self {
        let text = err.to_string();
        match err {
            RelayError::Connect { .. } | RelayError::Backlog { .. } => Self::ConnectFailed(text),
            RelayError::Upstream(_) => Self::UpstreamError(text),
            RelayError::Client(_) => Self::ClientError(text),
        }
    }
}

// =============================================================================
// TEARDOWN STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Closing,
    Closed,
}

/// Tracks which sides have been told to close.
///
/// `close_client` / `close_upstream` return `true` only the first time, so
/// the caller issues each close at most once no matter how many triggers
/// fire. The side that ended the relay counts as closed from `begin`.
#[derive(Debug)]
pub struct Teardown {
    phase: Phase,
    reason: Option<CloseReason>,
    client_closed: bool,
    upstream_closed: bool,
}

impl Teardown {
    #[must_use]
    pub fn new() -> Self {
        Self { phase: Phase::Active, reason: None, client_closed: false, upstream_closed: false }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn reason(&self) -> Option<&CloseReason> {
        self.reason.as_ref()
    }

    /// Leave `Active`. Returns `false` if teardown already started.
    pub fn begin(&mut self, reason: CloseReason) -> bool {
        if self.phase != Phase::Active {
            return false;
        }
        self.client_closed |= reason.client_gone();
        self.upstream_closed |= reason.upstream_gone();
        self.reason = Some(reason);
        self.phase = Phase::Closing;
        self.settle();
        true
    }

    /// Returns `true` if the client still needs a close issued.
    pub fn close_client(&mut self) -> bool {
        if self.client_closed {
            return false;
        }
        self.client_closed = true;
        self.settle();
        true
    }

    /// Returns `true` if the upstream still needs a close issued.
    pub fn close_upstream(&mut self) -> bool {
        if self.upstream_closed {
            return false;
        }
        self.upstream_closed = true;
        self.settle();
        true
    }

    fn settle(&mut self) {
        if self.phase == Phase::Closing && self.client_closed && self.upstream_closed {
            self.phase = Phase::Closed;
        }
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// FRAMING
// =============================================================================

/// Payload bytes followed by `\n`, appended even if one is already present.
#[must_use]
pub fn frame_upstream(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.extend_from_slice(payload);
    framed.push(UPSTREAM_DELIMITER);
    framed
}

/// Decode one upstream chunk as text. Invalid UTF-8 becomes U+FFFD.
#[must_use]
pub fn decode_chunk(chunk: &[u8]) -> String {
    String::from_utf8_lossy(chunk).into_owned()
}

enum ClientEvent {
    Payload(Vec<u8>),
    Control,
    Closed,
    Failed(axum::Error),
}

fn classify(msg: Option<Result<Message, axum::Error>>) -> ClientEvent {
    match msg {
        None | Some(Ok(Message::Close(_))) => ClientEvent::Closed,
        Some(Err(e)) => ClientEvent::Failed(e),
        Some(Ok(Message::Text(text))) => ClientEvent::Payload(text.as_str().as_bytes().to_vec()),
        Some(Ok(Message::Binary(bytes))) => ClientEvent::Payload(bytes.to_vec()),
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => ClientEvent::Control,
    }
}

// =============================================================================
// RELAY
// =============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Client messages written upstream.
    pub client_messages: u64,
    /// Upstream chunks sent to the client.
    pub upstream_chunks: u64,
    /// Bytes written upstream, delimiters included.
    pub upstream_bytes: u64,
}

/// Shared by both directions, which run concurrently.
#[derive(Debug, Default)]
struct Counters {
    client_messages: AtomicU64,
    upstream_chunks: AtomicU64,
    upstream_bytes: AtomicU64,
}

impl Counters {
    fn record_upstream_write(&self, bytes: usize) {
        self.client_messages.fetch_add(1, Ordering::Relaxed);
        self.upstream_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_client_send(&self) {
        self.upstream_chunks.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            client_messages: self.client_messages.load(Ordering::Relaxed),
            upstream_chunks: self.upstream_chunks.load(Ordering::Relaxed),
            upstream_bytes: self.upstream_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub id: Uuid,
    pub reason: CloseReason,
    pub phase: Phase,
    pub stats: RelayStats,
    pub elapsed: Duration,
}

pub struct Relay {
    id: Uuid,
    upstream: UpstreamAddr,
    teardown: Teardown,
    counters: Counters,
}

impl Relay {
    #[must_use]
    pub fn new(id: Uuid, upstream: UpstreamAddr) -> Self {
        Self { id, upstream, teardown: Teardown::new(), counters: Counters::default() }
    }

    /// Drive the relay to completion. Both connections are closed on return.
    pub async fn run(mut self, socket: WebSocket) -> RelaySummary {
        let started = Instant::now();
        let relay_id = self.id;
        info!(%relay_id, upstream = %self.upstream, "relay: client connected");

        let (mut client_tx, mut client_rx) = socket.split();
        let dial = TcpStream::connect(self.upstream.to_string());

        let reason = match self.connect(dial, &mut client_rx).await {
            Ok(tcp) => {
                info!(%relay_id, "relay: upstream connected");
                let (mut upstream_rx, mut upstream_tx) = tcp.into_split();
                let reason = self.pump(&mut client_rx, &mut client_tx, &mut upstream_rx, &mut upstream_tx).await;
                self.shutdown(&mut client_tx, Some(&mut upstream_tx), reason).await
            }
            Err(reason) => self.shutdown(&mut client_tx, None::<&mut OwnedWriteHalf>, reason).await,
        };

        let summary = RelaySummary {
            id: relay_id,
            reason,
            phase: self.teardown.phase(),
            stats: self.counters.snapshot(),
            elapsed: started.elapsed(),
        };

        if summary.reason.is_error() {
            warn!(
                %relay_id,
                reason = ?summary.reason,
                client_messages = summary.stats.client_messages,
                upstream_chunks = summary.stats.upstream_chunks,
                "relay: closed on error"
            );
        } else {
            info!(
                %relay_id,
                reason = ?summary.reason,
                client_messages = summary.stats.client_messages,
                upstream_chunks = summary.stats.upstream_chunks,
                upstream_bytes = summary.stats.upstream_bytes,
                elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
                "relay: closed"
            );
        }
        summary
    }

    /// Await `dial` while queueing client payloads that arrive first.
    ///
    /// The queue holds at most `MAX_PENDING_BYTES`; past that the attempt is
    /// abandoned. There is no connect timeout, so against a black-holed
    /// upstream this cap is what bounds a relay's memory.
    async fn connect<D, R>(&self, dial: D, client_rx: &mut R) -> Result<TcpStream, CloseReason>
    where
        D: Future<Output = std::io::Result<TcpStream>>,
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        tokio::pin!(dial);

        let mut queued: Vec<Vec<u8>> = Vec::new();
        let mut queued_bytes = 0usize;
        let mut tcp = loop {
            tokio::select! {
                result = &mut dial => match result {
                    Ok(tcp) => break tcp,
                    Err(source) => {
                        return Err(RelayError::Connect { addr: self.upstream.to_string(), source }.into());
                    }
                },
                msg = client_rx.next() => match classify(msg) {
                    ClientEvent::Payload(payload) => {
                        let framed = frame_upstream(&payload);
                        queued_bytes += framed.len();
                        if queued_bytes > MAX_PENDING_BYTES {
                            return Err(RelayError::Backlog { limit: MAX_PENDING_BYTES }.into());
                        }
                        debug!(relay_id = %self.id, bytes = framed.len(), "relay: queued payload before connect");
                        queued.push(framed);
                    }
                    ClientEvent::Control => {}
                    // Returning drops `dial`, releasing the half-open attempt.
                    ClientEvent::Closed => return Err(CloseReason::ClientClosed),
                    ClientEvent::Failed(e) => return Err(RelayError::Client(e).into()),
                },
            }
        };

        if let Err(e) = tcp.set_nodelay(true) {
            debug!(relay_id = %self.id, error = %e, "relay: set_nodelay failed");
        }

        for framed in queued {
            if let Err(e) = self.write_upstream(&mut tcp, &framed).await {
                return Err(RelayError::Upstream(e).into());
            }
        }
        Ok(tcp)
    }

    /// Run both directions concurrently until one of them ends.
    ///
    /// Each direction only ever waits on its own write, so a peer that is
    /// slow to read stalls that direction alone.
    async fn pump<R, W, UR, UW>(
        &self,
        client_rx: &mut R,
        client_tx: &mut W,
        upstream_rx: &mut UR,
        upstream_tx: &mut UW,
    ) -> CloseReason
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
        W: Sink<Message, Error = axum::Error> + Unpin,
        UR: AsyncRead + Unpin,
        UW: AsyncWrite + Unpin,
    {
        tokio::select! {
            reason = self.client_to_upstream(client_rx, upstream_tx) => reason,
            reason = self.upstream_to_client(upstream_rx, client_tx) => reason,
        }
    }

    async fn client_to_upstream<R, UW>(&self, client_rx: &mut R, upstream_tx: &mut UW) -> CloseReason
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
        UW: AsyncWrite + Unpin,
    {
        loop {
            match classify(client_rx.next().await) {
                ClientEvent::Payload(payload) => {
                    if let Err(e) = self.write_upstream(upstream_tx, &frame_upstream(&payload)).await {
                        return RelayError::Upstream(e).into();
                    }
                }
                ClientEvent::Control => {}
                ClientEvent::Closed => return CloseReason::ClientClosed,
                ClientEvent::Failed(e) => return RelayError::Client(e).into(),
            }
        }
    }

    async fn upstream_to_client<UR, W>(&self, upstream_rx: &mut UR, client_tx: &mut W) -> CloseReason
    where
        UR: AsyncRead + Unpin,
        W: Sink<Message, Error = axum::Error> + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match upstream_rx.read(&mut buf).await {
                Ok(0) => return CloseReason::UpstreamClosed,
                Ok(n) => {
                    let text = decode_chunk(&buf[..n]);
                    debug!(relay_id = %self.id, bytes = n, "relay: upstream chunk");
                    if let Err(e) = client_tx.send(Message::Text(text.into())).await {
                        return RelayError::Client(e).into();
                    }
                    self.counters.record_client_send();
                }
                Err(e) => return RelayError::Upstream(e).into(),
            }
        }
    }

    async fn write_upstream<UW>(&self, upstream_tx: &mut UW, framed: &[u8]) -> std::io::Result<()>
    where
        UW: AsyncWrite + Unpin,
    {
        upstream_tx.write_all(framed).await?;
        self.counters.record_upstream_write(framed.len());
        debug!(relay_id = %self.id, bytes = framed.len(), "relay: client message forwarded");
        Ok(())
    }

    /// Close whichever sides are still open, each at most once.
    async fn shutdown<W, UW>(&mut self, client_tx: &mut W, upstream_tx: Option<&mut UW>, reason: CloseReason) -> CloseReason
    where
        W: Sink<Message, Error = axum::Error> + Unpin,
        UW: AsyncWrite + Unpin,
    {
        let relay_id = self.id;
        let client_sent_close = reason == CloseReason::ClientClosed;
        let first = self.teardown.begin(reason);
        if !first {
            debug!(%relay_id, "relay: teardown already in progress");
        }

        if self.teardown.close_upstream() {
            if let Some(upstream_tx) = upstream_tx {
                if let Err(e) = upstream_tx.shutdown().await {
                    debug!(%relay_id, error = %e, "relay: upstream shutdown failed");
                }
            }
        }

        // Closing the sink sends our close frame, or flushes the queued reply
        // when the client started the handshake.
        if self.teardown.close_client() || (first && client_sent_close) {
            if let Err(e) = client_tx.close().await {
                debug!(%relay_id, error = %e, "relay: client close failed");
            }
        }

        self.teardown.reason().cloned().unwrap_or(CloseReason::ClientClosed)
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
