//! Relay session: one client connection and its paired upstream connection.
//!
//! Each direction runs its own copy loop:
//!
//! ```text
//! Idle -> Reading -> (Forwarding + Accounting + Logging) -> WaitingForLogAck -> Idle
//!            \______________________ any error ______________________/ -> Closed
//! ```
//!
//! A chunk read from the source peer is written to the destination while, in
//! parallel, an event carrying the same bytes is published to the pipeline.
//! Inbound chunks (client to upstream) are also accounted against the
//! client's IP. The next read only starts once the write has completed and,
//! with [`AckMode::PerChunk`], once the log writer has persisted the event.
//!
//! The session ends as soon as either direction ends; both sockets are
//! dropped together, so there is never a half-open relay.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use bytes::Bytes;
use tapline_pipeline::{Event, PipelineError, Publisher};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::accounting::TrafficAccountant;

/// Default scratch buffer size per direction.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream.
    Inbound,
    /// Upstream to client.
    Outbound,
}

impl Direction {
    /// Event tag for this direction and client.
    pub fn tag(self, client_ip: IpAddr) -> String {
        match self {
            Self::Inbound => format!("[IN] {client_ip}"),
            Self::Outbound => format!("[OUT] {client_ip}"),
        }
    }

    fn source_closed(self) -> CloseReason {
        match self {
            Self::Inbound => CloseReason::ClientClosed,
            Self::Outbound => CloseReason::UpstreamClosed,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        })
    }
}

/// When a session waits on the log writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Wait for every chunk's event to be persisted before the next read.
    PerChunk,
    /// Only wait when the ring is full.
    WhenFull,
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-chunk" => Ok(Self::PerChunk),
            "when-full" => Ok(Self::WhenFull),
            other => Err(format!(
                "unknown ack mode {other:?} (expected per-chunk or when-full)"
            )),
        }
    }
}

/// Per-direction state, reported at trace level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    Reading,
    Forwarding,
    WaitingForLogAck,
    Closed,
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The client closed its side (zero-byte read).
    ClientClosed,
    /// The upstream closed its side (zero-byte read).
    UpstreamClosed,
    /// Reading from the source peer failed.
    ReadFailed {
        direction: Direction,
        error: io::Error,
    },
    /// Writing to the destination peer failed.
    WriteFailed {
        direction: Direction,
        error: io::Error,
    },
    /// Publishing or awaiting the log event failed.
    Pipeline {
        direction: Direction,
        error: PipelineError,
    },
}

impl CloseReason {
    /// Whether the session ended because of a fault rather than a peer close.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::ClientClosed | Self::UpstreamClosed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::UpstreamClosed => f.write_str("upstream closed"),
            Self::ReadFailed { direction, error } => write!(f, "{direction} read failed: {error}"),
            Self::WriteFailed { direction, error } => {
                write!(f, "{direction} write failed: {error}")
            }
            Self::Pipeline { direction, error } => {
                write!(f, "{direction} log publish failed: {error}")
            }
        }
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub publisher: Publisher,
    pub accountant: TrafficAccountant,
    pub chunk_size: usize,
    pub ack_mode: AckMode,
}

/// What a finished session did.
#[derive(Debug)]
pub struct SessionSummary {
    pub reason: CloseReason,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
    pub events_published: u64,
}

/// One client connection relayed to the upstream.
pub struct RelaySession {
    client: TcpStream,
    upstream: TcpStream,
    client_addr: SocketAddr,
    context: SessionContext,
}

impl RelaySession {
    pub fn new(
        client: TcpStream,
        upstream: TcpStream,
        client_addr: SocketAddr,
        context: SessionContext,
    ) -> Self {
        Self {
            client,
            upstream,
            client_addr,
            context,
        }
    }

    /// Relay until either direction ends. Both sockets are closed on return.
    pub async fn run(self) -> SessionSummary {
        let (client_read, client_write) = self.client.into_split();
        let (upstream_read, upstream_write) = self.upstream.into_split();

        relay(
            client_read,
            client_write,
            upstream_read,
            upstream_write,
            self.client_addr.ip(),
            &self.context,
        )
        .await
    }
}

/// Drive both directions over arbitrary stream halves.
pub async fn relay<CR, CW, UR, UW>(
    client_read: CR,
    client_write: CW,
    upstream_read: UR,
    upstream_write: UW,
    client_ip: IpAddr,
    context: &SessionContext,
) -> SessionSummary
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let identity = client_ip.to_string();

    let mut inbound = Pump::new(
        Direction::Inbound,
        client_read,
        upstream_write,
        client_ip,
        &identity,
        context,
    );
    let mut outbound = Pump::new(
        Direction::Outbound,
        upstream_read,
        client_write,
        client_ip,
        &identity,
        context,
    );

    let reason = tokio::select! {
        reason = inbound.run() => reason,
        reason = outbound.run() => reason,
    };

    SessionSummary {
        reason,
        bytes_to_upstream: inbound.bytes,
        bytes_from_upstream: outbound.bytes,
        events_published: inbound.events + outbound.events,
    }
}

/// One direction's read/forward/log loop.
struct Pump<'a, R, W> {
    direction: Direction,
    reader: R,
    writer: W,
    buf: Vec<u8>,
    tag: String,
    identity: &'a str,
    context: &'a SessionContext,
    state: PumpState,
    bytes: u64,
    events: u64,
}

impl<'a, R, W> Pump<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(
        direction: Direction,
        reader: R,
        writer: W,
        client_ip: IpAddr,
        identity: &'a str,
        context: &'a SessionContext,
    ) -> Self {
        Self {
            direction,
            reader,
            writer,
            buf: vec![0u8; context.chunk_size.max(1)],
            tag: direction.tag(client_ip),
            identity,
            context,
            state: PumpState::Reading,
            bytes: 0,
            events: 0,
        }
    }

    fn enter(&mut self, state: PumpState) {
        trace!(direction = %self.direction, from = ?self.state, to = ?state, "Pump state");
        self.state = state;
    }

    async fn run(&mut self) -> CloseReason {
        let direction = self.direction;

        loop {
            self.enter(PumpState::Reading);
            let n = match self.reader.read(&mut self.buf).await {
                Ok(0) => {
                    self.enter(PumpState::Closed);
                    return direction.source_closed();
                }
                Ok(n) => n,
                Err(error) => {
                    self.enter(PumpState::Closed);
                    return CloseReason::ReadFailed { direction, error };
                }
            };

            self.enter(PumpState::Forwarding);
            let chunk = &self.buf[..n];

            if direction == Direction::Inbound {
                self.context.accountant.account(self.identity, n as u64);
            }

            let event = Event::new(self.tag.clone(), Bytes::copy_from_slice(chunk));
            let (forwarded, published) = tokio::join!(
                self.writer.write_all(chunk),
                self.context.publisher.publish(event),
            );

            if let Err(error) = forwarded {
                self.enter(PumpState::Closed);
                return CloseReason::WriteFailed { direction, error };
            }
            self.bytes += n as u64;

            let receipt = match published {
                Ok(receipt) => receipt,
                Err(error) => {
                    self.enter(PumpState::Closed);
                    return CloseReason::Pipeline { direction, error };
                }
            };
            self.events += 1;

            if self.context.ack_mode == AckMode::PerChunk {
                self.enter(PumpState::WaitingForLogAck);
                trace!(sequence = receipt.sequence(), "Awaiting log write");
                if let Err(error) = receipt.wait().await {
                    self.enter(PumpState::Closed);
                    return CloseReason::Pipeline { direction, error };
                }
            }
        }
    }
}
