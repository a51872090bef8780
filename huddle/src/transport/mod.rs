//! Transport layer for the realtime connection.
//!
//! A [`Connector`] produces one [`Link`] per connection attempt. The
//! supervisor in [`connection`] owns the current link, runs the
//! reconnect-with-backoff state machine and heartbeat, and publishes
//! [`ConnectionStatus`] changes. Implementations:
//! - [`ws::WsConnector`]: WebSocket via `tokio-tungstenite`
//! - [`loopback::LoopbackConnector`]: in-process channels for tests

pub mod backoff;
pub mod connection;
pub mod loopback;
pub mod ws;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use huddle_proto::outbound::EncodeError;

/// Lifecycle of the single server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link; waiting out the backoff delay or closed.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The link is up.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Published connection state plus the backoff currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Delay before the next attempt while disconnected; the nominal
    /// next delay otherwise.
    pub backoff: Duration,
    /// Consecutive failed attempts since the last stable connection.
    pub failures: u32,
    /// Number of links established so far. A change while `Connected`
    /// means a new link, even if the states in between were not observed.
    pub epoch: u64,
}

impl ConnectionStatus {
    pub(crate) const fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Duration::ZERO,
            failures: 0,
            epoch: 0,
        }
    }
}

/// Errors that can occur on a link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting took too long, or no frame arrived within the heartbeat
    /// timeout.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// The server refused the handshake (bad token, wrong path, ...).
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// An underlying I/O or protocol error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by [`connection::ConnectionHandle::send`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No link is up. Nothing was queued.
    #[error("not connected")]
    NotConnected,

    /// The outbound buffer of the current link is full.
    #[error("outbound buffer full")]
    Backpressure,

    /// The frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// A frame read from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text payload.
    Text(String),
    /// A binary payload (expected to hold UTF-8 JSON).
    Binary(Vec<u8>),
    /// A liveness frame (ping or pong) with no payload for the application.
    Heartbeat,
}

/// One established connection to the server.
///
/// Methods take `&self` so the supervisor can wait for an inbound frame
/// while writing.
pub trait Link: Send + Sync {
    /// Sends a text frame.
    fn send_text(&self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next frame. Cancel-safe.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the peer closed.
    fn recv(&self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Sends a liveness ping.
    fn ping(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Closes the link. Errors are ignored.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Creates links. Called once per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// The link type produced.
    type Link: Link + 'static;

    /// Opens a new link authenticated by `token`.
    fn connect(&self, token: &str)
    -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}
