//! WebSocket transport.
//!
//! The session token travels as the `token` query parameter of the upgrade
//! request; a completed upgrade is the handshake. Each link splits the
//! socket so reading and writing proceed independently. The connect
//! attempt is bounded by the connection supervisor, not here.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{Connector, Frame, Link, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Type alias for the write half of a WebSocket connection.
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// Type alias for the read half of a WebSocket connection.
type WsReader = futures_util::stream::SplitStream<WsStream>;

/// Opens WebSocket links to a fixed server URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Creates a connector for `url` (`ws://` or `wss://`).
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self { url }
    }
}

/// An open WebSocket connection.
pub struct WsLink {
    sink: Mutex<WsSink>,
    reader: Mutex<WsReader>,
}

impl Connector for WsConnector {
    type Link = WsLink;

    async fn connect(&self, token: &str) -> Result<WsLink, TransportError> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", token);

        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %self.url, err = %e, "WebSocket connect failed");
            map_ws_connect_error(e, &self.url)
        })?;

        tracing::info!(url = %self.url, "WebSocket connected");
        let (sink, reader) = stream.split();
        Ok(WsLink {
            sink: Mutex::new(sink),
            reader: Mutex::new(reader),
        })
    }
}

impl Link for WsLink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(data.to_vec())),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => return Ok(Frame::Heartbeat),
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "WebSocket closed by server");
                    return Err(TransportError::ConnectionClosed);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "WebSocket read error");
                    return Err(TransportError::Io(std::io::Error::other(e)));
                }
                None => return Err(TransportError::ConnectionClosed),
            }
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error, url: &Url) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            TransportError::Rejected(format!("HTTP status {}", response.status()))
        }
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
