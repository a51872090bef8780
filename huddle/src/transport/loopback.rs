//! Loopback transport for testing.
//!
//! [`pair`] returns a [`LoopbackConnector`] for the client side and a
//! [`LoopbackServer`] that accepts one [`ServerPeer`] per successful
//! connect. Dropping a `ServerPeer` closes that link, which makes the
//! client supervisor reconnect. Connect attempts can be scripted to fail.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connector, Frame, Link, TransportError};

/// What the client side sent over a loopback link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSignal {
    /// A text frame.
    Text(String),
    /// A heartbeat ping.
    Ping,
    /// The client closed the link.
    Close,
}

#[derive(Debug, Default)]
struct Script {
    fail_next: u32,
    attempts: u32,
    tokens: Vec<String>,
}

/// Client half: creates a fresh link per connect.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    accept: mpsc::UnboundedSender<ServerPeer>,
    script: Arc<Mutex<Script>>,
    buffer: usize,
}

/// Server half: hands out the server end of each new link.
#[derive(Debug)]
pub struct LoopbackServer {
    accept: mpsc::UnboundedReceiver<ServerPeer>,
    script: Arc<Mutex<Script>>,
}

/// Server end of one loopback link.
#[derive(Debug)]
pub struct ServerPeer {
    /// Token the client connected with.
    pub token: String,
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<ClientSignal>,
}

/// Client end of one loopback link.
#[derive(Debug)]
pub struct LoopbackLink {
    tx: mpsc::Sender<ClientSignal>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
}

/// Creates a connected connector/server pair. `buffer` bounds each
/// direction of every link.
#[must_use]
pub fn pair(buffer: usize) -> (LoopbackConnector, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let script = Arc::new(Mutex::new(Script::default()));
    (
        LoopbackConnector {
            accept: accept_tx,
            script: Arc::clone(&script),
            buffer,
        },
        LoopbackServer {
            accept: accept_rx,
            script,
        },
    )
}

impl LoopbackServer {
    /// Waits for the next successful connect.
    pub async fn accept(&mut self) -> Option<ServerPeer> {
        self.accept.recv().await
    }

    /// Makes the next `n` connect attempts fail as unreachable.
    pub fn fail_next(&self, n: u32) {
        self.script.lock().fail_next = n;
    }

    /// Total connect attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.script.lock().attempts
    }

    /// Tokens of all attempts, in order.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        self.script.lock().tokens.clone()
    }
}

impl ServerPeer {
    /// Pushes a text frame to the client. Returns `false` if the link is
    /// gone or its buffer is full.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.tx.try_send(Frame::Text(text.into())).is_ok()
    }

    /// Pushes an arbitrary frame to the client.
    pub fn push(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Waits for the next signal from the client. `None` once the client
    /// dropped the link.
    pub async fn recv(&mut self) -> Option<ClientSignal> {
        self.rx.recv().await
    }

    /// Waits for the next text frame, skipping pings.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                ClientSignal::Text(text) => return Some(text),
                ClientSignal::Ping => {}
                ClientSignal::Close => return None,
            }
        }
    }
}

impl Connector for LoopbackConnector {
    type Link = LoopbackLink;

    async fn connect(&self, token: &str) -> Result<LoopbackLink, TransportError> {
        {
            let mut script = self.script.lock();
            script.attempts += 1;
            script.tokens.push(token.to_owned());
            if script.fail_next > 0 {
                script.fail_next -= 1;
                return Err(TransportError::Unreachable("loopback".into()));
            }
        }

        let (client_tx, server_rx) = mpsc::channel(self.buffer);
        let (server_tx, client_rx) = mpsc::channel(self.buffer);
        let peer = ServerPeer {
            token: token.to_owned(),
            tx: server_tx,
            rx: server_rx,
        };
        self.accept
            .send(peer)
            .map_err(|_| TransportError::Unreachable("loopback".into()))?;
        Ok(LoopbackLink {
            tx: client_tx,
            rx: tokio::sync::Mutex::new(client_rx),
        })
    }
}

impl Link for LoopbackLink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(ClientSignal::Text(text))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.tx
            .send(ClientSignal::Ping)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let _ = self.tx.send(ClientSignal::Close).await;
    }
}
