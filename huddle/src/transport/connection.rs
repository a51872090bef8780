//! Connection supervisor.
//!
//! [`spawn`] starts one task that runs the state machine
//! `Disconnected → Connecting → Connected → Disconnected …`, creating a new
//! [`Link`] on every attempt. The backoff sleep is its only long wait and
//! is cut short by [`ConnectionHandle::close`]. While a link is up the task
//! forwards inbound frames, writes outbound frames, pings every
//! `ping_interval` and drops the link if nothing arrives for
//! `heartbeat_timeout`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use huddle_proto::outbound::{self, ClientFrame};

use super::backoff::{Backoff, BackoffConfig};
use super::{ConnectionState, ConnectionStatus, Connector, Frame, Link, SendError, TransportError};

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Interval between outbound pings.
    pub ping_interval: Duration,
    /// Drop the link if no frame arrives for this long.
    pub heartbeat_timeout: Duration,
    /// Give up on a connection attempt after this long.
    pub connect_timeout: Duration,
    /// Capacity of the per-link outbound buffer.
    pub outbound_buffer: usize,
    /// Capacity of the inbound frame channel.
    pub inbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            ping_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            outbound_buffer: 64,
            inbound_buffer: 256,
        }
    }
}

/// Writer of the link currently up, if any.
type WriterSlot = Arc<Mutex<Option<mpsc::Sender<String>>>>;

/// Handle to a running connection supervisor.
pub struct ConnectionHandle {
    status: watch::Receiver<ConnectionStatus>,
    writer: WriterSlot,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ConnectionHandle {
    /// Sends a frame on the current link.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`SendError::NotConnected`] while no link is
    /// up; the frame is not queued for a later link.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), SendError> {
        let Some(writer) = self.writer.lock().clone() else {
            return Err(SendError::NotConnected);
        };
        let text = outbound::encode(frame)?;
        writer.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// The latest published status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// A receiver notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stops the supervisor and waits for it to exit.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(err = %e, "connection supervisor ended abnormally");
        }
    }
}

/// Starts the supervisor. Inbound data frames arrive, in transport order,
/// on the returned receiver.
pub fn spawn<C: Connector>(
    connector: C,
    token: String,
    config: ConnectionConfig,
) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::initial());
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer: WriterSlot = Arc::new(Mutex::new(None));

    let supervisor = Supervisor {
        connector,
        token,
        backoff: Backoff::new(config.backoff),
        config,
        status: status_tx,
        inbound: inbound_tx,
        writer: Arc::clone(&writer),
        shutdown: shutdown_rx,
        epoch: 0,
    };
    let task = tokio::spawn(supervisor.run());

    (
        ConnectionHandle {
            status: status_rx,
            writer,
            shutdown: shutdown_tx,
            task,
        },
        inbound_rx,
    )
}

/// Why a link ended.
enum LinkEnd {
    /// Shutdown requested, or nobody consumes inbound frames any more.
    Stop,
    /// The link failed; reconnect.
    Dropped(TransportError),
}

struct Supervisor<C: Connector> {
    connector: C,
    token: String,
    backoff: Backoff,
    config: ConnectionConfig,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::Sender<Frame>,
    writer: WriterSlot,
    shutdown: watch::Receiver<bool>,
    epoch: u64,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self) {
        loop {
            self.publish(ConnectionState::Connecting, self.backoff.nominal());
            let attempt = tokio::select! {
                r = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.token)) => r,
                _ = self.shutdown.changed() => break,
            };

            match attempt {
                Ok(Ok(link)) => {
                    let started = Instant::now();
                    let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
                    *self.writer.lock() = Some(tx);
                    self.epoch += 1;
                    self.publish(ConnectionState::Connected, self.backoff.nominal());
                    tracing::info!("connection established");

                    let end = self.drive(&link, rx).await;
                    *self.writer.lock() = None;
                    if self.backoff.is_stable(started.elapsed()) {
                        self.backoff.reset();
                    }
                    match end {
                        LinkEnd::Stop => break,
                        LinkEnd::Dropped(e) => {
                            tracing::warn!(err = %e, "connection lost");
                        }
                    }
                }
                Ok(Err(e)) => tracing::warn!(err = %e, "connection attempt failed"),
                Err(_) => tracing::warn!("connection attempt timed out"),
            }

            let delay = self.backoff.next_delay();
            self.publish(ConnectionState::Disconnected, delay);
            tracing::info!(
                delay = ?delay,
                failures = self.backoff.failures(),
                "reconnecting after backoff"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        *self.writer.lock() = None;
        self.publish(ConnectionState::Disconnected, Duration::ZERO);
        tracing::info!("connection supervisor stopped");
    }

    /// Runs one link until it fails or the supervisor is stopped.
    async fn drive(&mut self, link: &C::Link, mut outbound: mpsc::Receiver<String>) -> LinkEnd {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;
        let mut last_frame = Instant::now();

        loop {
            let deadline = last_frame + self.config.heartbeat_timeout;
            tokio::select! {
                frame = link.recv() => match frame {
                    Ok(Frame::Heartbeat) => last_frame = Instant::now(),
                    Ok(data) => {
                        last_frame = Instant::now();
                        if self.inbound.send(data).await.is_err() {
                            tracing::debug!("inbound receiver dropped, stopping");
                            link.close().await;
                            return LinkEnd::Stop;
                        }
                    }
                    Err(e) => return LinkEnd::Dropped(e),
                },
                Some(text) = outbound.recv() => {
                    if let Err(e) = link.send_text(text).await {
                        return LinkEnd::Dropped(e);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = link.ping().await {
                        return LinkEnd::Dropped(e);
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(
                        timeout = ?self.config.heartbeat_timeout,
                        "no frame within heartbeat timeout, closing link"
                    );
                    link.close().await;
                    return LinkEnd::Dropped(TransportError::Timeout);
                }
                _ = self.shutdown.changed() => {
                    link.close().await;
                    return LinkEnd::Stop;
                }
            }
        }
    }

    fn publish(&self, state: ConnectionState, backoff: Duration) {
        let status = ConnectionStatus {
            state,
            backoff,
            failures: self.backoff.failures(),
            epoch: self.epoch,
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }
}
