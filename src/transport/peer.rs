//! Peer connections and their event loops.
//!
//! A [`PeerConnection`] is one side of the proxy: the client or the target.
//! It carries already-decoded [`RawPacket`] records; the byte-level game
//! codec lives outside this crate.
//!
//! # Backends
//!
//! | Backend | Constructor | Frames |
//! |---------|-------------|--------|
//! | WebSocket | [`PeerConnection::from_websocket`], [`PeerConnection::connect`] | one JSON `RawPacket` per text frame |
//! | In-memory | [`PeerConnection::pair`] | `RawPacket` values |
//!
//! # Event Loop
//!
//! Each connection spawns a tokio task that handles:
//!
//! - Incoming frames, surfaced as [`PeerEvent`]s
//! - Outgoing packets and shutdown requests from the session

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{from_slice, from_str, to_string};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::RawPacket;

// ============================================================================
// PeerEvent
// ============================================================================

/// Something received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A decoded packet.
    Packet(RawPacket),
    /// The connection failed. A [`PeerEvent::Closed`] follows.
    Error(String),
    /// The connection ended.
    Closed,
}

// ============================================================================
// PeerCommand
// ============================================================================

/// Internal commands for the event loop.
enum PeerCommand {
    /// Send a packet to the peer.
    Send(RawPacket),
    /// Close the connection.
    Shutdown,
}

// ============================================================================
// PeerConnection
// ============================================================================

/// Connection to the client or the target.
///
/// # Thread Safety
///
/// `PeerConnection` is `Send + Sync`. Sending never blocks; events are
/// consumed by one reader at a time.
pub struct PeerConnection {
    /// Connection id, for logs.
    id: Uuid,
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<PeerCommand>,
    /// Events produced by the event loop.
    events: AsyncMutex<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    /// Wraps an established WebSocket stream.
    ///
    /// Spawns the event loop task internally.
    pub fn from_websocket<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_websocket_loop(id, ws_stream, command_rx, events_tx));

        Self {
            id,
            command_tx,
            events: AsyncMutex::new(events_rx),
        }
    }

    /// Opens a WebSocket connection to `url`.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the handshake takes longer than `wait`
    /// - [`Error::WebSocket`] if the handshake fails
    pub async fn connect(url: &Url, wait: Duration) -> Result<Self> {
        let (ws_stream, _) = timeout(wait, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::timed_out(wait))??;

        debug!(%url, "Connected to peer");
        Ok(Self::from_websocket(ws_stream))
    }

    /// Creates two connected in-memory peers.
    ///
    /// A packet sent on one is received by the other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_command_tx, a_command_rx) = mpsc::unbounded_channel();
        let (b_command_tx, b_command_rx) = mpsc::unbounded_channel();
        let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
        let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();

        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();

        tokio::spawn(Self::run_memory_loop(
            a_id,
            a_command_rx,
            a_events_tx.clone(),
            b_events_tx.clone(),
        ));
        tokio::spawn(Self::run_memory_loop(
            b_id,
            b_command_rx,
            b_events_tx,
            a_events_tx,
        ));

        (
            Self {
                id: a_id,
                command_tx: a_command_tx,
                events: AsyncMutex::new(a_events_rx),
            },
            Self {
                id: b_id,
                command_tx: b_command_tx,
                events: AsyncMutex::new(b_events_rx),
            },
        )
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns `true` once the event loop has stopped.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    /// Sends a packet to the peer.
    ///
    /// Does not wait for the write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closed.
    pub fn send(&self, packet: RawPacket) -> Result<()> {
        self.command_tx
            .send(PeerCommand::Send(packet))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the connection is closed and all events were read.
    pub async fn next_event(&self) -> Option<PeerEvent> {
        self.events.lock().await.recv().await
    }

    /// Waits for the next packet.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the connection failed
    /// - [`Error::ConnectionClosed`] if it closed first
    pub async fn next_packet(&self) -> Result<RawPacket> {
        match self.next_event().await {
            Some(PeerEvent::Packet(packet)) => Ok(packet),
            Some(PeerEvent::Error(message)) => Err(Error::connection(message)),
            Some(PeerEvent::Closed) | None => Err(Error::ConnectionClosed),
        }
    }

    /// Closes the connection.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(PeerCommand::Shutdown);
    }

    /// Event loop of the WebSocket backend.
    async fn run_websocket_loop<S>(
        id: Uuid,
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming frames from the peer
                message = ws_read.next() => {
                    let parsed = match message {
                        Some(Ok(Message::Text(text))) => from_str::<RawPacket>(&text),
                        Some(Ok(Message::Binary(bytes))) => from_slice::<RawPacket>(&bytes),

                        Some(Ok(Message::Close(_))) => {
                            debug!(%id, "WebSocket closed by peer");
                            break;
                        }

                        Some(Err(e)) => {
                            let _ = events_tx.send(PeerEvent::Error(e.to_string()));
                            break;
                        }

                        None => {
                            debug!(%id, "WebSocket stream ended");
                            break;
                        }

                        // Ignore Ping, Pong, Frame
                        Some(Ok(_)) => continue,
                    };

                    match parsed {
                        Ok(packet) => {
                            trace!(%id, packet = %packet.name, "Packet received");
                            let _ = events_tx.send(PeerEvent::Packet(packet));
                        }
                        Err(e) => warn!(%id, error = %e, "Dropping unparseable frame"),
                    }
                }

                // Commands from the session
                command = command_rx.recv() => {
                    match command {
                        Some(PeerCommand::Send(packet)) => {
                            let json = match to_string(&packet) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!(%id, error = %e, "Failed to encode packet");
                                    continue;
                                }
                            };

                            if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                                let _ = events_tx.send(PeerEvent::Error(e.to_string()));
                                break;
                            }
                        }

                        Some(PeerCommand::Shutdown) | None => {
                            debug!(%id, "Closing WebSocket");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        let _ = events_tx.send(PeerEvent::Closed);
        debug!(%id, "Peer event loop terminated");
    }

    /// Event loop of the in-memory backend.
    async fn run_memory_loop(
        id: Uuid,
        mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
        local_tx: mpsc::UnboundedSender<PeerEvent>,
        remote_tx: mpsc::UnboundedSender<PeerEvent>,
    ) {
        while let Some(command) = command_rx.recv().await {
            match command {
                PeerCommand::Send(packet) => {
                    if remote_tx.send(PeerEvent::Packet(packet)).is_err() {
                        break;
                    }
                }
                PeerCommand::Shutdown => break,
            }
        }

        let _ = remote_tx.send(PeerEvent::Closed);
        let _ = local_tx.send(PeerEvent::Closed);
        trace!(%id, "In-memory peer closed");
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
