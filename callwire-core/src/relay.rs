//! Signaling relay
//!
//! The relay is the only broker between participants. Every connection joins
//! one or more rooms (normally its own participant id) and emits events; the
//! relay forwards each event to the members of the room named by the event's
//! `target_id`, stamped with the sender's room as `sender_id`.
//!
//! Two implementations share the same routing table:
//! - [`MemoryRelay`]: in-process, used for tests and single-process demos
//! - [`RelayServer`]: WebSocket server speaking [`RelayFrame`] JSON

use crate::error::ErrorKind;
use crate::identity::ParticipantId;
use crate::signaling::{InboundSignal, SignalingMessage, SignalingTransport, MAX_SIGNALING_MESSAGE_SIZE};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// The connection was closed
    #[error("Relay connection closed")]
    Closed,

    /// An event was emitted before any room was joined
    #[error("No room joined on this connection")]
    NotJoined,

    /// Malformed frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RelayError {
    /// Every relay failure leaves the signaling channel unusable
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SignalingUnavailable
    }
}

/// Frames exchanged between a client and the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// Client joins a room
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        /// Room to join
        room_id: ParticipantId,
    },
    /// Client emits an event
    Emit {
        /// The event
        message: SignalingMessage,
    },
    /// Relay delivers an event
    #[serde(rename_all = "camelCase")]
    Deliver {
        /// Room of the emitting connection
        sender_id: ParticipantId,
        /// The event
        message: SignalingMessage,
    },
    /// Relay reports a problem with the last frame
    Error {
        /// Description
        message: String,
    },
}

impl RelayFrame {
    /// Parse a text frame, enforcing the size limit
    ///
    /// # Errors
    ///
    /// Returns `Protocol` when the frame is oversized or not valid JSON
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(RelayError::Protocol(format!(
                "frame size {} exceeds maximum of {MAX_SIGNALING_MESSAGE_SIZE}",
                text.len()
            )));
        }
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Encode as a text frame
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if serialization fails
    pub fn encode(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

type FrameSender = mpsc::UnboundedSender<RelayFrame>;

struct Member {
    conn: u64,
    tx: FrameSender,
}

/// Room membership table
#[derive(Default)]
struct RoomTable {
    rooms: HashMap<ParticipantId, Vec<Member>>,
}

impl RoomTable {
    fn join(&mut self, room: ParticipantId, conn: u64, tx: FrameSender) {
        let members = self.rooms.entry(room).or_default();
        if !members.iter().any(|m| m.conn == conn) {
            members.push(Member { conn, tx });
        }
    }

    fn leave_all(&mut self, conn: u64) {
        for members in self.rooms.values_mut() {
            members.retain(|m| m.conn != conn);
        }
        self.rooms.retain(|_, members| !members.is_empty());
    }

    /// Forward a frame to every member of `room`, returning how many received it
    fn forward(&self, room: &ParticipantId, frame: &RelayFrame) -> usize {
        self.rooms.get(room).map_or(0, |members| {
            members
                .iter()
                .filter(|m| m.tx.send(frame.clone()).is_ok())
                .count()
        })
    }

    fn route(&self, sender_id: &ParticipantId, message: SignalingMessage) -> usize {
        let room = message.target_id().clone();
        let frame = RelayFrame::Deliver {
            sender_id: sender_id.clone(),
            message,
        };
        self.forward(&room, &frame)
    }

    fn room_size(&self, room: &ParticipantId) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }
}

#[derive(Default)]
struct MemoryRelayInner {
    rooms: RoomTable,
    next_conn: u64,
    /// Live connections and the room that identifies them as sender
    connections: HashMap<u64, (FrameSender, Option<ParticipantId>)>,
}

/// In-process relay
///
/// Cheap to clone; all clones share one routing table.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<MemoryRelayInner>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let conn = inner.next_conn;
        inner.next_conn += 1;
        inner.connections.insert(conn, (tx, None));
        MemoryTransport {
            relay: self.clone(),
            conn,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Drop every connection that joined `room`, as if the relay lost them
    pub fn disconnect(&self, room: &ParticipantId) {
        let mut inner = self.inner.lock();
        let conns: Vec<u64> = inner
            .rooms
            .rooms
            .get(room)
            .map(|members| members.iter().map(|m| m.conn).collect())
            .unwrap_or_default();
        for conn in conns {
            inner.rooms.leave_all(conn);
            inner.connections.remove(&conn);
        }
        tracing::debug!(room = %room, "Relay dropped connections");
    }

    /// Number of connections in a room
    #[must_use]
    pub fn room_size(&self, room: &ParticipantId) -> usize {
        self.inner.lock().rooms.room_size(room)
    }

    /// Deliver a signal to a room without target routing
    #[cfg(any(test, feature = "test-utils"))]
    pub fn deliver_to(&self, room: &ParticipantId, signal: InboundSignal) -> usize {
        let frame = RelayFrame::Deliver {
            sender_id: signal.sender_id,
            message: signal.message,
        };
        self.inner.lock().rooms.forward(room, &frame)
    }

    fn join(&self, conn: u64, room: &ParticipantId) -> Result<(), RelayError> {
        let mut inner = self.inner.lock();
        let tx = match inner.connections.get_mut(&conn) {
            Some((tx, sender)) => {
                sender.get_or_insert_with(|| room.clone());
                tx.clone()
            }
            None => return Err(RelayError::Closed),
        };
        inner.rooms.join(room.clone(), conn, tx);
        Ok(())
    }

    fn emit(&self, conn: u64, message: SignalingMessage) -> Result<usize, RelayError> {
        let inner = self.inner.lock();
        let sender_id = match inner.connections.get(&conn) {
            Some((_, Some(sender_id))) => sender_id.clone(),
            Some((_, None)) => return Err(RelayError::NotJoined),
            None => return Err(RelayError::Closed),
        };
        let delivered = inner.rooms.route(&sender_id, message);
        if delivered == 0 {
            tracing::debug!(sender = %sender_id, "Event addressed to an empty room");
        }
        Ok(delivered)
    }

    fn close(&self, conn: u64) {
        let mut inner = self.inner.lock();
        inner.rooms.leave_all(conn);
        inner.connections.remove(&conn);
    }
}

/// One connection to a [`MemoryRelay`]
pub struct MemoryTransport {
    relay: MemoryRelay,
    conn: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayFrame>>,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    type Error = RelayError;

    async fn join_room(&self, room: &ParticipantId) -> Result<(), Self::Error> {
        self.relay.join(self.conn, room)
    }

    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error> {
        self.relay.emit(self.conn, message).map(|_| ())
    }

    async fn receive_message(&self) -> Result<Option<InboundSignal>, Self::Error> {
        let mut rx = self.rx.lock().await;
        while let Some(frame) = rx.recv().await {
            if let RelayFrame::Deliver { sender_id, message } = frame {
                return Ok(Some(InboundSignal { sender_id, message }));
            }
        }
        Ok(None)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.relay.close(self.conn);
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.relay.close(self.conn);
    }
}

/// WebSocket relay server
pub struct RelayServer {
    listener: TcpListener,
    rooms: Arc<Mutex<RoomTable>>,
    next_conn: AtomicU64,
}

impl RelayServer {
    /// Bind the relay to an address
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Relay listening");
        Ok(Self {
            listener,
            rooms: Arc::new(Mutex::new(RoomTable::default())),
            next_conn: AtomicU64::new(0),
        })
    }

    /// Address the relay is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails
    ///
    /// # Errors
    ///
    /// Returns error if accepting fails
    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            let rooms = self.rooms.clone();
            tokio::spawn(async move {
                tracing::debug!(conn, %peer_addr, "Relay connection accepted");
                if let Err(e) = handle_connection(stream, conn, rooms.clone()).await {
                    tracing::debug!(conn, error = %e, "Relay connection ended with error");
                }
                rooms.lock().leave_all(conn);
                tracing::debug!(conn, "Relay connection closed");
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    conn: u64,
    rooms: Arc<Mutex<RoomTable>>,
) -> Result<(), RelayError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode relay frame");
                    continue;
                }
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut sender_id: Option<ParticipantId> = None;
    while let Some(msg) = source.next().await {
        let msg = msg?;
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let frame = match msg.to_text().map_err(RelayError::from).and_then(RelayFrame::decode) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = tx.send(RelayFrame::Error {
                    message: e.to_string(),
                });
                continue;
            }
        };
        match frame {
            RelayFrame::JoinRoom { room_id } => {
                if room_id.is_empty() {
                    let _ = tx.send(RelayFrame::Error {
                        message: "roomId cannot be empty".to_string(),
                    });
                    continue;
                }
                sender_id.get_or_insert_with(|| room_id.clone());
                tracing::debug!(conn, room = %room_id, "Joined room");
                rooms.lock().join(room_id, conn, tx.clone());
            }
            RelayFrame::Emit { message } => {
                let Some(sender) = sender_id.as_ref() else {
                    let _ = tx.send(RelayFrame::Error {
                        message: RelayError::NotJoined.to_string(),
                    });
                    continue;
                };
                if let Err(e) = message.validate() {
                    let _ = tx.send(RelayFrame::Error {
                        message: e.to_string(),
                    });
                    continue;
                }
                let kind = message.kind().as_str();
                let delivered = rooms.lock().route(sender, message);
                tracing::trace!(conn, message_type = kind, delivered, "Routed event");
            }
            RelayFrame::Deliver { .. } | RelayFrame::Error { .. } => {
                let _ = tx.send(RelayFrame::Error {
                    message: "unexpected frame from client".to_string(),
                });
            }
        }
    }

    drop(tx);
    rooms.lock().leave_all(conn);
    writer.abort();
    Ok(())
}
