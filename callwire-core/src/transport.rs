//! Transport layer implementations
//!
//! WebSocket client for a [`RelayServer`](crate::relay::RelayServer), speaking
//! [`RelayFrame`] JSON text frames.

use crate::identity::ParticipantId;
use crate::relay::RelayFrame;
use crate::signaling::{InboundSignal, SignalingMessage, SignalingTransport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Relay URL (`ws://host:port`)
    pub url: String,
    /// How long to wait for the WebSocket handshake
    #[serde(with = "crate::service::duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),
}

/// WebSocket connection to a relay
pub struct WebSocketTransport {
    url: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    source: Mutex<SplitStream<WsStream>>,
}

impl WebSocketTransport {
    /// Connect to the relay described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails or times out
    #[tracing::instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        let handshake = tokio_tungstenite::connect_async(config.url.as_str());
        let (ws, _) = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectionError("handshake timed out".to_string()))?
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        let (sink, source) = ws.split();
        tracing::info!("Connected to relay");
        Ok(Self {
            url: config.url.clone(),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
        })
    }

    /// Relay URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        let text = frame
            .encode()
            .map_err(|e| TransportError::SendError(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::SendError(e.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    type Error = TransportError;

    async fn join_room(&self, room: &ParticipantId) -> Result<(), Self::Error> {
        self.send_frame(&RelayFrame::JoinRoom {
            room_id: room.clone(),
        })
        .await
    }

    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error> {
        self.send_frame(&RelayFrame::Emit { message }).await
    }

    async fn receive_message(&self) -> Result<Option<InboundSignal>, Self::Error> {
        let mut source = self.source.lock().await;
        while let Some(msg) = source.next().await {
            let msg = msg.map_err(|e| TransportError::ReceiveError(e.to_string()))?;
            if msg.is_close() {
                return Ok(None);
            }
            if !msg.is_text() {
                continue;
            }
            let text = msg
                .to_text()
                .map_err(|e| TransportError::ReceiveError(e.to_string()))?;
            match RelayFrame::decode(text) {
                Ok(RelayFrame::Deliver { sender_id, message }) => {
                    return Ok(Some(InboundSignal { sender_id, message }));
                }
                Ok(RelayFrame::Error { message }) => {
                    tracing::warn!(relay = %self.url, error = %message, "Relay rejected a frame");
                }
                Ok(other) => {
                    tracing::debug!(frame = ?other, "Ignoring unexpected relay frame");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed relay frame");
                }
            }
        }
        Ok(None)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::SendError(e.to_string()))
    }
}
