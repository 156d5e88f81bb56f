//! Call signaling protocol
//!
//! Directed call-lifecycle and negotiation events exchanged through a relay.
//! A [`SignalingClient`] owns one logical channel per local identity: it joins
//! the identity's personal room, dispatches inbound events to handlers
//! registered per [`SignalingEventKind`], and reports channel loss through
//! error handlers.

use crate::error::ErrorKind;
use crate::identity::{ParticipantId, ParticipantIdentity};
use crate::types::{IceCandidate, MediaType};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Maximum encoded signaling frame size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum participant/room id length
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum SDP or candidate string length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Signaling errors
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    /// Message failed validation
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    /// The channel is not connected (never connected or already lost)
    #[error("Signaling channel not connected")]
    NotConnected,

    /// The relay closed the channel
    #[error("Signaling channel closed by relay")]
    Closed,

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl SignalingError {
    /// Taxonomy kind reported to observers
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SignalingUnavailable
    }
}

/// Signaling events on the wire
///
/// Encoded as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Caller asks the callee for a call
    #[serde(rename_all = "camelCase")]
    CallRequest {
        /// Caller id
        caller_id: ParticipantId,
        /// Caller display name
        caller_name: String,
        /// Requested call type
        call_type: MediaType,
        /// Room allocated for the call
        room_id: String,
        /// Callee id
        target_id: ParticipantId,
    },

    /// Callee accepts or declines; addressed to the caller
    #[serde(rename_all = "camelCase")]
    CallResponse {
        /// Caller id (the addressee)
        caller_id: ParticipantId,
        /// Callee id
        responder_id: ParticipantId,
        /// Callee display name
        responder_name: String,
        /// Whether the call was accepted
        accepted: bool,
        /// Why it was declined
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// SDP offer from caller to callee
    #[serde(rename_all = "camelCase")]
    SessionOffer {
        /// SDP content
        sdp: String,
        /// Addressee
        target_id: ParticipantId,
    },

    /// SDP answer from callee to caller
    #[serde(rename_all = "camelCase")]
    SessionAnswer {
        /// SDP content
        sdp: String,
        /// Addressee
        target_id: ParticipantId,
    },

    /// Local ICE candidate, either direction
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// The candidate
        candidate: IceCandidate,
        /// Addressee
        target_id: ParticipantId,
    },

    /// Hang up, either direction
    #[serde(rename_all = "camelCase")]
    EndCall {
        /// Addressee
        target_id: ParticipantId,
    },
}

/// Discriminant of [`SignalingMessage`], used as handler registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingEventKind {
    /// `call-request`
    CallRequest,
    /// `call-response`
    CallResponse,
    /// `session-offer`
    SessionOffer,
    /// `session-answer`
    SessionAnswer,
    /// `ice-candidate`
    IceCandidate,
    /// `end-call`
    EndCall,
}

impl SignalingEventKind {
    /// All kinds, in wire order
    pub const ALL: [SignalingEventKind; 6] = [
        Self::CallRequest,
        Self::CallResponse,
        Self::SessionOffer,
        Self::SessionAnswer,
        Self::IceCandidate,
        Self::EndCall,
    ];

    /// Wire event name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallResponse => "call-response",
            Self::SessionOffer => "session-offer",
            Self::SessionAnswer => "session-answer",
            Self::IceCandidate => "ice-candidate",
            Self::EndCall => "end-call",
        }
    }
}

impl SignalingMessage {
    /// Participant the event is addressed to
    #[must_use]
    pub fn target_id(&self) -> &ParticipantId {
        match self {
            Self::CallRequest { target_id, .. }
            | Self::SessionOffer { target_id, .. }
            | Self::SessionAnswer { target_id, .. }
            | Self::IceCandidate { target_id, .. }
            | Self::EndCall { target_id } => target_id,
            Self::CallResponse { caller_id, .. } => caller_id,
        }
    }

    /// Event kind
    #[must_use]
    pub fn kind(&self) -> SignalingEventKind {
        match self {
            Self::CallRequest { .. } => SignalingEventKind::CallRequest,
            Self::CallResponse { .. } => SignalingEventKind::CallResponse,
            Self::SessionOffer { .. } => SignalingEventKind::SessionOffer,
            Self::SessionAnswer { .. } => SignalingEventKind::SessionAnswer,
            Self::IceCandidate { .. } => SignalingEventKind::IceCandidate,
            Self::EndCall { .. } => SignalingEventKind::EndCall,
        }
    }

    /// Validate field sizes to prevent abuse
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` naming the offending field
    pub fn validate(&self) -> Result<(), SignalingError> {
        check_id("targetId", self.target_id().as_str())?;
        match self {
            Self::CallRequest {
                caller_id,
                caller_name,
                room_id,
                ..
            } => {
                check_id("callerId", caller_id.as_str())?;
                check_len("callerName", caller_name, MAX_ID_LENGTH)?;
                check_len("roomId", room_id, MAX_ID_LENGTH)
            }
            Self::CallResponse {
                responder_id,
                responder_name,
                reason,
                ..
            } => {
                check_id("responderId", responder_id.as_str())?;
                check_len("responderName", responder_name, MAX_ID_LENGTH)?;
                check_len("reason", reason.as_deref().unwrap_or_default(), MAX_ID_LENGTH)
            }
            Self::SessionOffer { sdp, .. } | Self::SessionAnswer { sdp, .. } => {
                check_len("sdp", sdp, MAX_SDP_LENGTH)
            }
            Self::IceCandidate { candidate, .. } => {
                check_len("candidate", &candidate.candidate, MAX_SDP_LENGTH)
            }
            Self::EndCall { .. } => Ok(()),
        }
    }
}

fn check_id(field: &str, value: &str) -> Result<(), SignalingError> {
    if value.is_empty() {
        return Err(SignalingError::InvalidMessage(format!("{field} cannot be empty")));
    }
    check_len(field, value, MAX_ID_LENGTH)
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), SignalingError> {
    if value.len() > max {
        return Err(SignalingError::InvalidMessage(format!(
            "{field} length {} exceeds maximum of {max}",
            value.len()
        )));
    }
    Ok(())
}

/// Event as delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    /// Room of the sending connection, stamped by the relay
    pub sender_id: ParticipantId,
    /// The event
    pub message: SignalingMessage,
}

/// Signaling transport trait
///
/// Implement this for a concrete relay connection. One transport instance
/// carries one logical channel; ordering is preserved within it.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Join a room so events addressed to it are delivered here
    async fn join_room(&self, room: &ParticipantId) -> Result<(), Self::Error>;

    /// Emit an event; the relay routes it by `target_id`
    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next event, `None` once the relay closed the channel
    async fn receive_message(&self) -> Result<Option<InboundSignal>, Self::Error>;

    /// Close the channel
    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

type SignalHandler = Arc<dyn Fn(&InboundSignal) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&SignalingError) + Send + Sync>;

/// Per-channel registry of typed event handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<SignalingEventKind, Vec<SignalHandler>>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn on(&self, kind: SignalingEventKind, handler: impl Fn(&InboundSignal) + Send + Sync + 'static) {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a channel-level error handler
    pub fn on_error(&self, handler: impl Fn(&SignalingError) + Send + Sync + 'static) {
        self.error_handlers.write().push(Arc::new(handler));
    }

    /// Deliver a signal to every handler of its kind, returning how many ran
    pub fn dispatch(&self, signal: &InboundSignal) -> usize {
        // Clone out so handlers may register further handlers
        let handlers: Vec<SignalHandler> = self
            .handlers
            .read()
            .get(&signal.message.kind())
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(signal);
        }
        handlers.len()
    }

    /// Deliver a channel error to every error handler
    pub fn dispatch_error(&self, error: &SignalingError) {
        let handlers: Vec<ErrorHandler> = self.error_handlers.read().clone();
        for handler in &handlers {
            handler(error);
        }
    }

    /// Number of handlers registered for a kind
    #[must_use]
    pub fn handler_count(&self, kind: SignalingEventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

/// Object-safe sending half of a signaling channel
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Local participant the channel belongs to
    fn local_id(&self) -> &ParticipantId;

    /// Send an event through the channel
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

/// Signaling client for one local identity
pub struct SignalingClient<T: SignalingTransport> {
    identity: ParticipantIdentity,
    transport: Arc<T>,
    registry: Arc<HandlerRegistry>,
    connected: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SignalingTransport> SignalingClient<T> {
    /// Connect the channel: join the identity's personal room
    ///
    /// Inbound events are buffered by the transport until [`listen`](Self::listen)
    /// is called, so handlers can be registered first.
    ///
    /// # Errors
    ///
    /// Returns error if the identity is not routable or joining fails
    #[tracing::instrument(skip(identity, transport), fields(participant = %identity.id))]
    pub async fn connect(
        identity: ParticipantIdentity,
        transport: Arc<T>,
    ) -> Result<Self, SignalingError> {
        let client = Self {
            identity,
            transport,
            registry: Arc::new(HandlerRegistry::new()),
            connected: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        };
        let room = client.identity.id.clone();
        client.join_room(&room).await?;
        client.connected.store(true, Ordering::SeqCst);
        tracing::info!("Signaling channel connected");
        Ok(client)
    }

    /// Join a room on the relay
    ///
    /// # Errors
    ///
    /// Returns error if the room id is invalid or the transport fails
    pub async fn join_room(&self, room: &ParticipantId) -> Result<(), SignalingError> {
        check_id("roomId", room.as_str())?;
        self.transport
            .join_room(room)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))?;
        tracing::debug!(room = %room, "Joined room");
        Ok(())
    }

    /// Register a handler for one inbound event kind
    pub fn on(&self, kind: SignalingEventKind, handler: impl Fn(&InboundSignal) + Send + Sync + 'static) {
        self.registry.on(kind, handler);
    }

    /// Register a handler for channel loss
    pub fn on_error(&self, handler: impl Fn(&SignalingError) + Send + Sync + 'static) {
        self.registry.on_error(handler);
    }

    /// Start the listener loop; calling it again is a no-op
    pub fn listen(&self) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let connected = self.connected.clone();
        let local_id = self.identity.id.clone();
        *listener = Some(tokio::spawn(async move {
            listen_loop(transport, registry, connected, local_id).await;
        }));
    }

    /// Send an event
    ///
    /// # Errors
    ///
    /// Returns error if the channel is down, the event is malformed, or the
    /// transport fails
    #[tracing::instrument(skip(self, message), fields(peer = %message.target_id(), message_type = message.kind().as_str()))]
    pub async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        message.validate()?;
        tracing::debug!("Sending signaling message");
        self.transport
            .send_message(message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Whether the channel is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Local identity
    #[must_use]
    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    /// Handler registry of this channel
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Stop listening and close the transport
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Error closing signaling transport");
        }
        tracing::info!(participant = %self.identity.id, "Signaling channel disconnected");
    }
}

impl<T: SignalingTransport> Drop for SignalingClient<T> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl<T: SignalingTransport> SignalSender for SignalingClient<T> {
    fn local_id(&self) -> &ParticipantId {
        &self.identity.id
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        SignalingClient::send(self, message).await
    }
}

async fn listen_loop<T: SignalingTransport>(
    transport: Arc<T>,
    registry: Arc<HandlerRegistry>,
    connected: Arc<AtomicBool>,
    local_id: ParticipantId,
) {
    tracing::debug!(participant = %local_id, "Signaling listener started");
    let error = loop {
        match transport.receive_message().await {
            Ok(Some(signal)) => {
                if signal.message.target_id() != &local_id {
                    tracing::trace!(
                        target_id = %signal.message.target_id(),
                        "Dropping event addressed to another participant"
                    );
                    continue;
                }
                if let Err(e) = signal.message.validate() {
                    tracing::warn!(sender = %signal.sender_id, error = %e, "Dropping malformed event");
                    continue;
                }
                tracing::debug!(
                    sender = %signal.sender_id,
                    message_type = signal.message.kind().as_str(),
                    "Received signaling message"
                );
                if registry.dispatch(&signal) == 0 {
                    tracing::trace!(message_type = signal.message.kind().as_str(), "No handler registered");
                }
            }
            Ok(None) => break SignalingError::Closed,
            Err(e) => break SignalingError::TransportError(e.to_string()),
        }
    };
    connected.store(false, Ordering::SeqCst);
    tracing::warn!(participant = %local_id, error = %error, "Signaling channel lost");
    registry.dispatch_error(&error);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn offer(to: &str) -> SignalingMessage {
        SignalingMessage::SessionOffer {
            sdp: "v=0\r\n".to_string(),
            target_id: to.into(),
        }
    }

    #[test]
    fn test_wire_format_call_request() {
        let msg = SignalingMessage::CallRequest {
            caller_id: "a".into(),
            caller_name: "Alice".to_string(),
            call_type: MediaType::Video,
            room_id: "room-1".to_string(),
            target_id: "b".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "call-request");
        assert_eq!(value["data"]["callerId"], "a");
        assert_eq!(value["data"]["callerName"], "Alice");
        assert_eq!(value["data"]["callType"], "video");
        assert_eq!(value["data"]["roomId"], "room-1");
        let back: SignalingMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_call_response_without_reason() {
        let json = r#"{"event":"call-response","data":{"callerId":"a","responderId":"b","responderName":"Bob","accepted":true}}"#;
        let msg: SignalingMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.target_id().as_str(), "a");
        assert_eq!(msg.kind(), SignalingEventKind::CallResponse);
        assert!(matches!(msg, SignalingMessage::CallResponse { accepted: true, reason: None, .. }));
    }

    #[test]
    fn test_event_names_cover_all_kinds() {
        let samples = vec![
            SignalingMessage::CallResponse {
                caller_id: "a".into(),
                responder_id: "b".into(),
                responder_name: "Bob".into(),
                accepted: false,
                reason: Some("busy".into()),
            },
            offer("b"),
            SignalingMessage::SessionAnswer {
                sdp: "v=0".into(),
                target_id: "a".into(),
            },
            SignalingMessage::IceCandidate {
                candidate: IceCandidate::new("candidate:0"),
                target_id: "a".into(),
            },
            SignalingMessage::EndCall { target_id: "a".into() },
        ];
        for msg in samples {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["event"], msg.kind().as_str());
        }
    }

    #[test]
    fn test_validation_limits() {
        assert!(offer("b").validate().is_ok());
        assert!(matches!(
            offer("").validate(),
            Err(SignalingError::InvalidMessage(ref m)) if m.contains("targetId")
        ));

        let huge = SignalingMessage::SessionAnswer {
            sdp: "x".repeat(MAX_SDP_LENGTH + 1),
            target_id: "a".into(),
        };
        assert!(matches!(
            huge.validate(),
            Err(SignalingError::InvalidMessage(ref m)) if m.contains("sdp")
        ));
    }

    #[test]
    fn test_registry_dispatches_by_kind() {
        let registry = HandlerRegistry::new();
        let offers = Arc::new(AtomicUsize::new(0));
        let counter = offers.clone();
        registry.on(SignalingEventKind::SessionOffer, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let signal = InboundSignal {
            sender_id: "a".into(),
            message: offer("b"),
        };
        assert_eq!(registry.dispatch(&signal), 1);
        let end = InboundSignal {
            sender_id: "a".into(),
            message: SignalingMessage::EndCall { target_id: "b".into() },
        };
        assert_eq!(registry.dispatch(&end), 0);
        assert_eq!(offers.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count(SignalingEventKind::SessionOffer), 1);
    }

    #[tokio::test]
    async fn test_client_delivers_directed_events_in_order() {
        let relay = MemoryRelay::new();
        let alice = SignalingClient::connect(
            ParticipantIdentity::new("alice", "Alice"),
            Arc::new(relay.connect()),
        )
        .await
        .unwrap();
        let bob = SignalingClient::connect(
            ParticipantIdentity::new("bob", "Bob"),
            Arc::new(relay.connect()),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in SignalingEventKind::ALL {
            let tx = tx.clone();
            bob.on(kind, move |signal| {
                let _ = tx.send(signal.clone());
            });
        }
        bob.listen();

        alice.send(offer("bob")).await.unwrap();
        alice
            .send(SignalingMessage::EndCall { target_id: "bob".into() })
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sender_id.as_str(), "alice");
        assert_eq!(first.message.kind(), SignalingEventKind::SessionOffer);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.message.kind(), SignalingEventKind::EndCall);
    }

    #[tokio::test]
    async fn test_events_for_other_participants_are_not_dispatched() {
        let relay = MemoryRelay::new();
        let bob = SignalingClient::connect(
            ParticipantIdentity::new("bob", "Bob"),
            Arc::new(relay.connect()),
        )
        .await
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bob.on(SignalingEventKind::SessionOffer, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bob.listen();

        // A misbehaving relay hands bob an offer meant for carol
        let delivered = relay.deliver_to(
            &"bob".into(),
            InboundSignal {
                sender_id: "alice".into(),
                message: offer("carol"),
            },
        );
        assert_eq!(delivered, 1);
        relay.deliver_to(
            &"bob".into(),
            InboundSignal {
                sender_id: "alice".into(),
                message: offer("bob"),
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_loss_reports_error_and_blocks_send() {
        let relay = MemoryRelay::new();
        let bob = SignalingClient::connect(
            ParticipantIdentity::new("bob", "Bob"),
            Arc::new(relay.connect()),
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_error(move |e| {
            let _ = tx.send(e.clone());
        });
        bob.listen();

        relay.disconnect(&"bob".into());
        let error = rx.recv().await.unwrap();
        assert!(matches!(error, SignalingError::Closed));
        assert!(!bob.is_connected());
        assert!(matches!(
            bob.send(offer("alice")).await,
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_identity() {
        let relay = MemoryRelay::new();
        let result =
            SignalingClient::connect(ParticipantIdentity::anonymous(""), Arc::new(relay.connect())).await;
        assert!(matches!(result, Err(SignalingError::InvalidMessage(_))));
    }
}
