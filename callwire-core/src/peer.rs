//! Peer session
//!
//! A [`PeerSession`] owns one peer connection for one call: it attaches the
//! local tracks, runs the offer/answer exchange over signaling, trickles
//! candidates in both directions and carries the text data channel.
//!
//! Remote candidates that arrive before the remote description is set are
//! queued and applied exactly once, in arrival order, as soon as it is.
//! Connection state changes are only reported upward; deciding what they
//! mean for the call is the controller's job.
//!
//! The connection itself sits behind [`PeerBackend`]/[`PeerDriver`] so the
//! negotiation logic runs unchanged over `webrtc` ([`RtcBackend`]) or a
//! simulated network in tests.

use crate::error::ErrorKind;
use crate::identity::ParticipantId;
use crate::media::{LocalTrack, MediaAcquisitionManager, MediaTrackSet};
use crate::signaling::{SignalSender, SignalingMessage};
use crate::types::{CallId, DataMessage, IceCandidate, IceServer, MediaType};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Peer session errors
#[derive(Error, Debug, Clone)]
pub enum PeerError {
    /// Session description or candidate rejected
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The peer connection could not be created or driven
    #[error("Peer connection error: {0}")]
    Backend(String),

    /// Operation not valid for the session's role or progress
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// The data channel is not open
    #[error("Data channel is not open")]
    DataChannelClosed,

    /// Signaling the remote side failed
    #[error("Signaling failed: {0}")]
    Signaling(String),
}

impl PeerError {
    /// Taxonomy kind reported to the UI
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Negotiation(_) | Self::Backend(_) | Self::InvalidState(_) => {
                ErrorKind::NegotiationFailed
            }
            Self::DataChannelClosed => ErrorKind::TransportLost,
            Self::Signaling(_) => ErrorKind::SignalingUnavailable,
        }
    }
}

/// Which side of the offer/answer exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Creates the offer and the data channel
    Caller,
    /// Answers the offer and receives the data channel
    Callee,
}

/// Kind of remote session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// From the caller
    Offer,
    /// From the callee
    Answer,
}

/// Connection state as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Closed locally
    Closed,
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// Remote media announced by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Stream the track belongs to
    pub stream_id: String,
    /// Audio or video
    pub kind: MediaType,
    /// Negotiated codec mime type
    pub codec: String,
}

/// Raw events produced by a [`PeerDriver`]
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// Connection state changed
    ConnectionState(PeerConnectionState),
    /// Remote media arrived
    RemoteTrack(RemoteTrack),
    /// The data channel opened
    DataChannelOpen,
    /// The data channel closed
    DataChannelClosed,
    /// Raw data channel payload
    DataMessage(Bytes),
}

/// Events a session surfaces to the controller after processing
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state changed
    ConnectionState(PeerConnectionState),
    /// Remote media arrived
    RemoteTrack(RemoteTrack),
    /// The data channel opened
    DataChannelOpen,
    /// The data channel closed
    DataChannelClosed,
    /// A text message arrived
    DataMessage(DataMessage),
}

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Label of the text data channel
    pub data_channel_label: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            data_channel_label: "chat".to_string(),
        }
    }
}

/// Factory for peer connections
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Allocate one peer connection; its callbacks are forwarded to `events`
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created
    async fn create(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerDriver>, PeerError>;
}

/// One peer connection
#[async_trait]
pub trait PeerDriver: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), PeerError>;

    /// Create an offer and set it as local description
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Create an answer and set it as local description
    async fn create_answer(&self) -> Result<String, PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Create the ordered text channel
    async fn create_data_channel(&self, label: &str) -> Result<(), PeerError>;

    /// Send one payload on the data channel
    async fn send_data(&self, payload: Bytes) -> Result<(), PeerError>;

    /// Close data channel and connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Candidate counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationStats {
    /// Local candidates sent to the remote side
    pub candidates_generated: u64,
    /// Remote candidates applied to the connection
    pub candidates_applied: u64,
    /// Remote candidates waiting for the remote description
    pub candidates_queued: u64,
}

/// Remote candidates held back until the remote description is set
#[derive(Debug, Default)]
pub struct CandidateQueue {
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    /// Empty queue, remote description not set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate; returns it back if it can be applied now
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Mark the remote description set and take everything queued, oldest first
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }

    /// Whether the remote description has been set
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.remote_description_set
    }

    /// Number of queued candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued candidates, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending.iter()
    }
}

/// Peer connection lifecycle for one call
pub struct PeerSession {
    call_id: CallId,
    role: PeerRole,
    local_id: ParticipantId,
    remote_id: ParticipantId,
    driver: Arc<dyn PeerDriver>,
    signaling: Arc<dyn SignalSender>,
    media: Arc<MediaAcquisitionManager>,
    tracks: Option<Arc<MediaTrackSet>>,
    candidates: CandidateQueue,
    local_description: Option<String>,
    remote_description: Option<String>,
    stats: NegotiationStats,
    data_channel_open: bool,
    closed: bool,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("remote_id", &self.remote_id)
            .field("stats", &self.stats)
            .field("data_channel_open", &self.data_channel_open)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Everything a session needs from its surroundings
#[derive(Clone)]
pub struct PeerContext {
    /// Connection factory
    pub backend: Arc<dyn PeerBackend>,
    /// Connection settings
    pub config: PeerConfig,
    /// Channel used for offers, answers, candidates and hangup
    pub signaling: Arc<dyn SignalSender>,
    /// Release authority for the attached tracks
    pub media: Arc<MediaAcquisitionManager>,
}

impl PeerSession {
    /// Allocate the peer connection and attach `tracks`
    ///
    /// As caller, also creates the data channel. Driver events arrive on the
    /// returned receiver and must be fed back through [`handle_event`](Self::handle_event).
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created or a track cannot be attached
    #[tracing::instrument(skip(ctx, tracks), fields(call_id = %call_id, peer = %remote_id))]
    pub async fn create(
        ctx: &PeerContext,
        call_id: CallId,
        role: PeerRole,
        remote_id: ParticipantId,
        tracks: Option<Arc<MediaTrackSet>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let driver = ctx.backend.create(&ctx.config, events_tx).await?;
        let mut session = Self {
            call_id,
            role,
            local_id: ctx.signaling.local_id().clone(),
            remote_id,
            driver,
            signaling: ctx.signaling.clone(),
            media: ctx.media.clone(),
            tracks: None,
            candidates: CandidateQueue::new(),
            local_description: None,
            remote_description: None,
            stats: NegotiationStats::default(),
            data_channel_open: false,
            closed: false,
        };
        if let Some(tracks) = tracks {
            session.attach(tracks).await?;
        }
        if role == PeerRole::Caller {
            session
                .driver
                .create_data_channel(&ctx.config.data_channel_label)
                .await?;
        }
        tracing::info!(role = ?role, "Peer session created");
        Ok((session, events_rx))
    }

    /// Attach a track set acquired after creation
    ///
    /// # Errors
    ///
    /// Returns error if a set is already attached or the driver rejects a track
    pub async fn attach(&mut self, tracks: Arc<MediaTrackSet>) -> Result<(), PeerError> {
        if self.tracks.is_some() {
            return Err(PeerError::InvalidState("tracks already attached".to_string()));
        }
        for track in tracks.tracks() {
            self.driver.add_track(track).await?;
            tracing::debug!(track_id = %track.id(), kind = %track.kind(), "Track attached");
        }
        self.tracks = Some(tracks);
        Ok(())
    }

    /// Caller: create the offer and send it
    ///
    /// # Errors
    ///
    /// Returns error if not the caller, or the offer cannot be created or sent
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn start_offer(&mut self) -> Result<(), PeerError> {
        if self.role != PeerRole::Caller || self.local_description.is_some() {
            return Err(PeerError::InvalidState("offer already created or not caller".to_string()));
        }
        let sdp = self.driver.create_offer().await?;
        self.local_description = Some(sdp.clone());
        self.signal(SignalingMessage::SessionOffer {
            sdp,
            target_id: self.remote_id.clone(),
        })
        .await?;
        tracing::debug!("Offer sent");
        Ok(())
    }

    /// Caller: apply the answer, then flush queued candidates
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if the answer is empty, unexpected or rejected
    #[tracing::instrument(skip(self, sdp), fields(call_id = %self.call_id))]
    pub async fn handle_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        if self.role != PeerRole::Caller || self.local_description.is_none() {
            return Err(PeerError::Negotiation("answer without a pending offer".to_string()));
        }
        self.apply_remote_description(SdpKind::Answer, sdp).await
    }

    /// Callee: apply the offer, flush queued candidates, answer
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if the offer is empty or rejected
    #[tracing::instrument(skip(self, sdp), fields(call_id = %self.call_id))]
    pub async fn handle_offer(&mut self, sdp: &str) -> Result<(), PeerError> {
        if self.role != PeerRole::Callee {
            return Err(PeerError::Negotiation("caller received an offer".to_string()));
        }
        self.apply_remote_description(SdpKind::Offer, sdp).await?;
        let answer = self.driver.create_answer().await?;
        self.local_description = Some(answer.clone());
        self.signal(SignalingMessage::SessionAnswer {
            sdp: answer,
            target_id: self.remote_id.clone(),
        })
        .await?;
        tracing::debug!("Answer sent");
        Ok(())
    }

    async fn apply_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        if self.remote_description.is_some() {
            return Err(PeerError::Negotiation("remote description already set".to_string()));
        }
        if sdp.trim().is_empty() {
            return Err(PeerError::Negotiation("empty session description".to_string()));
        }
        self.driver.set_remote_description(kind, sdp).await?;
        self.remote_description = Some(sdp.to_string());

        let queued = self.candidates.release();
        tracing::debug!(queued = queued.len(), "Remote description set, flushing candidates");
        for candidate in queued {
            self.apply_candidate(&candidate).await;
        }
        self.stats.candidates_queued = 0;
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until the remote description is set
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.candidates.push(candidate) {
            Some(candidate) => self.apply_candidate(&candidate).await,
            None => {
                self.stats.candidates_queued = self.candidates.len() as u64;
                tracing::trace!(queued = self.stats.candidates_queued, "Remote candidate queued");
            }
        }
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) {
        match self.driver.add_ice_candidate(candidate).await {
            Ok(()) => self.stats.candidates_applied += 1,
            Err(e) => tracing::warn!(call_id = %self.call_id, error = %e, "Remote candidate rejected"),
        }
    }

    /// Process one driver event
    ///
    /// Local candidates are sent to the remote side here and do not surface.
    pub async fn handle_event(&mut self, event: PeerEvent) -> Option<SessionEvent> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.closed {
                    return None;
                }
                let message = SignalingMessage::IceCandidate {
                    candidate,
                    target_id: self.remote_id.clone(),
                };
                match self.signal(message).await {
                    Ok(()) => self.stats.candidates_generated += 1,
                    Err(e) => tracing::warn!(call_id = %self.call_id, error = %e, "Failed to send local candidate"),
                }
                None
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!(call_id = %self.call_id, state = ?state, "Peer connection state");
                Some(SessionEvent::ConnectionState(state))
            }
            PeerEvent::RemoteTrack(track) => {
                tracing::info!(call_id = %self.call_id, track_id = %track.id, kind = %track.kind, "Remote track");
                Some(SessionEvent::RemoteTrack(track))
            }
            PeerEvent::DataChannelOpen => {
                self.data_channel_open = true;
                Some(SessionEvent::DataChannelOpen)
            }
            PeerEvent::DataChannelClosed => {
                self.data_channel_open = false;
                Some(SessionEvent::DataChannelClosed)
            }
            PeerEvent::DataMessage(payload) => match serde_json::from_slice::<DataMessage>(&payload) {
                Ok(message) => Some(SessionEvent::DataMessage(message)),
                Err(e) => {
                    tracing::warn!(call_id = %self.call_id, error = %e, "Dropping malformed data message");
                    None
                }
            },
        }
    }

    /// Send a text message on the data channel
    ///
    /// Fire-and-forget: no acknowledgment and no retry.
    ///
    /// # Errors
    ///
    /// Returns `DataChannelClosed` unless the channel is open
    pub async fn send_text(&self, text: &str) -> Result<DataMessage, PeerError> {
        if !self.data_channel_open || self.closed {
            return Err(PeerError::DataChannelClosed);
        }
        let message = DataMessage::new(text, self.local_id.clone());
        let payload =
            serde_json::to_vec(&message).map_err(|e| PeerError::Backend(e.to_string()))?;
        self.driver.send_data(Bytes::from(payload)).await?;
        Ok(message)
    }

    /// Close everything and release local media
    ///
    /// Sends `end-call` to the remote side when `notify_remote` is set.
    /// Calling it twice is a no-op.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn end(&mut self, notify_remote: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.data_channel_open = false;
        if let Err(e) = self.driver.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
        if let Some(tracks) = self.tracks.take() {
            self.media.release(&tracks);
        }
        if notify_remote {
            let end = SignalingMessage::EndCall {
                target_id: self.remote_id.clone(),
            };
            if let Err(e) = self.signal(end).await {
                tracing::debug!(error = %e, "Could not notify remote of hangup");
            }
        }
        tracing::info!(stats = ?self.stats, "Peer session ended");
    }

    async fn signal(&self, message: SignalingMessage) -> Result<(), PeerError> {
        self.signaling
            .send(message)
            .await
            .map_err(|e| PeerError::Signaling(e.to_string()))
    }

    /// Call the session belongs to
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Caller or callee
    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Candidate counters
    #[must_use]
    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    /// Remote candidates still waiting for the remote description
    #[must_use]
    pub fn queued_candidates(&self) -> &CandidateQueue {
        &self.candidates
    }

    /// Local description once created
    #[must_use]
    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    /// Remote description once applied
    #[must_use]
    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    /// Attached tracks
    #[must_use]
    pub fn tracks(&self) -> Option<&Arc<MediaTrackSet>> {
        self.tracks.as_ref()
    }

    /// Whether the data channel is open
    #[must_use]
    pub fn is_data_channel_open(&self) -> bool {
        self.data_channel_open
    }

    /// Whether `end` has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// [`PeerBackend`] over the `webrtc` crate
#[derive(Debug, Clone, Default)]
pub struct RtcBackend;

impl RtcBackend {
    /// Create the backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerBackend for RtcBackend {
    async fn create(
        &self,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerDriver>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Backend(e.to_string()))?,
        );

        let driver = RtcDriver {
            pc,
            data_channel: Arc::new(Mutex::new(None)),
            events,
        };
        driver.register_handlers();
        tracing::debug!(ice_servers = config.ice_servers.len(), "Peer connection allocated");
        Ok(Arc::new(driver))
    }
}

struct RtcDriver {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl RtcDriver {
    fn register_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                    }
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = events.send(PeerEvent::ConnectionState(state.into()));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaType::Video,
                _ => MediaType::Audio,
            };
            let _ = events.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                codec: track.codec().capability.mime_type,
            }));
            Box::pin(async {})
        }));

        let events = self.events.clone();
        let slot = self.data_channel.clone();
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                tracing::debug!(label = %channel.label(), "Inbound data channel");
                wire_data_channel(&channel, &events);
                *slot.lock() = Some(channel);
                Box::pin(async {})
            }));
    }
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let on_open = events.clone();
    channel.on_open(Box::new(move || {
        let _ = on_open.send(PeerEvent::DataChannelOpen);
        Box::pin(async {})
    }));
    let on_close = events.clone();
    channel.on_close(Box::new(move || {
        let _ = on_close.send(PeerEvent::DataChannelClosed);
        Box::pin(async {})
    }));
    let on_message = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let _ = on_message.send(PeerEvent::DataMessage(message.data));
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerDriver for RtcDriver {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), PeerError> {
        let Some(rtc_track) = track.rtc_track() else {
            tracing::warn!(track_id = %track.id(), "Track has no webrtc sink, not attached");
            return Ok(());
        };
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = rtc_track.clone();
        let sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        // RTCP must be drained for interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))?;
        wire_data_channel(&channel, &self.events);
        *self.data_channel.lock() = Some(channel);
        Ok(())
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), PeerError> {
        let channel = self.data_channel.lock().clone();
        match channel {
            Some(channel) if channel.ready_state() == RTCDataChannelState::Open => {
                channel
                    .send(&payload)
                    .await
                    .map_err(|e| PeerError::Backend(e.to_string()))?;
                Ok(())
            }
            _ => Err(PeerError::DataChannelClosed),
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        let channel = self.data_channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::debug!(error = %e, "Error closing data channel");
            }
        }
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Backend(e.to_string()))
    }
}
