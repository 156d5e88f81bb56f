//! Call types and data structures

use crate::error::ErrorKind;
use crate::identity::{ParticipantId, ParticipantIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Unique identifier for a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media, used both for the call type and for individual tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Camera video (with audio, when used as a call type)
    Video,
    /// Microphone audio only
    Audio,
}

impl MediaType {
    /// Constraints requested for a call of this type
    #[must_use]
    pub fn constraints(&self) -> MediaConstraints {
        match self {
            Self::Video => MediaConstraints::video_call(),
            Self::Audio => MediaConstraints::audio_only(),
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// Media constraints for acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a microphone track
    pub audio: bool,
    /// Request a camera track
    pub video: bool,
    /// Preferred capture width when video is requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideal_width: Option<u32>,
    /// Preferred capture height when video is requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideal_height: Option<u32>,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            ideal_width: None,
            ideal_height: None,
        }
    }

    /// Video call with audio, preferring 1280x720
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            ideal_width: Some(1280),
            ideal_height: Some(720),
        }
    }

    /// Whether anything at all is requested
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    /// The call type these constraints describe
    pub fn media_type(&self) -> MediaType {
        if self.video {
            MediaType::Video
        } else {
            MediaType::Audio
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Whether this endpoint placed or received the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Placed by the local participant
    Outgoing,
    /// Received from the remote participant
    Incoming,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No call in progress
    Idle,
    /// Outgoing request sent, waiting for the callee's response
    Requesting,
    /// Incoming request waiting for a local decision
    Ringing,
    /// Negotiating the peer connection
    Connecting,
    /// Media is flowing
    Active,
    /// Call finished normally (hangup, rejection, timeout)
    Ended,
    /// Call aborted by an error
    Failed,
}

impl CallState {
    /// `Ended` or `Failed`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Anything but `Idle`, `Ended` and `Failed`
    #[must_use]
    pub fn is_in_call(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }

    /// Check whether a transition is allowed by the lifecycle
    ///
    /// Transitions only move forward; the single way back is the reset to
    /// `Idle` once a terminal state has been torn down.
    #[must_use]
    pub fn can_transition_to(&self, to: CallState) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Requesting)
                | (Self::Idle, Self::Ringing)
                | (Self::Requesting, Self::Connecting)
                | (Self::Requesting, Self::Ended)
                | (Self::Requesting, Self::Failed)
                | (Self::Ringing, Self::Connecting)
                | (Self::Ringing, Self::Ended)
                | (Self::Ringing, Self::Failed)
                | (Self::Connecting, Self::Active)
                | (Self::Connecting, Self::Ended)
                | (Self::Connecting, Self::Failed)
                | (Self::Active, Self::Ended)
                | (Self::Ended, Self::Idle)
                | (Self::Failed, Self::Idle)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Why a session left the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum EndReason {
    /// Local `end_call`
    LocalHangup,
    /// Remote `end-call`
    RemoteHangup,
    /// The request was declined; carries the remote (or local) reason
    Rejected(String),
    /// Nobody answered within the countdown
    Timeout,
    /// Signaling channel or peer connection dropped mid-call
    TransportLost,
    /// Session aborted by an error
    Failed(ErrorKind),
}

impl EndReason {
    /// Reason as recorded on the session and sent on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::LocalHangup => "local-hangup",
            Self::RemoteHangup => "remote-hangup",
            Self::Rejected(reason) => reason,
            Self::Timeout => "timeout",
            Self::TransportLost => "transport-lost",
            Self::Failed(kind) => kind.as_str(),
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only a candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:host:port`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN-only server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Default public STUN servers
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
            Self::stun("stun:stun2.l.google.com:19302"),
        ]
    }
}

/// Text message carried over the peer data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    /// Message body
    pub text: String,
    /// Who wrote it
    pub sender_id: ParticipantId,
    /// When it was written
    pub timestamp: DateTime<Utc>,
}

impl DataMessage {
    /// New message stamped now
    pub fn new(text: impl Into<String>, sender_id: ParticipantId) -> Self {
        Self {
            text: text.into(),
            sender_id,
            timestamp: Utc::now(),
        }
    }
}

/// Caller information exposed to the UI while ringing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    /// Session created for the request
    pub call_id: CallId,
    /// Who is calling
    pub caller: ParticipantIdentity,
    /// Requested call type
    pub media_type: MediaType,
    /// Room the caller allocated for the call
    pub room_id: String,
}

/// The central call aggregate
///
/// Only the call controller mutates it. Negotiation fields are filled in as
/// the offer/answer exchange progresses.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Call identifier
    pub session_id: CallId,
    /// Room allocated by the caller
    pub room_id: String,
    /// Local participant
    pub local: ParticipantIdentity,
    /// Remote participant
    pub remote: ParticipantIdentity,
    /// Who placed the call
    pub direction: CallDirection,
    /// Call type
    pub media_type: MediaType,
    /// Current state
    pub state: CallState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the call became active
    pub connected_at: Option<DateTime<Utc>>,
    /// Local SDP once set
    pub local_description: Option<String>,
    /// Remote SDP once set
    pub remote_description: Option<String>,
    /// Offer received before the callee session existed
    pub buffered_offer: Option<String>,
    /// Remote candidates received before the remote description was set
    ///
    /// Buffered here while ringing; once a peer session exists this mirrors
    /// its queue.
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    /// Whether the data channel is open
    pub data_channel_open: bool,
    /// Recorded once the session reaches a terminal state
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    /// Session for a call placed by `local`
    pub fn outgoing(
        local: ParticipantIdentity,
        remote: ParticipantIdentity,
        media_type: MediaType,
    ) -> Self {
        let session_id = CallId::new();
        let room_id = format!("call-{session_id}");
        Self::new(session_id, room_id, local, remote, CallDirection::Outgoing, media_type)
    }

    /// Session for a request received from `remote`
    pub fn incoming(
        local: ParticipantIdentity,
        remote: ParticipantIdentity,
        media_type: MediaType,
        room_id: String,
    ) -> Self {
        Self::new(
            CallId::new(),
            room_id,
            local,
            remote,
            CallDirection::Incoming,
            media_type,
        )
    }

    fn new(
        session_id: CallId,
        room_id: String,
        local: ParticipantIdentity,
        remote: ParticipantIdentity,
        direction: CallDirection,
        media_type: MediaType,
    ) -> Self {
        Self {
            session_id,
            room_id,
            local,
            remote,
            direction,
            media_type,
            state: CallState::Idle,
            created_at: Utc::now(),
            connected_at: None,
            local_description: None,
            remote_description: None,
            buffered_offer: None,
            pending_remote_candidates: VecDeque::new(),
            data_channel_open: false,
            end_reason: None,
        }
    }

    /// Move to `to` if the lifecycle allows it, returning the previous state
    pub fn transition(&mut self, to: CallState) -> Option<CallState> {
        if !self.state.can_transition_to(to) {
            tracing::warn!(
                call_id = %self.session_id,
                from = ?self.state,
                to = ?to,
                "Rejected call state transition"
            );
            return None;
        }
        let from = self.state;
        self.state = to;
        if to == CallState::Active {
            self.connected_at = Some(Utc::now());
        }
        tracing::debug!(call_id = %self.session_id, old_state = ?from, new_state = ?to, "Call state transition");
        Some(from)
    }

    /// Remote id the session is talking to
    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote.id
    }

    /// Whether the remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    /// Call duration since the session became active
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}
