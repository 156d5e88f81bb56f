//! Call lifecycle controller
//!
//! The controller is the single writer of call state. It runs as one task
//! that consumes a command queue carrying local actions, inbound signaling,
//! peer connection events and timer expiries, so every transition happens in
//! one place and in arrival order.
//!
//! ```text
//!            start_call                 response(accepted)
//!     Idle ─────────────► Requesting ─────────────────────► Connecting ──► Active
//!      │                     │ rejected / timeout              │  ▲            │
//!      │ call-request        ▼                                 │  │ accept     │ hangup /
//!      └────────────────► Ringing ─────────────────────────────┼──┘            │ transport lost
//!                            │ reject / timeout                ▼               ▼
//!                            └──────────────────────────► Ended / Failed ◄─────┘
//!                                                              │ teardown
//!                                                              ▼
//!                                                             Idle
//! ```

use crate::error::ErrorKind;
use crate::identity::{ParticipantId, ParticipantIdentity};
use crate::media::{MediaAcquisitionManager, MediaError, MediaTrackSet};
use crate::peer::{
    NegotiationStats, PeerBackend, PeerConfig, PeerConnectionState, PeerContext, PeerError, PeerEvent,
    PeerRole, PeerSession, RemoteTrack, SessionEvent,
};
use crate::service::CallConfig;
use crate::signaling::{
    InboundSignal, SignalSender, SignalingClient, SignalingError, SignalingEventKind, SignalingMessage,
    SignalingTransport,
};
use crate::types::{
    CallId, CallSession, CallState, DataMessage, EndReason, IncomingCall, MediaConstraints, MediaType,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// A call is already in progress
    #[error("Another call is already in progress")]
    Busy,

    /// The action is not valid in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(CallState),

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// The target cannot be called
    #[error("Invalid call target: {0}")]
    InvalidTarget(String),

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Peer connection error
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// The controller task has stopped
    #[error("Call controller stopped")]
    ControllerStopped,
}

impl CallError {
    /// Taxonomy kind, for errors that map onto one
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Media(e) => Some(e.kind()),
            Self::Peer(e) => Some(e.kind()),
            Self::Signaling(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Call events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// A remote participant is calling
    IncomingCall(IncomingCall),
    /// The session moved to a new state
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: CallState,
        /// Recorded reason once the call ended or failed
        reason: Option<EndReason>,
    },
    /// Remote media arrived
    RemoteTrack {
        /// Call identifier
        call_id: CallId,
        /// The track
        track: RemoteTrack,
    },
    /// A text message was sent or received
    DataMessage {
        /// Call identifier
        call_id: CallId,
        /// The message
        message: DataMessage,
    },
    /// Something went wrong
    Error {
        /// Call identifier, if a call was involved
        call_id: Option<CallId>,
        /// Error kind
        kind: ErrorKind,
        /// Details for logs
        detail: String,
    },
}

/// Callbacks for the embedding UI
///
/// Every method defaults to a no-op. Callbacks run on the controller task
/// and must not block.
pub trait CallObserver: Send + Sync {
    /// Someone is calling; answer with `accept` or `reject`
    fn on_incoming_call(&self, _call: &IncomingCall) {}

    /// The call moved to `state`
    fn on_state_change(&self, _call_id: CallId, _state: CallState, _reason: Option<&EndReason>) {}

    /// Remote media arrived
    fn on_remote_track(&self, _call_id: CallId, _track: &RemoteTrack) {}

    /// A text message was sent or received
    fn on_data_message(&self, _call_id: CallId, _message: &DataMessage) {}

    /// An error occurred; `kind.user_message()` is suitable for display
    fn on_error(&self, _kind: ErrorKind, _detail: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Request,
    Ring,
    Negotiation,
    DisconnectGrace,
}

impl TimerKind {
    fn state(self) -> CallState {
        match self {
            Self::Request => CallState::Requesting,
            Self::Ring => CallState::Ringing,
            Self::Negotiation => CallState::Connecting,
            Self::DisconnectGrace => CallState::Active,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    StartCall {
        target: ParticipantId,
        media_type: MediaType,
        reply: Reply<CallId>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reason: String,
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    SendText {
        text: String,
        reply: Reply<DataMessage>,
    },
    ToggleVideo {
        reply: Reply<Option<bool>>,
    },
    ToggleAudio {
        reply: Reply<Option<bool>>,
    },
    Snapshot {
        reply: Reply<Option<CallSession>>,
    },
    Stats {
        reply: Reply<Option<NegotiationStats>>,
    },
    Signal(InboundSignal),
    SignalingLost(SignalingError),
    Peer {
        call_id: CallId,
        event: PeerEvent,
    },
    Timer {
        call_id: CallId,
        kind: TimerKind,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type Observers = Arc<RwLock<Vec<Arc<dyn CallObserver>>>>;

/// Handle to the call controller task
///
/// Cheap to clone; all clones drive the same controller.
#[derive(Clone)]
pub struct CallController {
    identity: ParticipantIdentity,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
    event_sender: broadcast::Sender<CallEvent>,
    observers: Observers,
}

impl CallController {
    /// Start the controller for the identity of `signaling`
    ///
    /// Registers inbound handlers on the signaling channel and starts its
    /// listener.
    pub fn spawn<T: SignalingTransport>(
        signaling: Arc<SignalingClient<T>>,
        media: Arc<MediaAcquisitionManager>,
        backend: Arc<dyn PeerBackend>,
        config: Arc<CallConfig>,
    ) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(CallState::Idle);
        let (event_sender, _) = broadcast::channel(256);
        let observers: Observers = Arc::new(RwLock::new(Vec::new()));
        let identity = signaling.identity().clone();

        // Handlers and the actor hold weak senders so the queue closes with the last handle
        for kind in SignalingEventKind::ALL {
            let commands = commands.downgrade();
            signaling.on(kind, move |signal| {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::Signal(signal.clone()));
                }
            });
        }
        let lost = commands.downgrade();
        signaling.on_error(move |error| {
            if let Some(commands) = lost.upgrade() {
                let _ = commands.send(Command::SignalingLost(error.clone()));
            }
        });

        let peer_ctx = PeerContext {
            backend,
            config: PeerConfig {
                ice_servers: config.ice_servers.clone(),
                data_channel_label: config.data_channel_label.clone(),
            },
            signaling: signaling.clone(),
            media: media.clone(),
        };
        let actor = Controller {
            identity: identity.clone(),
            config,
            signaling: signaling.clone(),
            media,
            peer_ctx,
            commands: commands.downgrade(),
            session: None,
            peer: None,
            timer: None,
            forwarder: None,
            state: state_tx,
            event_sender: event_sender.clone(),
            observers: observers.clone(),
        };
        tokio::spawn(actor.run(queue));
        signaling.listen();

        tracing::info!(participant = %identity.id, "Call controller started");
        Self {
            identity,
            commands,
            state,
            event_sender,
            observers,
        }
    }

    async fn request<R>(&self, make: impl FnOnce(Reply<R>) -> Command) -> Result<R, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| CallError::ControllerStopped)?;
        response.await.map_err(|_| CallError::ControllerStopped)?
    }

    /// Call `target`
    ///
    /// Acquires local media first; nothing is signaled if that fails.
    ///
    /// # Errors
    ///
    /// Returns `Busy` while another call exists, or the acquisition or
    /// signaling failure
    pub async fn start_call(
        &self,
        target: impl Into<ParticipantId>,
        media_type: MediaType,
    ) -> Result<CallId, CallError> {
        let target = target.into();
        self.request(|reply| Command::StartCall {
            target,
            media_type,
            reply,
        })
        .await
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or local media cannot be acquired
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    pub async fn reject(&self, reason: impl Into<String>) -> Result<(), CallError> {
        let reason = reason.into();
        self.request(|reply| Command::Reject { reason, reply }).await
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without a call
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Send a text message on the data channel
    ///
    /// # Errors
    ///
    /// Returns error if there is no call or the channel is not open
    pub async fn send_text(&self, text: impl Into<String>) -> Result<DataMessage, CallError> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await
    }

    /// Flip the camera on or off, returning the new flag
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn toggle_video(&self) -> Result<Option<bool>, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    /// Flip the microphone on or off, returning the new flag
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn toggle_audio(&self) -> Result<Option<bool>, CallError> {
        self.request(|reply| Command::ToggleAudio { reply }).await
    }

    /// Snapshot of the current session
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn session(&self) -> Result<Option<CallSession>, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Candidate counters of the current peer session
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn stats(&self) -> Result<Option<NegotiationStats>, CallError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Register a UI observer
    pub fn add_observer(&self, observer: Arc<dyn CallObserver>) {
        self.observers.write().push(observer);
    }

    /// Local identity
    #[must_use]
    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    /// End any call and stop the controller task
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

struct Controller {
    identity: ParticipantIdentity,
    config: Arc<CallConfig>,
    signaling: Arc<dyn SignalSender>,
    media: Arc<MediaAcquisitionManager>,
    peer_ctx: PeerContext,
    commands: mpsc::WeakUnboundedSender<Command>,
    session: Option<CallSession>,
    peer: Option<PeerSession>,
    timer: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    state: watch::Sender<CallState>,
    event_sender: broadcast::Sender<CallEvent>,
    observers: Observers,
}

impl Controller {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        let mut reply = None;
        while let Some(command) = queue.recv().await {
            if let Command::Shutdown { reply: done } = command {
                reply = Some(done);
                break;
            }
            self.handle(command).await;
        }
        if reply.is_none() {
            tracing::debug!(participant = %self.identity.id, "Every controller handle dropped");
        }
        if self.session.is_some() {
            self.finish(CallState::Ended, EndReason::LocalHangup, true).await;
        }
        self.cancel_timer();
        if let Some(done) = reply {
            let _ = done.send(());
        }
        tracing::info!(participant = %self.identity.id, "Call controller stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::StartCall {
                target,
                media_type,
                reply,
            } => {
                let _ = reply.send(self.start_call(target, media_type).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept().await);
            }
            Command::Reject { reason, reply } => {
                let _ = reply.send(self.reject(reason).await);
            }
            Command::EndCall { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            Command::SendText { text, reply } => {
                let _ = reply.send(self.send_text(&text).await);
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(Ok(self.media.toggle_video()));
            }
            Command::ToggleAudio { reply } => {
                let _ = reply.send(Ok(self.media.toggle_audio()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.session.clone()));
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.peer.as_ref().map(PeerSession::stats)));
            }
            Command::Signal(signal) => self.on_signal(signal).await,
            Command::SignalingLost(error) => self.on_signaling_lost(error).await,
            Command::Peer { call_id, event } => self.on_peer_event(call_id, event).await,
            Command::Timer { call_id, kind } => self.on_timer(call_id, kind).await,
            Command::Shutdown { .. } => {}
        }
    }

    fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    fn call_id(&self) -> Option<CallId> {
        self.session.as_ref().map(|s| s.session_id)
    }

    fn constraints_for(&self, media_type: MediaType) -> MediaConstraints {
        match media_type {
            MediaType::Audio => MediaConstraints::audio_only(),
            MediaType::Video if self.config.constraints.video => self.config.constraints.clone(),
            MediaType::Video => MediaConstraints::video_call(),
        }
    }

    #[tracing::instrument(skip(self), fields(participant = %self.identity.id))]
    async fn start_call(&mut self, target: ParticipantId, media_type: MediaType) -> Result<CallId, CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        if target.is_empty() || target == self.identity.id {
            return Err(CallError::InvalidTarget(target.to_string()));
        }

        let tracks = match self.media.acquire(&self.constraints_for(media_type)).await {
            Ok(tracks) => tracks,
            Err(e) => {
                self.report_error(None, e.kind(), &e.to_string());
                return Err(e.into());
            }
        };

        let session = CallSession::outgoing(
            self.identity.clone(),
            ParticipantIdentity::anonymous(target.clone()),
            tracks.media_type(),
        );
        let call_id = session.session_id;
        let request = SignalingMessage::CallRequest {
            caller_id: self.identity.id.clone(),
            caller_name: self.identity.display_name.clone(),
            call_type: session.media_type,
            room_id: session.room_id.clone(),
            target_id: target,
        };
        self.session = Some(session);
        self.transition(CallState::Requesting);

        if let Err(e) = self.signaling.send(request).await {
            self.fail(ErrorKind::SignalingUnavailable, &e.to_string(), false).await;
            return Err(e.into());
        }
        self.start_timer(call_id, TimerKind::Request, self.config.request_timeout);
        tracing::info!(call_id = %call_id, "Call requested");
        Ok(call_id)
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState(session.state));
        }
        let call_id = session.session_id;
        let remote = session.remote.id.clone();
        let constraints = self.constraints_for(session.media_type);

        let tracks = match self.media.acquire(&constraints).await {
            Ok(tracks) => tracks,
            Err(e) => {
                let kind = e.kind();
                let decline = self.call_response(&remote, false, Some(kind.as_str().to_string()));
                if let Err(send_error) = self.signaling.send(decline).await {
                    tracing::debug!(error = %send_error, "Could not decline call");
                }
                self.report_error(Some(call_id), kind, &e.to_string());
                self.finish(CallState::Failed, EndReason::Failed(kind), false).await;
                return Err(e.into());
            }
        };

        self.transition(CallState::Connecting);
        if let Err(e) = self.signaling.send(self.call_response(&remote, true, None)).await {
            self.fail(ErrorKind::SignalingUnavailable, &e.to_string(), false).await;
            return Err(e.into());
        }

        if let Err(e) = self.open_peer(PeerRole::Callee, Some(tracks)).await {
            self.fail(e.kind(), &e.to_string(), true).await;
            return Err(e.into());
        }

        let (offer, candidates) = match self.session.as_mut() {
            Some(session) => (
                session.buffered_offer.take(),
                std::mem::take(&mut session.pending_remote_candidates),
            ),
            None => return Ok(()),
        };
        if let Some(peer) = self.peer.as_mut() {
            for candidate in candidates {
                peer.add_remote_candidate(candidate).await;
            }
        }
        if let Some(sdp) = offer {
            self.apply_offer(&sdp).await;
        }
        tracing::info!(call_id = %call_id, "Call accepted");
        Ok(())
    }

    async fn reject(&mut self, reason: String) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState(session.state));
        }
        let remote = session.remote.id.clone();
        let decline = self.call_response(&remote, false, Some(reason.clone()));
        let sent = self.signaling.send(decline).await;
        self.finish(CallState::Ended, EndReason::Rejected(reason), false).await;
        sent.map_err(CallError::from)
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        match self.state() {
            CallState::Ringing => self.reject("rejected".to_string()).await,
            CallState::Requesting | CallState::Connecting | CallState::Active => {
                self.finish(CallState::Ended, EndReason::LocalHangup, true).await;
                Ok(())
            }
            _ => Err(CallError::NoActiveCall),
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<DataMessage, CallError> {
        let call_id = self.call_id().ok_or(CallError::NoActiveCall)?;
        let peer = self.peer.as_ref().ok_or(CallError::InvalidState(self.state()))?;
        let message = peer.send_text(text).await?;
        self.notify_data_message(call_id, &message);
        Ok(message)
    }

    fn call_response(
        &self,
        caller: &ParticipantId,
        accepted: bool,
        reason: Option<String>,
    ) -> SignalingMessage {
        SignalingMessage::CallResponse {
            caller_id: caller.clone(),
            responder_id: self.identity.id.clone(),
            responder_name: self.identity.display_name.clone(),
            accepted,
            reason,
        }
    }

    async fn open_peer(
        &mut self,
        role: PeerRole,
        tracks: Option<Arc<MediaTrackSet>>,
    ) -> Result<(), PeerError> {
        let Some(session) = self.session.as_ref() else {
            return Err(PeerError::InvalidState("no session".to_string()));
        };
        let call_id = session.session_id;
        let (peer, mut events) =
            PeerSession::create(&self.peer_ctx, call_id, role, session.remote.id.clone(), tracks).await?;
        let commands = self.commands.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(sender) = commands.upgrade() else {
                    break;
                };
                if sender.send(Command::Peer { call_id, event }).is_err() {
                    break;
                }
            }
        }));
        self.peer = Some(peer);
        Ok(())
    }

    async fn apply_offer(&mut self, sdp: &str) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        let result = peer.handle_offer(sdp).await;
        self.sync_descriptions();
        if let Err(e) = result {
            self.fail(e.kind(), &e.to_string(), true).await;
        }
    }

    fn sync_descriptions(&mut self) {
        if let (Some(session), Some(peer)) = (self.session.as_mut(), self.peer.as_ref()) {
            session.local_description = peer.local_description().map(str::to_string);
            session.remote_description = peer.remote_description().map(str::to_string);
            session.data_channel_open = peer.is_data_channel_open();
            session.pending_remote_candidates = peer.queued_candidates().iter().cloned().collect();
        }
    }

    #[tracing::instrument(skip(self, signal), fields(sender = %signal.sender_id, message_type = signal.message.kind().as_str()))]
    async fn on_signal(&mut self, signal: InboundSignal) {
        let InboundSignal { sender_id, message } = signal;

        if let SignalingMessage::CallRequest {
            caller_id,
            caller_name,
            call_type,
            room_id,
            ..
        } = message
        {
            // The relay stamps the sender; the caller id in the payload must match it
            if caller_id != sender_id {
                tracing::warn!(caller = %caller_id, "Dropping call request whose caller id is not its sender");
                return;
            }
            self.on_call_request(caller_id, caller_name, call_type, room_id).await;
            return;
        }

        let from_remote = self
            .session
            .as_ref()
            .is_some_and(|s| s.remote.id == sender_id);
        if !from_remote {
            tracing::debug!("Ignoring event outside the current call");
            return;
        }

        match (self.state(), message) {
            (
                CallState::Requesting,
                SignalingMessage::CallResponse {
                    accepted,
                    reason,
                    responder_name,
                    ..
                },
            ) => self.on_call_response(accepted, reason, responder_name).await,
            (CallState::Ringing, SignalingMessage::SessionOffer { sdp, .. }) => {
                if let Some(session) = self.session.as_mut() {
                    session.buffered_offer = Some(sdp);
                }
            }
            (CallState::Ringing, SignalingMessage::IceCandidate { candidate, .. }) => {
                if let Some(session) = self.session.as_mut() {
                    session.pending_remote_candidates.push_back(candidate);
                }
            }
            (CallState::Connecting, SignalingMessage::SessionOffer { sdp, .. }) => {
                self.apply_offer(&sdp).await;
            }
            (CallState::Connecting, SignalingMessage::SessionAnswer { sdp, .. }) => {
                let Some(peer) = self.peer.as_mut() else {
                    return;
                };
                let result = peer.handle_answer(&sdp).await;
                self.sync_descriptions();
                if let Err(e) = result {
                    self.fail(e.kind(), &e.to_string(), true).await;
                }
            }
            (
                CallState::Connecting | CallState::Active,
                SignalingMessage::IceCandidate { candidate, .. },
            ) => {
                if let Some(peer) = self.peer.as_mut() {
                    peer.add_remote_candidate(candidate).await;
                }
                self.sync_descriptions();
            }
            (
                CallState::Requesting | CallState::Ringing | CallState::Connecting | CallState::Active,
                SignalingMessage::EndCall { .. },
            ) => {
                tracing::info!("Remote hung up");
                self.finish(CallState::Ended, EndReason::RemoteHangup, false).await;
            }
            (state, message) => {
                tracing::debug!(state = ?state, message_type = message.kind().as_str(), "Ignoring out-of-order event");
            }
        }
    }

    async fn on_call_request(
        &mut self,
        caller_id: ParticipantId,
        caller_name: String,
        call_type: MediaType,
        room_id: String,
    ) {
        if self.session.is_some() {
            tracing::info!(caller = %caller_id, state = ?self.state(), "Declining call while busy");
            let busy = self.call_response(&caller_id, false, Some("busy".to_string()));
            if let Err(e) = self.signaling.send(busy).await {
                tracing::debug!(error = %e, "Could not decline call");
            }
            return;
        }

        let caller = ParticipantIdentity::new(caller_id, caller_name);
        let session = CallSession::incoming(self.identity.clone(), caller.clone(), call_type, room_id.clone());
        let call_id = session.session_id;
        self.session = Some(session);
        self.transition(CallState::Ringing);
        self.start_timer(call_id, TimerKind::Ring, self.config.ring_timeout);

        let incoming = IncomingCall {
            call_id,
            caller,
            media_type: call_type,
            room_id,
        };
        tracing::info!(call_id = %call_id, caller = %incoming.caller, "Incoming call");
        for observer in &self.observer_list() {
            observer.on_incoming_call(&incoming);
        }
        let _ = self.event_sender.send(CallEvent::IncomingCall(incoming));
    }

    async fn on_call_response(&mut self, accepted: bool, reason: Option<String>, responder_name: String) {
        let Some(call_id) = self.call_id() else {
            return;
        };
        if !accepted {
            let reason = reason.unwrap_or_else(|| "rejected".to_string());
            tracing::info!(call_id = %call_id, reason = %reason, "Call rejected");
            self.report_error(Some(call_id), ErrorKind::RemoteRejected, &reason);
            self.finish(CallState::Ended, EndReason::Rejected(reason), false).await;
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.remote.display_name = responder_name;
        }
        self.transition(CallState::Connecting);
        let tracks = self.media.current();
        if let Err(e) = self.open_peer(PeerRole::Caller, tracks).await {
            self.fail(e.kind(), &e.to_string(), true).await;
            return;
        }
        let result = match self.peer.as_mut() {
            Some(peer) => peer.start_offer().await,
            None => return,
        };
        self.sync_descriptions();
        if let Err(e) = result {
            self.fail(e.kind(), &e.to_string(), true).await;
        }
    }

    async fn on_signaling_lost(&mut self, error: SignalingError) {
        let call_id = self.call_id();
        match self.state() {
            CallState::Active => {
                self.report_error(call_id, ErrorKind::TransportLost, &error.to_string());
                self.finish(CallState::Ended, EndReason::TransportLost, false).await;
            }
            CallState::Requesting | CallState::Ringing | CallState::Connecting => {
                self.fail(ErrorKind::SignalingUnavailable, &error.to_string(), false).await;
            }
            _ => self.report_error(call_id, ErrorKind::SignalingUnavailable, &error.to_string()),
        }
    }

    async fn on_peer_event(&mut self, call_id: CallId, event: PeerEvent) {
        if self.call_id() != Some(call_id) {
            tracing::trace!(call_id = %call_id, "Dropping event from a stale peer session");
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        let Some(event) = peer.handle_event(event).await else {
            return;
        };
        match event {
            SessionEvent::ConnectionState(state) => self.on_connection_state(call_id, state).await,
            SessionEvent::RemoteTrack(track) => {
                for observer in &self.observer_list() {
                    observer.on_remote_track(call_id, &track);
                }
                let _ = self.event_sender.send(CallEvent::RemoteTrack { call_id, track });
            }
            SessionEvent::DataChannelOpen | SessionEvent::DataChannelClosed => self.sync_descriptions(),
            SessionEvent::DataMessage(message) => self.notify_data_message(call_id, &message),
        }
    }

    async fn on_connection_state(&mut self, call_id: CallId, state: PeerConnectionState) {
        match (self.state(), state) {
            (CallState::Connecting, PeerConnectionState::Connected) => {
                self.sync_descriptions();
                self.transition(CallState::Active);
                tracing::info!(call_id = %call_id, "Call active");
            }
            (CallState::Active, PeerConnectionState::Connected) => {
                if self.cancel_timer() {
                    tracing::info!(call_id = %call_id, "Peer connection recovered");
                }
            }
            (CallState::Active, PeerConnectionState::Disconnected) => {
                tracing::warn!(
                    call_id = %call_id,
                    grace_ms = self.config.disconnect_grace.as_millis() as u64,
                    "Peer connection interrupted"
                );
                self.start_timer(call_id, TimerKind::DisconnectGrace, self.config.disconnect_grace);
            }
            (CallState::Active, PeerConnectionState::Failed | PeerConnectionState::Closed) => {
                self.report_error(Some(call_id), ErrorKind::TransportLost, "peer connection lost");
                self.finish(CallState::Ended, EndReason::TransportLost, true).await;
            }
            (CallState::Connecting, PeerConnectionState::Failed | PeerConnectionState::Closed) => {
                self.fail(ErrorKind::NegotiationFailed, "ICE connectivity failed", true).await;
            }
            _ => {}
        }
    }

    async fn on_timer(&mut self, call_id: CallId, kind: TimerKind) {
        if self.call_id() != Some(call_id) || self.state() != kind.state() {
            return;
        }
        self.timer = None;
        match kind {
            TimerKind::Request => {
                tracing::info!(call_id = %call_id, "Call request timed out");
                self.report_error(Some(call_id), ErrorKind::RemoteTimeout, "no response from remote");
                self.finish(CallState::Ended, EndReason::Timeout, true).await;
            }
            TimerKind::Ring => {
                tracing::info!(call_id = %call_id, "Incoming call timed out");
                let remote = self.session.as_ref().map(|s| s.remote.id.clone());
                if let Some(remote) = remote {
                    let decline = self.call_response(&remote, false, Some("timeout".to_string()));
                    if let Err(e) = self.signaling.send(decline).await {
                        tracing::debug!(error = %e, "Could not decline call");
                    }
                }
                self.finish(CallState::Ended, EndReason::Timeout, false).await;
            }
            TimerKind::Negotiation => {
                self.fail(ErrorKind::NegotiationFailed, "peer connection was not established in time", true)
                    .await;
            }
            TimerKind::DisconnectGrace => {
                self.report_error(Some(call_id), ErrorKind::TransportLost, "peer connection did not recover");
                self.finish(CallState::Ended, EndReason::TransportLost, true).await;
            }
        }
    }

    /// Move the session to `to`, cancelling the timer of the state it leaves
    fn transition(&mut self, to: CallState) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.transition(to).is_none() {
            return false;
        }
        let call_id = session.session_id;
        let reason = session.end_reason.clone();
        self.cancel_timer();
        if to == CallState::Connecting {
            self.start_timer(call_id, TimerKind::Negotiation, self.config.negotiation_timeout);
        }
        self.state.send_replace(to);
        for observer in &self.observer_list() {
            observer.on_state_change(call_id, to, reason.as_ref());
        }
        let _ = self.event_sender.send(CallEvent::StateChanged {
            call_id,
            state: to,
            reason,
        });
        true
    }

    /// Abort the session because of `kind`
    async fn fail(&mut self, kind: ErrorKind, detail: &str, notify_remote: bool) {
        let call_id = self.call_id();
        tracing::warn!(call_id = ?call_id, kind = %kind, detail, "Call failed");
        self.report_error(call_id, kind, detail);
        let terminal = if self.state().can_transition_to(CallState::Failed) {
            CallState::Failed
        } else {
            CallState::Ended
        };
        self.finish(terminal, EndReason::Failed(kind), notify_remote).await;
    }

    /// Record `reason`, enter `terminal`, tear down and reset to `Idle`
    async fn finish(&mut self, terminal: CallState, reason: EndReason, notify_remote: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let remote = session.remote.id.clone();
        session.end_reason = Some(reason);
        self.transition(terminal);

        self.cancel_timer();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        match self.peer.take() {
            Some(mut peer) => peer.end(notify_remote).await,
            None if notify_remote => {
                let end = SignalingMessage::EndCall { target_id: remote };
                if let Err(e) = self.signaling.send(end).await {
                    tracing::debug!(error = %e, "Could not notify remote of hangup");
                }
            }
            None => {}
        }
        self.media.release_current();

        self.transition(CallState::Idle);
        if let Some(session) = self.session.take() {
            tracing::info!(
                call_id = %session.session_id,
                reason = ?session.end_reason,
                duration_secs = session.duration().map(|d| d.num_seconds()),
                "Call torn down"
            );
        }
    }

    fn start_timer(&mut self, call_id: CallId, kind: TimerKind, after: Duration) {
        self.cancel_timer();
        let commands = self.commands.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Timer { call_id, kind });
            }
        }));
    }

    fn cancel_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the observers; callbacks run without the lock so they may add observers
    fn observer_list(&self) -> Vec<Arc<dyn CallObserver>> {
        self.observers.read().clone()
    }

    fn report_error(&self, call_id: Option<CallId>, kind: ErrorKind, detail: &str) {
        for observer in &self.observer_list() {
            observer.on_error(kind, detail);
        }
        let _ = self.event_sender.send(CallEvent::Error {
            call_id,
            kind,
            detail: detail.to_string(),
        });
    }

    fn notify_data_message(&self, call_id: CallId, message: &DataMessage) {
        for observer in &self.observer_list() {
            observer.on_data_message(call_id, message);
        }
        let _ = self.event_sender.send(CallEvent::DataMessage {
            call_id,
            message: message.clone(),
        });
    }
}
