//! Call engine orchestration

use crate::call::{CallController, CallError, CallEvent, CallObserver};
use crate::error::ErrorKind;
use crate::identity::{ParticipantId, ParticipantIdentity};
use crate::media::{AcquisitionPolicy, MediaAcquisitionManager, MediaDevices, StaticSampleDevices};
use crate::peer::{NegotiationStats, PeerBackend, RtcBackend};
use crate::signaling::{SignalingClient, SignalingError, SignalingTransport};
use crate::types::{CallId, CallSession, CallState, DataMessage, IceServer, MediaConstraints, MediaType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Serde helper storing a [`Duration`] as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    ///
    /// # Errors
    ///
    /// Propagates serializer errors
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from milliseconds
    ///
    /// # Errors
    ///
    /// Propagates deserializer errors
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

impl EngineError {
    /// Taxonomy kind, for errors that map onto one
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Signaling(e) => Some(e.kind()),
            Self::Call(e) => e.kind(),
            Self::InitError(_) | Self::ConfigError(_) => None,
        }
    }
}

/// Call configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// How long an incoming call rings before it is declined
    #[serde(with = "duration_ms")]
    pub ring_timeout: Duration,
    /// How long an outgoing request waits for a response
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// How long an interrupted peer connection may take to recover
    #[serde(with = "duration_ms")]
    pub disconnect_grace: Duration,
    /// How long offer/answer may take before the peer connection comes up
    #[serde(with = "duration_ms")]
    pub negotiation_timeout: Duration,
    /// Media requested for video calls and the default call type
    pub constraints: MediaConstraints,
    /// Acquisition retry and fallback rules
    pub acquisition: AcquisitionPolicy,
    /// Label of the text data channel
    pub data_channel_label: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            ring_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(30),
            constraints: MediaConstraints::video_call(),
            acquisition: AcquisitionPolicy::default(),
            data_channel_label: "chat".to_string(),
        }
    }
}

impl CallConfig {
    /// Load a JSON configuration file; missing fields keep their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigError(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| EngineError::ConfigError(format!("{}: {e}", path.display())))
    }
}

/// Main call engine
///
/// Owns the signaling channel, the acquisition manager and the call
/// controller for one local identity.
pub struct CallEngine<T: SignalingTransport> {
    signaling: Arc<SignalingClient<T>>,
    media: Arc<MediaAcquisitionManager>,
    controller: CallController,
    config: Arc<CallConfig>,
}

impl<T: SignalingTransport> CallEngine<T> {
    /// Create a builder
    #[must_use]
    pub fn builder(identity: ParticipantIdentity, transport: Arc<T>) -> CallEngineBuilder<T> {
        CallEngineBuilder::new(identity, transport)
    }

    /// Call `target` with the configured default call type
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    pub async fn call(&self, target: impl Into<ParticipantId>) -> Result<CallId, EngineError> {
        let media_type = self.config.constraints.media_type();
        self.call_with(target, media_type).await
    }

    /// Call `target` with an explicit call type
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    #[tracing::instrument(skip(self, target), fields(participant = %self.identity().id))]
    pub async fn call_with(
        &self,
        target: impl Into<ParticipantId>,
        media_type: MediaType,
    ) -> Result<CallId, EngineError> {
        Ok(self.controller.start_call(target, media_type).await?)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or media cannot be acquired
    pub async fn accept(&self) -> Result<(), EngineError> {
        Ok(self.controller.accept().await?)
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    pub async fn reject(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        Ok(self.controller.reject(reason).await?)
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if there is no call
    pub async fn end_call(&self) -> Result<(), EngineError> {
        Ok(self.controller.end_call().await?)
    }

    /// Send a text message to the remote participant
    ///
    /// # Errors
    ///
    /// Returns error if the data channel is not open
    pub async fn send_text(&self, text: impl Into<String>) -> Result<DataMessage, EngineError> {
        Ok(self.controller.send_text(text).await?)
    }

    /// Flip the camera
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn toggle_video(&self) -> Result<Option<bool>, EngineError> {
        Ok(self.controller.toggle_video().await?)
    }

    /// Flip the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn toggle_audio(&self) -> Result<Option<bool>, EngineError> {
        Ok(self.controller.toggle_audio().await?)
    }

    /// Current call state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.controller.state()
    }

    /// Snapshot of the current session
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn session(&self) -> Result<Option<CallSession>, EngineError> {
        Ok(self.controller.session().await?)
    }

    /// Candidate counters of the current call
    ///
    /// # Errors
    ///
    /// Returns error if the controller stopped
    pub async fn stats(&self) -> Result<Option<NegotiationStats>, EngineError> {
        Ok(self.controller.stats().await?)
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.controller.subscribe_events()
    }

    /// Register a UI observer
    pub fn add_observer(&self, observer: Arc<dyn CallObserver>) {
        self.controller.add_observer(observer);
    }

    /// Local identity
    #[must_use]
    pub fn identity(&self) -> &ParticipantIdentity {
        self.signaling.identity()
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Controller handle
    #[must_use]
    pub fn controller(&self) -> &CallController {
        &self.controller
    }

    /// Acquisition manager
    #[must_use]
    pub fn media(&self) -> &Arc<MediaAcquisitionManager> {
        &self.media
    }

    /// Signaling channel
    #[must_use]
    pub fn signaling(&self) -> &Arc<SignalingClient<T>> {
        &self.signaling
    }

    /// End any call, stop the controller and close the signaling channel
    #[tracing::instrument(skip(self), fields(participant = %self.identity().id))]
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        self.signaling.disconnect().await;
        tracing::info!("Call engine stopped");
    }
}

/// Call engine builder
pub struct CallEngineBuilder<T: SignalingTransport> {
    identity: ParticipantIdentity,
    transport: Arc<T>,
    config: CallConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    backend: Option<Arc<dyn PeerBackend>>,
}

impl<T: SignalingTransport> CallEngineBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(identity: ParticipantIdentity, transport: Arc<T>) -> Self {
        Self {
            identity,
            transport,
            config: CallConfig::default(),
            devices: None,
            backend: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different capture backend (default: [`StaticSampleDevices`])
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Use a different peer connection backend (default: [`RtcBackend`])
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn PeerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Connect the signaling channel and start the controller
    ///
    /// # Errors
    ///
    /// Returns error if the identity is invalid or the channel cannot connect
    #[tracing::instrument(skip(self), fields(participant = %self.identity.id))]
    pub async fn build(self) -> Result<CallEngine<T>, EngineError> {
        if self.identity.id.is_empty() {
            return Err(EngineError::InitError("participant id must not be empty".to_string()));
        }
        let signaling = Arc::new(SignalingClient::connect(self.identity, self.transport).await?);
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(StaticSampleDevices::new()));
        let media = Arc::new(MediaAcquisitionManager::new(
            devices,
            self.config.acquisition.clone(),
        ));
        let backend = self.backend.unwrap_or_else(|| Arc::new(RtcBackend::new()));
        let config = Arc::new(self.config);
        let controller = CallController::spawn(signaling.clone(), media.clone(), backend, config.clone());

        tracing::info!("Call engine started");
        Ok(CallEngine {
            signaling,
            media,
            controller,
            config,
        })
    }
}
