//! Local media acquisition
//!
//! [`MediaAcquisitionManager`] opens camera and microphone tracks through a
//! [`MediaDevices`] implementation and applies an [`AcquisitionPolicy`]:
//! idempotent reuse of a live track set, audio-only fallback when no camera
//! exists, and a single delayed retry when a device is busy.
//!
//! Release authority stays here. Peer sessions attach tracks but never stop
//! them, so every track is stopped exactly once.

use crate::error::ErrorKind;
use crate::types::{MediaConstraints, MediaType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Access denied by the user or platform
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No device satisfies the constraints
    #[error("Constraints cannot be satisfied: {0}")]
    Overconstrained(String),

    /// Device held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Blocked by a security policy
    #[error("Security restriction: {0}")]
    SecurityRestricted(String),

    /// Writing to a track failed
    #[error("Stream error: {0}")]
    StreamError(String),
}

impl MediaError {
    /// Taxonomy kind reported to the UI
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DeviceNotFound(_) | Self::Overconstrained(_) => ErrorKind::DeviceNotFound,
            Self::DeviceBusy(_) | Self::StreamError(_) => ErrorKind::DeviceBusy,
            Self::SecurityRestricted(_) => ErrorKind::SecurityRestricted,
        }
    }
}

/// Media events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MediaEvent {
    /// A new track set was opened
    TracksAcquired {
        /// Ids of the opened tracks
        track_ids: Vec<String>,
        /// Whether video was dropped for lack of a camera
        fallback_applied: bool,
    },
    /// An acquisition attempt failed and will be retried
    AcquisitionRetry {
        /// Failure that triggered the retry
        kind: ErrorKind,
        /// Attempt number about to run
        attempt: u32,
    },
    /// Tracks were stopped
    TracksReleased {
        /// Number of tracks that were live
        stopped: usize,
    },
    /// A track was enabled or disabled
    TrackToggled {
        /// Track identifier
        track_id: String,
        /// New enabled flag
        enabled: bool,
    },
}

/// One local capture track
///
/// `enabled` mutes the track without renegotiation; `live` is cleared once
/// the track is stopped and never comes back.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaType,
    enabled: AtomicBool,
    live: AtomicBool,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalTrack {
    /// Track without a webrtc sample sink
    pub fn new(id: impl Into<String>, kind: MediaType) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtc: None,
        }
    }

    /// Track backed by a webrtc sample track
    pub fn with_sample_track(kind: MediaType, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            rtc: Some(track.clone()),
            ..Self::new(track.id().to_string(), kind)
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> MediaType {
        self.kind
    }

    /// Whether samples are currently forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the underlying device handle is still open
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Set the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track, returning whether it was live
    pub fn stop(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::SeqCst);
        if was_live {
            tracing::debug!(track_id = %self.id, kind = %self.kind, "Track stopped");
        }
        was_live
    }

    /// webrtc track to attach to a peer connection
    pub fn rtc_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.rtc.as_ref()
    }

    /// Write one media sample; disabled or stopped tracks drop it
    ///
    /// # Returns
    ///
    /// `true` if the sample was forwarded
    ///
    /// # Errors
    ///
    /// Returns error if the webrtc track rejects the sample
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        let Some(track) = &self.rtc else {
            return Ok(false);
        };
        track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::StreamError(e.to_string()))?;
        Ok(true)
    }
}

/// Tracks obtained by one acquisition
#[derive(Debug)]
pub struct MediaTrackSet {
    /// Camera track, absent for audio-only calls and after fallback
    pub video: Option<Arc<LocalTrack>>,
    /// Microphone track
    pub audio: Option<Arc<LocalTrack>>,
    /// Whether video was dropped because no camera was available
    pub fallback_applied: bool,
}

impl MediaTrackSet {
    /// All tracks, video first
    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.video.iter().chain(self.audio.iter())
    }

    /// Whether at least one track is still live
    pub fn is_live(&self) -> bool {
        self.tracks().any(|t| t.is_live())
    }

    /// Call type the set can carry
    pub fn media_type(&self) -> MediaType {
        if self.video.is_some() {
            MediaType::Video
        } else {
            MediaType::Audio
        }
    }

    /// Stop every track, returning how many were live
    pub fn stop_all(&self) -> usize {
        self.tracks().filter(|t| t.stop()).count()
    }
}

/// Access state of one capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceAccess {
    /// Access allowed
    Granted,
    /// Access refused
    Denied,
    /// The user will be asked on first use
    Prompt,
    /// No such device attached
    Missing,
    /// The platform cannot tell
    Unknown,
}

impl std::fmt::Display for DeviceAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Prompt => "prompt",
            Self::Missing => "missing",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Capture support and per-device access, checked without opening tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Whether the platform can capture at all
    pub supported: bool,
    /// Camera access
    pub camera: DeviceAccess,
    /// Microphone access
    pub microphone: DeviceAccess,
}

impl DeviceStatus {
    /// Capture supported, access unknown
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            supported: true,
            camera: DeviceAccess::Unknown,
            microphone: DeviceAccess::Unknown,
        }
    }
}

/// Outcome of a trial acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTrial {
    /// Call type the opened tracks could carry
    pub media_type: MediaType,
    /// Whether video was dropped for lack of a camera
    pub fallback_applied: bool,
    /// Tracks that were opened and released again
    pub tracks: usize,
}

/// Platform capture API
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open one track per requested kind
    ///
    /// # Errors
    ///
    /// Returns the platform failure mapped onto [`MediaError`]
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, MediaError>;

    /// Capture support and access state; platforms without a permission
    /// query report [`DeviceStatus::unknown`]
    async fn device_status(&self) -> DeviceStatus {
        DeviceStatus::unknown()
    }

    /// Backend name for logging
    fn backend_type(&self) -> &'static str;
}

/// Devices producing webrtc `TrackLocalStaticSample` tracks
///
/// Opus 48 kHz stereo audio and VP8 90 kHz video. Presence of camera and
/// microphone can be switched off to model machines without them.
#[derive(Debug)]
pub struct StaticSampleDevices {
    camera: bool,
    microphone: bool,
    opened: AtomicUsize,
}

impl StaticSampleDevices {
    /// Camera and microphone present
    #[must_use]
    pub fn new() -> Self {
        Self {
            camera: true,
            microphone: true,
            opened: AtomicUsize::new(0),
        }
    }

    /// No camera attached
    #[must_use]
    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    /// No microphone attached
    #[must_use]
    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn audio_track(track_id: String) -> LocalTrack {
        let codec = RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        tracing::debug!(codec = %codec.mime_type, clock_rate = codec.clock_rate, "Audio codec configured");
        let track = TrackLocalStaticSample::new(codec, track_id, "callwire-audio".to_string());
        LocalTrack::with_sample_track(MediaType::Audio, Arc::new(track))
    }

    fn video_track(track_id: String) -> LocalTrack {
        let codec = RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        tracing::debug!(codec = %codec.mime_type, clock_rate = codec.clock_rate, "Video codec configured");
        let track = TrackLocalStaticSample::new(codec, track_id, "callwire-video".to_string());
        LocalTrack::with_sample_track(MediaType::Video, Arc::new(track))
    }
}

impl Default for StaticSampleDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for StaticSampleDevices {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, MediaError> {
        if constraints.video && !self.camera {
            return Err(MediaError::DeviceNotFound("no camera attached".to_string()));
        }
        if constraints.audio && !self.microphone {
            return Err(MediaError::DeviceNotFound("no microphone attached".to_string()));
        }
        let generation = self.opened.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::with_capacity(2);
        if constraints.video {
            tracks.push(Self::video_track(format!("video-{generation}")));
        }
        if constraints.audio {
            tracks.push(Self::audio_track(format!("audio-{generation}")));
        }
        Ok(tracks)
    }

    async fn device_status(&self) -> DeviceStatus {
        let access = |present: bool| {
            if present {
                DeviceAccess::Granted
            } else {
                DeviceAccess::Missing
            }
        };
        DeviceStatus {
            supported: true,
            camera: access(self.camera),
            microphone: access(self.microphone),
        }
    }

    fn backend_type(&self) -> &'static str {
        "static-sample"
    }
}

/// What to do after a failed acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Propagate the error
    Fail,
    /// Retry once with audio only
    FallbackAudioOnly,
    /// Retry the same constraints after a delay
    RetryAfter(Duration),
}

/// Retry and fallback policy for acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionPolicy {
    /// Drop video when no camera exists
    pub audio_fallback: bool,
    /// Retries allowed after a busy device
    pub busy_retries: u32,
    /// Delay before a busy retry
    #[serde(with = "crate::service::duration_ms")]
    pub busy_backoff: Duration,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            audio_fallback: true,
            busy_retries: 1,
            busy_backoff: Duration::from_millis(200),
        }
    }
}

impl AcquisitionPolicy {
    /// Decide how to react to `error` for the request `constraints`
    ///
    /// `busy_attempts` counts busy retries already performed.
    #[must_use]
    pub fn decide(
        &self,
        error: &MediaError,
        constraints: &MediaConstraints,
        busy_attempts: u32,
    ) -> RetryDecision {
        match error {
            MediaError::DeviceNotFound(_) | MediaError::Overconstrained(_)
                if self.audio_fallback && constraints.video =>
            {
                RetryDecision::FallbackAudioOnly
            }
            MediaError::DeviceBusy(_) if busy_attempts < self.busy_retries => {
                RetryDecision::RetryAfter(self.busy_backoff)
            }
            _ => RetryDecision::Fail,
        }
    }
}

/// Acquires and releases local media
pub struct MediaAcquisitionManager {
    devices: Arc<dyn MediaDevices>,
    policy: AcquisitionPolicy,
    current: Mutex<Option<Arc<MediaTrackSet>>>,
    acquiring: tokio::sync::Mutex<()>,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaAcquisitionManager {
    /// Create a manager over `devices`
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, policy: AcquisitionPolicy) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices,
            policy,
            current: Mutex::new(None),
            acquiring: tokio::sync::Mutex::new(()),
            event_sender,
        }
    }

    /// Acquisition policy in use
    #[must_use]
    pub fn policy(&self) -> &AcquisitionPolicy {
        &self.policy
    }

    /// Acquire tracks for `constraints`
    ///
    /// Returns the current set unchanged while any of its tracks is live.
    ///
    /// # Errors
    ///
    /// Returns the device error once the policy gives up
    #[tracing::instrument(skip(self), fields(backend = self.devices.backend_type()))]
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaTrackSet>, MediaError> {
        let _guard = self.acquiring.lock().await;

        if let Some(set) = self.current() {
            if set.is_live() {
                tracing::debug!("Reusing live track set");
                return Ok(set);
            }
        }
        if constraints.is_empty() {
            return Err(MediaError::Overconstrained(
                "neither audio nor video requested".to_string(),
            ));
        }

        let mut request = constraints.clone();
        let mut fallback_applied = false;
        let mut busy_attempts = 0;
        loop {
            let error = match self.devices.open(&request).await {
                Ok(tracks) => return Ok(self.install(tracks, fallback_applied)),
                Err(e) => e,
            };
            match self.policy.decide(&error, &request, busy_attempts) {
                RetryDecision::Fail => {
                    tracing::warn!(error = %error, "Media acquisition failed");
                    return Err(error);
                }
                RetryDecision::FallbackAudioOnly => {
                    tracing::info!(error = %error, "No camera, falling back to audio only");
                    request = MediaConstraints::audio_only();
                    fallback_applied = true;
                }
                RetryDecision::RetryAfter(backoff) => {
                    busy_attempts += 1;
                    let stale = self.clear_current();
                    tracing::info!(
                        error = %error,
                        stale_tracks = stale,
                        backoff_ms = backoff.as_millis() as u64,
                        "Device busy, retrying"
                    );
                    let _ = self.event_sender.send(MediaEvent::AcquisitionRetry {
                        kind: error.kind(),
                        attempt: busy_attempts + 1,
                    });
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn install(&self, tracks: Vec<LocalTrack>, fallback_applied: bool) -> Arc<MediaTrackSet> {
        let mut video = None;
        let mut audio = None;
        for track in tracks {
            match track.kind() {
                MediaType::Video => video = Some(Arc::new(track)),
                MediaType::Audio => audio = Some(Arc::new(track)),
            }
        }
        let set = Arc::new(MediaTrackSet {
            video,
            audio,
            fallback_applied,
        });
        let track_ids: Vec<String> = set.tracks().map(|t| t.id().to_string()).collect();
        tracing::info!(tracks = ?track_ids, fallback_applied, "Media acquired");
        *self.current.lock() = Some(set.clone());
        let _ = self.event_sender.send(MediaEvent::TracksAcquired {
            track_ids,
            fallback_applied,
        });
        set
    }

    fn clear_current(&self) -> usize {
        self.current
            .lock()
            .take()
            .map_or(0, |set| set.stop_all())
    }

    /// Stop every track of `set`
    ///
    /// Releasing an already released set is a no-op.
    ///
    /// # Returns
    ///
    /// Number of tracks that were still live
    pub fn release(&self, set: &Arc<MediaTrackSet>) -> usize {
        {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, set)) {
                *current = None;
            }
        }
        let stopped = set.stop_all();
        if stopped > 0 {
            tracing::info!(stopped, "Media released");
            let _ = self.event_sender.send(MediaEvent::TracksReleased { stopped });
        }
        stopped
    }

    /// Capture support and access state of the devices
    pub async fn device_status(&self) -> DeviceStatus {
        self.devices.device_status().await
    }

    /// Open tracks for `constraints` under the acquisition policy, then release them
    ///
    /// # Errors
    ///
    /// Returns `DeviceBusy` while a call holds live tracks, otherwise the
    /// acquisition failure
    #[tracing::instrument(skip(self), fields(backend = self.devices.backend_type()))]
    pub async fn test_devices(&self, constraints: &MediaConstraints) -> Result<DeviceTrial, MediaError> {
        if self.current().is_some_and(|set| set.is_live()) {
            return Err(MediaError::DeviceBusy("tracks are held by a call".to_string()));
        }
        let set = self.acquire(constraints).await?;
        let trial = DeviceTrial {
            media_type: set.media_type(),
            fallback_applied: set.fallback_applied,
            tracks: set.tracks().count(),
        };
        self.release(&set);
        tracing::info!(media_type = %trial.media_type, tracks = trial.tracks, "Device test passed");
        Ok(trial)
    }

    /// Release the current set, if any
    pub fn release_current(&self) -> usize {
        match self.current() {
            Some(set) => self.release(&set),
            None => 0,
        }
    }

    /// Currently held track set
    #[must_use]
    pub fn current(&self) -> Option<Arc<MediaTrackSet>> {
        self.current.lock().clone()
    }

    /// Flip the camera track's enabled flag
    ///
    /// # Returns
    ///
    /// The new flag, or `None` without a camera track
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(|set| set.video.clone())
    }

    /// Flip the microphone track's enabled flag
    ///
    /// # Returns
    ///
    /// The new flag, or `None` without a microphone track
    pub fn toggle_audio(&self) -> Option<bool> {
        self.toggle(|set| set.audio.clone())
    }

    fn toggle(&self, pick: impl FnOnce(&MediaTrackSet) -> Option<Arc<LocalTrack>>) -> Option<bool> {
        let track = self.current().as_deref().and_then(pick)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(track_id = %track.id(), enabled, "Track toggled");
        let _ = self.event_sender.send(MediaEvent::TrackToggled {
            track_id: track.id().to_string(),
            enabled,
        });
        Some(enabled)
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Devices replaying a fixed list of outcomes
    struct ScriptedDevices {
        script: Mutex<VecDeque<Result<(), MediaError>>>,
        requests: Mutex<Vec<MediaConstraints>>,
    }

    impl ScriptedDevices {
        fn new(script: Vec<Result<(), MediaError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<MediaConstraints> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl MediaDevices for ScriptedDevices {
        async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, MediaError> {
            self.requests.lock().push(constraints.clone());
            self.script.lock().pop_front().unwrap_or(Ok(()))?;
            let mut tracks = Vec::new();
            if constraints.video {
                tracks.push(LocalTrack::new("cam", MediaType::Video));
            }
            if constraints.audio {
                tracks.push(LocalTrack::new("mic", MediaType::Audio));
            }
            Ok(tracks)
        }

        fn backend_type(&self) -> &'static str {
            "scripted"
        }
    }

    fn manager(devices: Arc<dyn MediaDevices>) -> MediaAcquisitionManager {
        MediaAcquisitionManager::new(devices, AcquisitionPolicy::default())
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent_while_live() {
        let devices = Arc::new(StaticSampleDevices::new());
        let manager = manager(devices.clone());
        let constraints = MediaConstraints::video_call();

        let first = manager.acquire(&constraints).await.unwrap();
        let second = manager.acquire(&constraints).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(devices.open_count(), 1);
        assert!(first.video.as_ref().unwrap().rtc_track().is_some());
    }

    #[tokio::test]
    async fn test_release_then_acquire_opens_new_set() {
        let devices = Arc::new(StaticSampleDevices::new());
        let manager = manager(devices.clone());

        let first = manager.acquire(&MediaConstraints::audio_only()).await.unwrap();
        assert_eq!(manager.release(&first), 1);
        assert_eq!(manager.release(&first), 0);
        assert!(manager.current().is_none());

        let second = manager.acquire(&MediaConstraints::audio_only()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(devices.open_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_to_audio_without_camera() {
        let manager = manager(Arc::new(StaticSampleDevices::new().without_camera()));
        let set = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert!(set.video.is_none());
        assert!(set.audio.is_some());
        assert!(set.fallback_applied);
        assert_eq!(set.media_type(), MediaType::Audio);
    }

    #[tokio::test]
    async fn test_missing_microphone_is_not_retried_forever() {
        let manager = manager(Arc::new(
            StaticSampleDevices::new().without_camera().without_microphone(),
        ));
        let err = manager.acquire(&MediaConstraints::video_call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_overconstrained_video_falls_back() {
        let devices = ScriptedDevices::new(vec![Err(MediaError::Overconstrained("720p".into()))]);
        let manager = manager(devices.clone());
        let set = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert!(set.fallback_applied);
        assert_eq!(devices.requests()[1], MediaConstraints::audio_only());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_device_retried_once() {
        let devices = ScriptedDevices::new(vec![Err(MediaError::DeviceBusy("camera".into()))]);
        let manager = manager(devices.clone());
        let mut events = manager.subscribe_events();

        let started = tokio::time::Instant::now();
        let set = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!set.fallback_applied);
        assert_eq!(devices.requests().len(), 2);
        assert!(matches!(
            events.recv().await.unwrap(),
            MediaEvent::AcquisitionRetry { kind: ErrorKind::DeviceBusy, attempt: 2 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_busy_propagates_without_third_attempt() {
        let devices = ScriptedDevices::new(vec![
            Err(MediaError::DeviceBusy("camera".into())),
            Err(MediaError::DeviceBusy("camera".into())),
            Ok(()),
        ]);
        let manager = manager(devices.clone());
        let err = manager.acquire(&MediaConstraints::video_call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
        assert_eq!(devices.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_not_retried() {
        let devices = ScriptedDevices::new(vec![Err(MediaError::PermissionDenied("user".into()))]);
        let manager = manager(devices.clone());
        let err = manager.acquire(&MediaConstraints::video_call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(devices.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_constraints_rejected() {
        let devices = ScriptedDevices::new(vec![]);
        let manager = manager(devices.clone());
        let nothing = MediaConstraints {
            audio: false,
            video: false,
            ideal_width: None,
            ideal_height: None,
        };
        assert!(matches!(
            manager.acquire(&nothing).await,
            Err(MediaError::Overconstrained(_))
        ));
        assert!(devices.requests().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_flips_enabled_flag() {
        let manager = manager(Arc::new(StaticSampleDevices::new()));
        assert_eq!(manager.toggle_video(), None);

        let set = manager.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert_eq!(manager.toggle_video(), Some(false));
        assert!(!set.video.as_ref().unwrap().is_enabled());
        assert!(set.audio.as_ref().unwrap().is_enabled());
        assert_eq!(manager.toggle_video(), Some(true));
        assert_eq!(manager.toggle_audio(), Some(false));
    }

    #[tokio::test]
    async fn test_disabled_track_drops_samples() {
        let manager = manager(Arc::new(StaticSampleDevices::new()));
        let set = manager.acquire(&MediaConstraints::audio_only()).await.unwrap();
        let audio = set.audio.clone().unwrap();
        audio.set_enabled(false);
        let sample = Sample {
            data: bytes::Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        assert!(!audio.write_sample(&sample).await.unwrap());
        audio.stop();
        audio.set_enabled(true);
        assert!(!audio.write_sample(&sample).await.unwrap());
    }

    #[test]
    fn test_policy_decisions() {
        let policy = AcquisitionPolicy::default();
        let video = MediaConstraints::video_call();
        let audio = MediaConstraints::audio_only();
        let missing = MediaError::DeviceNotFound("camera".into());
        let busy = MediaError::DeviceBusy("mic".into());

        assert_eq!(policy.decide(&missing, &video, 0), RetryDecision::FallbackAudioOnly);
        assert_eq!(policy.decide(&missing, &audio, 0), RetryDecision::Fail);
        assert_eq!(
            policy.decide(&busy, &video, 0),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(policy.decide(&busy, &video, 1), RetryDecision::Fail);

        let strict = AcquisitionPolicy {
            audio_fallback: false,
            busy_retries: 0,
            ..AcquisitionPolicy::default()
        };
        assert_eq!(strict.decide(&missing, &video, 0), RetryDecision::Fail);
        assert_eq!(strict.decide(&busy, &video, 0), RetryDecision::Fail);
    }

    #[test]
    fn test_policy_from_json() {
        let policy: AcquisitionPolicy =
            serde_json::from_str(r#"{"busy_retries":2,"busy_backoff":50}"#).unwrap();
        assert!(policy.audio_fallback);
        assert_eq!(policy.busy_retries, 2);
        assert_eq!(policy.busy_backoff, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_device_status_reports_missing_camera() {
        let manager = manager(Arc::new(StaticSampleDevices::new().without_camera()));
        let status = manager.device_status().await;
        assert!(status.supported);
        assert_eq!(status.camera, DeviceAccess::Missing);
        assert_eq!(status.microphone, DeviceAccess::Granted);

        // Backends without a permission query fall back to unknown
        let scripted = manager_with_script(vec![]);
        assert_eq!(scripted.0.device_status().await, DeviceStatus::unknown());
    }

    fn manager_with_script(
        script: Vec<Result<(), MediaError>>,
    ) -> (MediaAcquisitionManager, Arc<ScriptedDevices>) {
        let devices = ScriptedDevices::new(script);
        (manager(devices.clone()), devices)
    }

    #[tokio::test]
    async fn test_device_trial_releases_tracks() {
        let manager = manager(Arc::new(StaticSampleDevices::new().without_camera()));
        let mut events = manager.subscribe_events();

        let trial = manager.test_devices(&MediaConstraints::video_call()).await.unwrap();
        assert_eq!(trial.media_type, MediaType::Audio);
        assert!(trial.fallback_applied);
        assert_eq!(trial.tracks, 1);
        assert!(manager.current().is_none());

        assert!(matches!(events.recv().await.unwrap(), MediaEvent::TracksAcquired { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            MediaEvent::TracksReleased { stopped: 1 }
        ));
    }

    #[tokio::test]
    async fn test_device_trial_reports_failure_kind() {
        let (manager, devices) =
            manager_with_script(vec![Err(MediaError::PermissionDenied("camera".into()))]);
        let err = manager.test_devices(&MediaConstraints::video_call()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(devices.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_device_trial_leaves_call_tracks_alone() {
        let manager = manager(Arc::new(StaticSampleDevices::new()));
        let held = manager.acquire(&MediaConstraints::audio_only()).await.unwrap();

        let err = manager.test_devices(&MediaConstraints::audio_only()).await.unwrap_err();
        assert!(matches!(err, MediaError::DeviceBusy(_)));
        assert!(held.is_live());
        assert!(Arc::ptr_eq(&manager.current().unwrap(), &held));
    }
}
