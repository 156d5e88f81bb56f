//! Shared fixtures: scripted devices, a simulated peer network and engines
//! wired to an in-process relay.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use bytes::Bytes;
use callwire_core::{
    CallConfig, CallEngine, CallEvent, CallState, EndReason, IceCandidate, LocalTrack,
    MediaConstraints, MediaDevices, MediaError, MemoryRelay, MemoryTransport, ParticipantIdentity,
    PeerBackend, PeerConfig, PeerConnectionState, PeerDriver, PeerError, PeerEvent, RemoteTrack,
    SdpKind,
};
use callwire_core::MediaType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Candidates each simulated connection gathers
pub const CANDIDATES_PER_SIDE: u64 = 2;

/// Devices that succeed unless told to fail
#[derive(Default)]
pub struct TestDevices {
    failure: Mutex<Option<MediaError>>,
    no_camera: bool,
    opened: AtomicUsize,
}

impl TestDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_camera() -> Arc<Self> {
        Arc::new(Self {
            no_camera: true,
            ..Self::default()
        })
    }

    pub fn failing(error: MediaError) -> Arc<Self> {
        let devices = Self::default();
        *devices.failure.lock() = Some(error);
        Arc::new(devices)
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for TestDevices {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<LocalTrack>, MediaError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if constraints.video && self.no_camera {
            return Err(MediaError::DeviceNotFound("no camera".to_string()));
        }
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack::new(format!("video-{n}"), MediaType::Video));
        }
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("audio-{n}"), MediaType::Audio));
        }
        Ok(tracks)
    }

    fn backend_type(&self) -> &'static str {
        "test"
    }
}

/// In-memory stand-in for the network between peer connections
///
/// Drivers find each other through the `o=sim <id>` line of the SDP they
/// exchange, so data messages reach the right counterpart.
#[derive(Clone, Default)]
pub struct SimNetwork {
    drivers: Arc<Mutex<HashMap<u64, Arc<SimDriver>>>>,
    next_id: Arc<AtomicU64>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer connections created so far
    pub fn created(&self) -> usize {
        self.next_id.load(Ordering::SeqCst) as usize
    }

    /// Most recent driver that created an offer
    pub fn caller(&self) -> Arc<SimDriver> {
        self.latest(true)
    }

    /// Most recent driver that answered
    pub fn callee(&self) -> Arc<SimDriver> {
        self.latest(false)
    }

    fn latest(&self, offered: bool) -> Arc<SimDriver> {
        let drivers = self.drivers.lock();
        drivers
            .values()
            .filter(|d| d.state.lock().offered == offered)
            .max_by_key(|d| d.id)
            .cloned()
            .unwrap()
    }
}

#[async_trait]
impl PeerBackend for SimNetwork {
    async fn create(
        &self,
        _config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerDriver>, PeerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let driver = Arc::new(SimDriver {
            id,
            network: self.clone(),
            events,
            state: Mutex::new(SimState::default()),
        });
        self.drivers.lock().insert(id, driver.clone());
        Ok(driver)
    }
}

#[derive(Default)]
struct SimState {
    offered: bool,
    tracks: Vec<MediaType>,
    data_channel: bool,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    remote_peer: Option<u64>,
    applied: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
}

/// One simulated peer connection
pub struct SimDriver {
    id: u64,
    network: SimNetwork,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<SimState>,
}

impl SimDriver {
    /// Force a connection state as if the network changed
    pub fn set_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::ConnectionState(state));
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn applied_candidates(&self) -> usize {
        self.state.lock().applied.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn describe(&self) -> String {
        let state = self.state.lock();
        let mut sdp = format!("v=0\r\no=sim {}\r\n", self.id);
        for kind in &state.tracks {
            sdp.push_str(&format!("m={kind}\r\n"));
        }
        if state.data_channel {
            sdp.push_str("m=application\r\n");
        }
        sdp
    }

    fn set_local(&self, sdp: &str) {
        self.state.lock().local_sdp = Some(sdp.to_string());
        for n in 0..CANDIDATES_PER_SIDE {
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{} {n} udp 2122260223 10.0.0.{} 5000{n} typ host",
                self.id, self.id
            ))));
        }
        self.maybe_connect();
    }

    fn maybe_connect(&self) {
        let (remote_sdp, has_channel) = {
            let mut state = self.state.lock();
            let (Some(local), Some(remote)) = (&state.local_sdp, &state.remote_sdp) else {
                return;
            };
            if state.connected {
                return;
            }
            let has_channel = local.contains("m=application") || remote.contains("m=application");
            let remote = remote.clone();
            state.connected = true;
            state.data_channel |= has_channel;
            (remote, has_channel)
        };
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
        for line in remote_sdp.lines() {
            let kind = match line {
                "m=audio" => MediaType::Audio,
                "m=video" => MediaType::Video,
                _ => continue,
            };
            self.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{kind}"),
                stream_id: "remote-stream".to_string(),
                kind,
                codec: match kind {
                    MediaType::Audio => "audio/opus".to_string(),
                    MediaType::Video => "video/VP8".to_string(),
                },
            }));
        }
        if has_channel {
            self.emit(PeerEvent::DataChannelOpen);
        }
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));
    }
}

#[async_trait]
impl PeerDriver for SimDriver {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), PeerError> {
        self.state.lock().tracks.push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        self.state.lock().offered = true;
        let sdp = self.describe();
        self.set_local(&sdp);
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        if self.state.lock().remote_sdp.is_none() {
            return Err(PeerError::Negotiation("answer without offer".to_string()));
        }
        let sdp = self.describe();
        self.set_local(&sdp);
        Ok(sdp)
    }

    async fn set_remote_description(&self, _kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        if !sdp.starts_with("v=0") {
            return Err(PeerError::Negotiation("malformed description".to_string()));
        }
        let remote_peer = sdp
            .lines()
            .find_map(|line| line.strip_prefix("o=sim "))
            .and_then(|id| id.trim().parse().ok());
        {
            let mut state = self.state.lock();
            state.remote_sdp = Some(sdp.to_string());
            state.remote_peer = remote_peer;
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.remote_sdp.is_none() {
            return Err(PeerError::InvalidState("no remote description".to_string()));
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn create_data_channel(&self, _label: &str) -> Result<(), PeerError> {
        self.state.lock().data_channel = true;
        Ok(())
    }

    async fn send_data(&self, payload: Bytes) -> Result<(), PeerError> {
        let peer = {
            let state = self.state.lock();
            if state.closed || !state.connected {
                return Err(PeerError::DataChannelClosed);
            }
            state.remote_peer
        };
        let target = peer.and_then(|id| self.network.drivers.lock().get(&id).cloned());
        match target {
            Some(target) if !target.is_closed() => {
                target.emit(PeerEvent::DataMessage(payload));
                Ok(())
            }
            _ => Err(PeerError::DataChannelClosed),
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// One participant wired to the relay and the simulated network
pub struct Participant {
    pub engine: CallEngine<MemoryTransport>,
    pub events: broadcast::Receiver<CallEvent>,
    pub devices: Arc<TestDevices>,
}

/// Route engine logs through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn participant(
    relay: &MemoryRelay,
    network: &SimNetwork,
    id: &str,
    devices: Arc<TestDevices>,
    config: CallConfig,
) -> Participant {
    init_tracing();
    let transport = Arc::new(relay.connect());
    let engine = CallEngine::builder(ParticipantIdentity::new(id, id.to_uppercase()), transport)
        .with_config(config)
        .with_devices(devices.clone())
        .with_backend(Arc::new(network.clone()))
        .build()
        .await
        .unwrap();
    let events = engine.subscribe_events();
    Participant {
        engine,
        events,
        devices,
    }
}

/// Default participant with working devices
pub async fn join(relay: &MemoryRelay, network: &SimNetwork, id: &str) -> Participant {
    participant(relay, network, id, TestDevices::new(), CallConfig::default()).await
}

impl Participant {
    /// Next event matching `pick`, failing after a minute of (possibly virtual) time
    pub async fn next_matching<T>(&mut self, mut pick: impl FnMut(CallEvent) -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(event) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for call event")
    }

    /// Wait until the call reaches `state`; returns the recorded reason
    pub async fn reach(&mut self, state: CallState) -> Option<EndReason> {
        self.next_matching(|event| match event {
            CallEvent::StateChanged {
                state: reached,
                reason,
                ..
            } if reached == state => Some(reason),
            _ => None,
        })
        .await
    }

    /// Wait for the incoming-call notification
    pub async fn ringing(&mut self) -> callwire_core::IncomingCall {
        self.next_matching(|event| match event {
            CallEvent::IncomingCall(call) => Some(call),
            _ => None,
        })
        .await
    }
}

/// Caller places a call, callee accepts, both reach `Active`
pub async fn connect_pair(caller: &mut Participant, callee: &mut Participant) {
    caller
        .engine
        .call(callee.engine.identity().id.clone())
        .await
        .unwrap();
    callee.ringing().await;
    callee.engine.accept().await.unwrap();
    caller.reach(CallState::Active).await;
    callee.reach(CallState::Active).await;
}
