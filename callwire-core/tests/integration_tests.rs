//! End-to-end tests for data messages, remote media, observers and relays

mod common;

use callwire_core::{
    CallConfig, CallController, CallEngine, CallEvent, CallId, CallObserver, CallState, DataMessage, EndReason,
    EngineError, ErrorKind, IncomingCall, MediaType, MemoryRelay, ParticipantIdentity,
    CallError, RelayServer, RemoteTrack, TransportConfig, WebSocketTransport,
};
use common::{connect_pair, join, SimNetwork, TestDevices};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingObserver {
    log: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl CallObserver for RecordingObserver {
    fn on_incoming_call(&self, call: &IncomingCall) {
        self.log.lock().push(format!("incoming:{}", call.caller.id));
    }

    fn on_state_change(&self, _call_id: CallId, state: CallState, _reason: Option<&EndReason>) {
        self.log.lock().push(format!("state:{state}"));
    }

    fn on_remote_track(&self, _call_id: CallId, track: &RemoteTrack) {
        self.log.lock().push(format!("track:{}", track.kind));
    }

    fn on_data_message(&self, _call_id: CallId, message: &DataMessage) {
        self.log.lock().push(format!("text:{}:{}", message.sender_id, message.text));
    }

    fn on_error(&self, kind: ErrorKind, _detail: &str) {
        self.log.lock().push(format!("error:{kind}"));
    }
}

/// Registers another observer from inside a callback
struct ChainingObserver {
    controller: CallController,
    chained: Arc<RecordingObserver>,
}

impl CallObserver for ChainingObserver {
    fn on_incoming_call(&self, _call: &IncomingCall) {
        self.controller.add_observer(self.chained.clone());
    }
}

#[tokio::test]
async fn text_messages_reach_the_remote_and_echo_locally() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;
    connect_pair(&mut alice, &mut bob).await;

    let sent = alice.engine.send_text("hello bob").await.unwrap();
    assert_eq!(sent.sender_id.as_str(), "alice");

    let echoed = alice
        .next_matching(|event| match event {
            CallEvent::DataMessage { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(echoed, sent);

    let received = bob
        .next_matching(|event| match event {
            CallEvent::DataMessage { message, .. } => Some(message),
            _ => None,
        })
        .await;
    assert_eq!(received.text, "hello bob");
    assert_eq!(received.sender_id.as_str(), "alice");
    assert_eq!(received.timestamp, sent.timestamp);

    bob.engine.send_text("hi alice").await.unwrap();
    let reply = alice
        .next_matching(|event| match event {
            CallEvent::DataMessage { message, .. } if message.sender_id.as_str() == "bob" => {
                Some(message)
            }
            _ => None,
        })
        .await;
    assert_eq!(reply.text, "hi alice");
}

#[tokio::test]
async fn sending_without_a_call_fails() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let alice = join(&relay, &network, "alice").await;

    let err = alice.engine.send_text("anyone?").await.unwrap_err();
    assert!(matches!(err, EngineError::Call(CallError::NoActiveCall)));
}

#[tokio::test]
async fn sending_before_the_channel_opens_fails() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;

    alice.engine.call("bob").await.unwrap();
    bob.ringing().await;
    let err = alice.engine.send_text("too early").await.unwrap_err();
    assert!(matches!(err, EngineError::Call(CallError::InvalidState(CallState::Requesting))));

    bob.engine.accept().await.unwrap();
    alice.reach(CallState::Active).await;
    alice.engine.send_text("now").await.unwrap();

    alice.engine.end_call().await.unwrap();
    alice.reach(CallState::Idle).await;
    let err = alice.engine.send_text("gone").await.unwrap_err();
    assert!(matches!(err, EngineError::Call(CallError::NoActiveCall)));
}

#[tokio::test]
async fn remote_tracks_match_the_call_type() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;

    alice.engine.call_with("bob", MediaType::Audio).await.unwrap();
    assert_eq!(bob.ringing().await.media_type, MediaType::Audio);
    bob.engine.accept().await.unwrap();

    let kind = alice
        .next_matching(|event| match event {
            CallEvent::RemoteTrack { track, .. } => Some(track.kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, MediaType::Audio);

    let tracks = bob.engine.media().current().unwrap();
    assert!(tracks.video.is_none());
    assert!(tracks.audio.is_some());
}

#[tokio::test]
async fn toggles_flip_local_tracks() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;

    assert_eq!(alice.engine.toggle_video().await.unwrap(), None);

    connect_pair(&mut alice, &mut bob).await;
    assert_eq!(alice.engine.toggle_video().await.unwrap(), Some(false));
    assert_eq!(alice.engine.toggle_audio().await.unwrap(), Some(false));
    assert_eq!(alice.engine.toggle_video().await.unwrap(), Some(true));

    let tracks = alice.engine.media().current().unwrap();
    assert!(tracks.video.as_ref().unwrap().is_enabled());
    assert!(!tracks.audio.as_ref().unwrap().is_enabled());
}

#[tokio::test]
async fn observers_see_the_whole_call() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;
    let alice_log = Arc::new(RecordingObserver::default());
    let bob_log = Arc::new(RecordingObserver::default());
    alice.engine.add_observer(alice_log.clone());
    bob.engine.add_observer(bob_log.clone());

    connect_pair(&mut alice, &mut bob).await;
    bob.engine.send_text("ping").await.unwrap();
    alice
        .next_matching(|event| matches!(event, CallEvent::DataMessage { .. }).then_some(()))
        .await;
    bob.engine.end_call().await.unwrap();
    alice.reach(CallState::Idle).await;
    bob.reach(CallState::Idle).await;

    let alice_entries = alice_log.entries();
    let states: Vec<&str> = alice_entries
        .iter()
        .filter_map(|e| e.strip_prefix("state:"))
        .collect();
    assert_eq!(states, ["Requesting", "Connecting", "Active", "Ended", "Idle"]);
    assert!(alice_entries.contains(&"track:video".to_string()));
    assert!(alice_entries.contains(&"track:audio".to_string()));
    assert!(alice_entries.contains(&"text:bob:ping".to_string()));

    let bob_entries = bob_log.entries();
    assert_eq!(bob_entries.first().map(String::as_str), Some("state:Ringing"));
    assert!(bob_entries.contains(&"incoming:alice".to_string()));
    assert!(bob_entries.contains(&"text:bob:ping".to_string()));
    assert!(!bob_entries.iter().any(|e| e.starts_with("error:")));
}

#[tokio::test]
async fn signaling_loss_while_active_is_transport_lost() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;
    connect_pair(&mut alice, &mut bob).await;

    relay.disconnect(&"alice".into());

    let kind = alice
        .next_matching(|event| match event {
            CallEvent::Error { kind, .. } => Some(kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, ErrorKind::TransportLost);
    assert_eq!(alice.reach(CallState::Ended).await, Some(EndReason::TransportLost));
    alice.reach(CallState::Idle).await;
    assert!(alice.engine.media().current().is_none());
}

#[tokio::test]
async fn signaling_loss_while_requesting_fails_the_call() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let mut alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;

    alice.engine.call("bob").await.unwrap();
    bob.ringing().await;
    relay.disconnect(&"alice".into());

    assert_eq!(
        alice.reach(CallState::Failed).await,
        Some(EndReason::Failed(ErrorKind::SignalingUnavailable))
    );
    alice.reach(CallState::Idle).await;

    let err = alice.engine.call("bob").await.unwrap_err();
    assert!(matches!(err, EngineError::Call(CallError::Signaling(_))));
    assert_eq!(alice.engine.state(), CallState::Idle);
}

#[tokio::test]
async fn call_over_websocket_relay() {
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    tokio::spawn(server.run());

    let network = SimNetwork::new();
    let config = TransportConfig {
        url,
        connect_timeout: Duration::from_secs(5),
    };
    let mut engines = Vec::new();
    for id in ["alice", "bob"] {
        let transport = Arc::new(WebSocketTransport::connect(&config).await.unwrap());
        let engine = CallEngine::builder(ParticipantIdentity::new(id, id), transport)
            .with_config(CallConfig::default())
            .with_devices(TestDevices::new())
            .with_backend(Arc::new(network.clone()))
            .build()
            .await
            .unwrap();
        engines.push(engine);
    }
    let bob = engines.pop().unwrap();
    let alice = engines.pop().unwrap();
    let mut alice_events = alice.subscribe_events();
    let mut bob_events = bob.subscribe_events();

    // Joins race the first emit on separate connections
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.call("bob").await.unwrap();

    let wait = Duration::from_secs(10);
    tokio::time::timeout(wait, async {
        loop {
            if let CallEvent::IncomingCall(call) = bob_events.recv().await.unwrap() {
                assert_eq!(call.caller.id.as_str(), "alice");
                return;
            }
        }
    })
    .await
    .unwrap();
    bob.accept().await.unwrap();

    tokio::time::timeout(wait, async {
        loop {
            if let CallEvent::StateChanged {
                state: CallState::Active,
                ..
            } = alice_events.recv().await.unwrap()
            {
                return;
            }
        }
    })
    .await
    .unwrap();

    alice.shutdown().await;
    tokio::time::timeout(wait, async {
        loop {
            if let CallEvent::StateChanged {
                state: CallState::Ended,
                reason,
                ..
            } = bob_events.recv().await.unwrap()
            {
                assert_eq!(reason, Some(EndReason::RemoteHangup));
                return;
            }
        }
    })
    .await
    .unwrap();
    bob.shutdown().await;
}

#[tokio::test]
async fn observer_may_register_observers_from_a_callback() {
    let relay = MemoryRelay::new();
    let network = SimNetwork::new();
    let alice = join(&relay, &network, "alice").await;
    let mut bob = join(&relay, &network, "bob").await;
    let chained = Arc::new(RecordingObserver::default());
    bob.engine.add_observer(Arc::new(ChainingObserver {
        controller: bob.engine.controller().clone(),
        chained: chained.clone(),
    }));

    alice.engine.call("bob").await.unwrap();
    bob.ringing().await;
    bob.engine.reject("rejected").await.unwrap();
    bob.reach(CallState::Idle).await;

    let entries = chained.entries();
    assert!(entries.contains(&"state:Ended".to_string()), "{entries:?}");
    assert!(entries.contains(&"state:Idle".to_string()), "{entries:?}");

    // The observer holds a controller handle, so stop explicitly
    bob.engine.shutdown().await;
}
