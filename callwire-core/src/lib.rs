//! Callwire - relay-brokered one-to-one audio/video calls over WebRTC
//!
//! This library places and receives calls between two participants who find
//! each other through a signaling relay. It features:
//!
//! - **Relay Signaling**: JSON events routed by personal room over WebSocket
//! - **Media Acquisition**: Configurable retry and audio-only fallback policy
//! - **Peer Sessions**: Offer/answer and ICE candidate exchange with ordered queuing
//! - **Call Lifecycle**: A single-writer state machine with ring and request timeouts
//! - **Text Chat**: A data channel alongside audio and video
//!
//! # Examples
//!
//! ```rust,no_run
//! use callwire_core::{CallEngine, CallConfig, ParticipantIdentity, TransportConfig, WebSocketTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Connect to a relay
//! let transport = Arc::new(WebSocketTransport::connect(&TransportConfig::default()).await?);
//!
//! // Start the engine for the local identity
//! let engine = CallEngine::builder(ParticipantIdentity::new("alice", "Alice"), transport)
//!     .with_config(CallConfig::default())
//!     .build()
//!     .await?;
//!
//! // Place a video call
//! let call_id = engine.call("bob").await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Error taxonomy shared by all layers
pub mod error;

/// Participant identity
pub mod identity;

/// Signaling protocol and client
pub mod signaling;

/// WebSocket signaling transport
pub mod transport;

/// In-process and WebSocket relays
pub mod relay;

/// Local media acquisition
pub mod media;

/// Peer connection sessions
pub mod peer;

/// Call lifecycle state machine
pub mod call;

/// Call engine and configuration
pub mod service;

// Re-export main types at crate root
pub use call::{CallController, CallError, CallEvent, CallObserver};
pub use error::ErrorKind;
pub use identity::{ParticipantId, ParticipantIdentity};
pub use media::{
    AcquisitionPolicy, DeviceAccess, DeviceStatus, DeviceTrial, LocalTrack, MediaAcquisitionManager,
    MediaDevices, MediaError, MediaEvent, MediaTrackSet, RetryDecision, StaticSampleDevices,
};
pub use peer::{
    NegotiationStats, PeerBackend, PeerConfig, PeerConnectionState, PeerDriver, PeerError, PeerEvent,
    PeerRole, PeerSession, RemoteTrack, RtcBackend, SdpKind,
};
pub use relay::{MemoryRelay, MemoryTransport, RelayError, RelayFrame, RelayServer};
pub use service::{CallConfig, CallEngine, CallEngineBuilder, EngineError};
pub use signaling::{
    InboundSignal, SignalSender, SignalingClient, SignalingError, SignalingEventKind, SignalingMessage,
    SignalingTransport,
};
pub use transport::{TransportConfig, TransportError, WebSocketTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallEvent, CallObserver};
    pub use crate::error::ErrorKind;
    pub use crate::identity::{ParticipantId, ParticipantIdentity};
    pub use crate::relay::MemoryRelay;
    pub use crate::service::{CallConfig, CallEngine};
    pub use crate::transport::{TransportConfig, WebSocketTransport};
    pub use crate::types::{CallId, CallState, EndReason, MediaConstraints, MediaType};
}
