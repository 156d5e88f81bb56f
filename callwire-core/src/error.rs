//! Error taxonomy surfaced to the embedding UI
//!
//! Each module keeps its own `thiserror` enum; every one of them maps onto a
//! single [`ErrorKind`] so the UI can present actionable guidance.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of failure reported through `CallObserver::on_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The user or platform denied camera/microphone access
    PermissionDenied,
    /// No matching capture device exists
    DeviceNotFound,
    /// The capture device is held by another application
    DeviceBusy,
    /// Access is blocked by a security policy (insecure context, sandbox)
    SecurityRestricted,
    /// The signaling channel could not be used
    SignalingUnavailable,
    /// The remote side never answered the call request
    RemoteTimeout,
    /// The remote side declined the call request
    RemoteRejected,
    /// SDP or ICE negotiation failed
    NegotiationFailed,
    /// The signaling channel or peer connection dropped mid-call
    TransportLost,
}

impl ErrorKind {
    /// Stable machine-readable name (also used as a rejection reason on the wire)
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission-denied",
            Self::DeviceNotFound => "device-not-found",
            Self::DeviceBusy => "device-busy",
            Self::SecurityRestricted => "security-restricted",
            Self::SignalingUnavailable => "signaling-unavailable",
            Self::RemoteTimeout => "remote-timeout",
            Self::RemoteRejected => "remote-rejected",
            Self::NegotiationFailed => "negotiation-failed",
            Self::TransportLost => "transport-lost",
        }
    }

    /// Human-readable message for the UI
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Camera and microphone access denied. Please allow permissions and try again."
            }
            Self::DeviceNotFound => "No camera or microphone found. Please check your devices.",
            Self::DeviceBusy => "Camera or microphone is being used by another application.",
            Self::SecurityRestricted => {
                "Camera and microphone access blocked due to security restrictions."
            }
            Self::SignalingUnavailable => {
                "Not connected to the call server. Please check your connection and try again."
            }
            Self::RemoteTimeout => "The other participant did not answer.",
            Self::RemoteRejected => "The other participant declined the call.",
            Self::NegotiationFailed => "Could not establish a media connection with the other participant.",
            Self::TransportLost => "The call connection was lost.",
        }
    }

    /// Whether the failure happened while acquiring local media
    #[must_use]
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::DeviceNotFound
                | Self::DeviceBusy
                | Self::SecurityRestricted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
