//! Console output for call events

use callwire_core::{
    CallId, CallObserver, CallState, DataMessage, DeviceStatus, DeviceTrial, EndReason, ErrorKind,
    IncomingCall, ParticipantId, RemoteTrack,
};

/// Prints call progress to stdout
pub struct ConsoleObserver {
    local_id: ParticipantId,
}

impl ConsoleObserver {
    /// Observer for the local participant `local_id`
    pub fn new(local_id: ParticipantId) -> Self {
        Self { local_id }
    }
}

impl CallObserver for ConsoleObserver {
    fn on_incoming_call(&self, call: &IncomingCall) {
        println!("{}", format_incoming(call));
    }

    fn on_state_change(&self, _call_id: CallId, state: CallState, reason: Option<&EndReason>) {
        println!("{}", format_state(state, reason));
    }

    fn on_remote_track(&self, _call_id: CallId, track: &RemoteTrack) {
        println!("🎞  Receiving {} ({})", track.kind, track.codec);
    }

    fn on_data_message(&self, _call_id: CallId, message: &DataMessage) {
        println!("{}", format_message(message, &self.local_id));
    }

    fn on_error(&self, kind: ErrorKind, detail: &str) {
        tracing::debug!(kind = %kind, detail, "Call error");
        println!("⚠️  {}", kind.user_message());
    }
}

/// One line announcing an incoming call
pub fn format_incoming(call: &IncomingCall) -> String {
    format!("📞 Incoming {} call from {}", call.media_type, call.caller)
}

/// One line describing a state change
pub fn format_state(state: CallState, reason: Option<&EndReason>) -> String {
    match (state, reason) {
        (CallState::Requesting, _) => "⏳ Waiting for answer...".to_string(),
        (CallState::Ringing, _) => "🔔 Ringing".to_string(),
        (CallState::Connecting, _) => "🔄 Connecting...".to_string(),
        (CallState::Active, _) => "✅ Call active".to_string(),
        (CallState::Ended | CallState::Failed, Some(reason)) => format!("📴 Call ended ({reason})"),
        (CallState::Ended | CallState::Failed, None) => "📴 Call ended".to_string(),
        (CallState::Idle, _) => "💤 Idle".to_string(),
    }
}

/// One line for a chat message, marking our own messages
pub fn format_message(message: &DataMessage, local_id: &ParticipantId) -> String {
    let time = message.timestamp.format("%H:%M:%S");
    if &message.sender_id == local_id {
        format!("[{time}] you: {}", message.text)
    } else {
        format!("[{time}] {}: {}", message.sender_id, message.text)
    }
}

/// Lines describing capture support and device access
pub fn format_device_status(status: &DeviceStatus) -> Vec<String> {
    if !status.supported {
        return vec!["❌ Camera and microphone capture is not supported here".to_string()];
    }
    vec![
        format!("📷 Camera:     {}", status.camera),
        format!("🎙  Microphone: {}", status.microphone),
    ]
}

/// One line summarizing a successful device test
pub fn format_device_trial(trial: &DeviceTrial) -> String {
    if trial.fallback_applied {
        format!("✅ Microphone works; no camera, calls fall back to {}", trial.media_type)
    } else {
        format!("✅ Camera and microphone are working ({} tracks)", trial.tracks)
    }
}
