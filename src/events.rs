use std::fmt;

pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_READY: &str = "Ready";
pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_DISCONNECTING: &str = "Disconnecting...";
pub const STATUS_DISCONNECTED: &str = "Disconnected";

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Status(String),
    /// Emitted when the capture VAD flips.
    VoiceActivity(bool),
    Error(String),
    /// 0..=100 while waiting for a pooled connection.
    InitProgress(u8),
}

impl EngineEvent {
    pub fn status(s: &str) -> Self {
        EngineEvent::Status(s.to_string())
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Status(s) => write!(f, "status: {s}"),
            EngineEvent::VoiceActivity(v) => write!(f, "voice_activity: {v}"),
            EngineEvent::Error(e) => write!(f, "error: {e}"),
            EngineEvent::InitProgress(p) => write!(f, "init_progress: {p}%"),
        }
    }
}
