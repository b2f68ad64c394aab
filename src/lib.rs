//! livecall - real-time voice calls over a WebSocket
//!
//! Captures microphone audio, streams it to a voice service and plays the
//! service's audio back through a jitter buffer. Connections are kept warm
//! in per-contact pools so a call starts without waiting for the handshake.

#![forbid(unsafe_code)]

/// PCM helpers and the frame type shared by the engines
pub mod audio;
/// Microphone capture with energy VAD
pub mod capture;
/// One WebSocket connection to the voice service
pub mod client;
/// Engine configuration and environment overrides
pub mod config;
/// ID token sources for new connections
pub mod credentials;
/// Audio device backends
pub mod device;
/// Events for the UI layer
pub mod events;
/// Jitter-buffered playback
pub mod playback;
/// Warm connection pools
pub mod pool;
/// Wire messages
pub mod protocol;
/// Call orchestration
pub mod session;

pub use config::EngineConfig;
pub use credentials::{TokenProvider, TokenStore};
pub use device::{AudioBackend, AudioRoute};
pub use events::EngineEvent;
pub use pool::{PoolRegistry, WsConnector};
pub use session::{SessionError, VoiceSession};
