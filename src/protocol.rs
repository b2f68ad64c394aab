//! Wire messages for the voice service
//!
//! Every message, in both directions, is a JSON envelope:
//!
//! ```json
//! {"type": "...", "session_id": "...", "call_id": "...", "request_id": "...", "content": ...}
//! ```
//!
//! `content` is message specific. Audio travels as base64 of raw S16LE PCM in
//! `content.audio_data`.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Error as WsError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("No active call")]
    NoActiveCall,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Initialize,
    CallConnect,
    CallConnectResponse,
    Audio,
    Ping,
    PingResponse,
    CallDisconnect,
    CallDisconnectResponse,
    ClientLocationState,
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Control messages bypass the keep-alive discipline.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageKind::Ping | MessageKind::CallConnect | MessageKind::CallDisconnect
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Always serialized; `null` before a call exists.
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioContent {
    pub audio_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationContent {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSettings {
    pub character: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDevice {
    pub device_id: String,
    pub kind: String,
    pub label: String,
    pub group_id: String,
}

impl MediaDevice {
    fn default_device(kind: &str, label: &str) -> Self {
        Self {
            device_id: "default".into(),
            kind: kind.into(),
            label: label.into(),
            group_id: "default".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub language: String,
    pub user_agent: String,
    pub mobile_browser: bool,
    pub media_devices: Vec<MediaDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConnectContent {
    pub sample_rate: u32,
    pub audio_codec: String,
    pub reconnect: bool,
    pub is_private: bool,
    pub client_name: String,
    pub settings: CallSettings,
    pub client_metadata: ClientMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallConnectResponseContent {
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub audio_codec: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectContent {
    pub reason: String,
}

/// Parameters of the `call_connect` request.
#[derive(Debug, Clone)]
pub struct CallRequest<'a> {
    pub sample_rate: u32,
    pub client_name: &'a str,
    pub character: &'a str,
    pub language: &'a str,
    pub user_agent: &'a str,
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl Envelope {
    fn new(kind: MessageKind, session_id: &str, call_id: Option<&str>, content: Value) -> Self {
        Self {
            kind,
            session_id: Some(session_id.to_string()),
            call_id: call_id.map(str::to_string),
            request_id: None,
            content,
        }
    }

    fn with_request_id(mut self) -> Self {
        self.request_id = Some(new_request_id());
        self
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn ping(session_id: &str, call_id: Option<&str>) -> Self {
        Self::new(MessageKind::Ping, session_id, call_id, Value::from("ping")).with_request_id()
    }

    pub fn location_state(session_id: &str, timezone: &str) -> Result<Self> {
        let content = serde_json::to_value(LocationContent {
            latitude: 0.0,
            longitude: 0.0,
            address: String::new(),
            timezone: timezone.to_string(),
        })?;
        Ok(Self::new(
            MessageKind::ClientLocationState,
            session_id,
            None,
            content,
        ))
    }

    pub fn call_connect(session_id: &str, request: &CallRequest<'_>) -> Result<Self> {
        let content = serde_json::to_value(CallConnectContent {
            sample_rate: request.sample_rate,
            audio_codec: "none".into(),
            reconnect: false,
            is_private: false,
            client_name: request.client_name.to_string(),
            settings: CallSettings {
                character: request.character.to_string(),
            },
            client_metadata: ClientMetadata {
                language: request.language.to_string(),
                user_agent: request.user_agent.to_string(),
                mobile_browser: true,
                media_devices: vec![
                    MediaDevice::default_device("audioinput", "Default - Microphone"),
                    MediaDevice::default_device("audiooutput", "Default - Speaker"),
                ],
            },
        })?;
        Ok(Self::new(MessageKind::CallConnect, session_id, None, content).with_request_id())
    }

    /// An audio message carrying an already-encoded payload.
    pub fn audio_encoded(session_id: &str, call_id: &str, audio_data: String) -> Result<Self> {
        let content = serde_json::to_value(AudioContent { audio_data })?;
        Ok(Self::new(MessageKind::Audio, session_id, Some(call_id), content))
    }

    pub fn audio(session_id: &str, call_id: &str, pcm: &[u8]) -> Result<Self> {
        Self::audio_encoded(session_id, call_id, general_purpose::STANDARD.encode(pcm))
    }

    pub fn call_disconnect(session_id: &str, call_id: &str) -> Result<Self> {
        let content = serde_json::to_value(DisconnectContent {
            reason: "user_request".into(),
        })?;
        Ok(Self::new(MessageKind::CallDisconnect, session_id, Some(call_id), content)
            .with_request_id())
    }

    /// Decoded PCM from an `audio` message. `Ok(None)` if there is no payload.
    pub fn decode_audio(&self) -> Result<Option<Vec<u8>>> {
        match self.content.get("audio_data").and_then(Value::as_str) {
            Some(data) if !data.is_empty() => Ok(Some(general_purpose::STANDARD.decode(data)?)),
            _ => Ok(None),
        }
    }

    /// Negotiated parameters from a `call_connect_response`. Missing or
    /// malformed fields come back as `None`.
    pub fn call_connect_response(&self) -> CallConnectResponseContent {
        serde_json::from_value(self.content.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_type_deserializes() {
        let env = Envelope::parse(r#"{"type":"transcript","content":{"text":"hi"}}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown);
        assert_eq!(env.session_id, None);
    }

    #[test]
    fn test_call_connect_shape() {
        let request = CallRequest {
            sample_rate: 16_000,
            client_name: "RP-Android",
            character: "Miles",
            language: "en-US",
            user_agent: "ua",
        };
        let env = Envelope::call_connect("s1", &request).unwrap();
        let v: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(v["type"], "call_connect");
        assert_eq!(v["session_id"], "s1");
        assert!(v["call_id"].is_null());
        assert!(Uuid::parse_str(v["request_id"].as_str().unwrap()).is_ok());
        assert_eq!(v["content"]["sample_rate"], 16_000);
        assert_eq!(v["content"]["audio_codec"], "none");
        assert_eq!(v["content"]["reconnect"], false);
        assert_eq!(v["content"]["settings"]["character"], "Miles");
        assert_eq!(v["content"]["client_metadata"]["mobile_browser"], true);
        assert_eq!(
            v["content"]["client_metadata"]["media_devices"][1],
            json!({"deviceId": "default", "kind": "audiooutput", "label": "Default - Speaker", "groupId": "default"})
        );
    }

    #[test]
    fn test_location_and_ping_shape() {
        let v: Value =
            serde_json::from_str(&Envelope::location_state("s", "America/Chicago").unwrap().to_json().unwrap())
                .unwrap();
        assert_eq!(v["type"], "client_location_state");
        assert!(v["call_id"].is_null());
        assert!(v.get("request_id").is_none());
        assert_eq!(v["content"]["timezone"], "America/Chicago");
        assert_eq!(v["content"]["address"], "");

        let ping = Envelope::ping("s", Some("c"));
        assert_eq!(ping.content, json!("ping"));
        assert_eq!(ping.call_id.as_deref(), Some("c"));
        assert!(ping.request_id.is_some());
    }

    #[test]
    fn test_audio_payload_decoding() {
        let env = Envelope::audio("s", "c", &[1, 2, 3, 4]).unwrap();
        assert!(env.request_id.is_none());
        assert_eq!(env.decode_audio().unwrap(), Some(vec![1, 2, 3, 4]));

        let bad = Envelope::parse(r#"{"type":"audio","content":{"audio_data":"***"}}"#).unwrap();
        assert!(bad.decode_audio().is_err());

        let empty = Envelope::parse(r#"{"type":"audio","content":{}}"#).unwrap();
        assert_eq!(empty.decode_audio().unwrap(), None);
    }

    #[test]
    fn test_call_connect_response_defaults() {
        let env = Envelope::parse(
            r#"{"type":"call_connect_response","session_id":"s","call_id":"c","content":{"sample_rate":22050}}"#,
        )
        .unwrap();
        let content = env.call_connect_response();
        assert_eq!(content.sample_rate, Some(22050));
        assert_eq!(content.audio_codec, None);

        let env = Envelope::parse(r#"{"type":"call_connect_response","content":"odd"}"#).unwrap();
        assert_eq!(env.call_connect_response(), CallConnectResponseContent::default());
    }

    #[test]
    fn test_control_kinds() {
        assert!(MessageKind::Ping.is_control());
        assert!(MessageKind::CallDisconnect.is_control());
        assert!(!MessageKind::Audio.is_control());
        assert!(!MessageKind::ClientLocationState.is_control());
    }
}
