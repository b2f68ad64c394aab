//! WebSocket client for one voice call
//!
//! Uses a split sink/stream: the write half sits behind an async mutex so
//! any task can send, while a spawned reader task owns the read half and
//! drives the handshake:
//!
//! ```text
//! connect ──▶ Connecting ──initialize──▶ Initialized ──call_connect_response──▶ CallConnected
//!                                                                               │
//!                        Disconnected ◀── Closing ◀── disconnect / socket close ┘
//! ```
//!
//! A client is single use. Once it reaches `Disconnected` after connecting it
//! never reconnects; the pool builds a fresh one instead.

use crate::audio::{CAPTURE_SAMPLE_RATE, DEFAULT_PLAYBACK_SAMPLE_RATE};
use crate::protocol::{CallRequest, Envelope, MessageKind, ProtocolError, Result};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const EVENT_CAPACITY: usize = 32;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub ws_url: String,
    pub origin: String,
    pub user_agent: String,
    pub client_name: String,
    pub timezone: String,
    pub language: String,
    /// Rate announced for outbound audio.
    pub capture_sample_rate: u32,
    pub receive_queue_capacity: usize,
    /// Filler messages sent after the first inbound audio.
    pub bootstrap_chunks: usize,
    /// Base64 payload of each filler message.
    pub bootstrap_payload: String,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://sesameai.app/agent-service-0/v1/connect".into(),
            origin: "https://www.sesame.com".into(),
            user_agent: "Mozilla/5.0 (Linux; Android 10) AppleWebKit/537.36".into(),
            client_name: "RP-Android".into(),
            timezone: "America/Chicago".into(),
            language: "en-US".into(),
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            receive_queue_capacity: 100,
            bootstrap_chunks: 2,
            bootstrap_payload: format!("{}=", "A".repeat(1707)),
            connect_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Full connection URL with the query parameters the service expects.
    pub fn connect_url(&self, id_token: &str, character: &str) -> String {
        let usercontext = format!(r#"{{"timezone": "{}"}}"#, self.timezone);
        let params = [
            ("id_token", id_token),
            ("client_name", self.client_name.as_str()),
            ("usercontext", usercontext.as_str()),
            ("character", character),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.ws_url, query)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Initialized,
    CallConnected,
    Closing,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Initialized => 2,
            ConnectionState::CallConnected => 3,
            ConnectionState::Closing => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Error(String),
}

/// Decides when a `ping` must precede an outbound message.
///
/// A ping goes first if nothing was sent yet, if the kind differs from the
/// previous send, or if nothing arrived from the server since that send.
#[derive(Debug, Clone, Default)]
pub struct KeepAlive {
    last_sent: Option<MessageKind>,
    received_since_send: bool,
}

impl KeepAlive {
    pub fn needs_ping(&self, kind: MessageKind) -> bool {
        match self.last_sent {
            None => true,
            Some(last) => last != kind || !self.received_since_send,
        }
    }

    pub fn record_send(&mut self, kind: MessageKind) {
        self.last_sent = Some(kind);
        self.received_since_send = false;
    }

    pub fn record_inbound(&mut self) {
        self.received_since_send = true;
    }
}

struct CallInfo {
    session_id: Option<String>,
    call_id: Option<String>,
    sample_rate: u32,
    audio_codec: String,
    keep_alive: KeepAlive,
    first_audio_received: bool,
}

struct Inner {
    id: u64,
    config: ClientConfig,
    credential: String,
    character: String,
    info: parking_lot::Mutex<CallInfo>,
    sink: Mutex<Option<WsSink>>,
    queue: parking_lot::Mutex<VecDeque<Bytes>>,
    audio_ready: Notify,
    state: watch::Sender<ConnectionState>,
    terminated: AtomicBool,
    inbound: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// One WebSocket connection to the voice service.
pub struct ProtocolClient {
    inner: Arc<Inner>,
}

impl ProtocolClient {
    pub fn new(config: ClientConfig, credential: impl Into<String>, character: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                credential: credential.into(),
                character: character.into(),
                info: parking_lot::Mutex::new(CallInfo {
                    session_id: None,
                    call_id: None,
                    sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
                    audio_codec: "none".into(),
                    keep_alive: KeepAlive::default(),
                    first_audio_received: false,
                }),
                sink: Mutex::new(None),
                queue: parking_lot::Mutex::new(VecDeque::new()),
                audio_ready: Notify::new(),
                state,
                terminated: AtomicBool::new(false),
                inbound: AtomicU64::new(0),
                events,
                reader: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn character(&self) -> &str {
        &self.inner.character
    }

    /// Open the WebSocket and start the reader task.
    ///
    /// Returns once the socket is open; the call itself is established
    /// asynchronously (watch [`state`](Self::state) or the event stream).
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.terminated.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        if !inner.advance(ConnectionState::Connecting) {
            return Err(ProtocolError::InvalidRequest("client already connected".into()));
        }

        let url = inner.config.connect_url(&inner.credential, &inner.character);
        info!(client = inner.id, character = %inner.character, "Connecting to {}", inner.config.ws_url);

        let ws_stream = match self.open(&url).await {
            Ok(ws) => ws,
            Err(e) => {
                error!(client = inner.id, "Connection failed: {}", e);
                inner.terminate(Some(format!("WebSocket error: {e}"))).await;
                return Err(e);
            }
        };

        let (sink, stream) = ws_stream.split();
        *inner.sink.lock().await = Some(Arc::new(Mutex::new(sink)));

        let reader = tokio::spawn(read_loop(inner.clone(), stream));
        *inner.reader.lock() = Some(reader);
        debug!(client = inner.id, "WebSocket opened");
        Ok(())
    }

    async fn open(&self, url: &str) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let config = &self.inner.config;
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Origin",
            HeaderValue::from_str(&config.origin)
                .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?,
        );
        headers.insert(
            "User-Agent",
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| ProtocolError::InvalidRequest(e.to_string()))?,
        );

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let (ws_stream, resp) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        debug!(client = self.inner.id, status = %resp.status(), "WebSocket handshake complete");
        Ok(ws_stream)
    }

    /// End the call and close the socket. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if inner.terminated.load(Ordering::SeqCst) {
            return;
        }
        let was_connected = inner.current_state() == ConnectionState::CallConnected;
        inner.advance(ConnectionState::Closing);

        if was_connected {
            let ids = {
                let info = inner.info.lock();
                info.session_id.clone().zip(info.call_id.clone())
            };
            if let Some((session_id, call_id)) = ids {
                match Envelope::call_disconnect(&session_id, &call_id) {
                    Ok(env) => {
                        if let Err(e) = inner.send_data(env).await {
                            debug!(client = inner.id, "call_disconnect not delivered: {}", e);
                        }
                    }
                    Err(e) => error!(client = inner.id, "Failed to build call_disconnect: {}", e),
                }
            }
        }

        inner.terminate(None).await;
        if let Some(reader) = inner.reader.lock().take() {
            reader.abort();
        }
    }

    /// Send one block of PCM as an `audio` message.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        let (session_id, call_id) = {
            let info = self.inner.info.lock();
            match (&info.session_id, &info.call_id) {
                (Some(s), Some(c)) => (s.clone(), c.clone()),
                _ => return Err(ProtocolError::NoActiveCall),
            }
        };
        let env = Envelope::audio(&session_id, &call_id, pcm)?;
        self.inner.send_data(env).await
    }

    /// Pop the oldest received audio chunk, if any.
    pub fn next_audio_chunk(&self) -> Option<Bytes> {
        self.inner.queue.lock().pop_front()
    }

    /// Wait for the next received audio chunk. `None` once the connection
    /// has closed and the queue is drained.
    pub async fn recv_audio(&self) -> Option<Bytes> {
        loop {
            let notified = self.inner.audio_ready.notified();
            if let Some(chunk) = self.next_audio_chunk() {
                return Some(chunk);
            }
            if self.inner.terminated.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn queued_audio(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Number of well-formed messages received.
    pub fn inbound_messages(&self) -> u64 {
        self.inner.inbound.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::CallConnected
    }

    /// True once the connection has ended for good.
    pub fn is_closed(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.info.lock().session_id.clone()
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.info.lock().call_id.clone()
    }

    pub fn server_sample_rate(&self) -> u32 {
        self.inner.info.lock().sample_rate
    }

    pub fn audio_codec(&self) -> String {
        self.inner.info.lock().audio_codec.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the connection has ended for good.
    pub async fn wait_until_closed(&self) {
        let mut rx = self.inner.state.subscribe();
        loop {
            if self.inner.terminated.load(Ordering::SeqCst) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Inner {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move forward in the state machine. Backward moves are ignored.
    fn advance(&self, to: ConnectionState) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        self.state.send_if_modified(|state| {
            if to.rank() > state.rank() {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Enter the terminal state, close the socket and notify listeners.
    async fn terminate(&self, error: Option<String>) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_if_modified(|state| {
            if *state != ConnectionState::Closing {
                *state = ConnectionState::Closing;
            }
            true
        });

        let sink = self.sink.lock().await.take();
        if let Some(sink) = sink {
            if let Err(e) = sink.lock().await.close().await {
                debug!(client = self.id, "Socket close: {}", e);
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(e) = error {
            let _ = self.events.send(ClientEvent::Error(e));
        }
        let _ = self.events.send(ClientEvent::Disconnected);
        self.audio_ready.notify_waiters();
        self.audio_ready.notify_one();
        info!(client = self.id, character = %self.character, "Connection closed");
    }

    async fn send_data(&self, env: Envelope) -> Result<()> {
        let writer = self
            .sink
            .lock()
            .await
            .clone()
            .ok_or(ProtocolError::NotConnected)?;
        let mut sink = writer.lock().await;

        // Decided under the sink lock so the ping and its message stay adjacent.
        let ping = {
            let mut info = self.info.lock();
            if info.call_id.is_some() && !env.kind.is_control() {
                let needed = info.keep_alive.needs_ping(env.kind);
                info.keep_alive.record_send(env.kind);
                match (&info.session_id, needed) {
                    (Some(session_id), true) => {
                        Some(Envelope::ping(session_id, info.call_id.as_deref()))
                    }
                    _ => None,
                }
            } else {
                None
            }
        };

        let result = write_messages(&mut sink, ping, &env).await;
        drop(sink);

        if let Err(ProtocolError::WebSocket(e)) = &result {
            error!(client = self.id, "Send failed: {}", e);
            self.terminate(Some(format!("WebSocket error: {e}"))).await;
        }
        result
    }

    async fn handle_text(&self, text: &str) {
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(client = self.id, "Dropping malformed message: {}", e);
                return;
            }
        };
        self.inbound.fetch_add(1, Ordering::Relaxed);
        self.info.lock().keep_alive.record_inbound();

        match env.kind {
            MessageKind::Initialize => self.on_initialize(env).await,
            MessageKind::CallConnectResponse => self.on_call_connect_response(env),
            MessageKind::Audio => self.on_audio(env).await,
            MessageKind::PingResponse => {}
            MessageKind::CallDisconnectResponse => {
                info!(client = self.id, "Call disconnected by server");
                self.info.lock().call_id = None;
                self.terminate(None).await;
            }
            other => debug!(client = self.id, kind = ?other, "Received message"),
        }
    }

    async fn on_initialize(&self, env: Envelope) {
        let session_id = env.session_id.unwrap_or_default();
        debug!(client = self.id, session_id = %session_id, "Session initialized");
        self.info.lock().session_id = Some(session_id.clone());

        let request = CallRequest {
            sample_rate: self.config.capture_sample_rate,
            client_name: &self.config.client_name,
            character: &self.character,
            language: &self.config.language,
            user_agent: &self.config.user_agent,
        };
        let handshake = [
            Envelope::location_state(&session_id, &self.config.timezone),
            Envelope::call_connect(&session_id, &request),
        ];
        for env in handshake {
            let sent = match env {
                Ok(env) => self.send_data(env).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                error!(client = self.id, "Handshake send failed: {}", e);
                return;
            }
        }
        self.advance(ConnectionState::Initialized);
    }

    fn on_call_connect_response(&self, env: Envelope) {
        let negotiated = env.call_connect_response();
        {
            let mut info = self.info.lock();
            if let Some(session_id) = env.session_id {
                info.session_id = Some(session_id);
            }
            info.call_id = Some(env.call_id.unwrap_or_default());
            info.sample_rate = negotiated
                .sample_rate
                .filter(|r| *r > 0)
                .unwrap_or(DEFAULT_PLAYBACK_SAMPLE_RATE);
            info.audio_codec = negotiated.audio_codec.unwrap_or_else(|| "none".into());
            info!(
                client = self.id,
                session_id = info.session_id.as_deref().unwrap_or(""),
                call_id = info.call_id.as_deref().unwrap_or(""),
                sample_rate = info.sample_rate,
                codec = %info.audio_codec,
                "Call connected"
            );
        }
        if self.advance(ConnectionState::CallConnected) {
            let _ = self.events.send(ClientEvent::Connected);
        }
    }

    async fn on_audio(&self, env: Envelope) {
        let pcm = match env.decode_audio() {
            Ok(Some(pcm)) => pcm,
            Ok(None) => return,
            Err(e) => {
                warn!(client = self.id, "Dropping audio message: {}", e);
                return;
            }
        };

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.config.receive_queue_capacity {
                queue.pop_front();
            }
            queue.push_back(Bytes::from(pcm));
        }
        self.audio_ready.notify_one();

        let bootstrap = {
            let mut info = self.info.lock();
            if info.first_audio_received {
                None
            } else {
                info.first_audio_received = true;
                info.session_id.clone().zip(info.call_id.clone())
            }
        };
        if let Some((session_id, call_id)) = bootstrap {
            debug!(
                client = self.id,
                chunks = self.config.bootstrap_chunks,
                "First audio received, sending bootstrap chunks"
            );
            for _ in 0..self.config.bootstrap_chunks {
                let sent = match Envelope::audio_encoded(
                    &session_id,
                    &call_id,
                    self.config.bootstrap_payload.clone(),
                ) {
                    Ok(env) => self.send_data(env).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    error!(client = self.id, "Bootstrap send failed: {}", e);
                    break;
                }
            }
        }
    }
}

async fn write_messages(
    sink: &mut SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    ping: Option<Envelope>,
    env: &Envelope,
) -> Result<()> {
    if let Some(ping) = ping {
        sink.send(Message::Text(ping.to_json()?.into())).await?;
    }
    sink.send(Message::Text(env.to_json()?.into())).await?;
    Ok(())
}

async fn read_loop(inner: Arc<Inner>, mut stream: WsStream) {
    debug!(client = inner.id, "Reader task started");
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => inner.handle_text(&text).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => inner.handle_text(text).await,
                Err(_) => debug!(client = inner.id, len = bytes.len(), "Ignoring binary message"),
            },
            Ok(Message::Close(frame)) => {
                info!(client = inner.id, "WebSocket closed: {:?}", frame);
                if !inner.terminated.load(Ordering::SeqCst) {
                    inner.terminate(Some("WebSocket closed by server".into())).await;
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(client = inner.id, "WebSocket error: {}", e);
                inner.terminate(Some(format!("WebSocket error: {e}"))).await;
                return;
            }
        }
    }
    inner.terminate(Some("WebSocket stream ended".into())).await;
}
