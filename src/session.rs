//! One voice call at a time, end to end
//!
//! [`VoiceSession`] is the surface a UI talks to. `connect` takes a warm
//! connection from the contact's pool, starts playback at the negotiated rate
//! and capture at 16 kHz, then wires them together:
//!
//! ```text
//! capture ──frames──▶ uplink ──send_audio──▶ ProtocolClient
//! ProtocolClient ──recv_audio──▶ downlink ──enqueue──▶ playback
//! ProtocolClient ──events──▶ status / teardown
//! ```

use crate::audio::AudioFrame;
use crate::capture::{CaptureEngine, CaptureError, CaptureEvent, CaptureStats};
use crate::client::{ClientEvent, ProtocolClient};
use crate::config::EngineConfig;
use crate::credentials::TokenProvider;
use crate::device::{AudioBackend, AudioRoute, DeviceError};
use crate::events::{
    EngineEvent, STATUS_CONNECTED, STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_DISCONNECTING,
    STATUS_READY,
};
use crate::playback::{PlaybackEngine, PlaybackError, PlaybackEvent, PlaybackStats};
use crate::pool::{ConnectionPool, Connector, PoolEntry, PoolRegistry};
use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Timeout: Failed to connect, timed out waiting for a ready connection")]
    PoolTimeout,

    #[error("A call is already active")]
    AlreadyActive,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("Audio route: {0}")]
    Route(#[from] DeviceError),

    #[error("Engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Polls for a ready pooled connection before giving up.
    pub acquire_attempts: u32,
    pub acquire_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acquire_attempts: 30,
            acquire_interval_ms: 500,
        }
    }
}

struct ActiveCall<C: Connector<Conn = ProtocolClient>> {
    contact: String,
    pool: Arc<ConnectionPool<C>>,
    entry: Arc<PoolEntry<ProtocolClient>>,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionInner<C: Connector<Conn = ProtocolClient>> {
    config: SessionConfig,
    registry: Arc<PoolRegistry<C>>,
    backend: Arc<dyn AudioBackend>,
    capture: Arc<CaptureEngine>,
    playback: Arc<PlaybackEngine>,
    events: broadcast::Sender<EngineEvent>,
    muted: AtomicBool,
    active: Mutex<Option<ActiveCall<C>>>,
}

/// Owns the audio engines and the current call.
pub struct VoiceSession<C: Connector<Conn = ProtocolClient>> {
    inner: Arc<SessionInner<C>>,
}

impl<C: Connector<Conn = ProtocolClient>> Clone for VoiceSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector<Conn = ProtocolClient>> VoiceSession<C> {
    /// The registry carries the connector its pools build connections with.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<PoolRegistry<C>>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                config: config.session.clone(),
                registry,
                capture: Arc::new(CaptureEngine::new(config.capture.clone(), backend.clone())),
                playback: Arc::new(PlaybackEngine::with_default_rate(
                    config.playback.clone(),
                    backend.clone(),
                )),
                backend,
                events,
                muted: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<PoolRegistry<C>> {
        &self.inner.registry
    }

    pub async fn is_active(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capture.is_running()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.inner.capture.stats()
    }

    pub fn playback_stats(&self) -> PlaybackStats {
        self.inner.playback.stats()
    }

    /// Start a call with `contact` (e.g. `Miles-EN`).
    pub async fn connect(&self, contact: &str, tokens: Arc<dyn TokenProvider>) -> Result<()> {
        let inner = &self.inner;
        let mut active = inner.active.lock().await;
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        inner.emit(EngineEvent::status(STATUS_CONNECTING));

        let pool = inner.registry.get_or_create(contact);
        pool.initialize(tokens);

        let Some(entry) = inner.acquire(&pool).await else {
            let err = SessionError::PoolTimeout;
            error!(contact, status = ?pool.status(), "{}", err);
            inner.emit(EngineEvent::Error(err.to_string()));
            inner.emit(EngineEvent::status(STATUS_DISCONNECTED));
            return Err(err);
        };
        inner.emit(EngineEvent::InitProgress(100));
        inner.emit(EngineEvent::status(STATUS_READY));

        let client = entry.connection().clone();
        if let Err(e) = inner.start_audio(&client).await {
            error!(contact, "Failed to start audio: {}", e);
            inner.emit(EngineEvent::Error(e.to_string()));
            inner.stop_audio().await;
            pool.remove_connection(&entry).await;
            inner.emit(EngineEvent::status(STATUS_DISCONNECTED));
            return Err(e);
        }

        let tasks = inner.spawn_pumps(client.clone());
        info!(
            contact,
            character = %client.character(),
            seq = entry.seq(),
            client = client.id(),
            sample_rate = client.server_sample_rate(),
            "Call started"
        );
        *active = Some(ActiveCall {
            contact: contact.to_string(),
            pool,
            entry,
            tasks,
        });
        inner.emit(EngineEvent::status(STATUS_CONNECTED));
        Ok(())
    }

    /// End the current call. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.teardown(None).await;
    }

    /// Stop or resume capture. The call stays up while muted.
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        if self.inner.muted.swap(muted, Ordering::SeqCst) == muted {
            return Ok(());
        }
        info!(muted, "Microphone mute changed");
        if !self.is_active().await {
            return Ok(());
        }
        let capture = self.inner.capture.clone();
        if muted {
            tokio::task::spawn_blocking(move || capture.stop()).await?;
        } else {
            tokio::task::spawn_blocking(move || capture.start()).await??;
        }
        Ok(())
    }

    pub fn set_audio_route(&self, route: AudioRoute) -> Result<()> {
        self.inner.backend.set_route(route)?;
        info!(%route, "Audio route changed");
        Ok(())
    }

    /// End the call and shut down every pool.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.registry.shutdown_all().await;
    }
}

impl<C: Connector<Conn = ProtocolClient>> SessionInner<C> {
    fn emit(&self, event: EngineEvent) {
        debug!(%event, "Engine event");
        let _ = self.events.send(event);
    }

    async fn acquire(&self, pool: &ConnectionPool<C>) -> Option<Arc<PoolEntry<ProtocolClient>>> {
        let attempts = self.config.acquire_attempts.max(1);
        let interval = Duration::from_millis(self.config.acquire_interval_ms);
        for attempt in 1..=attempts {
            if let Some(entry) = pool.get_best_available_connection(pool.key()) {
                return Some(entry);
            }
            self.emit(EngineEvent::InitProgress((attempt * 100 / attempts).min(99) as u8));
            debug!(attempt, ready = pool.ready_count(), "Waiting for a pooled connection");
            tokio::time::sleep(interval).await;
        }
        None
    }

    async fn start_audio(&self, client: &ProtocolClient) -> Result<()> {
        let rate = client.server_sample_rate();
        let muted = self.muted.load(Ordering::SeqCst);
        let capture = self.capture.clone();
        let playback = self.playback.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            playback.set_sample_rate(rate)?;
            playback.start()?;
            if !muted {
                capture.start()?;
            }
            Ok(())
        })
        .await?
    }

    async fn stop_audio(&self) {
        let capture = self.capture.clone();
        let playback = self.playback.clone();
        let stopped = tokio::task::spawn_blocking(move || {
            capture.stop();
            playback.stop();
        })
        .await;
        if let Err(e) = stopped {
            error!("Failed to stop audio engines: {}", e);
        }
    }

    fn spawn_pumps(self: &Arc<Self>, client: Arc<ProtocolClient>) -> Vec<JoinHandle<()>> {
        let frames = self.capture.subscribe();
        let playback_events = self.playback.subscribe();
        let client_events = client.subscribe();
        vec![
            tokio::spawn(uplink(self.clone(), client.clone(), frames)),
            tokio::spawn(downlink(self.playback.clone(), client.clone())),
            tokio::spawn(watch_playback(self.clone(), playback_events)),
            tokio::spawn(watch_client(self.clone(), client, client_events)),
        ]
    }

    /// Tear down the active call, or only the call running on client `only_client`.
    async fn teardown(&self, only_client: Option<u64>) {
        let call = {
            let mut active = self.active.lock().await;
            let matches = match (active.as_ref(), only_client) {
                (Some(call), Some(id)) => call.entry.connection().id() == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return;
            }
            active.take()
        };
        let Some(call) = call else {
            return;
        };

        self.emit(EngineEvent::status(STATUS_DISCONNECTING));
        for task in &call.tasks {
            task.abort();
        }
        self.stop_audio().await;
        call.pool.remove_connection(&call.entry).await;
        info!(contact = %call.contact, seq = call.entry.seq(), "Call ended");
        self.emit(EngineEvent::status(STATUS_DISCONNECTED));
    }
}

async fn uplink<C: Connector<Conn = ProtocolClient>>(
    session: Arc<SessionInner<C>>,
    client: Arc<ProtocolClient>,
    mut frames: broadcast::Receiver<CaptureEvent>,
) {
    let mut last_voice = None;
    loop {
        match frames.recv().await {
            Ok(CaptureEvent::Frame { frame, is_voice }) => {
                if last_voice != Some(is_voice) {
                    last_voice = Some(is_voice);
                    session.emit(EngineEvent::VoiceActivity(is_voice));
                }
                if session.muted.load(Ordering::SeqCst) {
                    continue;
                }
                match client.send_audio(frame.as_bytes()).await {
                    Ok(()) => {}
                    Err(ProtocolError::NoActiveCall | ProtocolError::NotConnected) => {
                        debug!("Dropping capture frame, no call");
                    }
                    Err(e) => warn!("Failed to send audio: {}", e),
                }
                if client.is_closed() {
                    break;
                }
            }
            Ok(CaptureEvent::Error(e)) => session.emit(EngineEvent::Error(e)),
            Ok(CaptureEvent::Stopped) => debug!("Capture stopped"),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Uplink fell behind, dropped capture frames"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn downlink(playback: Arc<PlaybackEngine>, client: Arc<ProtocolClient>) {
    while let Some(chunk) = client.recv_audio().await {
        playback.enqueue(AudioFrame::new(chunk));
    }
    debug!("Downlink ended");
}

async fn watch_playback<C: Connector<Conn = ProtocolClient>>(
    session: Arc<SessionInner<C>>,
    mut events: broadcast::Receiver<PlaybackEvent>,
) {
    loop {
        match events.recv().await {
            Ok(PlaybackEvent::Error(e)) => session.emit(EngineEvent::Error(e)),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

async fn watch_client<C: Connector<Conn = ProtocolClient>>(
    session: Arc<SessionInner<C>>,
    client: Arc<ProtocolClient>,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    let id = client.id();
    if !client.is_closed() {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Error(e)) => session.emit(EngineEvent::Error(e)),
                Ok(ClientEvent::Connected) | Err(RecvError::Lagged(_)) => {}
                Ok(ClientEvent::Disconnected) | Err(RecvError::Closed) => break,
            }
        }
    }
    info!(client = id, "Connection ended, tearing down call");
    // Separate task: teardown aborts this one.
    tokio::spawn(async move { session.teardown(Some(id)).await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio;
    use crate::client::ClientConfig;
    use crate::credentials::TokenStore;
    use crate::device::{AudioInput, AudioOutput, StreamSpec};
    use crate::pool::{PoolConfig, WsConnector};
    use base64::engine::general_purpose;
    use base64::Engine;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    /// In-process stand-in for the voice service.
    struct FakeService {
        addr: SocketAddr,
        received: Arc<parking_lot::Mutex<Vec<Value>>>,
    }

    impl FakeService {
        async fn start(close_on_uplink: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let log = received.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, log.clone(), close_on_uplink));
                }
            });
            Self { addr, received }
        }

        fn client_config(&self) -> ClientConfig {
            ClientConfig {
                ws_url: format!("ws://{}/v1/connect", self.addr),
                ..ClientConfig::default()
            }
        }

        /// Decoded uplink frames of `len` bytes.
        fn uplink_frames(&self, len: usize) -> Vec<Vec<u8>> {
            self.received
                .lock()
                .iter()
                .filter(|m| m["type"] == "audio")
                .filter_map(|m| m["content"]["audio_data"].as_str())
                .filter_map(|d| general_purpose::STANDARD.decode(d).ok())
                .filter(|pcm| pcm.len() == len)
                .collect()
        }

        fn saw(&self, kind: &str) -> bool {
            self.received.lock().iter().any(|m| m["type"] == kind)
        }
    }

    async fn serve(
        stream: TcpStream,
        received: Arc<parking_lot::Mutex<Vec<Value>>>,
        close_on_uplink: bool,
    ) {
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        let init = json!({"type": "initialize", "session_id": "s1", "content": {}});
        if ws.send(Message::Text(init.to_string().into())).await.is_err() {
            return;
        }
        let mut handshake = 0;
        while handshake < 2 {
            match ws.next().await {
                Some(Ok(Message::Text(_))) => handshake += 1,
                Some(Ok(_)) => {}
                _ => return,
            }
        }
        let response = json!({"type": "call_connect_response", "session_id": "s1", "call_id": "c1",
                              "content": {"sample_rate": 24000, "audio_codec": "none"}});
        let _ = ws.send(Message::Text(response.to_string().into())).await;

        let pcm = audio::samples_to_bytes(&[500i16; 32]);
        for _ in 0..4 {
            let msg = json!({"type": "audio", "session_id": "s1", "call_id": "c1",
                             "content": {"audio_data": general_purpose::STANDARD.encode(&pcm)}});
            let _ = ws.send(Message::Text(msg.to_string().into())).await;
        }

        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let Ok(v) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let is_uplink = v["type"] == "audio"
                    && v["content"]["audio_data"].as_str().map(str::len) == Some(88);
                received.lock().push(v);
                if close_on_uplink && is_uplink {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    }

    /// Twenty loud blocks, then background hiss below the VAD threshold,
    /// paced like a real microphone.
    struct ToneInput {
        reads: usize,
    }

    const LOUD: i16 = 1000;
    const HISS: i16 = 20;

    impl AudioInput for ToneInput {
        fn read(&mut self, buf: &mut [u8]) -> crate::device::Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            self.reads += 1;
            let amplitude = if self.reads <= 20 { LOUD } else { HISS };
            let samples: Vec<i16> = (0..buf.len() / 2)
                .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
                .collect();
            buf.copy_from_slice(&audio::samples_to_bytes(&samples));
            Ok(())
        }
    }

    struct CountingOutput(Arc<AtomicUsize>);

    impl AudioOutput for CountingOutput {
        fn play(&mut self) -> crate::device::Result<()> {
            Ok(())
        }

        fn pause(&mut self) -> crate::device::Result<()> {
            Ok(())
        }

        fn write(&mut self, _data: &[u8]) -> crate::device::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestBackend {
        writes: Arc<AtomicUsize>,
        routes: parking_lot::Mutex<Vec<AudioRoute>>,
    }

    impl AudioBackend for TestBackend {
        fn open_input(&self, _spec: StreamSpec) -> crate::device::Result<Box<dyn AudioInput>> {
            Ok(Box::new(ToneInput { reads: 0 }))
        }

        fn open_output(&self, _spec: StreamSpec) -> crate::device::Result<Box<dyn AudioOutput>> {
            Ok(Box::new(CountingOutput(self.writes.clone())))
        }

        fn set_route(&self, route: AudioRoute) -> crate::device::Result<()> {
            self.routes.lock().push(route);
            Ok(())
        }
    }

    fn test_config(client: ClientConfig) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.client = client;
        config.capture.frame_bytes = Some(64);
        config.capture.hangover = Some(0);
        config.playback.frame_bytes = 64;
        config.playback.latency_budget_ms = 0;
        config.pool = PoolConfig {
            target_size: 1,
            maintenance_interval_ms: Some(5),
            stagger_base_ms: 0,
            stagger_jitter_min_ms: 0,
            stagger_jitter_max_ms: 0,
            connect_attempts: 100,
            connect_poll_ms: 5,
            error_backoff_ms: 5,
            ..PoolConfig::default()
        };
        config.session = SessionConfig {
            acquire_attempts: 300,
            acquire_interval_ms: 10,
        };
        config
    }

    fn new_session(
        config: &EngineConfig,
        backend: Arc<TestBackend>,
    ) -> VoiceSession<WsConnector> {
        let connector = Arc::new(WsConnector::new(config.client.clone()));
        let registry = Arc::new(PoolRegistry::new(config.pool.clone(), connector));
        VoiceSession::new(config, registry, backend)
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ev) => out.push(ev),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break out,
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_lifecycle() {
        let service = FakeService::start(false).await;
        let config = test_config(service.client_config());
        let backend = Arc::new(TestBackend::default());
        let session = new_session(&config, backend.clone());
        let mut events = session.subscribe();

        session
            .connect("Miles-EN", Arc::new(TokenStore::with_token("tok")))
            .await
            .unwrap();
        assert!(session.is_active().await);
        assert!(session.is_capturing());

        let seen = drain(&mut events);
        assert!(seen.contains(&EngineEvent::status(STATUS_CONNECTING)));
        let ready = seen.iter().position(|e| *e == EngineEvent::status(STATUS_READY)).unwrap();
        let connected = seen.iter().position(|e| *e == EngineEvent::status(STATUS_CONNECTED)).unwrap();
        assert!(ready < connected);
        assert!(seen.contains(&EngineEvent::InitProgress(100)));

        // Every block goes out as captured, voiced or not.
        let peak = |pcm: &Vec<u8>| {
            audio::bytes_to_samples(pcm)
                .iter()
                .map(|s| s.unsigned_abs())
                .max()
                .unwrap_or(0)
        };
        wait_for(|| {
            let frames = service.uplink_frames(64);
            frames.iter().any(|f| peak(f) == LOUD as u16)
                && frames.iter().any(|f| peak(f) == HISS as u16)
        })
        .await;
        assert!(
            service.uplink_frames(64).iter().all(|f| peak(f) > 0),
            "unvoiced blocks must not be replaced with silence"
        );

        // Server audio reaches the speaker.
        let writes = backend.writes.clone();
        wait_for(move || writes.load(Ordering::SeqCst) > 0).await;

        let seen = drain(&mut events);
        assert!(seen.contains(&EngineEvent::VoiceActivity(true)));
        assert!(seen.contains(&EngineEvent::VoiceActivity(false)));

        session.set_muted(true).await.unwrap();
        assert!(session.is_muted());
        assert!(!session.is_capturing());

        session.set_audio_route(AudioRoute::Speaker).unwrap();
        assert_eq!(*backend.routes.lock(), vec![AudioRoute::Speaker]);

        session.disconnect().await;
        assert!(!session.is_active().await);
        let seen = drain(&mut events);
        assert!(seen.contains(&EngineEvent::status(STATUS_DISCONNECTING)));
        assert_eq!(seen.last(), Some(&EngineEvent::status(STATUS_DISCONNECTED)));
        wait_for(|| service.saw("call_disconnect")).await;

        session.disconnect().await;
        assert!(drain(&mut events).is_empty());

        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_close_tears_down_call() {
        let service = FakeService::start(true).await;
        let config = test_config(service.client_config());
        let session = new_session(&config, Arc::new(TestBackend::default()));
        let mut events = session.subscribe();

        session
            .connect("Miles-EN", Arc::new(TokenStore::with_token("tok")))
            .await
            .unwrap();

        let mut errors = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    EngineEvent::Status(s) if s == STATUS_DISCONNECTED => break,
                    EngineEvent::Error(e) => errors.push(e),
                    _ => {}
                }
            }
        })
        .await
        .expect("call was not torn down");

        assert!(errors.iter().any(|e| e.contains("closed by server")));
        assert!(!session.is_active().await);
        assert!(!session.is_capturing());
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_timeout() {
        // Reserve a port, then free it so nothing is listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = test_config(ClientConfig {
            ws_url: format!("ws://{addr}/v1/connect"),
            ..ClientConfig::default()
        });
        config.session.acquire_attempts = 3;
        let session = new_session(&config, Arc::new(TestBackend::default()));
        let mut events = session.subscribe();

        let result = session
            .connect("Miles-EN", Arc::new(TokenStore::with_token("tok")))
            .await;
        assert!(matches!(result, Err(SessionError::PoolTimeout)));
        assert!(!session.is_active().await);

        let seen = drain(&mut events);
        assert!(seen.contains(&EngineEvent::InitProgress(33)));
        assert!(seen.contains(&EngineEvent::InitProgress(99)));
        assert!(seen
            .iter()
            .any(|e| matches!(e, EngineEvent::Error(msg) if msg.contains("timed out"))));
        assert!(!seen.contains(&EngineEvent::status(STATUS_READY)));
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_connect_is_rejected() {
        let service = FakeService::start(false).await;
        let config = test_config(service.client_config());
        let session = new_session(&config, Arc::new(TestBackend::default()));
        let tokens: Arc<dyn TokenProvider> = Arc::new(TokenStore::with_token("tok"));

        session.connect("Miles-EN", tokens.clone()).await.unwrap();
        assert!(matches!(
            session.connect("Miles-EN", tokens).await,
            Err(SessionError::AlreadyActive)
        ));
        session.shutdown().await;
    }
}
