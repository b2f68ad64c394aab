//! Microphone capture with voice-activity gating
//!
//! A dedicated OS thread owns the input device, reads fixed-size blocks and
//! classifies each one as voice or silence before broadcasting it.

use crate::audio::{self, AudioFrame, BYTES_PER_SAMPLE, CAPTURE_SAMPLE_RATE};
use crate::device::{AudioBackend, AudioInput, DeviceError, StreamSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;
/// Processing a block slower than this counts as a slow block.
const SLOW_BLOCK: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Recording: {0}")]
    Device(#[from] DeviceError),

    #[error("Recording: capture thread failed to start: {0}")]
    Spawn(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Named VAD/block-size settings for different acoustic environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePreset {
    /// Phone held to the ear or on a desk.
    #[default]
    Handheld,
    /// Noisy cabin; larger blocks and a higher threshold.
    Vehicle,
}

impl CapturePreset {
    pub fn frame_bytes(self) -> usize {
        match self {
            CapturePreset::Handheld => 1024 * BYTES_PER_SAMPLE,
            CapturePreset::Vehicle => 2048 * BYTES_PER_SAMPLE,
        }
    }

    pub fn threshold(self) -> f64 {
        match self {
            CapturePreset::Handheld => 100.0,
            CapturePreset::Vehicle => 150.0,
        }
    }

    pub fn hangover(self) -> u32 {
        15
    }
}

impl FromStr for CapturePreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "handheld" | "phone" => Ok(CapturePreset::Handheld),
            "vehicle" | "car" => Ok(CapturePreset::Vehicle),
            other => Err(format!("unknown capture preset: {other}")),
        }
    }
}

/// Capture settings. Unset overrides fall back to the preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub preset: CapturePreset,
    pub sample_rate: u32,
    pub frame_bytes: Option<usize>,
    pub threshold: Option<f64>,
    pub hangover: Option<u32>,
    /// Report every block as voiced. Detection still runs for logging.
    pub force_voice: bool,
    pub stats_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from_preset(CapturePreset::Handheld)
    }
}

impl CaptureConfig {
    pub fn from_preset(preset: CapturePreset) -> Self {
        Self {
            preset,
            sample_rate: CAPTURE_SAMPLE_RATE,
            frame_bytes: None,
            threshold: None,
            hangover: None,
            force_voice: false,
            stats_interval_ms: 5000,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes.unwrap_or_else(|| self.preset.frame_bytes())
    }

    pub fn threshold(&self) -> f64 {
        self.threshold.unwrap_or_else(|| self.preset.threshold())
    }

    pub fn hangover(&self) -> u32 {
        self.hangover.unwrap_or_else(|| self.preset.hangover())
    }

    pub fn stream_spec(&self) -> StreamSpec {
        StreamSpec::mono(self.sample_rate, self.frame_bytes())
    }
}

/// Energy VAD with a hangover.
///
/// A block is voiced when its RMS exceeds the threshold. After a voiced
/// block, the next `hangover` silent blocks are still voiced. Silence before
/// any voice is unvoiced.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f64,
    hangover: u32,
    hangover_counter: u32,
    last_rms: f64,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, hangover: u32) -> Self {
        Self {
            threshold,
            hangover,
            hangover_counter: 0,
            last_rms: 0.0,
        }
    }

    pub fn detect(&mut self, block: &[u8]) -> bool {
        let samples = audio::bytes_to_samples(block);
        if samples.is_empty() {
            warn!("No audio samples in block");
            return false;
        }
        self.last_rms = audio::rms(&samples);

        if self.last_rms > self.threshold {
            self.hangover_counter = self.hangover;
            true
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            true
        } else {
            false
        }
    }

    pub fn last_rms(&self) -> f64 {
        self.last_rms
    }

    pub fn reset(&mut self) {
        self.hangover_counter = 0;
        self.last_rms = 0.0;
    }
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame { frame: AudioFrame, is_voice: bool },
    /// Reported once; the message carries the `"Recording: "` prefix.
    Error(String),
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub blocks: u64,
    pub voiced_blocks: u64,
    pub slow_blocks: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    voiced_blocks: AtomicU64,
    slow_blocks: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            blocks: self.blocks.load(Ordering::Relaxed),
            voiced_blocks: self.voiced_blocks.load(Ordering::Relaxed),
            slow_blocks: self.slow_blocks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.blocks.store(0, Ordering::Relaxed);
        self.voiced_blocks.store(0, Ordering::Relaxed);
        self.slow_blocks.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Owns the microphone while running.
pub struct CaptureEngine {
    config: CaptureConfig,
    backend: Arc<dyn AudioBackend>,
    events: broadcast::Sender<CaptureEvent>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureEngine {
    pub fn new(config: CaptureConfig, backend: Arc<dyn AudioBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            backend,
            events,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            thread: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Open the input device and start the capture thread.
    ///
    /// Returns once the device is open. Starting a running engine is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Reap a thread that stopped on its own after a read failure.
        if let Some(old) = thread.take() {
            let _ = old.join();
        }

        self.counters.reset();
        self.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let worker = Worker {
            config: self.config.clone(),
            backend: self.backend.clone(),
            events: self.events.clone(),
            running: self.running.clone(),
            counters: self.counters.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("livecall-capture".into())
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                CaptureError::Spawn(e.to_string())
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DeviceError::Open("capture thread exited".into())));

        match opened {
            Ok(()) => {
                info!(
                    chunk_bytes = self.config.frame_bytes(),
                    threshold = self.config.threshold(),
                    hangover = self.config.hangover(),
                    force_voice = self.config.force_voice,
                    "Audio recording started"
                );
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                let err = CaptureError::Device(e);
                error!("{}", err);
                let _ = self.events.send(CaptureEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stop the capture thread and release the device. Idempotent.
    pub fn stop(&self) {
        let handle = {
            let mut thread = self.thread.lock();
            self.running.store(false, Ordering::SeqCst);
            thread.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
            debug!("Audio recording stopped");
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    config: CaptureConfig,
    backend: Arc<dyn AudioBackend>,
    events: broadcast::Sender<CaptureEvent>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(self, ready: std::sync::mpsc::Sender<std::result::Result<(), DeviceError>>) {
        let input = match self.backend.open_input(self.config.stream_spec()) {
            Ok(input) => {
                let _ = ready.send(Ok(()));
                input
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        self.capture_loop(input);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(CaptureEvent::Stopped);
    }

    fn capture_loop(&self, mut input: Box<dyn AudioInput>) {
        let mut vad = VoiceActivityDetector::new(self.config.threshold(), self.config.hangover());
        let mut buf = vec![0u8; self.config.frame_bytes()];
        let stats_interval = Duration::from_millis(self.config.stats_interval_ms.max(1));
        let mut last_stats = Instant::now();
        let mut blocks_at_last_stats = 0u64;

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = input.read(&mut buf) {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                // A read interrupted by stop() is not worth reporting.
                if self.running.load(Ordering::SeqCst) {
                    let msg = format!("Recording: {e}");
                    error!("{}", msg);
                    let _ = self.events.send(CaptureEvent::Error(msg));
                }
                break;
            }
            let started = Instant::now();

            let detected = vad.detect(&buf);
            let is_voice = self.config.force_voice || detected;

            let blocks = self.counters.blocks.fetch_add(1, Ordering::Relaxed);
            if is_voice {
                self.counters.voiced_blocks.fetch_add(1, Ordering::Relaxed);
            }
            if blocks % 200 == 0 {
                debug!(
                    rms = vad.last_rms() as i64,
                    threshold = self.config.threshold() as i64,
                    forced = self.config.force_voice,
                    "Audio levels"
                );
            }

            let frame = AudioFrame::new(buf.clone());
            let _ = self.events.send(CaptureEvent::Frame { frame, is_voice });

            if started.elapsed() > SLOW_BLOCK {
                self.counters.slow_blocks.fetch_add(1, Ordering::Relaxed);
            }

            let elapsed = last_stats.elapsed();
            if elapsed >= stats_interval {
                let stats = self.counters.snapshot();
                let rate = (stats.blocks - blocks_at_last_stats) as f64 / elapsed.as_secs_f64();
                info!(
                    blocks_per_sec = %format!("{rate:.1}"),
                    slow = stats.slow_blocks,
                    errors = stats.errors,
                    "Capture stats"
                );
                blocks_at_last_stats = stats.blocks;
                last_stats = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AudioOutput, AudioRoute, NullOutput};
    use std::collections::VecDeque;

    fn block(amplitude: i16, samples: usize) -> Vec<u8> {
        let s: Vec<i16> = (0..samples)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        audio::samples_to_bytes(&s)
    }

    #[test]
    fn test_vad_hangover() {
        let hangover = 15;
        let mut vad = VoiceActivityDetector::new(100.0, hangover);
        let loud = block(1000, 1024);
        let quiet = block(10, 1024);

        assert!(!vad.detect(&quiet), "silence before any voice is unvoiced");
        assert!(vad.detect(&loud));
        for i in 0..hangover {
            assert!(vad.detect(&quiet), "silent block {} should still be voiced", i + 1);
        }
        assert!(!vad.detect(&quiet), "block hangover+1 is silent");

        // Voice re-arms the full hangover.
        assert!(vad.detect(&loud));
        assert!(vad.detect(&quiet));
    }

    #[test]
    fn test_vad_threshold_is_strict() {
        let mut vad = VoiceActivityDetector::new(100.0, 0);
        assert!(!vad.detect(&block(100, 64)));
        assert!(vad.detect(&block(101, 64)));
        assert!(!vad.detect(&[]));
    }

    #[test]
    fn test_presets() {
        let handheld = CaptureConfig::from_preset(CapturePreset::Handheld);
        assert_eq!(handheld.frame_bytes(), 2048);
        assert_eq!(handheld.threshold(), 100.0);
        assert_eq!(handheld.hangover(), 15);

        let mut vehicle = CaptureConfig::from_preset(CapturePreset::Vehicle);
        assert_eq!(vehicle.frame_bytes(), 4096);
        assert_eq!(vehicle.threshold(), 150.0);
        vehicle.threshold = Some(80.0);
        assert_eq!(vehicle.threshold(), 80.0);

        assert_eq!("car".parse::<CapturePreset>().unwrap(), CapturePreset::Vehicle);
        assert!("boat".parse::<CapturePreset>().is_err());
    }

    struct ScriptedInput {
        blocks: VecDeque<Vec<u8>>,
    }

    impl AudioInput for ScriptedInput {
        fn read(&mut self, buf: &mut [u8]) -> crate::device::Result<()> {
            match self.blocks.pop_front() {
                Some(b) => {
                    buf.copy_from_slice(&b);
                    Ok(())
                }
                None => Err(DeviceError::Read("device unplugged".into())),
            }
        }
    }

    struct ScriptedBackend {
        blocks: Mutex<Option<VecDeque<Vec<u8>>>>,
        fail_open: bool,
    }

    impl AudioBackend for ScriptedBackend {
        fn open_input(&self, _spec: StreamSpec) -> crate::device::Result<Box<dyn AudioInput>> {
            if self.fail_open {
                return Err(DeviceError::Open("no microphone".into()));
            }
            let blocks = self.blocks.lock().take().unwrap_or_default();
            Ok(Box::new(ScriptedInput { blocks }))
        }

        fn open_output(&self, _spec: StreamSpec) -> crate::device::Result<Box<dyn AudioOutput>> {
            Ok(Box::new(NullOutput::default()))
        }

        fn set_route(&self, _route: AudioRoute) -> crate::device::Result<()> {
            Ok(())
        }
    }

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            frame_bytes: Some(64),
            hangover: Some(1),
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn test_engine_emits_frames_then_error_then_stopped() {
        let blocks: VecDeque<Vec<u8>> = vec![
            block(10, 32),
            block(1000, 32),
            block(10, 32),
            block(10, 32),
        ]
        .into();
        let backend = Arc::new(ScriptedBackend {
            blocks: Mutex::new(Some(blocks)),
            fail_open: false,
        });
        let engine = CaptureEngine::new(small_config(), backend);
        let mut rx = engine.subscribe();
        engine.start().unwrap();

        let mut voicing = Vec::new();
        let mut errors = Vec::new();
        loop {
            match rx.blocking_recv().unwrap() {
                CaptureEvent::Frame { frame, is_voice } => {
                    assert_eq!(frame.len(), 64);
                    voicing.push(is_voice);
                }
                CaptureEvent::Error(e) => errors.push(e),
                CaptureEvent::Stopped => break,
            }
        }

        assert_eq!(voicing, vec![false, true, true, false]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Recording: "));
        assert!(!engine.is_running());
        let stats = engine.stats();
        assert_eq!(stats.blocks, 4);
        assert_eq!(stats.voiced_blocks, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_force_voice_reports_everything_voiced() {
        let blocks: VecDeque<Vec<u8>> = vec![block(0, 32), block(0, 32)].into();
        let backend = Arc::new(ScriptedBackend {
            blocks: Mutex::new(Some(blocks)),
            fail_open: false,
        });
        let config = CaptureConfig {
            force_voice: true,
            ..small_config()
        };
        let engine = CaptureEngine::new(config, backend);
        let mut rx = engine.subscribe();
        engine.start().unwrap();

        let mut voicing = Vec::new();
        while let Ok(ev) = rx.blocking_recv() {
            match ev {
                CaptureEvent::Frame { is_voice, .. } => voicing.push(is_voice),
                CaptureEvent::Stopped => break,
                CaptureEvent::Error(_) => {}
            }
        }
        assert_eq!(voicing, vec![true, true]);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let backend = Arc::new(ScriptedBackend {
            blocks: Mutex::new(None),
            fail_open: true,
        });
        let engine = CaptureEngine::new(small_config(), backend);
        let mut rx = engine.subscribe();

        let err = engine.start().unwrap_err();
        assert!(err.to_string().starts_with("Recording: "));
        assert!(!engine.is_running());
        match rx.try_recv().unwrap() {
            CaptureEvent::Error(msg) => assert!(msg.contains("no microphone")),
            other => panic!("unexpected event {other:?}"),
        }

        engine.stop();
    }
}
