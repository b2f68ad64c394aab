//! Jitter-buffered playback
//!
//! Inbound speech arrives in bursts. Frames are queued in a bounded
//! [`JitterBuffer`] and written to the output device by a pacing thread at
//! the rate they were recorded, so playback neither races ahead nor drifts.
//!
//! The device is only activated once the buffer holds `min` frames. If the
//! buffer runs dry the device is paused and the buffer pre-fills again,
//! rather than playing silence.

use crate::audio::{self, AudioFrame, DEFAULT_FRAME_BYTES, DEFAULT_PLAYBACK_SAMPLE_RATE};
use crate::device::{AudioBackend, AudioOutput, DeviceError, StreamSpec};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Playback: {0}")]
    Device(#[from] DeviceError),

    #[error("Playback: playback thread failed to start: {0}")]
    Spawn(String),

    #[error("Playback: invalid sample rate {0}")]
    InvalidSampleRate(u32),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Nominal size of one inbound frame, used for pacing.
    pub frame_bytes: usize,
    /// Latency the watermarks are sized for.
    pub latency_budget_ms: u64,
    pub min_floor: usize,
    pub target_floor: usize,
    pub max_floor: usize,
    pub health_interval_ms: u64,
    /// How long the pacing thread sleeps while waiting for pre-fill.
    pub idle_wait_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_bytes: DEFAULT_FRAME_BYTES,
            latency_budget_ms: 200,
            min_floor: 3,
            target_floor: 5,
            max_floor: 10,
            health_interval_ms: 5000,
            idle_wait_ms: 20,
        }
    }
}

impl PlaybackConfig {
    pub fn watermarks(&self, sample_rate: u32) -> Watermarks {
        let frame = audio::frame_duration(self.frame_bytes, sample_rate);
        let n = if frame.is_zero() {
            0
        } else {
            (Duration::from_millis(self.latency_budget_ms).as_nanos() / frame.as_nanos()) as usize
        };
        Watermarks {
            min: self.min_floor.max(n / 3),
            target: self.target_floor.max(n / 2),
            max: self.max_floor.max(n),
        }
    }
}

/// Queue-depth thresholds, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Depth required before the device is activated.
    pub min: usize,
    pub target: usize,
    /// Depth at which the oldest frame is dropped on push.
    pub max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferHealth {
    Starving,
    Filling,
    Healthy,
    Overflowing,
}

impl fmt::Display for BufferHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BufferHealth::Starving => "STARVING",
            BufferHealth::Filling => "FILLING",
            BufferHealth::Healthy => "HEALTHY",
            BufferHealth::Overflowing => "OVERFLOWING",
        };
        f.write_str(s)
    }
}

/// What happened on a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub dropped_oldest: bool,
    /// This push completed pre-fill; the output should be activated.
    pub activate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCounters {
    pub received: u64,
    pub played: u64,
    pub overruns: u64,
    pub underruns: u64,
}

/// Bounded FIFO of frames with pre-fill tracking. Not thread safe.
#[derive(Debug)]
pub struct JitterBuffer {
    frames: VecDeque<AudioFrame>,
    marks: Watermarks,
    started: bool,
    counters: BufferCounters,
}

impl JitterBuffer {
    pub fn new(marks: Watermarks) -> Self {
        Self {
            frames: VecDeque::with_capacity(marks.max),
            marks,
            started: false,
            counters: BufferCounters::default(),
        }
    }

    pub fn push(&mut self, frame: AudioFrame) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        if self.frames.len() >= self.marks.max {
            self.frames.pop_front();
            self.counters.overruns += 1;
            outcome.dropped_oldest = true;
        }
        self.frames.push_back(frame);
        self.counters.received += 1;

        if !self.started && self.frames.len() >= self.marks.min {
            self.started = true;
            outcome.activate = true;
        }
        outcome
    }

    /// Take the next frame. Only yields once pre-fill has completed.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        if !self.started {
            return None;
        }
        let frame = self.frames.pop_front()?;
        self.counters.played += 1;
        if self.frames.len() < self.marks.min {
            self.counters.underruns += 1;
        }
        Some(frame)
    }

    /// Return to pre-filling if the buffer ran dry. True if it did.
    pub fn rearm_if_drained(&mut self) -> bool {
        if self.started && self.frames.is_empty() {
            self.started = false;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.started = false;
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn watermarks(&self) -> Watermarks {
        self.marks
    }

    pub fn counters(&self) -> BufferCounters {
        self.counters
    }

    pub fn health(&self) -> BufferHealth {
        let depth = self.frames.len();
        if depth < self.marks.min {
            BufferHealth::Starving
        } else if depth * 10 > self.marks.max * 8 {
            BufferHealth::Overflowing
        } else if depth >= self.marks.target {
            BufferHealth::Healthy
        } else {
            BufferHealth::Filling
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Pre-fill completed and the device was activated.
    Started,
    /// The buffer ran dry and the device was paused.
    Drained,
    /// Carries the `"Playback: "` prefix.
    Error(String),
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub depth: usize,
    pub received: u64,
    pub played: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub jitter_corrections: u64,
    pub started: bool,
}

struct Shared {
    buffer: Mutex<JitterBuffer>,
    wake: Condvar,
    running: AtomicBool,
    sample_rate: AtomicU32,
    jitter_corrections: AtomicU64,
}

/// Owns the output device while running.
pub struct PlaybackEngine {
    config: PlaybackConfig,
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
    events: broadcast::Sender<PlaybackEvent>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(config: PlaybackConfig, sample_rate: u32, backend: Arc<dyn AudioBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let marks = config.watermarks(sample_rate);
        Self {
            config,
            backend,
            shared: Arc::new(Shared {
                buffer: Mutex::new(JitterBuffer::new(marks)),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
                sample_rate: AtomicU32::new(sample_rate),
                jitter_corrections: AtomicU64::new(0),
            }),
            events,
            thread: Mutex::new(None),
        }
    }

    pub fn with_default_rate(config: PlaybackConfig, backend: Arc<dyn AudioBackend>) -> Self {
        Self::new(config, DEFAULT_PLAYBACK_SAMPLE_RATE, backend)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::SeqCst)
    }

    pub fn watermarks(&self) -> Watermarks {
        self.shared.buffer.lock().watermarks()
    }

    /// Open the output device and start the pacing thread.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(old) = thread.take() {
            let _ = old.join();
        }

        let rate = self.sample_rate();
        if rate == 0 {
            return Err(PlaybackError::InvalidSampleRate(rate));
        }
        let marks = self.config.watermarks(rate);
        *self.shared.buffer.lock() = JitterBuffer::new(marks);
        self.shared.jitter_corrections.store(0, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let pacer = Pacer {
            config: self.config.clone(),
            backend: self.backend.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            sample_rate: rate,
        };
        let handle = std::thread::Builder::new()
            .name("livecall-playback".into())
            .spawn(move || pacer.run(ready_tx))
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                PlaybackError::Spawn(e.to_string())
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DeviceError::Open("playback thread exited".into())));

        match opened {
            Ok(()) => {
                info!(
                    sample_rate = rate,
                    min = marks.min,
                    target = marks.target,
                    max = marks.max,
                    frame_ms = audio::frame_duration(self.config.frame_bytes, rate).as_millis() as u64,
                    "Buffered audio playback started"
                );
                *thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                let err = PlaybackError::Device(e);
                error!("{}", err);
                let _ = self.events.send(PlaybackEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stop the pacing thread, release the device and drop queued audio.
    pub fn stop(&self) {
        let handle = {
            let mut thread = self.thread.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.wake.notify_all();
            thread.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Playback thread panicked");
            }
            debug!("Audio playback stopped");
        }
        self.shared.buffer.lock().clear();
    }

    /// Queue a frame. Never blocks; drops the oldest frame when full.
    /// Frames arriving while stopped are discarded.
    pub fn enqueue(&self, frame: AudioFrame) {
        if !self.is_running() {
            debug!(len = frame.len(), "Playback stopped, dropping frame");
            return;
        }
        let outcome = {
            let mut buffer = self.shared.buffer.lock();
            buffer.push(frame)
        };
        if outcome.dropped_oldest {
            debug!("Buffer overflow, dropped oldest chunk");
        }
        if outcome.activate {
            self.shared.wake.notify_all();
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    pub fn clear(&self) {
        self.shared.buffer.lock().clear();
    }

    /// Change the output rate, restarting the device if it is running.
    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        if rate == 0 {
            return Err(PlaybackError::InvalidSampleRate(rate));
        }
        let current = self.sample_rate();
        if rate == current {
            return Ok(());
        }
        info!(from = current, to = rate, "Updating playback sample rate");
        let was_running = self.is_running();
        if was_running {
            self.stop();
        }
        self.shared.sample_rate.store(rate, Ordering::SeqCst);
        if was_running {
            self.start()?;
        } else {
            *self.shared.buffer.lock() = JitterBuffer::new(self.config.watermarks(rate));
        }
        Ok(())
    }

    pub fn stats(&self) -> PlaybackStats {
        let buffer = self.shared.buffer.lock();
        let c = buffer.counters();
        PlaybackStats {
            depth: buffer.len(),
            received: c.received,
            played: c.played,
            overruns: c.overruns,
            underruns: c.underruns,
            jitter_corrections: self.shared.jitter_corrections.load(Ordering::Relaxed),
            started: buffer.is_started(),
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Pacer {
    config: PlaybackConfig,
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
    events: broadcast::Sender<PlaybackEvent>,
    sample_rate: u32,
}

impl Pacer {
    fn run(self, ready: std::sync::mpsc::Sender<std::result::Result<(), DeviceError>>) {
        let spec = StreamSpec::mono(self.sample_rate, self.config.frame_bytes);
        let output = match self.backend.open_output(spec) {
            Ok(output) => {
                let _ = ready.send(Ok(()));
                output
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        if let Err(e) = self.pace(output) {
            if self.shared.running.load(Ordering::SeqCst) {
                let msg = format!("Playback: {e}");
                error!("{}", msg);
                let _ = self.events.send(PlaybackEvent::Error(msg));
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.events.send(PlaybackEvent::Stopped);
    }

    fn pace(&self, mut output: Box<dyn AudioOutput>) -> std::result::Result<(), DeviceError> {
        let frame_duration = audio::frame_duration(self.config.frame_bytes, self.sample_rate);
        let idle_wait = Duration::from_millis(self.config.idle_wait_ms.max(1));
        let health_interval = Duration::from_millis(self.config.health_interval_ms.max(1));

        let mut active = false;
        let mut deadline = Instant::now();
        let mut last_health = Instant::now();

        while self.shared.running.load(Ordering::SeqCst) {
            let next = {
                let mut buffer = self.shared.buffer.lock();
                if !buffer.is_started() {
                    self.shared.wake.wait_for(&mut buffer, idle_wait);
                    None
                } else {
                    match buffer.pop() {
                        Some(frame) => Some(frame),
                        None => {
                            buffer.rearm_if_drained();
                            None
                        }
                    }
                }
            };

            match next {
                Some(frame) => {
                    if !active {
                        output.play()?;
                        active = true;
                        deadline = Instant::now();
                        info!(depth = self.shared.buffer.lock().len() + 1, "Output started after pre-fill");
                        let _ = self.events.send(PlaybackEvent::Started);
                    }

                    let now = Instant::now();
                    if now < deadline {
                        std::thread::sleep(deadline - now);
                    } else if now - deadline > frame_duration {
                        deadline = now;
                        self.shared.jitter_corrections.fetch_add(1, Ordering::Relaxed);
                        debug!("Corrected playback timing drift");
                    }

                    output.write(frame.as_bytes())?;
                    deadline += frame_duration;
                }
                None if active => {
                    warn!("Buffer completely empty, pausing output for refill");
                    output.pause()?;
                    active = false;
                    let _ = self.events.send(PlaybackEvent::Drained);
                }
                None => {}
            }

            if last_health.elapsed() >= health_interval {
                self.log_health();
                last_health = Instant::now();
            }
        }

        if active {
            let _ = output.pause();
        }
        Ok(())
    }

    fn log_health(&self) {
        let buffer = self.shared.buffer.lock();
        let marks = buffer.watermarks();
        let c = buffer.counters();
        let health_pct = if marks.target == 0 {
            0
        } else {
            buffer.len() * 100 / marks.target
        };
        info!(
            depth = buffer.len(),
            max = marks.max,
            health_pct,
            status = %buffer.health(),
            underruns = c.underruns,
            overruns = c.overruns,
            "Playback buffer"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AudioInput, AudioRoute};

    fn marks(min: usize, target: usize, max: usize) -> Watermarks {
        Watermarks { min, target, max }
    }

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(vec![tag; 4])
    }

    #[test]
    fn test_watermarks_from_latency_budget() {
        let config = PlaybackConfig::default();
        // 2048 bytes at 24 kHz is ~42.7 ms, so n = 4 and every floor wins.
        assert_eq!(config.watermarks(24_000), marks(3, 5, 10));

        let small = PlaybackConfig {
            frame_bytes: 320,
            ..PlaybackConfig::default()
        };
        // 160 samples at 16 kHz is 10 ms, n = 20
        assert_eq!(small.watermarks(16_000), marks(6, 10, 20));
        assert_eq!(config.watermarks(0), marks(3, 5, 10));
    }

    #[test]
    fn test_depth_never_exceeds_max() {
        let mut buf = JitterBuffer::new(marks(3, 5, 10));
        for i in 0..50u8 {
            let outcome = buf.push(frame(i));
            assert!(buf.len() <= 10);
            assert_eq!(outcome.dropped_oldest, i >= 10);
        }
        assert_eq!(buf.counters().overruns, 40);
        // Oldest frames were the ones dropped.
        assert_eq!(buf.pop().unwrap().as_bytes()[0], 40);
    }

    #[test]
    fn test_activation_once_per_fill_cycle() {
        let mut buf = JitterBuffer::new(marks(3, 5, 10));
        assert!(!buf.push(frame(0)).activate);
        assert!(buf.pop().is_none(), "nothing plays during pre-fill");
        assert!(!buf.push(frame(1)).activate);
        assert!(buf.push(frame(2)).activate);
        assert!(!buf.push(frame(3)).activate);

        for _ in 0..4 {
            assert!(buf.pop().is_some());
        }
        assert!(buf.pop().is_none());
        assert!(buf.rearm_if_drained());
        assert!(!buf.is_started());

        // Re-enters pre-fill: no activation until min again.
        assert!(!buf.push(frame(4)).activate);
        assert!(!buf.push(frame(5)).activate);
        assert!(buf.pop().is_none());
        assert!(buf.push(frame(6)).activate);
    }

    #[test]
    fn test_underrun_counting_and_health() {
        let mut buf = JitterBuffer::new(marks(3, 5, 10));
        for i in 0..9 {
            buf.push(frame(i));
        }
        assert_eq!(buf.health(), BufferHealth::Overflowing);
        while buf.len() > 5 {
            buf.pop();
        }
        assert_eq!(buf.health(), BufferHealth::Healthy);
        buf.pop();
        assert_eq!(buf.health(), BufferHealth::Filling);
        buf.pop();
        buf.pop();
        assert_eq!(buf.health(), BufferHealth::Starving);
        assert_eq!(buf.counters().underruns, 1);
        assert_eq!(buf.counters().played, 7);
    }

    #[derive(Default)]
    struct Recording {
        writes: Vec<Instant>,
        plays: usize,
        pauses: usize,
        // Write index that blocks, and for how long.
        stall: Option<(usize, Duration)>,
        fail_writes: bool,
    }

    struct RecordingOutput(Arc<Mutex<Recording>>);

    impl AudioOutput for RecordingOutput {
        fn play(&mut self) -> crate::device::Result<()> {
            self.0.lock().plays += 1;
            Ok(())
        }

        fn pause(&mut self) -> crate::device::Result<()> {
            self.0.lock().pauses += 1;
            Ok(())
        }

        fn write(&mut self, _data: &[u8]) -> crate::device::Result<()> {
            let (index, stall, fail) = {
                let mut rec = self.0.lock();
                rec.writes.push(Instant::now());
                (rec.writes.len() - 1, rec.stall, rec.fail_writes)
            };
            if fail {
                return Err(DeviceError::Write("speaker unplugged".into()));
            }
            if let Some((at, pause)) = stall {
                if at == index {
                    std::thread::sleep(pause);
                }
            }
            Ok(())
        }
    }

    struct RecordingBackend {
        recording: Arc<Mutex<Recording>>,
        fail_open: bool,
    }

    impl AudioBackend for RecordingBackend {
        fn open_input(&self, _spec: StreamSpec) -> crate::device::Result<Box<dyn AudioInput>> {
            Err(DeviceError::Unsupported("input".into()))
        }

        fn open_output(&self, _spec: StreamSpec) -> crate::device::Result<Box<dyn AudioOutput>> {
            if self.fail_open {
                return Err(DeviceError::Open("no speaker".into()));
            }
            Ok(Box::new(RecordingOutput(self.recording.clone())))
        }

        fn set_route(&self, _route: AudioRoute) -> crate::device::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_prefill_and_pacing() {
        let recording = Arc::new(Mutex::new(Recording::default()));
        let backend = Arc::new(RecordingBackend {
            recording: recording.clone(),
            fail_open: false,
        });
        let engine = PlaybackEngine::new(PlaybackConfig::default(), 24_000, backend);
        assert_eq!(engine.watermarks().min, 3);
        engine.start().unwrap();

        let pcm = vec![0u8; 2048];
        engine.enqueue(AudioFrame::new(pcm.clone()));
        engine.enqueue(AudioFrame::new(pcm.clone()));
        std::thread::sleep(Duration::from_millis(100));
        assert!(recording.lock().writes.is_empty(), "no write before the 3rd enqueue");
        assert_eq!(recording.lock().plays, 0);

        for _ in 0..4 {
            engine.enqueue(AudioFrame::new(pcm.clone()));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while recording.lock().pauses == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        engine.stop();

        let rec = recording.lock();
        assert_eq!(rec.writes.len(), 6);
        assert_eq!(rec.plays, 1);
        assert_eq!(rec.pauses, 1);
        for pair in rec.writes.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(35) && gap <= Duration::from_millis(60),
                "write gap {gap:?} out of range"
            );
        }
    }

    #[test]
    fn test_enqueue_while_stopped_is_dropped() {
        let backend = Arc::new(RecordingBackend {
            recording: Arc::new(Mutex::new(Recording::default())),
            fail_open: false,
        });
        let engine = PlaybackEngine::with_default_rate(PlaybackConfig::default(), backend);
        engine.enqueue(frame(1));
        assert_eq!(engine.queue_depth(), 0);
    }

    #[test]
    fn test_open_failure_reports_prefixed_error() {
        let backend = Arc::new(RecordingBackend {
            recording: Arc::new(Mutex::new(Recording::default())),
            fail_open: true,
        });
        let engine = PlaybackEngine::with_default_rate(PlaybackConfig::default(), backend);
        let mut rx = engine.subscribe();
        let err = engine.start().unwrap_err();
        assert!(err.to_string().starts_with("Playback: "));
        assert!(!engine.is_running());
        match rx.try_recv().unwrap() {
            PlaybackEvent::Error(msg) => assert!(msg.contains("no speaker")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_set_sample_rate_restarts() {
        let recording = Arc::new(Mutex::new(Recording::default()));
        let backend = Arc::new(RecordingBackend {
            recording,
            fail_open: false,
        });
        let engine = PlaybackEngine::new(PlaybackConfig::default(), 24_000, backend);
        engine.start().unwrap();
        engine.set_sample_rate(16_000).unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.sample_rate(), 16_000);
        assert!(engine.set_sample_rate(0).is_err());
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_stalled_write_resyncs_clock() {
        let recording = Arc::new(Mutex::new(Recording {
            stall: Some((1, Duration::from_millis(150))),
            ..Recording::default()
        }));
        let backend = Arc::new(RecordingBackend {
            recording: recording.clone(),
            fail_open: false,
        });
        let engine = PlaybackEngine::new(PlaybackConfig::default(), 24_000, backend);
        engine.start().unwrap();

        let pcm = vec![0u8; 2048];
        for _ in 0..8 {
            engine.enqueue(AudioFrame::new(pcm.clone()));
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while recording.lock().pauses == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = engine.stats();
        engine.stop();

        assert!(stats.jitter_corrections >= 1);
        let rec = recording.lock();
        assert_eq!(rec.writes.len(), 8);
        // The write after the stall goes out at once, then pacing resumes
        // from the new clock instead of bursting to catch up.
        let catch_up = rec.writes[2] - rec.writes[1];
        assert!(catch_up >= Duration::from_millis(140), "stall not observed: {catch_up:?}");
        for pair in rec.writes[2..].windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(35) && gap <= Duration::from_millis(60),
                "write gap {gap:?} out of range after resync"
            );
        }
    }

    #[test]
    fn test_write_failure_stops_with_prefixed_error() {
        let recording = Arc::new(Mutex::new(Recording {
            fail_writes: true,
            ..Recording::default()
        }));
        let backend = Arc::new(RecordingBackend {
            recording,
            fail_open: false,
        });
        let engine = PlaybackEngine::new(PlaybackConfig::default(), 24_000, backend);
        let mut rx = engine.subscribe();
        engine.start().unwrap();
        for i in 0..3 {
            engine.enqueue(frame(i));
        }

        let mut error = None;
        loop {
            match rx.blocking_recv().unwrap() {
                PlaybackEvent::Started => {}
                PlaybackEvent::Error(msg) => error = Some(msg),
                PlaybackEvent::Stopped => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        let msg = error.expect("error before Stopped");
        assert!(msg.starts_with("Playback: "), "{msg}");
        assert!(msg.contains("speaker unplugged"));
        assert!(!engine.is_running());
        engine.stop();
    }
}
