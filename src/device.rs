//! Audio device layer
//!
//! The engines never talk to an OS audio API directly. They ask an
//! [`AudioBackend`] to open an input or output stream on their own thread
//! and then do blocking reads/writes on it, which is how PulseAudio's simple
//! API wants to be driven.
//!
//! Backends shipped here:
//! - [`pulse::PulseBackend`] (feature `pulse`): microphone and speaker via PulseAudio
//! - [`FileBackend`]: WAV file as the microphone, output discarded

use crate::audio::{self, BYTES_PER_SAMPLE};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Errors raised by audio devices.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("End of input stream")]
    EndOfStream,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Format of a stream requested from a backend. Always S16LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u8,
    /// Size of the blocks the engine will read or write.
    pub frame_bytes: usize,
}

impl StreamSpec {
    pub fn mono(sample_rate: u32, frame_bytes: usize) -> Self {
        Self {
            sample_rate,
            channels: 1,
            frame_bytes,
        }
    }
}

/// A blocking source of PCM.
pub trait AudioInput {
    /// Fill `buf` completely, blocking until enough audio is available.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// A blocking sink of PCM.
pub trait AudioOutput {
    /// Begin (or resume) audible output.
    fn play(&mut self) -> Result<()>;
    /// Suspend output; queued audio may still drain.
    fn pause(&mut self) -> Result<()>;
    /// Queue one frame for output.
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// Where audible output should go. The backend decides what that means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AudioRoute {
    #[default]
    Auto,
    Speaker,
    Earpiece,
    WiredHeadset,
    Bluetooth,
}

impl fmt::Display for AudioRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AudioRoute::Auto => "AUTO",
            AudioRoute::Speaker => "SPEAKER",
            AudioRoute::Earpiece => "EARPIECE",
            AudioRoute::WiredHeadset => "WIRED_HEADSET",
            AudioRoute::Bluetooth => "BLUETOOTH",
        };
        f.write_str(s)
    }
}

impl FromStr for AudioRoute {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AUTO" => Ok(AudioRoute::Auto),
            "SPEAKER" => Ok(AudioRoute::Speaker),
            "EARPIECE" => Ok(AudioRoute::Earpiece),
            "WIRED_HEADSET" => Ok(AudioRoute::WiredHeadset),
            "BLUETOOTH" => Ok(AudioRoute::Bluetooth),
            other => Err(DeviceError::Unsupported(format!("audio route {other}"))),
        }
    }
}

/// Opens device streams. Shared between engines, so it must be thread safe;
/// the streams it returns are used only on the thread that opened them.
pub trait AudioBackend: Send + Sync {
    fn open_input(&self, spec: StreamSpec) -> Result<Box<dyn AudioInput>>;
    fn open_output(&self, spec: StreamSpec) -> Result<Box<dyn AudioOutput>>;
    /// Select the output route. Pass-through to the OS; no state machine.
    fn set_route(&self, route: AudioRoute) -> Result<()>;
}

/// Output that drops everything. Pacing is the playback engine's job.
#[derive(Debug, Default)]
pub struct NullOutput {
    written: u64,
}

impl AudioOutput for NullOutput {
    fn play(&mut self) -> Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.written += data.len() as u64;
        Ok(())
    }
}

/// A WAV file played back as if it were a microphone.
///
/// The file is converted to mono at the requested rate up front and served
/// in real time, one block per block duration.
pub struct WavInput {
    pcm: Vec<u8>,
    pos: usize,
    sample_rate: u32,
    next_block_at: Option<Instant>,
}

impl WavInput {
    pub fn open(path: &Path, spec: StreamSpec) -> Result<Self> {
        let mut reader = hound::WavReader::open(path)?;
        let wav = reader.spec();
        if wav.bits_per_sample != 16 || wav.sample_format != hound::SampleFormat::Int {
            return Err(DeviceError::Unsupported(format!(
                "{}-bit {:?} WAV",
                wav.bits_per_sample, wav.sample_format
            )));
        }

        let samples = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut pcm = audio::samples_to_bytes(&samples);
        if wav.channels == 2 {
            pcm = audio::downmix_to_mono(&pcm);
        } else if wav.channels != 1 {
            return Err(DeviceError::Unsupported(format!("{} channels", wav.channels)));
        }
        let pcm = audio::resample(&pcm, wav.sample_rate, spec.sample_rate, 1);

        info!(
            path = %path.display(),
            source_rate = wav.sample_rate,
            channels = wav.channels,
            bytes = pcm.len(),
            "Opened WAV input"
        );

        Ok(Self {
            pcm,
            pos: 0,
            sample_rate: spec.sample_rate,
            next_block_at: None,
        })
    }
}

impl AudioInput for WavInput {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.pos >= self.pcm.len() {
            return Err(DeviceError::EndOfStream);
        }

        let now = Instant::now();
        let due = *self.next_block_at.get_or_insert(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_block_at = Some(due + audio::frame_duration(buf.len(), self.sample_rate));

        let end = (self.pos + buf.len()).min(self.pcm.len());
        let n = end - self.pos;
        buf[..n].copy_from_slice(&self.pcm[self.pos..end]);
        buf[n..].fill(0);
        self.pos = end;
        Ok(())
    }
}

/// Backend that reads the microphone from a WAV file and discards output.
#[derive(Debug, Clone)]
pub struct FileBackend {
    wav: PathBuf,
}

impl FileBackend {
    pub fn new(wav: impl Into<PathBuf>) -> Self {
        Self { wav: wav.into() }
    }
}

impl AudioBackend for FileBackend {
    fn open_input(&self, spec: StreamSpec) -> Result<Box<dyn AudioInput>> {
        Ok(Box::new(WavInput::open(&self.wav, spec)?))
    }

    fn open_output(&self, spec: StreamSpec) -> Result<Box<dyn AudioOutput>> {
        debug!(rate = spec.sample_rate, "Opening null output");
        Ok(Box::new(NullOutput::default()))
    }

    fn set_route(&self, route: AudioRoute) -> Result<()> {
        debug!(%route, "Route change ignored by file backend");
        Ok(())
    }
}

/// How long a block of `spec.frame_bytes` lasts.
pub fn block_duration(spec: &StreamSpec) -> Duration {
    let per_channel = spec.frame_bytes / spec.channels.max(1) as usize;
    audio::frame_duration(per_channel - per_channel % BYTES_PER_SAMPLE, spec.sample_rate)
}

#[cfg(feature = "pulse")]
pub mod pulse {
    //! PulseAudio devices via the simple API.

    use super::{AudioBackend, AudioInput, AudioOutput, AudioRoute, DeviceError, Result, StreamSpec};
    use libpulse_binding::callbacks::ListResult;
    use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
    use libpulse_binding::def::{BufferAttr, Retval};
    use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
    use libpulse_binding::proplist::{properties, Proplist};
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tracing::{error, info, warn};

    /// A PulseAudio source or sink.
    #[derive(Debug, Clone)]
    pub struct PulseDevice {
        pub name: String,
        pub description: String,
        pub sample_rate: u32,
        pub channels: u8,
        /// True for sinks, and for sources that monitor a sink.
        pub is_output: bool,
    }

    /// PulseAudio backend.
    ///
    /// `set_route` picks the sink used for outputs opened afterwards, using
    /// the route → sink map given at construction. Unmapped routes fall back
    /// to the server default sink.
    pub struct PulseBackend {
        app_name: String,
        input_device: Option<String>,
        route_sinks: HashMap<AudioRoute, String>,
        current_sink: Mutex<Option<String>>,
    }

    impl PulseBackend {
        pub fn new(app_name: &str) -> Self {
            Self {
                app_name: app_name.to_string(),
                input_device: None,
                route_sinks: HashMap::new(),
                current_sink: Mutex::new(None),
            }
        }

        pub fn with_input_device(mut self, device: impl Into<String>) -> Self {
            self.input_device = Some(device.into());
            self
        }

        pub fn with_route_sink(mut self, route: AudioRoute, sink: impl Into<String>) -> Self {
            self.route_sinks.insert(route, sink.into());
            self
        }

        fn sample_spec(spec: &StreamSpec) -> Spec {
            Spec {
                format: Format::S16le,
                channels: spec.channels,
                rate: spec.sample_rate,
            }
        }
    }

    impl AudioBackend for PulseBackend {
        fn open_input(&self, spec: StreamSpec) -> Result<Box<dyn AudioInput>> {
            let pa_spec = Self::sample_spec(&spec);
            if !pa_spec.is_valid() {
                return Err(DeviceError::Open(format!("invalid sample spec {spec:?}")));
            }
            let attr = BufferAttr {
                maxlength: u32::MAX,
                tlength: u32::MAX,
                prebuf: u32::MAX,
                minreq: u32::MAX,
                fragsize: spec.frame_bytes as u32,
            };
            let simple = Simple::new(
                None,
                &self.app_name,
                Direction::Record,
                self.input_device.as_deref(),
                "microphone",
                &pa_spec,
                None,
                Some(&attr),
            )
            .map_err(|e| DeviceError::Open(ToString::to_string(&e)))?;

            info!(
                device = self.input_device.as_deref().unwrap_or("default"),
                rate = spec.sample_rate,
                "PulseAudio record stream connected"
            );
            Ok(Box::new(PulseInput { simple }))
        }

        fn open_output(&self, spec: StreamSpec) -> Result<Box<dyn AudioOutput>> {
            let pa_spec = Self::sample_spec(&spec);
            if !pa_spec.is_valid() {
                return Err(DeviceError::Open(format!("invalid sample spec {spec:?}")));
            }
            let sink = self.current_sink.lock().clone();
            let simple = Simple::new(
                None,
                &self.app_name,
                Direction::Playback,
                sink.as_deref(),
                "voice",
                &pa_spec,
                None,
                None,
            )
            .map_err(|e| DeviceError::Open(ToString::to_string(&e)))?;

            info!(
                sink = sink.as_deref().unwrap_or("default"),
                rate = spec.sample_rate,
                "PulseAudio playback stream connected"
            );
            Ok(Box::new(PulseOutput { simple }))
        }

        fn set_route(&self, route: AudioRoute) -> Result<()> {
            let sink = match route {
                AudioRoute::Auto => None,
                other => match self.route_sinks.get(&other) {
                    Some(sink) => Some(sink.clone()),
                    None => {
                        warn!(%other, "No sink mapped for route, using default");
                        None
                    }
                },
            };
            info!(%route, sink = sink.as_deref().unwrap_or("default"), "Audio route selected");
            *self.current_sink.lock() = sink;
            Ok(())
        }
    }

    struct PulseInput {
        simple: Simple,
    }

    impl AudioInput for PulseInput {
        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            self.simple
                .read(buf)
                .map_err(|e| DeviceError::Read(ToString::to_string(&e)))
        }
    }

    struct PulseOutput {
        simple: Simple,
    }

    impl AudioOutput for PulseOutput {
        fn play(&mut self) -> Result<()> {
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            self.simple
                .drain()
                .map_err(|e| DeviceError::Write(ToString::to_string(&e)))
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.simple
                .write(data)
                .map_err(|e| DeviceError::Write(ToString::to_string(&e)))
        }
    }

    /// Enumerate sources and sinks known to the PulseAudio server.
    pub fn list_devices() -> anyhow::Result<Vec<PulseDevice>> {
        let devices = Arc::new(Mutex::new(Vec::new()));

        let mut proplist =
            Proplist::new().ok_or_else(|| anyhow::anyhow!("Failed to create proplist"))?;
        proplist
            .set_str(properties::APPLICATION_NAME, "livecall-device-lister")
            .map_err(|_| anyhow::anyhow!("Failed to set application name"))?;

        let mut mainloop =
            Mainloop::new().ok_or_else(|| anyhow::anyhow!("Failed to create mainloop"))?;
        let mut context = Context::new_with_proplist(&mainloop, "livecall-context", &proplist)
            .ok_or_else(|| anyhow::anyhow!("Failed to create context"))?;
        context.connect(None, ContextFlagSet::NOFLAGS, None)?;

        loop {
            match mainloop.iterate(true) {
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    anyhow::bail!("Mainloop iterate failed");
                }
                IterateResult::Success(_) => {}
            }
            match context.get_state() {
                ContextState::Ready => break,
                ContextState::Failed | ContextState::Terminated => {
                    anyhow::bail!("PulseAudio connection failed");
                }
                _ => {}
            }
        }

        let pending = Arc::new(Mutex::new(2u8));
        let introspector = context.introspect();

        let (list, left) = (devices.clone(), pending.clone());
        let _sources = introspector.get_source_info_list(move |result| match result {
            ListResult::Item(info) => {
                if let (Some(name), Some(description)) = (&info.name, &info.description) {
                    list.lock().push(PulseDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        is_output: info.monitor_of_sink.is_some(),
                    });
                }
            }
            ListResult::End => *left.lock() -= 1,
            ListResult::Error => {
                error!("Error listing sources");
                *left.lock() -= 1;
            }
        });

        let (list, left) = (devices.clone(), pending.clone());
        let _sinks = introspector.get_sink_info_list(move |result| match result {
            ListResult::Item(info) => {
                if let (Some(name), Some(description)) = (&info.name, &info.description) {
                    list.lock().push(PulseDevice {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        is_output: true,
                    });
                }
            }
            ListResult::End => *left.lock() -= 1,
            ListResult::Error => {
                error!("Error listing sinks");
                *left.lock() -= 1;
            }
        });

        while *pending.lock() > 0 {
            match mainloop.iterate(true) {
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    anyhow::bail!("Mainloop iterate failed");
                }
                IterateResult::Success(_) => {}
            }
        }

        context.disconnect();
        mainloop.quit(Retval(0));

        let list = devices.lock().clone();
        Ok(list)
    }
}
