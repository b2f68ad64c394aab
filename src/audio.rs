//! PCM frame utilities
//!
//! Everything that moves through the engine is 16-bit signed little-endian
//! PCM. Capture runs at 16 kHz mono; playback runs at whatever rate the
//! server negotiated for the call (24 kHz unless told otherwise).

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, error};

/// Sample rate used for microphone capture and sent in `call_connect`.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Playback rate assumed until the server negotiates one.
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Default frame size in bytes (1024 mono samples).
pub const DEFAULT_FRAME_BYTES: usize = 2048;
/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// One immutable block of mono S16LE audio.
///
/// Cloning is cheap; the payload is reference counted so a frame can be
/// fanned out to several subscribers without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
}

impl AudioFrame {
    /// Wrap raw PCM bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Build a frame from 16-bit samples.
    pub fn from_samples(samples: &[i16]) -> Self {
        Self::new(samples_to_bytes(samples))
    }

    /// A frame of `len` zero bytes.
    pub fn silence(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate the samples. A trailing odd byte is ignored.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
    }

    /// Root-mean-square amplitude of the frame.
    pub fn rms(&self) -> f64 {
        rms_iter(self.samples())
    }

    /// Wall-clock duration of this frame when played mono at `sample_rate`.
    pub fn duration(&self, sample_rate: u32) -> Duration {
        frame_duration(self.len(), sample_rate)
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

/// Duration of `frame_bytes` of mono S16LE at `sample_rate`.
///
/// Returns zero for a zero sample rate.
pub fn frame_duration(frame_bytes: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let samples = (frame_bytes / BYTES_PER_SAMPLE) as u64;
    Duration::from_nanos(samples * 1_000_000_000 / sample_rate as u64)
}

/// Convert little-endian bytes to samples.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Convert samples to little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// `sqrt(mean(sample^2))`, zero for an empty block.
pub fn rms(samples: &[i16]) -> f64 {
    rms_iter(samples.iter().copied())
}

fn rms_iter(samples: impl Iterator<Item = i16>) -> f64 {
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for s in samples {
        let v = s as f64;
        sum += v * v;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

/// Linear-interpolation resampler for interleaved S16LE.
///
/// Invalid parameters are logged and the input comes back unchanged.
pub fn resample(data: &[u8], from_rate: u32, to_rate: u32, channels: u16) -> Vec<u8> {
    if from_rate == 0 || to_rate == 0 || channels == 0 {
        error!(
            from_rate,
            to_rate, channels, "Invalid resample parameters, returning input unchanged"
        );
        return data.to_vec();
    }
    if from_rate == to_rate {
        return data.to_vec();
    }

    let channels = channels as usize;
    let frame_width = BYTES_PER_SAMPLE * channels;
    let in_frames = data.len() / frame_width;
    if in_frames == 0 {
        error!(len = data.len(), channels, "No samples to resample");
        return data.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    if !ratio.is_finite() || ratio <= 0.0 {
        error!(ratio, "Invalid resample ratio");
        return data.to_vec();
    }

    let out_frames = (in_frames as f64 / ratio) as usize;
    if out_frames == 0 {
        error!(in_frames, ratio, "Resample would produce no output");
        return data.to_vec();
    }

    debug!(in_frames, out_frames, from_rate, to_rate, "Resampling");

    let sample_at = |frame: usize, ch: usize| -> f64 {
        let i = (frame * channels + ch) * BYTES_PER_SAMPLE;
        i16::from_le_bytes([data[i], data[i + 1]]) as f64
    };

    let mut out = Vec::with_capacity(out_frames * frame_width);
    for i in 0..out_frames {
        let pos = i as f64 * ratio;
        let base = (pos.floor() as usize).min(in_frames - 1);
        let next = (base + 1).min(in_frames - 1);
        let frac = pos - base as f64;
        for ch in 0..channels {
            let a = sample_at(base, ch);
            let b = sample_at(next, ch);
            let v = (a + (b - a) * frac).round();
            let s = v.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
    out
}

/// Average interleaved stereo S16LE down to mono.
pub fn downmix_to_mono(stereo: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stereo.len() / 2);
    for pair in stereo.chunks_exact(BYTES_PER_SAMPLE * 2) {
        let left = i16::from_le_bytes([pair[0], pair[1]]) as i32;
        let right = i16::from_le_bytes([pair[2], pair[3]]) as i32;
        let mono = ((left + right) / 2) as i16;
        out.extend_from_slice(&mono.to_le_bytes());
    }
    out
}

/// Cut `data` into frames of exactly `frame_bytes`, zero-padding the tail.
pub fn split_into_frames(data: &[u8], frame_bytes: usize) -> Vec<AudioFrame> {
    if frame_bytes == 0 {
        return Vec::new();
    }
    data.chunks(frame_bytes)
        .map(|chunk| {
            if chunk.len() == frame_bytes {
                AudioFrame::new(chunk.to_vec())
            } else {
                let mut padded = vec![0u8; frame_bytes];
                padded[..chunk.len()].copy_from_slice(chunk);
                AudioFrame::new(padded)
            }
        })
        .collect()
}
