use anyhow::Result;
use livecall::audio::{self, DEFAULT_PLAYBACK_SAMPLE_RATE};
use livecall::capture::{CaptureConfig, CaptureEngine, CaptureEvent};
use livecall::device::pulse::{list_devices, PulseBackend};
use livecall::playback::{PlaybackConfig, PlaybackEngine};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

const CAPTURE_SECONDS: u64 = 3;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Available audio devices:");
    match list_devices() {
        Ok(devices) if devices.is_empty() => println!("No audio devices found!"),
        Ok(devices) => {
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "{}: {} ({})",
                    i + 1,
                    device.description,
                    if device.is_output { "Output" } else { "Microphone" }
                );
                println!("   Name: {}", device.name);
                println!(
                    "   Rate: {} Hz, Channels: {}",
                    device.sample_rate, device.channels
                );
            }
        }
        Err(e) => println!("Error listing devices: {}", e),
    }

    let backend = Arc::new(PulseBackend::new("livecall-check"));

    println!("\nCapturing {CAPTURE_SECONDS} seconds from the default microphone, say something...");
    let capture = CaptureEngine::new(CaptureConfig::default(), backend.clone());
    let mut frames = capture.subscribe();
    match capture.start() {
        Ok(()) => {
            let deadline = Instant::now() + Duration::from_secs(CAPTURE_SECONDS);
            let (mut total, mut voiced, mut peak) = (0u32, 0u32, 0f64);
            while Instant::now() < deadline {
                match frames.blocking_recv() {
                    Ok(CaptureEvent::Frame { frame, is_voice }) => {
                        total += 1;
                        voiced += is_voice as u32;
                        peak = peak.max(frame.rms());
                    }
                    Ok(CaptureEvent::Error(e)) => {
                        println!("  ❌ {}", e);
                        break;
                    }
                    Ok(CaptureEvent::Stopped) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => {}
                }
            }
            capture.stop();
            println!("  Blocks: {total}, voiced: {voiced}, peak RMS: {peak:.1}");
            if voiced == 0 {
                println!("  No voice detected; check the input level");
            }
        }
        Err(e) => println!("  ❌ Failed: {}", e),
    }

    println!("\nPlaying a 440 Hz tone...");
    let playback = PlaybackEngine::with_default_rate(PlaybackConfig::default(), backend);
    match playback.start() {
        Ok(()) => {
            let rate = DEFAULT_PLAYBACK_SAMPLE_RATE;
            let tone: Vec<i16> = (0..rate)
                .map(|i| {
                    let t = i as f64 / rate as f64;
                    ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 8000.0) as i16
                })
                .collect();
            let frame_bytes = PlaybackConfig::default().frame_bytes;
            let pace = audio::frame_duration(frame_bytes, rate);
            for frame in audio::split_into_frames(&audio::samples_to_bytes(&tone), frame_bytes) {
                playback.enqueue(frame);
                std::thread::sleep(pace);
            }
            std::thread::sleep(Duration::from_millis(500));
            let stats = playback.stats();
            playback.stop();
            println!("  ✅ Played {} frames, {} underruns", stats.played, stats.underruns);
        }
        Err(e) => println!("  ❌ Failed: {}", e),
    }

    println!("\nAudio device check complete!");
    Ok(())
}
