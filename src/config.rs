//! Engine configuration
//!
//! Every section has working defaults; a TOML file only needs the keys it
//! changes. Environment variables override the file.

use crate::capture::{CaptureConfig, CapturePreset};
use crate::client::ClientConfig;
use crate::playback::PlaybackConfig;
use crate::pool::PoolConfig;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "LIVECALL_CONFIG";
pub const WS_URL_ENV: &str = "LIVECALL_WS_URL";
pub const POOL_SIZE_ENV: &str = "LIVECALL_POOL_SIZE";
pub const CAPTURE_PRESET_ENV: &str = "LIVECALL_CAPTURE_PRESET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading config file");
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Defaults, then the file named by `LIVECALL_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => {
                info!(path = %path, "Loading config");
                Self::from_file(path)?
            }
            _ => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(WS_URL_ENV).filter(|s| !s.is_empty()) {
            self.client.ws_url = url;
        }
        if let Some(size) = lookup(POOL_SIZE_ENV) {
            self.pool.target_size = size.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Env {
                    var: POOL_SIZE_ENV,
                    message: e.to_string(),
                }
            })?;
        }
        if let Some(preset) = lookup(CAPTURE_PRESET_ENV) {
            let preset: CapturePreset = preset
                .parse()
                .map_err(|message| ConfigError::Env {
                    var: CAPTURE_PRESET_ENV,
                    message,
                })?;
            self.capture.preset = preset;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.capture.sample_rate == 0, "capture.sample_rate must be positive"),
            (self.capture.frame_bytes() == 0, "capture.frame_bytes must be positive"),
            (self.playback.frame_bytes == 0, "playback.frame_bytes must be positive"),
            (self.client.capture_sample_rate == 0, "client.capture_sample_rate must be positive"),
            (self.client.receive_queue_capacity == 0, "client.receive_queue_capacity must be positive"),
            (self.pool.target_size == 0, "pool.target_size must be positive"),
            (
                self.pool.stagger_jitter_max_ms < self.pool.stagger_jitter_min_ms,
                "pool.stagger_jitter_max_ms is below stagger_jitter_min_ms",
            ),
            (self.session.acquire_attempts == 0, "session.acquire_attempts must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.target_size, 3);
        assert_eq!(config.session.acquire_attempts, 30);
        assert_eq!(config.capture.frame_bytes(), 2048);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [client]
            ws_url = "ws://localhost:9000/connect"

            [capture]
            preset = "vehicle"

            [pool]
            target_size = 5
            grace_period_ms = 1000

            [pool.aliases]
            kira = "Maya"
            nova = "Miles"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.ws_url, "ws://localhost:9000/connect");
        assert_eq!(config.client.client_name, "RP-Android");
        assert_eq!(config.capture.preset, CapturePreset::Vehicle);
        assert_eq!(config.capture.frame_bytes(), 4096);
        assert_eq!(config.pool.target_size, 5);
        assert_eq!(config.pool.connect_attempts, 100);
        assert_eq!(config.pool.aliases.get("nova").map(String::as_str), Some("Miles"));
        assert!(!config.pool.aliases.contains_key("hugo"));
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(matches!(
            EngineConfig::from_toml_str("[pool]\ntarget_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[playback]\nframe_bytes = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (WS_URL_ENV, "ws://127.0.0.1:1/x"),
            (POOL_SIZE_ENV, " 8 "),
            (CAPTURE_PRESET_ENV, "car"),
        ]);
        let mut config = EngineConfig::default();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.client.ws_url, "ws://127.0.0.1:1/x");
        assert_eq!(config.pool.target_size, 8);
        assert_eq!(config.capture.preset, CapturePreset::Vehicle);

        let err = EngineConfig::default()
            .apply_env(|var| (var == POOL_SIZE_ENV).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(POOL_SIZE_ENV));
    }
}
