//! Configuration management for rtsp-recorder

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Segment rotation and output configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// RTSP session configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Retry/backoff configuration
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Frame buffer capacity (per lane)
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Container writer configuration
    #[serde(default)]
    pub writer: WriterConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory segments are written to when none is given on the command line
    #[serde(default = "default_output_directory_option")]
    pub output_directory: Option<PathBuf>,

    /// Rotate after this many seconds of media (0 = no duration cap)
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u64,

    /// Rotate once a segment reaches this many bytes (0 = no size cap)
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    /// Closed segments smaller than this are discarded (0 = keep all)
    #[serde(default)]
    pub min_segment_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Watchdog for DESCRIBE/SETUP/PLAY
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Longest silence between frames before the session is considered dead
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,

    /// User-Agent sent with RTSP requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Give up after this many failures in a row
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    /// Retry the first failure after a healthy stream without waiting
    #[serde(default = "default_true")]
    pub immediate_first_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_frames")]
    pub max_frames: usize,

    #[serde(default = "default_buffer_bytes")]
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Consecutive write failures tolerated before the run fails
    #[serde(default = "default_write_retries")]
    pub max_write_retries: u32,

    /// Upper bound on the Finalizing phase
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,

    /// How long the writer waits on an empty buffer before re-checking state
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

// Default value functions
fn default_output_directory() -> PathBuf {
    std::env::temp_dir().join("rtsp-recordings")
}

fn default_output_directory_option() -> Option<PathBuf> {
    Some(default_output_directory())
}

fn default_segment_duration() -> u64 {
    180 // three-minute segments
}

fn default_segment_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_frame_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("rtsp-recorder/{}", env!("CARGO_PKG_VERSION"))
}

fn default_base_delay() -> u64 {
    3_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_max_failures() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_buffer_frames() -> usize {
    600
}

fn default_buffer_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_write_retries() -> u32 {
    3
}

fn default_flush_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory_option(),
            segment_duration_secs: default_segment_duration(),
            segment_max_bytes: default_segment_max_bytes(),
            min_segment_bytes: 0,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            frame_timeout_secs: default_frame_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_consecutive_failures: default_max_failures(),
            immediate_first_retry: true,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_frames: default_buffer_frames(),
            max_bytes: default_buffer_bytes(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_write_retries: default_write_retries(),
            flush_timeout_ms: default_flush_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl RecordingConfig {
    pub fn segment_duration(&self) -> Option<Duration> {
        (self.segment_duration_secs > 0).then(|| Duration::from_secs(self.segment_duration_secs))
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }
}

impl WriterConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match &self.config_path {
            Some(path) => path.clone(),
            None => Self::default_config_path()?,
        };

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path, if known
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "rtsp-recorder", "recorder")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.max_frames == 0 || self.buffer.max_bytes == 0 {
            return Err(ConfigError("buffer capacity must be non-zero".into()));
        }
        if self.recording.segment_duration_secs == 0 && self.recording.segment_max_bytes == 0 {
            return Err(ConfigError(
                "at least one of segment_duration_secs / segment_max_bytes must be set".into(),
            ));
        }
        if self.reconnect.max_consecutive_failures == 0 {
            return Err(ConfigError("max_consecutive_failures must be at least 1".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.transport.frame_timeout_secs == 0 || self.transport.connect_timeout_secs == 0 {
            return Err(ConfigError("transport timeouts must be non-zero".into()));
        }
        if self.writer.flush_timeout_ms == 0 {
            return Err(ConfigError("flush_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.recording.segment_duration_secs, 180);
        assert_eq!(config.reconnect.base_delay_ms, 3_000);
        assert_eq!(config.transport.connect_timeout_secs, 30);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [recording]
            segment_duration_secs = 10

            [reconnect]
            max_consecutive_failures = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.recording.segment_duration_secs, 10);
        assert_eq!(config.recording.segment_max_bytes, 512 * 1024 * 1024);
        assert_eq!(config.reconnect.max_consecutive_failures, 3);
        assert_eq!(config.buffer.max_frames, 600);
    }

    #[test]
    fn test_validate_rejects_unbounded_segments() {
        let mut config = Config::default();
        config.recording.segment_duration_secs = 0;
        config.recording.segment_max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.reconnect.base_delay_ms = 90_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.recording.segment_duration_secs = 42;
        config.config_path = Some(path.clone());
        config.save().unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.recording.segment_duration_secs, 42);
        assert_eq!(loaded.config_path(), Some(path.as_path()));
    }
}
