//! Configuration types for Tapedeck

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::{CaptureSettings, DeviceAlias};
use crate::{Result, TapedeckError};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Capture process settings
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Retention and reconciliation of finished sessions
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Capture options applied when a request leaves them out
    #[serde(default)]
    pub defaults: CaptureSettings,
    /// Named device aliases, e.g. `cam0`
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceAlias>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request body size in bytes
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            max_connections: 64,
            max_request_size: 64 * 1024, // 64 KiB
        }
    }
}

/// Capture process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Capture binary to invoke
    pub ffmpeg_path: PathBuf,
    /// Directory for generated output files and the `/files` listing
    pub recordings_dir: PathBuf,
    /// How long a fresh process must stay alive to count as launched
    pub startup_probe_ms: u64,
    /// Time allowed for a graceful exit after SIGINT
    pub stop_grace_ms: u64,
    /// Time allowed for the process to be reaped after SIGKILL
    pub kill_timeout_ms: u64,
    /// Number of stderr lines kept per session
    pub log_lines: usize,
    /// Maximum concurrently live sessions
    pub max_sessions: usize,
    /// Video codecs a request may ask for
    pub allowed_codecs: Vec<String>,
    /// Video bitrates a request may ask for
    pub allowed_bitrates: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            recordings_dir: PathBuf::from("recordings"),
            startup_probe_ms: 500,
            stop_grace_ms: 5000,
            kill_timeout_ms: 2000,
            log_lines: 200,
            max_sessions: 64,
            allowed_codecs: ["libx264", "libx265", "mjpeg", "copy"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_bitrates: ["500k", "1M", "2M", "4M"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl CaptureConfig {
    /// Startup probe window
    #[must_use]
    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    /// Graceful stop window
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Forced kill window
    #[must_use]
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// Retention policy for finished sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Finished sessions kept in the registry
    pub max_finished: usize,
    /// Seconds a finished session is kept after it ended
    pub finished_ttl_secs: u64,
    /// Interval of the background reconciliation pass
    pub reconcile_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_finished: 100,
            finished_ttl_secs: 3600,
            reconcile_interval_ms: 1000,
        }
    }
}

impl RetentionConfig {
    /// Time-to-live of a finished session
    #[must_use]
    pub fn finished_ttl(&self) -> Duration {
        Duration::from_secs(self.finished_ttl_secs)
    }

    /// Reconciliation interval
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TapedeckError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TapedeckError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.capture.ffmpeg_path.as_os_str().is_empty() {
            return Err(TapedeckError::ConfigError(
                "capture.ffmpeg_path cannot be empty".to_string(),
            ));
        }

        if self.recordings_dir_is_file() {
            return Err(TapedeckError::ConfigError(format!(
                "Recordings directory is a file: {}",
                self.capture.recordings_dir.display()
            )));
        }

        let nonzero = [
            ("server.max_connections", self.server.max_connections),
            ("server.max_request_size", self.server.max_request_size),
            ("capture.log_lines", self.capture.log_lines),
            ("capture.max_sessions", self.capture.max_sessions),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(TapedeckError::ConfigError(format!("{name} must be > 0")));
            }
        }

        if self.capture.stop_grace_ms == 0 || self.capture.kill_timeout_ms == 0 {
            return Err(TapedeckError::ConfigError(
                "capture.stop_grace_ms and capture.kill_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.retention.reconcile_interval_ms == 0 {
            return Err(TapedeckError::ConfigError(
                "retention.reconcile_interval_ms must be > 0".to_string(),
            ));
        }

        if self.capture.allowed_codecs.is_empty() {
            return Err(TapedeckError::ConfigError(
                "capture.allowed_codecs cannot be empty".to_string(),
            ));
        }

        for (name, alias) in &self.devices {
            alias
                .validate()
                .map_err(|e| TapedeckError::ConfigError(format!("devices.{name}: {e}")))?;
        }

        // Defaults must pass the same checks as request options
        crate::capture::CaptureOptions::default()
            .resolve(&self.defaults, &self.capture)
            .map_err(|e| TapedeckError::ConfigError(format!("defaults: {e}")))?;

        Ok(())
    }

    fn recordings_dir_is_file(&self) -> bool {
        self.capture.recordings_dir.is_file()
    }
}
