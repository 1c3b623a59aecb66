pub mod capture;
pub mod error;
pub mod pipeline;
pub mod server;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::net::SocketAddr;
use std::path::Path;

use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource, Resolution};
pub use error::{BusError, ReconfigError};
pub use pipeline::{FrameBus, ReconfigCoordinator, StreamSession};

/// Config file read when no path is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "zerocam.toml";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

/// Which frame source implementation to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Synthetic,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Device path; empty means auto-detect
    pub device: String,
    /// Resolution applied at startup
    pub resolution: Resolution,
    pub fps: u32,
    pub jpeg_quality: u8,
    pub buffer_count: u32,
    /// Pin the capture thread to this core
    pub cpu_core: Option<usize>,
}

/// Per-client streaming policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Consecutive `SourceUnavailable` results tolerated before a session ends
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Longest wait for a single frame; 0 waits indefinitely
    pub frame_timeout_ms: u64,
    /// Minimum gap between parts sent to one client; 0 disables throttling
    pub frame_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Synthetic,
            device: String::new(),
            resolution: Resolution::P1080,
            fps: 30,
            jpeg_quality: 75,
            buffer_count: 4,
            cpu_core: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_delay_ms: 200,
            frame_timeout_ms: 5_000,
            frame_interval_ms: 0,
        }
    }
}

impl Config {
    /// Load defaults, then the TOML file (if present), then `ZEROCAM__*`
    /// environment overrides such as `ZEROCAM__SERVER__PORT=9000`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("ZEROCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .wrap_err_with(|| format!("Failed to read configuration from {}", file.display()))?;

        settings
            .try_deserialize()
            .wrap_err("Invalid configuration")
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .wrap_err_with(|| format!("Invalid bind address {}:{}", self.bind, self.port))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_camera_server() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.capture.resolution, Resolution::P1080);
        assert_eq!(config.capture.jpeg_quality, 75);
        assert_eq!(config.capture.source, SourceKind::Synthetic);
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "0.0.0.0:8000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn toml_overrides_partial_sections() {
        let dir = std::env::temp_dir().join(format!("zerocam-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("zerocam.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[capture]\nresolution = \"720p\"\nfps = 15\n\n[stream]\nretry_attempts = 2"
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.resolution, Resolution::P720);
        assert_eq!(config.capture.fps, 15);
        assert_eq!(config.stream.retry_attempts, 2);
        // Untouched keys keep their defaults
        assert_eq!(config.capture.jpeg_quality, 75);
        assert_eq!(config.server.port, 8000);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/zerocam.toml");
        assert!(Config::load(Some(missing)).is_err());
    }

    #[test]
    fn unknown_resolution_in_config_is_rejected() {
        let dir = std::env::temp_dir().join(format!("zerocam-badres-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("zerocam.toml");
        std::fs::write(&path, "[capture]\nresolution = \"4k\"\n").unwrap();

        assert!(Config::load(Some(&path)).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
