pub mod capture;
pub mod pipeline;
pub mod serve;
pub mod shutdown;
pub mod upload;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use capture::frame::PixelFormat;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variables `FRAMECAST_<SECTION>__<KEY>` override the file
const ENV_PREFIX: &str = "FRAMECAST";

/// Device value that asks for auto-detection
pub const AUTO_DEVICE: &str = "auto";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub push: PushConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureBackend {
    /// External pipeline first, then the device directly
    #[default]
    Auto,
    Gstreamer,
    V4l2,
    TestPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device path, or `auto` to pick the first capture-capable one
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub backend: CaptureBackend,
    /// Custom GStreamer pipeline ending in `appsink name=appsink`
    pub pipeline: Option<String>,
    pub buffer_count: u32,
    pub jpeg_quality: u8,
    /// Consecutive transient errors tolerated before the source is reopened
    pub max_transient_failures: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 1280,
            height: 720,
            fps: 15,
            format: PixelFormat::Mjpeg,
            backend: CaptureBackend::Auto,
            pipeline: None,
            buffer_count: 4,
            jpeg_quality: 80,
            max_transient_failures: 8,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
        }
    }
}

/// Per-client limits for MJPEG sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Session ends if no new frame arrives within this window
    pub idle_timeout_ms: u64,
    /// Session ends if a client cannot take a frame within this window
    pub write_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub url: String,
    /// Uploads are disabled while this or `url` is empty
    pub token: String,
    pub fingerprint: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl PushConfig {
    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty() && !self.url.is_empty()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "https://connect.prusa3d.com".into(),
            token: String::new(),
            fingerprint: String::new(),
            interval_secs: 5,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// How long a snapshot request may wait for the first frame
    pub snapshot_wait_ms: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server.bind {:?}: {e}", self.bind)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            snapshot_wait_ms: 0,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if it exists, then the
    /// environment. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with(path: &Path, env: Environment) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            // No `try_parsing`: credentials must stay strings; numeric
            // fields are converted on deserialize
            .add_source(env.prefix_separator("_").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        let checks = [
            (capture.device.is_empty(), "capture.device must not be empty"),
            (
                capture.width == 0 || capture.height == 0,
                "capture.width and capture.height must be non-zero",
            ),
            (capture.fps == 0, "capture.fps must be non-zero"),
            (capture.buffer_count == 0, "capture.buffer_count must be non-zero"),
            (
                !(1..=100).contains(&capture.jpeg_quality),
                "capture.jpeg_quality must be within 1..=100",
            ),
            (
                capture.backoff_initial_ms == 0,
                "capture.backoff_initial_ms must be non-zero",
            ),
            (
                capture.backoff_initial_ms > capture.backoff_max_ms,
                "capture.backoff_initial_ms exceeds capture.backoff_max_ms",
            ),
            (
                self.stream.idle_timeout_ms == 0 || self.stream.write_timeout_ms == 0,
                "stream timeouts must be non-zero",
            ),
            (self.push.interval_secs == 0, "push.interval_secs must be non-zero"),
            (self.push.timeout_secs == 0, "push.timeout_secs must be non-zero"),
        ];

        if let Some((_, message)) = checks.into_iter().find(|(failed, _)| *failed) {
            return Err(ConfigError::Invalid(message.into()));
        }
        self.server.bind_addr()?;
        Ok(())
    }
}
