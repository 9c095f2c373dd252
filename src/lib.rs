pub mod capture;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod service;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use error::{CaptureError, PipelineError};
pub use pipeline::{FrameCache, ProcessSupervisor};

/// Environment prefix for layered configuration (`CAMRELAY_HTTP__PORT=8080`)
pub const ENV_PREFIX: &str = "CAMRELAY";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Loopback device written by the converter and read by the frame reader
    pub device: PathBuf,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub gphoto2: PathBuf,
    pub ffmpeg: PathBuf,
    pub module: String,
    pub module_params: Vec<String>,
    pub use_sudo: bool,
    pub terminate_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub open_threshold: u32,
    pub open_backoff_ms: u64,
    pub read_threshold: u32,
    pub read_interval_ms: u64,
    /// Poll timeout for a single device dequeue; expiry counts as a soft failure
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub file: Option<PathBuf>,
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: PathBuf::from("/dev/video0"),
                buffer_count: 4,
            },
            pipeline: PipelineConfig {
                gphoto2: PathBuf::from("/usr/bin/gphoto2"),
                ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
                module: "v4l2loopback".into(),
                module_params: vec!["devices=1".into(), "exclusive_caps=1".into()],
                use_sudo: true,
                terminate_grace_ms: 2_000,
            },
            retry: RetryConfig {
                open_threshold: 5,
                open_backoff_ms: 2_000,
                read_threshold: 500,
                read_interval_ms: 100,
                read_timeout_ms: 1_000,
            },
            http: HttpConfig {
                bind: "0.0.0.0".into(),
                port: 9007,
            },
            logging: LoggingConfig {
                file: Some(PathBuf::from("./webcam.log")),
                filter: "camrelay=info".into(),
            },
        }
    }
}

impl Config {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `CAMRELAY_*` variables, then the legacy per-tool variables.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("pipeline.gphoto2", std::env::var("GPHOTO2_PATH").ok())?
            .set_override_option("pipeline.ffmpeg", std::env::var("FFMPEG_PATH").ok())?
            .set_override_option("logging.file", std::env::var("WEBCAM_LOG_PATH").ok())?
            .build()?
            .try_deserialize()
    }
}

impl PipelineConfig {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl RetryConfig {
    pub fn open_backoff(&self) -> Duration {
        Duration::from_millis(self.open_backoff_ms)
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
