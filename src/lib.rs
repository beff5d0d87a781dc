pub mod capture;
pub mod detect;
pub mod display;
pub mod pipeline;
pub mod sink;

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use capture::{DeviceHandle, DeviceId, Frame, FrameLedger, PixelFormat, Source, SourceBackend};
pub use detect::{DetectionResult, Detector, QrDetector};
pub use pipeline::{Pipeline, PipelineHandle, PipelineSettings, PipelineState, Stimulus};
pub use sink::{FileSink, OutputMode, Sink};

/// Prefix for environment overrides, e.g. `QRSCAN_CAPTURE__DEVICE_ID=2`.
pub const ENV_PREFIX: &str = "QRSCAN";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub detect: DetectConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: SourceBackend,
    pub device_id: DeviceId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    /// Upper bound on a single frame read before it is reported as a failure.
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// Frames larger than this on either side are downscaled before the grid search.
    /// `0` disables downscaling.
    pub max_dimension: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub result_capacity: usize,
    pub capture_backoff_ms: u64,
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub mode: OutputMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: SourceBackend::Hardware,
            device_id: 0,
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
            capture_timeout_ms: 1000,
        }
    }
}

impl CaptureConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Time between frames at the configured rate, if one is set.
    pub fn frame_interval(&self) -> Option<Duration> {
        (self.fps > 0).then(|| Duration::from_micros(1_000_000 / u64::from(self.fps)))
    }
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self { max_dimension: 1280 }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            result_capacity: 10,
            capture_backoff_ms: 10,
            drain_timeout_ms: 5000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("code.txt"),
            mode: OutputMode::Overwrite,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered under `QRSCAN_*`
    /// environment overrides. Missing keys fall back to the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// First existing config file among the standard locations.
    pub fn find_file() -> Option<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("qrscan.toml"),
            PathBuf::from("config/qrscan.toml"),
        ];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".config/qrscan/config.toml"));
        }
        candidates.into_iter().find(|path| path.is_file())
    }
}
