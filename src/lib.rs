pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pipeline::wait::Backoff;

pub use crate::error::CaptureError;

/// Environment variables named `RAWCAP__<SECTION>__<KEY>` override file values
pub const ENV_PREFIX: &str = "RAWCAP";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub decoder: DecoderConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Reads block inside the driver until a packet arrives
    Blocking,
    /// Reads return "not ready" and the loop backs off
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// libavdevice input format name
    pub driver: String,
    /// Compressed format requested from the device
    pub input_format: Option<String>,
    pub read_mode: ReadMode,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Check V4L2 capabilities before handing the device to FFmpeg
    pub probe_device: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Decoder name overriding the stream's codec, e.g. `h264`
    pub codec: Option<String>,
    pub threads: Option<u32>,
    /// Passed to the codec as AVOptions
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub write_buffer_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, `RUST_LOG` wins when set
    pub filter: String,
    pub ffmpeg_level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            driver: "video4linux2".into(),
            input_format: Some("h264".into()),
            read_mode: ReadMode::NonBlocking,
            backoff_initial_ms: 1,
            backoff_max_ms: 20,
            probe_device: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 1 << 20,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "rawcap=info".into(),
            ffmpeg_level: "warning".into(),
        }
    }
}

impl CaptureConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl Config {
    /// Layer defaults, an optional TOML file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
