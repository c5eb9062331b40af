//! Error taxonomy for the capture pipeline

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Everything that can go wrong between opening the device and closing the output file.
///
/// Setup variants abort before any frame is captured. `Decode` and `PictureLayout` are
/// per-packet and the loop skips past them. `Read`, `Write` and `OutputFlush` stop the run.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot initialize ffmpeg: {0}")]
    Init(String),

    #[error("invalid capture parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("cannot find the {0} driver")]
    DriverNotFound(String),

    #[error("cannot allocate a format context")]
    ContextAlloc,

    #[error("cannot open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },

    #[error("device {device} rejected: {reason}")]
    DeviceProbe { device: String, reason: String },

    #[error("cannot find stream info: {0}")]
    StreamInfo(String),

    #[error("cannot find video stream")]
    NoVideoStream,

    #[error("cannot find codec {0}")]
    CodecNotFound(String),

    #[error("cannot open codec: {0}")]
    CodecOpen(String),

    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(String),

    #[error("cannot allocate a {width}x{height} image ({bytes} bytes)")]
    BufferAlloc { width: u32, height: u32, bytes: usize },

    #[error("cannot open output file {path:?}")]
    OutputOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read packet: {0}")]
    Read(String),

    #[error("cannot decode frame: {0}")]
    Decode(String),

    #[error("decoded picture does not match stream layout: {0}")]
    PictureLayout(String),

    #[error("cannot write frame")]
    Write(#[source] io::Error),

    #[error("cannot flush output file")]
    OutputFlush(#[source] io::Error),
}

impl CaptureError {
    /// Per-packet errors leave the session usable; everything else ends it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_) | Self::PictureLayout(_))
    }
}
