//! Capture session: ordered acquisition and release of device, decoder, buffer and output

use std::path::PathBuf;

use tracing::{info, instrument, warn};

use crate::capture::decoder::{Decoder, FfmpegDecoder};
use crate::capture::ffmpeg::{self, FfmpegSource};
use crate::capture::{DeviceSource, StreamDescriptor};
use crate::error::{CaptureError, Result};
use crate::pipeline::capture_loop::{CaptureLoop, CaptureStats};
use crate::pipeline::materialize::FrameBuffer;
use crate::pipeline::sink::{FileSink, FrameSink};
use crate::pipeline::wait::Waiter;
use crate::Config;

/// The four values the command line hands to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParams {
    pub device: String,
    /// Requested frame rate, passed to the driver verbatim
    pub frame_rate: String,
    /// Requested geometry as `WIDTHxHEIGHT`, passed to the driver verbatim
    pub frame_size: String,
    pub output: PathBuf,
}

impl CaptureParams {
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(CaptureError::InvalidParams("device is empty".into()));
        }
        parse_frame_rate(&self.frame_rate)?;
        parse_frame_size(&self.frame_size)?;
        Ok(())
    }
}

/// Accepts `30`, `29.97` or `30000/1001`
pub fn parse_frame_rate(value: &str) -> Result<f64> {
    let invalid = || CaptureError::InvalidParams(format!("invalid frame rate {value:?}"));
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().map_err(|_| invalid())?;
            let den: f64 = den.trim().parse().map_err(|_| invalid())?;
            if den == 0.0 {
                return Err(invalid());
            }
            num / den
        }
        None => value.trim().parse().map_err(|_| invalid())?,
    };
    if !rate.is_finite() || rate <= 0.0 {
        return Err(invalid());
    }
    Ok(rate)
}

/// Parses `WIDTHxHEIGHT`
pub fn parse_frame_size(value: &str) -> Result<(u32, u32)> {
    let invalid = || CaptureError::InvalidParams(format!("invalid frame size {value:?}, expected WIDTHxHEIGHT"));
    let (width, height) = value
        .split_once(|c| c == 'x' || c == 'X')
        .ok_or_else(invalid)?;
    let width: u32 = width.parse().map_err(|_| invalid())?;
    let height: u32 = height.parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Everything one capture run owns.
///
/// Resources are acquired in the order source, decoder, buffer, sink. If a step fails,
/// the ones already acquired drop in reverse. A finished session releases the decoder,
/// then the source, then flushes and closes the sink.
pub struct CaptureSession<S, D, K> {
    pub(crate) decoder: D,
    pub(crate) source: S,
    pub(crate) sink: K,
    pub(crate) buffer: FrameBuffer,
    descriptor: StreamDescriptor,
}

pub type FfmpegSession = CaptureSession<FfmpegSource, FfmpegDecoder, FileSink>;

impl<S, D, K> CaptureSession<S, D, K>
where
    S: DeviceSource,
    D: Decoder,
    K: FrameSink,
{
    /// Run each setup step in order, stopping at the first failure.
    ///
    /// The sink is opened last so that a failed setup never creates or truncates the output.
    pub fn assemble<FS, FD, FK>(open_source: FS, open_decoder: FD, open_sink: FK) -> Result<Self>
    where
        FS: FnOnce() -> Result<S>,
        FD: FnOnce(&S) -> Result<D>,
        FK: FnOnce(&StreamDescriptor) -> Result<K>,
    {
        let source = open_source()?;
        let descriptor = source.descriptor().clone();
        let decoder = open_decoder(&source)?;
        let buffer = FrameBuffer::allocate(&descriptor)?;
        let sink = open_sink(&descriptor)?;

        Ok(Self {
            decoder,
            source,
            sink,
            buffer,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Bytes written per decoded frame
    pub fn frame_size(&self) -> usize {
        self.buffer.len()
    }

    /// Drive the loop to its end, then tear the session down.
    ///
    /// A loop failure takes precedence over a failure to flush the output.
    pub fn run<W: Waiter>(mut self, capture: &mut CaptureLoop<W>) -> Result<CaptureStats> {
        let outcome = capture.run(&mut self);
        let closed = self.close();
        let stats = outcome?;
        closed?;
        Ok(stats)
    }

    /// Release decoder, source, then sink, surfacing the sink's flush error
    pub fn close(self) -> Result<()> {
        let Self {
            decoder,
            source,
            mut sink,
            ..
        } = self;
        drop(decoder);
        drop(source);
        sink.finish()
    }
}

impl FfmpegSession {
    /// Open the device through FFmpeg, its decoder, the frame buffer and the output file
    #[instrument(skip_all, fields(device = %params.device))]
    pub fn open(params: &CaptureParams, config: &Config) -> Result<Self> {
        params.validate()?;

        let level = ffmpeg::log_level_from_name(&config.logging.ffmpeg_level).unwrap_or_else(|| {
            warn!(level = %config.logging.ffmpeg_level, "unknown ffmpeg log level, using warning");
            ffmpeg_next::util::log::Level::Warning
        });
        ffmpeg::init(level)?;

        #[cfg(feature = "v4l-probe")]
        if config.capture.probe_device && config.capture.driver == "video4linux2" {
            crate::utils::probe_device(&params.device)?;
        }

        let session = Self::assemble(
            || {
                FfmpegSource::open(
                    &params.device,
                    &params.frame_rate,
                    &params.frame_size,
                    &config.capture,
                )
            },
            |source| {
                let parameters = source
                    .codec_parameters()
                    .ok_or(CaptureError::NoVideoStream)?;
                FfmpegDecoder::open(source.descriptor(), parameters, &config.decoder)
            },
            |descriptor| {
                FileSink::create(
                    &params.output,
                    descriptor.frame_size(),
                    config.output.write_buffer_bytes,
                )
            },
        )?;

        info!(
            output = %params.output.display(),
            frame_size = session.frame_size(),
            "capture session ready"
        );
        Ok(session)
    }
}
