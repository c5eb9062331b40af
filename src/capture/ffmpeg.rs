//! FFmpeg device capture: capture drivers appear as libavdevice input formats

use std::ffi::{c_int, CString};
use std::fmt;
use std::ptr;

use bytes::Bytes;
use ffmpeg_next::{
    codec, ffi, format::context::Input as InputContext, format::Pixel, media::Type,
    util::log::Level, Dictionary,
};
use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::frame::{Packet, PixelFormat, StreamDescriptor};
use crate::capture::{DeviceSource, ReadOutcome};
use crate::error::{CaptureError, Result};
use crate::{CaptureConfig, ReadMode};

static INIT: OnceCell<()> = OnceCell::new();

/// Register FFmpeg's devices and codecs and set its log level.
///
/// Only the first call does anything; later calls return the first outcome's success.
pub fn init(level: Level) -> Result<()> {
    INIT.get_or_try_init(|| {
        ffmpeg_next::init().map_err(|e| CaptureError::Init(e.to_string()))?;
        ffmpeg_next::util::log::set_level(level);
        debug!(?level, "ffmpeg initialized");
        Ok::<_, CaptureError>(())
    })?;
    Ok(())
}

/// Map a config level name onto FFmpeg's log levels
pub fn log_level_from_name(name: &str) -> Option<Level> {
    let level = match name.to_ascii_lowercase().as_str() {
        "quiet" => Level::Quiet,
        "panic" => Level::Panic,
        "fatal" => Level::Fatal,
        "error" => Level::Error,
        "warning" | "warn" => Level::Warning,
        "info" => Level::Info,
        "verbose" => Level::Verbose,
        "debug" => Level::Debug,
        "trace" => Level::Trace,
        _ => return None,
    };
    Some(level)
}

/// Owns a format context between allocation and `avformat_open_input`
struct FormatContextGuard(*mut ffi::AVFormatContext);

impl FormatContextGuard {
    fn alloc() -> Result<Self> {
        let ptr = unsafe { ffi::avformat_alloc_context() };
        if ptr.is_null() {
            return Err(CaptureError::ContextAlloc);
        }
        Ok(Self(ptr))
    }

    /// Hand ownership to FFmpeg, which frees the context itself if opening fails
    fn into_raw(self) -> *mut ffi::AVFormatContext {
        let ptr = self.0;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for FormatContextGuard {
    fn drop(&mut self) {
        unsafe { ffi::avformat_free_context(self.0) }
    }
}

/// A capture device opened through a libavdevice driver
pub struct FfmpegSource {
    input: InputContext,
    descriptor: StreamDescriptor,
    device: String,
    sequence: u64,
}

impl FfmpegSource {
    /// Open `device` through the configured driver, requesting `frame_rate` and
    /// `frame_size` (`WIDTHxHEIGHT`). Both are passed to the driver verbatim.
    #[instrument(skip(config), fields(driver = %config.driver))]
    pub fn open(
        device: &str,
        frame_rate: &str,
        frame_size: &str,
        config: &CaptureConfig,
    ) -> Result<Self> {
        let driver = CString::new(config.driver.as_str())
            .map_err(|_| CaptureError::DriverNotFound(config.driver.clone()))?;
        let input_format = unsafe { ffi::av_find_input_format(driver.as_ptr()) };
        if input_format.is_null() {
            return Err(CaptureError::DriverNotFound(config.driver.clone()));
        }

        let context = FormatContextGuard::alloc()?;
        if config.read_mode == ReadMode::NonBlocking {
            unsafe { (*context.0).flags |= ffi::AVFMT_FLAG_NONBLOCK as c_int };
        }

        let mut options = Dictionary::new();
        if let Some(input_format) = &config.input_format {
            options.set("input_format", input_format);
        }
        options.set("framerate", frame_rate);
        options.set("video_size", frame_size);

        let url = CString::new(device).map_err(|_| CaptureError::DeviceOpen {
            device: device.to_owned(),
            reason: "path contains a NUL byte".into(),
        })?;

        let mut ps = context.into_raw();
        let (rc, leftover) = unsafe {
            let mut raw_options = options.disown();
            let rc = ffi::avformat_open_input(&mut ps, url.as_ptr(), input_format, &mut raw_options);
            (rc, Dictionary::own(raw_options))
        };
        if rc < 0 {
            return Err(CaptureError::DeviceOpen {
                device: device.to_owned(),
                reason: ffmpeg_next::Error::from(rc).to_string(),
            });
        }
        for (key, value) in leftover.iter() {
            warn!(key, value, "driver ignored option");
        }

        let mut input = unsafe { InputContext::wrap(ps) };

        let rc = unsafe { ffi::avformat_find_stream_info(input.as_mut_ptr(), ptr::null_mut()) };
        if rc < 0 {
            return Err(CaptureError::StreamInfo(
                ffmpeg_next::Error::from(rc).to_string(),
            ));
        }

        let descriptor = describe_best_video_stream(&input)?;
        info!(
            device,
            stream = descriptor.stream_index,
            codec = %descriptor.codec,
            width = descriptor.width,
            height = descriptor.height,
            format = %descriptor.format,
            "device opened"
        );

        Ok(Self {
            input,
            descriptor,
            device: device.to_owned(),
            sequence: 0,
        })
    }

    /// Codec parameters of the selected stream, for opening a decoder
    pub fn codec_parameters(&self) -> Option<codec::Parameters> {
        self.input
            .stream(self.descriptor.stream_index)
            .map(|stream| stream.parameters())
    }
}

fn describe_best_video_stream(input: &InputContext) -> Result<StreamDescriptor> {
    let stream = input
        .streams()
        .best(Type::Video)
        .ok_or(CaptureError::NoVideoStream)?;

    let parameters = stream.parameters();
    let codec = parameters.id().name().to_owned();
    let context = codec::context::Context::from_parameters(parameters)
        .map_err(|e| CaptureError::StreamInfo(e.to_string()))?;

    // SAFETY: the context was just created from the stream's parameters and is not shared
    let (width, height, pixel) = unsafe {
        let ptr = context.as_ptr();
        ((*ptr).width, (*ptr).height, Pixel::from((*ptr).pix_fmt))
    };

    let format = pixel_format_from_ffmpeg(pixel)
        .ok_or_else(|| CaptureError::UnsupportedPixelFormat(format!("{pixel:?}")))?;

    Ok(StreamDescriptor {
        stream_index: stream.index(),
        width: width.max(0) as u32,
        height: height.max(0) as u32,
        format,
        codec,
    })
}

impl DeviceSource for FfmpegSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => {
                    return Ok(ReadOutcome::NotReady);
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(ReadOutcome::EndOfStream),
                Err(e) => return Err(CaptureError::Read(e.to_string())),
            }

            if packet.stream() != self.descriptor.stream_index {
                trace!(stream = packet.stream(), "skipping packet of unselected stream");
                continue;
            }

            self.sequence += 1;
            let mut out = Packet::new(
                Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                packet.stream(),
                self.sequence,
            );
            out.pts = packet.pts();
            out.is_key = packet.is_key();
            return Ok(ReadOutcome::Packet(out));
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        debug!(device = %self.device, packets = self.sequence, "closing device");
    }
}

impl fmt::Debug for FfmpegSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegSource")
            .field("device", &self.device)
            .field("descriptor", &self.descriptor)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Convert FFmpeg pixel format to our PixelFormat
pub fn pixel_format_from_ffmpeg(format: Pixel) -> Option<PixelFormat> {
    let format = match format {
        Pixel::YUV420P => PixelFormat::Yuv420p,
        Pixel::YUVJ420P => PixelFormat::Yuvj420p,
        Pixel::YUV422P => PixelFormat::Yuv422p,
        Pixel::YUVJ422P => PixelFormat::Yuvj422p,
        Pixel::YUV444P => PixelFormat::Yuv444p,
        Pixel::YUVJ444P => PixelFormat::Yuvj444p,
        Pixel::YUV411P => PixelFormat::Yuv411p,
        Pixel::NV12 => PixelFormat::Nv12,
        Pixel::NV21 => PixelFormat::Nv21,
        Pixel::YUYV422 => PixelFormat::Yuyv422,
        Pixel::UYVY422 => PixelFormat::Uyvy422,
        Pixel::RGB24 => PixelFormat::Rgb24,
        Pixel::BGR24 => PixelFormat::Bgr24,
        Pixel::RGBA => PixelFormat::Rgba,
        Pixel::BGRA => PixelFormat::Bgra,
        Pixel::GRAY8 => PixelFormat::Gray,
        _ => return None,
    };
    Some(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert!(matches!(log_level_from_name("warning"), Some(Level::Warning)));
        assert!(matches!(log_level_from_name("WARN"), Some(Level::Warning)));
        assert!(matches!(log_level_from_name("Quiet"), Some(Level::Quiet)));
        assert!(log_level_from_name("loud").is_none());
    }

    #[test]
    fn pixel_formats_map_from_ffmpeg() {
        assert_eq!(
            pixel_format_from_ffmpeg(Pixel::YUVJ422P),
            Some(PixelFormat::Yuvj422p)
        );
        assert_eq!(pixel_format_from_ffmpeg(Pixel::GRAY8), Some(PixelFormat::Gray));
        assert_eq!(pixel_format_from_ffmpeg(Pixel::YUV420P10LE), None);
    }
}
