use std::collections::BTreeMap;
use std::fmt;

use ffmpeg_next::{
    codec::{self, decoder::Video as VideoDecoder},
    ffi,
    util::frame::video::Video as VideoFrame,
    Dictionary,
};
use tracing::{debug, info, instrument, warn};

use super::frame::{Packet, StreamDescriptor};
use crate::error::{CaptureError, Result};
use crate::DecoderConfig;

/// Most planes any supported pixel format uses
pub const MAX_PLANES: usize = 4;

/// One plane of a decoded picture, rows `stride` bytes apart
#[derive(Debug, Clone, Copy, Default)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// Borrowed view of the decoder's current picture.
///
/// Valid until the next call into the decoder.
#[derive(Debug, Clone, Copy)]
pub struct Picture<'a> {
    pub width: u32,
    pub height: u32,
    planes: [Plane<'a>; MAX_PLANES],
    plane_count: usize,
}

impl<'a> Picture<'a> {
    pub fn new(width: u32, height: u32, planes: &[Plane<'a>]) -> Self {
        let plane_count = planes.len().min(MAX_PLANES);
        let mut slots = [Plane::default(); MAX_PLANES];
        slots[..plane_count].copy_from_slice(&planes[..plane_count]);
        Self {
            width,
            height,
            planes: slots,
            plane_count,
        }
    }

    pub fn planes(&self) -> &[Plane<'a>] {
        &self.planes[..self.plane_count]
    }
}

/// Outcome of feeding one packet to a decoder
#[derive(Debug)]
pub enum Decoded<'a> {
    Picture(Picture<'a>),
    /// The codec buffered the packet and has nothing to show yet
    NeedsMorePackets,
}

/// Stateful packet-to-picture transform.
///
/// Errors returned from `decode` concern the one packet only; the decoder stays usable.
pub trait Decoder {
    fn decode(&mut self, packet: &Packet) -> Result<Decoded<'_>>;

    /// Drain pictures buffered inside the codec after the last packet.
    ///
    /// Returns one picture per call and `None` once the codec is empty.
    fn flush(&mut self) -> Result<Option<Picture<'_>>>;
}

/// Software decoder backed by libavcodec, using send/receive semantics
pub struct FfmpegDecoder {
    decoder: VideoDecoder,
    frame: VideoFrame,
    codec: String,
    eof_sent: bool,
    decoded: u64,
}

impl FfmpegDecoder {
    /// Open a decoder for the selected stream.
    ///
    /// The codec is looked up by `config.codec` when set, otherwise by the stream's codec id.
    #[instrument(skip_all, fields(stream_codec = %descriptor.codec))]
    pub fn open(
        descriptor: &StreamDescriptor,
        parameters: codec::Parameters,
        config: &DecoderConfig,
    ) -> Result<Self> {
        let codec = match &config.codec {
            Some(name) => ffmpeg_next::decoder::find_by_name(name)
                .ok_or_else(|| CaptureError::CodecNotFound(name.clone()))?,
            None => ffmpeg_next::decoder::find(parameters.id())
                .ok_or_else(|| CaptureError::CodecNotFound(descriptor.codec.clone()))?,
        };
        let codec_name = codec.name().to_owned();

        let context = codec::context::Context::from_parameters(parameters)
            .map_err(|e| CaptureError::CodecOpen(e.to_string()))?;

        let decoder = context
            .decoder()
            .open_as_with(codec, codec_options(config))
            .and_then(|opened| opened.video())
            .map_err(|e| CaptureError::CodecOpen(e.to_string()))?;

        info!(codec = %codec_name, options = ?describe_options(config), "decoder opened");

        Ok(Self {
            decoder,
            frame: VideoFrame::empty(),
            codec: codec_name,
            eof_sent: false,
            decoded: 0,
        })
    }

    /// Pull the next buffered frame into `self.frame`; false when the codec has none
    fn receive(&mut self) -> Result<bool> {
        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {
                self.decoded += 1;
                Ok(true)
            }
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => Ok(false),
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(e) => Err(CaptureError::Decode(e.to_string())),
        }
    }

    fn picture(&self) -> Picture<'_> {
        picture_from_frame(&self.frame)
    }
}

/// Outcome of resubmitting a packet after draining the codec.
///
/// Returns true when a drained picture must be returned right away because the
/// packet was refused again; that packet is dropped, the picture is kept.
fn keep_drained_picture(
    have_frame: bool,
    resent: std::result::Result<(), ffmpeg_next::Error>,
    sequence: u64,
) -> Result<bool> {
    match resent {
        Ok(()) => Ok(false),
        Err(e) if have_frame => {
            warn!(sequence, error = %e, "codec refused packet again, keeping drained picture");
            Ok(true)
        }
        Err(e) => Err(CaptureError::Decode(e.to_string())),
    }
}

fn codec_options(config: &DecoderConfig) -> Dictionary<'static> {
    let mut options = Dictionary::new();
    for (key, value) in &describe_options(config) {
        options.set(key, value);
    }
    options
}

fn picture_from_frame(frame: &VideoFrame) -> Picture<'_> {
    let count = frame.planes().min(MAX_PLANES);
    let mut planes = [Plane::default(); MAX_PLANES];
    for (index, plane) in planes.iter_mut().enumerate().take(count) {
        *plane = Plane {
            data: frame.data(index),
            stride: frame.stride(index),
        };
    }
    Picture::new(frame.width(), frame.height(), &planes[..count])
}

impl Decoder for FfmpegDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Decoded<'_>> {
        let mut ffmpeg_packet = ffmpeg_next::Packet::copy(&packet.data);
        ffmpeg_packet.set_pts(packet.pts);

        // EAGAIN means the codec is full: take one frame out, then resubmit
        let mut have_frame = false;
        match self.decoder.send_packet(&ffmpeg_packet) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => {
                have_frame = self.receive()?;
                let resent = self.decoder.send_packet(&ffmpeg_packet);
                if keep_drained_picture(have_frame, resent, packet.sequence)? {
                    return Ok(Decoded::Picture(self.picture()));
                }
            }
            Err(e) => return Err(CaptureError::Decode(e.to_string())),
        }

        if !have_frame {
            have_frame = self.receive()?;
        }

        if have_frame {
            Ok(Decoded::Picture(self.picture()))
        } else {
            Ok(Decoded::NeedsMorePackets)
        }
    }

    fn flush(&mut self) -> Result<Option<Picture<'_>>> {
        if !self.eof_sent {
            match self.decoder.send_eof() {
                Ok(()) | Err(ffmpeg_next::Error::Eof) => {}
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffi::EAGAIN => {
                    // Pending output first; EOF is resent on the next call
                    if self.receive()? {
                        return Ok(Some(self.picture()));
                    }
                    self.decoder
                        .send_eof()
                        .map_err(|e| CaptureError::Decode(e.to_string()))?;
                }
                Err(e) => return Err(CaptureError::Decode(e.to_string())),
            }
            self.eof_sent = true;
        }

        if self.receive()? {
            Ok(Some(self.picture()))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        debug!(codec = %self.codec, frames = self.decoded, "closing decoder");
    }
}

impl fmt::Debug for FfmpegDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegDecoder")
            .field("codec", &self.codec)
            .field("decoded", &self.decoded)
            .field("eof_sent", &self.eof_sent)
            .finish_non_exhaustive()
    }
}

/// Extra decoder options from configuration, in a stable order for logging
pub fn describe_options(config: &DecoderConfig) -> BTreeMap<String, String> {
    let mut options = config.options.clone();
    if let Some(threads) = config.threads {
        options.insert("threads".into(), threads.to_string());
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picture_keeps_only_given_planes() {
        let luma = [1u8; 8];
        let chroma = [2u8; 2];
        let picture = Picture::new(
            4,
            2,
            &[
                Plane { data: &luma, stride: 4 },
                Plane { data: &chroma, stride: 2 },
                Plane { data: &chroma, stride: 2 },
            ],
        );
        assert_eq!(picture.planes().len(), 3);
        assert_eq!(picture.planes()[0].data, &luma);
        assert_eq!(picture.planes()[2].stride, 2);
    }

    #[test]
    fn drained_picture_survives_a_second_refusal() {
        let again = || Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN });

        assert!(keep_drained_picture(true, again(), 7).unwrap());
        assert!(keep_drained_picture(true, Err(ffmpeg_next::Error::InvalidData), 7).unwrap());
        assert!(!keep_drained_picture(true, Ok(()), 7).unwrap());
        assert!(!keep_drained_picture(false, Ok(()), 7).unwrap());
        assert!(matches!(
            keep_drained_picture(false, again(), 7),
            Err(CaptureError::Decode(_))
        ));
    }

    #[test]
    fn threads_show_up_with_other_options() {
        let config = DecoderConfig {
            codec: None,
            threads: Some(2),
            options: BTreeMap::from([("flags2".to_string(), "+fast".to_string())]),
        };
        let options = describe_options(&config);
        assert_eq!(options.get("threads").map(String::as_str), Some("2"));
        assert_eq!(options.get("flags2").map(String::as_str), Some("+fast"));
    }
}
