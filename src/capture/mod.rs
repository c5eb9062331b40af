pub mod decoder;
pub mod ffmpeg;
pub mod frame;

pub use decoder::{Decoded, Decoder, FfmpegDecoder, Picture, Plane};
pub use ffmpeg::FfmpegSource;
pub use frame::{Packet, PixelFormat, StreamDescriptor};

use crate::error::Result;

/// Result of asking a source for its next packet
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    /// Non-blocking source has nothing queued right now
    NotReady,
    EndOfStream,
}

/// A capture device producing compressed packets for one video stream.
///
/// Dropping the source closes the device.
pub trait DeviceSource {
    /// Negotiated stream properties, fixed once the device is open
    fn descriptor(&self) -> &StreamDescriptor;

    /// Read the next packet of the selected stream.
    ///
    /// `Err` is a hard failure; callers must not retry it.
    fn read_packet(&mut self) -> Result<ReadOutcome>;
}
