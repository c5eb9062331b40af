use std::fmt;

use bytes::Bytes;

/// One compressed access unit read from the device
#[derive(Clone)]
pub struct Packet {
    /// Compressed payload
    pub data: Bytes,

    /// Index of the stream the packet belongs to
    pub stream_index: usize,

    /// Presentation timestamp in stream time base, if the driver set one
    pub pts: Option<i64>,

    pub is_key: bool,

    /// Position in read order, starting at 1
    pub sequence: u64,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, stream_index: usize, sequence: u64) -> Self {
        Self {
            data: data.into(),
            stream_index,
            pts: None,
            is_key: false,
            sequence,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("stream_index", &self.stream_index)
            .field("pts", &self.pts)
            .field("is_key", &self.is_key)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Negotiated properties of the selected video stream, fixed for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Codec name as reported by the driver, e.g. `h264`
    pub codec: String,
}

impl StreamDescriptor {
    /// Bytes of one tightly packed frame
    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Command line that plays back the raw output file
    pub fn playback_hint(&self, output: &str) -> String {
        format!(
            "ffplay -f rawvideo -pixel_format {} -video_size {}x{} {}",
            self.format.name(),
            self.width,
            self.height,
            output
        )
    }
}

/// Decoded pixel formats we can materialize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Yuvj420p,
    Yuv422p,
    Yuvj422p,
    Yuv444p,
    Yuvj444p,
    Yuv411p,
    Nv12,
    Nv21,
    Yuyv422,
    Uyvy422,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Gray,
}

/// Sample step and chroma subsampling of one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneSpec {
    /// Bytes per horizontal sample position after subsampling
    pub step: usize,
    pub log2_chroma_w: u32,
    pub log2_chroma_h: u32,
}

const fn plane(step: usize, log2_chroma_w: u32, log2_chroma_h: u32) -> PlaneSpec {
    PlaneSpec {
        step,
        log2_chroma_w,
        log2_chroma_h,
    }
}

const PLANAR_420: &[PlaneSpec] = &[plane(1, 0, 0), plane(1, 1, 1), plane(1, 1, 1)];
const PLANAR_422: &[PlaneSpec] = &[plane(1, 0, 0), plane(1, 1, 0), plane(1, 1, 0)];
const PLANAR_444: &[PlaneSpec] = &[plane(1, 0, 0), plane(1, 0, 0), plane(1, 0, 0)];
const PLANAR_411: &[PlaneSpec] = &[plane(1, 0, 0), plane(1, 2, 0), plane(1, 2, 0)];
const SEMI_PLANAR_420: &[PlaneSpec] = &[plane(1, 0, 0), plane(2, 1, 1)];
// Two pixels share one 4-byte macropixel
const PACKED_422: &[PlaneSpec] = &[plane(4, 1, 0)];
const PACKED_3: &[PlaneSpec] = &[plane(3, 0, 0)];
const PACKED_4: &[PlaneSpec] = &[plane(4, 0, 0)];
const GRAY: &[PlaneSpec] = &[plane(1, 0, 0)];

/// Row width and row count of one plane at a given geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub row_bytes: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn size(&self) -> usize {
        self.row_bytes * self.rows
    }
}

/// `ceil(value / 2^shift)`
const fn ceil_rshift(value: usize, shift: u32) -> usize {
    (value + (1 << shift) - 1) >> shift
}

impl PixelFormat {
    pub fn planes(self) -> &'static [PlaneSpec] {
        match self {
            Self::Yuv420p | Self::Yuvj420p => PLANAR_420,
            Self::Yuv422p | Self::Yuvj422p => PLANAR_422,
            Self::Yuv444p | Self::Yuvj444p => PLANAR_444,
            Self::Yuv411p => PLANAR_411,
            Self::Nv12 | Self::Nv21 => SEMI_PLANAR_420,
            Self::Yuyv422 | Self::Uyvy422 => PACKED_422,
            Self::Rgb24 | Self::Bgr24 => PACKED_3,
            Self::Rgba | Self::Bgra => PACKED_4,
            Self::Gray => GRAY,
        }
    }

    /// Per-plane layout with no row padding
    pub fn plane_layouts(self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let (width, height) = (width as usize, height as usize);
        self.planes()
            .iter()
            .map(|p| PlaneLayout {
                row_bytes: p.step * ceil_rshift(width, p.log2_chroma_w),
                rows: ceil_rshift(height, p.log2_chroma_h),
            })
            .collect()
    }

    /// Size of one frame with 1-byte alignment
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        self.plane_layouts(width, height)
            .iter()
            .map(PlaneLayout::size)
            .sum()
    }

    /// FFmpeg's name for the format, as accepted by `-pixel_format`
    pub fn name(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Yuvj420p => "yuvj420p",
            Self::Yuv422p => "yuv422p",
            Self::Yuvj422p => "yuvj422p",
            Self::Yuv444p => "yuv444p",
            Self::Yuvj444p => "yuvj444p",
            Self::Yuv411p => "yuv411p",
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
            Self::Yuyv422 => "yuyv422",
            Self::Uyvy422 => "uyvy422",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::Gray => "gray",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
