//! Contiguous frame buffer that every decoded picture is flattened into

use tracing::debug;

use crate::capture::frame::{PlaneLayout, StreamDescriptor};
use crate::capture::Picture;
use crate::error::{CaptureError, Result};

/// Reusable tightly packed buffer sized once from the stream descriptor
pub struct FrameBuffer {
    data: Vec<u8>,
    layouts: Vec<PlaneLayout>,
    /// Start of each plane in `data`
    offsets: Vec<usize>,
    width: u32,
    height: u32,
}

impl FrameBuffer {
    /// Allocate the buffer with 1-byte alignment, no row padding
    pub fn allocate(descriptor: &StreamDescriptor) -> Result<Self> {
        let (width, height) = (descriptor.width, descriptor.height);
        let layouts = descriptor.format.plane_layouts(width, height);

        let alloc_error = |bytes| CaptureError::BufferAlloc {
            width,
            height,
            bytes,
        };
        if width == 0 || height == 0 {
            return Err(alloc_error(0));
        }

        let mut offsets = Vec::with_capacity(layouts.len());
        let mut size = 0usize;
        for layout in &layouts {
            offsets.push(size);
            size = layout
                .row_bytes
                .checked_mul(layout.rows)
                .and_then(|plane| size.checked_add(plane))
                .ok_or_else(|| alloc_error(usize::MAX))?;
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| alloc_error(size))?;
        data.resize(size, 0);

        debug!(width, height, format = %descriptor.format, bytes = size, "frame buffer allocated");

        Ok(Self {
            data,
            layouts,
            offsets,
            width,
            height,
        })
    }

    /// Copy a picture row by row, dropping the decoder's stride padding.
    ///
    /// The picture is checked against the layout before any byte is written, so a
    /// rejected picture leaves the previous contents intact.
    pub fn copy(&mut self, picture: &Picture<'_>) -> Result<()> {
        self.check(picture)?;

        for ((layout, offset), plane) in self
            .layouts
            .iter()
            .zip(&self.offsets)
            .zip(picture.planes())
        {
            let dst = &mut self.data[*offset..*offset + layout.size()];
            if plane.stride == layout.row_bytes {
                dst.copy_from_slice(&plane.data[..layout.size()]);
                continue;
            }
            for (row, dst_row) in dst.chunks_exact_mut(layout.row_bytes).enumerate() {
                let start = row * plane.stride;
                dst_row.copy_from_slice(&plane.data[start..start + layout.row_bytes]);
            }
        }

        Ok(())
    }

    fn check(&self, picture: &Picture<'_>) -> Result<()> {
        if picture.width != self.width || picture.height != self.height {
            return Err(CaptureError::PictureLayout(format!(
                "picture is {}x{}, stream is {}x{}",
                picture.width, picture.height, self.width, self.height
            )));
        }

        let planes = picture.planes();
        if planes.len() < self.layouts.len() {
            return Err(CaptureError::PictureLayout(format!(
                "picture has {} planes, format needs {}",
                planes.len(),
                self.layouts.len()
            )));
        }

        for (index, (layout, plane)) in self.layouts.iter().zip(planes).enumerate() {
            if plane.stride < layout.row_bytes {
                return Err(CaptureError::PictureLayout(format!(
                    "plane {index} stride {} is narrower than a {} byte row",
                    plane.stride, layout.row_bytes
                )));
            }
            let needed = (layout.rows - 1) * plane.stride + layout.row_bytes;
            if plane.data.len() < needed {
                return Err(CaptureError::PictureLayout(format!(
                    "plane {index} holds {} bytes, needs {needed}",
                    plane.data.len()
                )));
            }
        }

        Ok(())
    }

    /// The whole frame, ready to be written
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Row width of each plane in the packed buffer
    pub fn strides(&self) -> Vec<usize> {
        self.layouts.iter().map(|l| l.row_bytes).collect()
    }
}
