//! Raw output: fixed-size frames concatenated with no header or framing

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CaptureError, Result};

/// Append-only destination for materialized frames
pub trait FrameSink {
    /// Append one whole frame
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Push everything written so far down to the destination
    fn finish(&mut self) -> Result<()>;
}

/// Writes frames into a file, created or truncated on open
pub struct FileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
    bytes: u64,
}

impl FileSink {
    /// `buffer_capacity` is raised to at least one frame so a frame never straddles two
    /// buffer flushes unless the file itself rejects it
    pub fn create(path: impl AsRef<Path>, frame_size: usize, buffer_capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| CaptureError::OutputOpen {
            path: path.clone(),
            source,
        })?;

        let capacity = buffer_capacity.max(frame_size);
        debug!(path = %path.display(), capacity, "output file opened");

        Ok(Self {
            writer: BufWriter::with_capacity(capacity, file),
            path,
            frames: 0,
            bytes: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame).map_err(CaptureError::Write)?;
        self.frames += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(CaptureError::OutputFlush)?;
        info!(
            path = %self.path.display(),
            frames = self.frames,
            bytes = self.bytes,
            "output file closed"
        );
        Ok(())
    }
}
