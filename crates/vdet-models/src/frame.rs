//! Decoded video frames.

use std::fmt;

use chrono::{DateTime, Utc};

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel.
    Rgb24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
        }
    }

    /// FFmpeg `-pix_fmt` name for this layout.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
        }
    }
}

/// One decoded image sampled from a live stream.
///
/// A frame is owned by its source until it is moved into a detection job;
/// the worker that runs the job drops it once inference is done.
#[derive(Clone)]
pub struct Frame {
    /// Stream this frame was captured from
    pub stream_id: String,
    /// Per-stream capture sequence number, starting at 0
    pub sequence: u64,
    /// Capture timestamp (monotonic within a stream)
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Raw pixel data, row-major
    pub data: Vec<u8>,
}

impl Frame {
    /// Number of bytes a buffer of the given geometry must hold.
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    /// True when the buffer length matches the declared geometry.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == Self::expected_len(self.width, self.height, self.format)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
