//! Frame sources.
//!
//! A [`FrameSource`] turns a stream URL into a restartable sequence of decoded
//! frames. [`ReconnectingSource`] wraps any source with the reconnect policy and
//! keeps sequence numbers and timestamps continuous across reconnects.

mod ffmpeg;
mod reconnect;

pub use ffmpeg::{FfmpegSource, FfmpegSourceProvider};
pub use reconnect::{ReconnectPolicy, ReconnectingSource};

use vdet_models::{Frame, PixelFormat, SessionConfig, StreamConfig, TransportOptions};

use crate::error::MediaResult;

/// A restartable decode session for one stream.
pub trait FrameSource: Send {
    /// Establish the decode session.
    ///
    /// Fails with `SourceUnavailable` when the source cannot be reached within
    /// the configured stall timeout. Calling `open` again after `close` starts a
    /// fresh session.
    fn open(&mut self) -> MediaResult<()>;

    /// Block until the next decoded frame is available.
    ///
    /// Fails with `Decode` for transient problems and `StreamEnded` when the
    /// session finished.
    fn next_frame(&mut self) -> MediaResult<Frame>;

    /// Release decoder resources. Idempotent.
    fn close(&mut self);

    /// Source URL, for logging.
    fn url(&self) -> &str;
}

/// Everything a source needs to open one stream.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub stream_id: String,
    pub url: String,
    /// Output frame width
    pub width: u32,
    /// Output frame height
    pub height: u32,
    pub format: PixelFormat,
    pub transport: TransportOptions,
}

impl SourceOptions {
    pub fn new(stream: &StreamConfig, session: &SessionConfig, transport: TransportOptions) -> Self {
        Self {
            stream_id: stream.id.clone(),
            url: stream.url.clone(),
            width: session.frame_width,
            height: session.frame_height,
            format: PixelFormat::Rgb24,
            transport,
        }
    }
}

/// Creates frame sources for streams.
pub trait SourceProvider: Send + Sync {
    fn create(&self, options: SourceOptions) -> MediaResult<Box<dyn FrameSource>>;
}
