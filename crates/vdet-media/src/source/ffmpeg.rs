//! FFmpeg-backed frame source.
//!
//! Spawns `ffmpeg` decoding the stream to raw frames on stdout. A reader
//! thread pushes whole frames into a small bounded channel, so waiting for a
//! frame is always a bounded wait and a stalled source is detected by timeout.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};
use vdet_models::Frame;

use super::{FrameSource, SourceOptions, SourceProvider};
use crate::error::{MediaError, MediaResult};

/// Decoded frames buffered between the reader thread and the consumer.
const FRAME_BUFFER: usize = 2;

/// How long to wait for ffmpeg to exit after its stdout closed.
const EXIT_WAIT: Duration = Duration::from_secs(1);

enum ReadEvent {
    Frame(Vec<u8>),
    Eof,
    Failed(String),
}

/// Frame source decoding a stream URL through an `ffmpeg` child process.
pub struct FfmpegSource {
    options: SourceOptions,
    child: Option<Child>,
    frames: Option<Receiver<ReadEvent>>,
    reader: Option<JoinHandle<()>>,
    /// First frame received during `open`, handed out by the next `next_frame`
    pending: Option<Vec<u8>>,
    sequence: u64,
}

impl FfmpegSource {
    pub fn new(options: SourceOptions) -> Self {
        Self {
            options,
            child: None,
            frames: None,
            reader: None,
            pending: None,
            sequence: 0,
        }
    }

    /// FFmpeg arguments for this source.
    pub fn build_args(&self) -> Vec<String> {
        let transport = &self.options.transport;
        let url = self.options.url.as_str();
        let stall_us = (transport.stall_timeout_ms * 1_000).to_string();

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostdin".into(),
        ];

        if is_rtsp(url) {
            args.extend([
                "-rtsp_transport".into(),
                transport.transport.as_str().into(),
                "-timeout".into(),
                stall_us,
            ]);
        } else if is_network(url) {
            args.extend(["-rw_timeout".into(), stall_us]);
        }

        args.extend([
            "-max_delay".into(),
            (transport.max_delay_ms * 1_000).to_string(),
        ]);

        if transport.regenerate_timestamps {
            args.extend(["-fflags".into(), "+genpts".into()]);
        }

        args.extend([
            "-i".into(),
            url.to_string(),
            "-an".into(),
            "-vf".into(),
            format!("scale={}:{}", self.options.width, self.options.height),
            "-pix_fmt".into(),
            self.options.format.ffmpeg_name().into(),
            "-f".into(),
            "rawvideo".into(),
            "-".into(),
        ]);

        args
    }

    fn frame_bytes(&self) -> usize {
        Frame::expected_len(self.options.width, self.options.height, self.options.format)
    }

    fn make_frame(&mut self, data: Vec<u8>) -> Frame {
        let frame = Frame {
            stream_id: self.options.stream_id.clone(),
            sequence: self.sequence,
            timestamp: Utc::now(),
            width: self.options.width,
            height: self.options.height,
            format: self.options.format,
            data,
        };
        self.sequence += 1;
        frame
    }

    fn recv(&mut self, timeout: Duration) -> MediaResult<Vec<u8>> {
        let event = match self.frames.as_ref() {
            Some(rx) => rx.recv_timeout(timeout),
            None => return Err(MediaError::StreamEnded),
        };

        match event {
            Ok(ReadEvent::Frame(data)) => Ok(data),
            Ok(ReadEvent::Failed(message)) => Err(MediaError::decode(message)),
            Ok(ReadEvent::Eof) | Err(RecvTimeoutError::Disconnected) => Err(self.exit_error()),
            Err(RecvTimeoutError::Timeout) => Err(MediaError::decode(format!(
                "no frame within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Classify the end of the decode session from the child's exit status.
    fn exit_error(&mut self) -> MediaError {
        let Some(child) = self.child.as_mut() else {
            return MediaError::StreamEnded;
        };

        let deadline = Instant::now() + EXIT_WAIT;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return MediaError::StreamEnded,
                Ok(Some(status)) => {
                    return MediaError::decode(format!("ffmpeg exited with {}", status))
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => return MediaError::decode("ffmpeg output closed but process is alive"),
                Err(e) => return MediaError::decode(format!("failed to reap ffmpeg: {}", e)),
            }
        }
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self) -> MediaResult<()> {
        self.close();

        which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)?;

        let args = self.build_args();
        debug!(
            stream_id = %self.options.stream_id,
            "Running FFmpeg: ffmpeg {}",
            args.join(" ")
        );

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("ffmpeg stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            let stream_id = self.options.stream_id.clone();
            thread::Builder::new()
                .name(format!("ffmpeg-log-{}", self.options.stream_id))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        warn!(stream_id = %stream_id, "ffmpeg: {}", line);
                    }
                })?;
        }

        let (tx, rx) = bounded(FRAME_BUFFER);
        let frame_bytes = self.frame_bytes();
        let reader = thread::Builder::new()
            .name(format!("ffmpeg-read-{}", self.options.stream_id))
            .spawn(move || read_loop(stdout, frame_bytes, tx))?;

        self.child = Some(child);
        self.frames = Some(rx);
        self.reader = Some(reader);

        match self.recv(self.options.transport.stall_timeout()) {
            Ok(data) => {
                self.pending = Some(data);
                info!(
                    stream_id = %self.options.stream_id,
                    url = %self.options.url,
                    "Frame source opened"
                );
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(MediaError::source_unavailable(&self.options.url, e.to_string()))
            }
        }
    }

    fn next_frame(&mut self) -> MediaResult<Frame> {
        if let Some(data) = self.pending.take() {
            return Ok(self.make_frame(data));
        }
        let data = self.recv(self.options.transport.stall_timeout())?;
        Ok(self.make_frame(data))
    }

    fn close(&mut self) {
        self.pending = None;

        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }

        // Dropping the receiver unblocks a reader stuck on a full channel.
        self.frames = None;

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn url(&self) -> &str {
        &self.options.url
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Provider creating [`FfmpegSource`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSourceProvider;

impl SourceProvider for FfmpegSourceProvider {
    fn create(&self, options: SourceOptions) -> MediaResult<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::new(options)))
    }
}

fn read_loop(mut stdout: impl Read, frame_bytes: usize, tx: Sender<ReadEvent>) {
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                if tx.send(ReadEvent::Frame(buffer)).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                let _ = tx.send(ReadEvent::Eof);
                return;
            }
            Err(err) => {
                let _ = tx.send(ReadEvent::Failed(err.to_string()));
                return;
            }
        }
    }
}

fn is_rtsp(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("rtsp://") || lower.starts_with("rtsps://")
}

fn is_network(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    ["rtmp://", "rtmps://", "http://", "https://", "srt://", "udp://", "tcp://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use vdet_models::{PixelFormat, RtspTransport, TransportOptions};

    fn options(url: &str) -> SourceOptions {
        SourceOptions {
            stream_id: "cam-1".to_string(),
            url: url.to_string(),
            width: 4,
            height: 2,
            format: PixelFormat::Rgb24,
            transport: TransportOptions::default(),
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_rtsp_args_use_reliable_transport() {
        let source = FfmpegSource::new(options("rtsp://10.0.0.5/stream1"));
        let args = source.build_args();

        assert_eq!(arg_after(&args, "-rtsp_transport"), Some("tcp"));
        assert_eq!(arg_after(&args, "-timeout"), Some("5000000"));
        assert_eq!(arg_after(&args, "-max_delay"), Some("500000"));
        assert_eq!(arg_after(&args, "-fflags"), Some("+genpts"));
        assert_eq!(arg_after(&args, "-vf"), Some("scale=4:2"));
        assert_eq!(arg_after(&args, "-pix_fmt"), Some("rgb24"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_udp_transport_override() {
        let mut opts = options("rtsp://10.0.0.5/stream1");
        opts.transport.transport = RtspTransport::Udp;
        opts.transport.regenerate_timestamps = false;
        let args = FfmpegSource::new(opts).build_args();

        assert_eq!(arg_after(&args, "-rtsp_transport"), Some("udp"));
        assert!(!args.iter().any(|a| a == "-fflags"));
    }

    #[test]
    fn test_file_source_has_no_network_flags() {
        let args = FfmpegSource::new(options("/videos/lobby.mp4")).build_args();
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
        assert!(!args.iter().any(|a| a == "-rw_timeout"));
        assert_eq!(arg_after(&args, "-i"), Some("/videos/lobby.mp4"));
    }

    #[test]
    fn test_http_source_uses_rw_timeout() {
        let args = FfmpegSource::new(options("https://cdn.local/live.m3u8")).build_args();
        assert_eq!(arg_after(&args, "-rw_timeout"), Some("5000000"));
    }

    #[test]
    fn test_read_loop_splits_frames_and_reports_eof() {
        // Two whole 4-byte frames and a truncated third one
        let bytes: Vec<u8> = (0..10).collect();
        let (tx, rx) = bounded(8);
        read_loop(Cursor::new(bytes), 4, tx);

        match rx.recv().unwrap() {
            ReadEvent::Frame(data) => assert_eq!(data, vec![0, 1, 2, 3]),
            _ => panic!("expected frame"),
        }
        match rx.recv().unwrap() {
            ReadEvent::Frame(data) => assert_eq!(data, vec![4, 5, 6, 7]),
            _ => panic!("expected frame"),
        }
        assert!(matches!(rx.recv().unwrap(), ReadEvent::Eof));
    }

    #[test]
    fn test_next_frame_without_open_reports_end() {
        let mut source = FfmpegSource::new(options("rtsp://10.0.0.5/stream1"));
        assert!(matches!(source.next_frame(), Err(MediaError::StreamEnded)));
        source.close();
        source.close();
    }
}
