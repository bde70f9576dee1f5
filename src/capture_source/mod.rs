//! CaptureSource - Frame Acquisition
//!
//! ## Responsibilities
//!
//! - Parse stream descriptors (URI or numeric device index)
//! - Open a blocking frame source per camera
//! - Split an MJPEG byte stream into JPEG frames
//!
//! Sources are read from a dedicated capture thread, so everything here is
//! blocking std I/O. Frames are opaque encoded bytes.

use crate::error::{Error, Result};
use std::fmt;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on a single buffered frame
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Socket read timeout passed to ffmpeg for network inputs (microseconds)
const NETWORK_RW_TIMEOUT_US: &str = "5000000";

/// Hard deadline for the ffprobe frame-rate probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(8);
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Encoded frame; cheap to clone
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Arc<[u8]>,
}

impl Frame {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(bytes.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("bytes", &self.data.len()).finish()
    }
}

/// Where a camera's frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Local capture device index (`/dev/videoN`)
    Device(u32),
    /// Stream URI or file path
    Uri(String),
}

impl SourceDescriptor {
    /// Parse a descriptor; all-digit strings are device indices
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Validation("empty source descriptor".to_string()));
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(SourceDescriptor::Device(index));
        }
        Ok(SourceDescriptor::Uri(s.to_string()))
    }

    pub fn is_network(&self) -> bool {
        match self {
            SourceDescriptor::Device(_) => false,
            SourceDescriptor::Uri(uri) => uri.contains("://"),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "{}", index),
            SourceDescriptor::Uri(uri) => f.write_str(uri),
        }
    }
}

/// Open frame source owned by one capture thread
pub trait CaptureSource: Send {
    /// Block until the next frame is available
    fn read(&mut self) -> Result<Frame>;

    /// Frame rate reported by the source, if known
    fn fps(&self) -> Option<f64>;

    /// Release the underlying handle; further reads fail
    fn release(&mut self);
}

/// Factory for capture sources
pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn CaptureSource>>;
}

/// Splits a concatenated JPEG stream into frames
pub struct MjpegReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_BYTES)
    }

    pub fn with_limit(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK_BYTES),
            max_frame_bytes,
        }
    }

    /// Next complete frame, `None` at end of stream
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(frame) = self.extract() {
                return Ok(Some(frame));
            }

            if self.buf.len() > self.max_frame_bytes {
                let buffered = self.buf.len();
                self.buf.clear();
                return Err(Error::Capture(format!(
                    "no frame boundary within {} bytes",
                    buffered
                )));
            }

            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn extract(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find_marker(&self.buf, SOI, 0) else {
            // Keep a trailing 0xFF that may begin the next marker
            let keep = usize::from(self.buf.last() == Some(&0xFF));
            let discard = self.buf.len() - keep;
            self.buf.drain(..discard);
            return None;
        };
        if start > 0 {
            self.buf.drain(..start);
        }

        let end = find_marker(&self.buf, EOI, SOI.len())?;
        Some(self.buf.drain(..end + EOI.len()).collect())
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|i| i + from)
}

/// Parse an ffprobe rational frame rate (`30000/1001`, `25/1`, `30`)
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let s = s.trim();
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Opens ffmpeg child processes emitting an MJPEG pipe
pub struct FfmpegOpener {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    probe_timeout: Duration,
}

impl FfmpegOpener {
    /// Create new opener using `ffmpeg`/`ffprobe` from PATH
    pub fn new() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_binaries(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn input_args(descriptor: &SourceDescriptor) -> Vec<String> {
        let mut args = Vec::new();
        match descriptor {
            SourceDescriptor::Device(index) => {
                args.extend(["-f".to_string(), "v4l2".to_string()]);
                args.extend(["-i".to_string(), format!("/dev/video{}", index)]);
            }
            SourceDescriptor::Uri(uri) => {
                if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
                    args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
                }
                if descriptor.is_network() {
                    args.extend(["-rw_timeout".to_string(), NETWORK_RW_TIMEOUT_US.to_string()]);
                }
                args.extend(["-i".to_string(), uri.clone()]);
            }
        }
        args
    }

    /// Ask ffprobe for the stream's average frame rate
    ///
    /// ffprobe gets the same input options as ffmpeg and is killed once
    /// `probe_timeout` elapses; any failure yields `None`.
    fn probe_fps(&self, descriptor: &SourceDescriptor) -> Option<f64> {
        let mut child = Command::new(&self.ffprobe_bin)
            .args([
                "-v", "error",
                "-select_streams", "v:0",
                "-show_entries", "stream=avg_frame_rate",
                "-of", "csv=p=0",
            ])
            .args(Self::input_args(descriptor))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| tracing::debug!(error = %e, "ffprobe spawn failed"))
            .ok()?;

        let deadline = Instant::now() + self.probe_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    tracing::warn!(
                        source = %descriptor,
                        timeout_ms = self.probe_timeout.as_millis() as u64,
                        "ffprobe timed out, using default frame rate"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                Ok(None) => std::thread::sleep(PROBE_POLL_INTERVAL),
                Err(e) => {
                    tracing::debug!(error = %e, "ffprobe wait failed");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
            }
        }

        let output = child.wait_with_output().ok()?;
        if !output.status.success() {
            return None;
        }
        parse_frame_rate(String::from_utf8_lossy(&output.stdout).lines().next()?)
    }
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn CaptureSource>> {
        let fps = self.probe_fps(descriptor);

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(["-loglevel", "error", "-nostdin"])
            .args(Self::input_args(descriptor))
            .args(["-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Capture(format!("ffmpeg spawn failed: {}", e)))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Capture("ffmpeg stdout not captured".to_string()));
        };

        tracing::info!(
            source = %descriptor,
            fps = ?fps,
            pid = child.id(),
            "ffmpeg capture started"
        );

        Ok(Box::new(FfmpegSource {
            child: Some(child),
            reader: MjpegReader::new(stdout),
            fps,
        }))
    }
}

/// Running ffmpeg capture
struct FfmpegSource {
    child: Option<Child>,
    reader: MjpegReader<ChildStdout>,
    fps: Option<f64>,
}

impl CaptureSource for FfmpegSource {
    fn read(&mut self) -> Result<Frame> {
        if self.child.is_none() {
            return Err(Error::Capture("source released".to_string()));
        }
        match self.reader.next_frame()? {
            Some(bytes) => Ok(Frame::from_bytes(bytes)),
            None => Err(Error::Capture("stream ended".to_string())),
        }
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "ffmpeg already exited");
            }
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}
