//! Sequential video decoding.
//!
//! A [`VideoDecoder`] opens a local file and hands back a [`FrameReader`]
//! that yields packed BGR24 frames in decode order. The reader owns the
//! underlying decode handle and releases it when dropped, so every exit path
//! of a decode loop (end of stream, early break, `?` propagation, panic)
//! releases it exactly once.
//!
//! The production decoder probes the file with `ffprobe` and then streams raw
//! frames out of an `ffmpeg` child process:
//!
//! ```text
//! ffprobe (dimensions) -> ffmpeg -f rawvideo -pix_fmt bgr24 - -> FrameReader
//! ```

use serde::Deserialize;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

/// Bytes per pixel of decoded frames (BGR24).
pub const DECODED_CHANNELS: usize = 3;

/// Decoder stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 2048;

/// Errors that can occur while opening or reading a video.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to probe {path}: {reason}")]
    ProbeFailed { path: PathBuf, reason: String },

    #[error("No decodable video stream in {0}")]
    NoVideoStream(PathBuf),

    #[error("Invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Failed to start decoder: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("Decoder exited with {status}: {stderr}")]
    DecoderFailed { status: String, stderr: String },

    #[error("Decoder I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A decoded frame in packed BGR24 layout.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame data, `width * height * 3` bytes
    pub data: Vec<u8>,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,
}

/// Properties of the video stream being decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Average frame rate, when the container reports one
    pub frame_rate: Option<f64>,
    /// Frame count, when the container reports one
    pub frame_count: Option<u64>,
}

impl StreamInfo {
    /// Size in bytes of one decoded frame.
    pub fn frame_len(&self) -> Result<usize, DecodeError> {
        let invalid = DecodeError::InvalidDimensions {
            width: self.width,
            height: self.height,
        };
        if self.width == 0 || self.height == 0 {
            return Err(invalid);
        }
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(DECODED_CHANNELS))
            .ok_or(invalid)
    }
}

/// Opens videos for sequential decode.
pub trait VideoDecoder: Send + Sync {
    /// Open `path`. Failure here means the file cannot be decoded at all.
    fn open(&self, path: &Path) -> Result<Box<dyn FrameReader>, DecodeError>;
}

/// An open decode handle. Dropping it releases the handle.
pub trait FrameReader: Send {
    /// Stream properties reported at open time.
    fn info(&self) -> &StreamInfo;

    /// Decode the next frame. `Ok(None)` marks the end of the stream.
    fn read_frame(&mut self) -> Result<Option<RawFrame>, DecodeError>;

    /// Advance past the next frame without handing it out. Returns `false`
    /// at the end of the stream.
    fn skip_frame(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_frame()?.is_some())
    }
}

/// Decoder backed by the `ffprobe` and `ffmpeg` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Read the first video stream's properties.
    pub fn probe(&self, path: &Path) -> Result<StreamInfo, DecodeError> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DecodeError::ProbeFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError::ProbeFailed {
                path: path.to_path_buf(),
                reason: stderr.trim().to_string(),
            });
        }

        parse_probe_output(&output.stdout)
            .ok_or_else(|| DecodeError::NoVideoStream(path.to_path_buf()))
    }

    fn spawn(&self, path: &Path) -> Result<Child, DecodeError> {
        Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-noautorotate"])
            .arg("-i")
            .arg(path)
            .args([
                "-map", "0:v:0",
                "-an", "-sn", "-dn",
                "-vsync", "passthrough",
                "-f", "rawvideo",
                "-pix_fmt", "bgr24",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(DecodeError::SpawnFailed)
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameReader>, DecodeError> {
        let info = self.probe(path)?;
        let frame_len = info.frame_len()?;

        let mut child = self.spawn(path)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DecodeError::SpawnFailed(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "decoder stdout unavailable",
                )));
            }
        };

        let stderr = child.stderr.take().and_then(spawn_stderr_collector);

        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            pid = child.id(),
            "Decoder opened"
        );

        Ok(Box::new(FfmpegFrameReader {
            child,
            stdout: BufReader::with_capacity(frame_len, stdout),
            stderr,
            info,
            frame_len,
            scratch: Vec::new(),
            frames_read: 0,
            failure_reported: false,
        }))
    }
}

/// Raw frame stream read from an `ffmpeg` child's stdout.
struct FfmpegFrameReader {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    info: StreamInfo,
    frame_len: usize,
    /// Reused by `skip_frame`
    scratch: Vec<u8>,
    frames_read: u64,
    failure_reported: bool,
}

impl FfmpegFrameReader {
    /// Fill `buf` with the next frame. `Ok(false)` at a clean end of stream.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool, DecodeError> {
        let filled = read_full(&mut self.stdout, buf)?;

        if filled == 0 {
            self.finish()?;
            return Ok(false);
        }
        if filled < self.frame_len {
            return Err(DecodeError::TruncatedFrame {
                expected: self.frame_len,
                actual: filled,
            });
        }

        self.frames_read += 1;
        Ok(true)
    }

    /// Reap the child once its output is exhausted. A non-zero exit means
    /// the stream ended on a decode failure.
    fn finish(&mut self) -> Result<(), DecodeError> {
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }

        self.failure_reported = true;
        Err(DecodeError::DecoderFailed {
            status: status.to_string(),
            stderr: self.stderr_tail(),
        })
    }

    fn stderr_tail(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|collector| collector.join().ok())
            .unwrap_or_default()
    }
}

impl FrameReader for FfmpegFrameReader {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<RawFrame>, DecodeError> {
        let mut data = vec![0u8; self.frame_len];
        if !self.fill(&mut data)? {
            return Ok(None);
        }

        Ok(Some(RawFrame {
            data,
            width: self.info.width,
            height: self.info.height,
        }))
    }

    fn skip_frame(&mut self) -> Result<bool, DecodeError> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(self.frame_len, 0);
        let result = self.fill(&mut scratch);
        self.scratch = scratch;
        result
    }
}

impl Drop for FfmpegFrameReader {
    fn drop(&mut self) {
        // The child may still be blocked writing frames we will never read.
        let killed = matches!(self.child.try_wait(), Ok(None)) && self.child.kill().is_ok();

        match self.child.wait() {
            Ok(status) if !status.success() && !killed && !self.failure_reported => {
                let stderr = self.stderr_tail();
                warn!(
                    frames_read = self.frames_read,
                    status = %status,
                    stderr = %stderr,
                    "Decoder exited with failure"
                );
            }
            Ok(status) => debug!(
                frames_read = self.frames_read,
                status = %status,
                "Decoder released"
            ),
            Err(e) => warn!(error = %e, "Failed to reap decoder process"),
        }
    }
}

/// Drain the child's stderr on a helper thread, keeping only the tail.
fn spawn_stderr_collector(mut stderr: ChildStderr) -> Option<JoinHandle<String>> {
    std::thread::Builder::new()
        .name("decoder-stderr".to_string())
        .spawn(move || {
            let mut tail = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match stderr.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        tail.extend_from_slice(&chunk[..n]);
                        if tail.len() > STDERR_TAIL_BYTES {
                            tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            String::from_utf8_lossy(&tail).trim().to_string()
        })
        .map_err(|e| warn!(error = %e, "Failed to start decoder stderr reader"))
        .ok()
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Deserialize)]
struct ProbeOutput {
    streams: Option<Vec<ProbeStream>>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

fn parse_probe_output(stdout: &[u8]) -> Option<StreamInfo> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;
    let stream = probe.streams?.into_iter().next()?;

    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

    Some(StreamInfo {
        width: stream.width?,
        height: stream.height?,
        frame_rate,
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
    })
}

/// Parse a frame rate such as "30/1", "30000/1001" or "29.97".
fn parse_frame_rate(rate: &str) -> Option<f64> {
    if let Some((num, den)) = rate.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den > 0.0 && num > 0.0).then(|| num / den);
    }
    rate.parse().ok().filter(|r: &f64| *r > 0.0)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("30/1").unwrap() - 30.0).abs() < 0.01);
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert!((parse_frame_rate("25").unwrap() - 25.0).abs() < 0.01);
        assert!(parse_frame_rate("0/0").is_none());
        assert!(parse_frame_rate("n/a").is_none());
    }

    #[test]
    fn test_parse_probe_output() {
        let json = br#"{
            "programs": [],
            "streams": [
                {"width": 1280, "height": 720, "avg_frame_rate": "30000/1001",
                 "r_frame_rate": "30000/1001", "nb_frames": "1800"}
            ]
        }"#;

        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.frame_count, Some(1800));
        assert!((info.frame_rate.unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_parse_probe_output_without_video_stream() {
        assert!(parse_probe_output(br#"{"streams": []}"#).is_none());
        assert!(parse_probe_output(br#"{}"#).is_none());
        assert!(parse_probe_output(b"not json").is_none());
    }

    #[test]
    fn test_frame_len() {
        let info = StreamInfo {
            width: 4,
            height: 2,
            frame_rate: None,
            frame_count: None,
        };
        assert_eq!(info.frame_len().unwrap(), 24);

        let empty = StreamInfo { width: 0, ..info };
        assert!(matches!(
            empty.frame_len(),
            Err(DecodeError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_read_full_reports_short_reads() {
        let mut source: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 5];
        assert_eq!(read_full(&mut source, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    /// Write an executable shell script standing in for a decoder binary.
    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// 2x1 BGR frames are 6 bytes each.
    #[cfg(unix)]
    fn scripted_decoder(dir: &Path, ffmpeg_body: &str) -> FfmpegDecoder {
        let ffprobe = script(
            dir,
            "ffprobe",
            r#"echo '{"streams":[{"width":2,"height":1,"avg_frame_rate":"25/1"}]}'"#,
        );
        let ffmpeg = script(dir, "ffmpeg", ffmpeg_body);
        FfmpegDecoder::new(ffmpeg, ffprobe)
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_reader_reads_and_skips_frames() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = scripted_decoder(dir.path(), "printf 'abcdefghijklmnopqr'");

        let mut reader = decoder.open(Path::new("clip.mp4")).unwrap();
        assert_eq!(reader.info().frame_rate, Some(25.0));

        let first = reader.read_frame().unwrap().unwrap();
        assert_eq!(first.data, b"abcdef");
        assert!(reader.skip_frame().unwrap());
        let third = reader.read_frame().unwrap().unwrap();
        assert_eq!(third.data, b"mnopqr");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_reader_reports_decoder_failure() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = scripted_decoder(
            dir.path(),
            "printf 'abcdef'\necho 'corrupt packet at 00:00:01' >&2\nexit 1",
        );

        let mut reader = decoder.open(Path::new("clip.mp4")).unwrap();
        assert!(reader.read_frame().unwrap().is_some());

        match reader.read_frame() {
            Err(DecodeError::DecoderFailed { stderr, .. }) => {
                assert!(stderr.contains("corrupt packet"), "stderr: {stderr}");
            }
            other => panic!("expected decoder failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_reader_truncated_frame() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = scripted_decoder(dir.path(), "printf 'abcdefgh'");

        let mut reader = decoder.open(Path::new("clip.mp4")).unwrap();
        assert!(reader.skip_frame().unwrap());
        assert!(matches!(
            reader.read_frame(),
            Err(DecodeError::TruncatedFrame {
                expected: 6,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_missing_probe_binary_fails_open() {
        let decoder = FfmpegDecoder::new("definitely-not-ffmpeg", "definitely-not-ffprobe");
        let result = decoder.open(Path::new("/nonexistent/video.mp4"));
        assert!(matches!(result, Err(DecodeError::ProbeFailed { .. })));
    }
}
