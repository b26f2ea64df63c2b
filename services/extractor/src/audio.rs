//! Audio track extraction.
//!
//! The audio of a source video is transcoded into a 16 kHz mono AAC track
//! (`<stem>.m4a`) by an external transcoder. Extraction is best effort: a
//! failure is logged and reported as an absent track, never as a request
//! error.

use crate::artifacts::{ArtifactLinks, ArtifactStore};
use crate::source::VideoSource;
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Longest stderr tail carried in an error.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Failed to start transcoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Transcoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Transcoder timed out after {0:?}")]
    TimedOut(Duration),
}

/// How the audio track is reported in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// Public URL under the static route
    Link,
    /// Local filesystem path
    Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("return_wav must be one of 'link' or 'path', got {0:?}")]
pub struct InvalidAudioMode(pub String);

impl FromStr for AudioMode {
    type Err = InvalidAudioMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "link" => Ok(Self::Link),
            "path" => Ok(Self::Path),
            _ => Err(InvalidAudioMode(s.to_string())),
        }
    }
}

/// Target encoding of the audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioProfile {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: String,
}

impl AudioProfile {
    /// Mono 16 kHz AAC.
    pub fn speech(bitrate: impl Into<String>) -> Self {
        Self {
            codec: "aac".to_string(),
            sample_rate: 16_000,
            channels: 1,
            bitrate: bitrate.into(),
        }
    }
}

/// An extracted audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioArtifact {
    pub file_path: PathBuf,
    pub profile: AudioProfile,
}

/// Converts the audio of `source` into `output`.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn transcode(
        &self,
        source: &Path,
        output: &Path,
        profile: &AudioProfile,
    ) -> Result<(), AudioError>;
}

/// Transcoder backed by an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn args(source: &Path, output: &Path, profile: &AudioProfile) -> Vec<OsString> {
        let sample_rate = profile.sample_rate.to_string();
        let channels = profile.channels.to_string();

        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), source.into()];
        args.extend(
            [
                "-vn",
                "-acodec",
                profile.codec.as_str(),
                "-ar",
                sample_rate.as_str(),
                "-ac",
                channels.as_str(),
                "-b:a",
                profile.bitrate.as_str(),
            ]
            .map(OsString::from),
        );
        args.push(output.into());
        args
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        source: &Path,
        output: &Path,
        profile: &AudioProfile,
    ) -> Result<(), AudioError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::args(source, output, profile))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The child is killed when the output future is dropped on timeout
        let result = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AudioError::TimedOut(self.timeout))?
            .map_err(|source| AudioError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(AudioError::Failed {
                status: result.status.to_string(),
                stderr: stderr_tail(&result.stderr),
            });
        }

        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }

    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Extracts audio tracks into an [`ArtifactStore`].
#[derive(Clone)]
pub struct AudioExtractor {
    transcoder: Arc<dyn AudioTranscoder>,
    store: ArtifactStore,
    profile: AudioProfile,
}

impl AudioExtractor {
    pub fn new(
        transcoder: Arc<dyn AudioTranscoder>,
        store: ArtifactStore,
        profile: AudioProfile,
    ) -> Self {
        Self {
            transcoder,
            store,
            profile,
        }
    }

    pub fn profile(&self) -> &AudioProfile {
        &self.profile
    }

    /// Transcode the audio of `source` to `<stem>.m4a`.
    #[instrument(skip(self, source), fields(video = %source.display_name, stem = %source.stem))]
    pub async fn extract(&self, source: &VideoSource) -> Result<AudioArtifact, AudioError> {
        let output = self.store.audio_path(&source.stem);
        let started = Instant::now();

        if let Err(e) = self
            .transcoder
            .transcode(&source.local_path, &output, &self.profile)
            .await
        {
            if let Err(remove_err) = tokio::fs::remove_file(&output).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    debug!(
                        path = %output.display(),
                        error = %remove_err,
                        "Failed to remove partial audio"
                    );
                }
            }
            return Err(e);
        }

        info!(
            video = %source.display_name,
            path = %output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Extracted audio"
        );

        Ok(AudioArtifact {
            file_path: output,
            profile: self.profile.clone(),
        })
    }

    /// Extract audio and render it for `mode`. Failures degrade to `None`.
    pub async fn extract_for(
        &self,
        source: &VideoSource,
        mode: AudioMode,
        links: &ArtifactLinks,
    ) -> Option<String> {
        match self.extract(source).await {
            Ok(artifact) => Some(match mode {
                AudioMode::Link => links.url_for(&artifact.file_path),
                AudioMode::Path => artifact.file_path.to_string_lossy().into_owned(),
            }),
            Err(e) => {
                metrics::counter!("extractor.audio.failed").increment(1);
                warn!(
                    video = %source.display_name,
                    error = %e,
                    "Audio extraction failed"
                );
                None
            }
        }
    }
}
