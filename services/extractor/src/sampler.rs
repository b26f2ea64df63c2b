//! Stride-based frame sampling with a hard output cap.
//!
//! The sampler walks a video in decode order and treats every frame whose
//! decode index is a multiple of the stride as a candidate. Candidates are
//! converted, resized and written as `<stem>_<decode_index>.jpg`. Decoding
//! stops at end of stream or the moment `max_frames` frames have been saved;
//! frames after the cutoff are never read.

use crate::artifacts::{ArtifactLinks, ArtifactStore};
use crate::decoder::{DecodeError, VideoDecoder};
use crate::frame_processor::{Conversion, FrameProcessor, TargetSize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Saved-frame interval between progress log lines.
const PROGRESS_INTERVAL: usize = 50;

/// Invalid sampling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplingConfigError {
    #[error("every_nth must be at least 1, got {0}")]
    InvalidStride(i64),

    #[error("max_frames cannot be negative, got {0}")]
    InvalidMaxFrames(i64),
}

/// Errors that end sampling of a video.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("Failed to open video {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
}

/// Which frames to keep and how to transform them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingConfig {
    stride: u64,
    max_frames: u64,
    conversion: Conversion,
    target_size: Option<TargetSize>,
}

impl SamplingConfig {
    /// Validate the stride and cap. A stride below 1 is rejected here so the
    /// sampler can never spin or divide by zero.
    pub fn new(every_nth: i64, max_frames: i64) -> Result<Self, SamplingConfigError> {
        if every_nth < 1 {
            return Err(SamplingConfigError::InvalidStride(every_nth));
        }
        if max_frames < 0 {
            return Err(SamplingConfigError::InvalidMaxFrames(max_frames));
        }

        Ok(Self {
            stride: every_nth as u64,
            max_frames: max_frames as u64,
            conversion: Conversion::None,
            target_size: None,
        })
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = conversion;
        self
    }

    pub fn with_target_size(mut self, target_size: Option<TargetSize>) -> Self {
        self.target_size = target_size;
        self
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn max_frames(&self) -> u64 {
        self.max_frames
    }

    pub fn conversion(&self) -> Conversion {
        self.conversion
    }

    pub fn target_size(&self) -> Option<TargetSize> {
        self.target_size
    }

    /// Whether the frame at `decode_index` should be saved.
    pub fn is_candidate(&self, decode_index: u64) -> bool {
        decode_index % self.stride == 0
    }
}

/// A persisted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameArtifact {
    /// Decode-order position of the frame in the source video
    pub sequence_index: u64,
    pub file_path: PathBuf,
    pub url: String,
}

/// Result of sampling one video.
#[derive(Debug, Clone, Default)]
pub struct SamplingOutcome {
    /// Saved frames in increasing decode order
    pub artifacts: Vec<FrameArtifact>,
    pub frames_decoded: u64,
    pub candidates: u64,
    pub persist_failures: u64,
    /// True when decoding stopped because `max_frames` was reached
    pub hit_cap: bool,
    /// True when the stream ended on a decode error
    pub decode_failed: bool,
    pub elapsed: Duration,
}

impl SamplingOutcome {
    pub fn frames_saved(&self) -> usize {
        self.artifacts.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.url.clone()).collect()
    }

    /// A mid-stream decode error ends the stream. Frames saved so far stay.
    fn record_decode_error(&mut self, stem: &str, decode_index: u64, err: &DecodeError) {
        self.decode_failed = true;
        warn!(
            stem = %stem,
            decode_index,
            saved = self.artifacts.len(),
            error = %err,
            "Decode error, treating as end of stream"
        );
    }
}

/// Samples frames from local videos.
#[derive(Clone)]
pub struct FrameSampler {
    decoder: Arc<dyn VideoDecoder>,
    jpeg_quality: u8,
}

impl FrameSampler {
    pub fn new(decoder: Arc<dyn VideoDecoder>, jpeg_quality: u8) -> Self {
        Self {
            decoder,
            jpeg_quality,
        }
    }

    /// Sample `source`, writing frames into `store` under `stem`.
    ///
    /// Only a failure to open the video is an error. Frames that fail to
    /// transform or persist are skipped and not counted.
    pub fn sample(
        &self,
        source: &Path,
        stem: &str,
        config: &SamplingConfig,
        store: &ArtifactStore,
        links: &ArtifactLinks,
    ) -> Result<SamplingOutcome, SamplerError> {
        let started = Instant::now();
        let mut reader = self
            .decoder
            .open(source)
            .map_err(|source_err| SamplerError::OpenFailed {
                path: source.to_path_buf(),
                source: source_err,
            })?;

        let stream = reader.info().clone();
        info!(
            stem = %stem,
            width = stream.width,
            height = stream.height,
            fps = ?stream.frame_rate,
            frames = ?stream.frame_count,
            every_nth = config.stride(),
            max_frames = config.max_frames(),
            "Sampling video"
        );

        let mut outcome = SamplingOutcome::default();

        if config.max_frames() == 0 {
            debug!(stem = %stem, "max_frames is 0, skipping decode");
            outcome.elapsed = started.elapsed();
            return Ok(outcome);
        }

        let processor =
            FrameProcessor::new(config.conversion(), config.target_size(), self.jpeg_quality);
        let mut decode_index: u64 = 0;

        loop {
            if !config.is_candidate(decode_index) {
                match reader.skip_frame() {
                    Ok(true) => {
                        outcome.frames_decoded += 1;
                        decode_index += 1;
                        continue;
                    }
                    Ok(false) => break,
                    Err(e) => {
                        outcome.record_decode_error(stem, decode_index, &e);
                        break;
                    }
                }
            }

            let frame = match reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    outcome.record_decode_error(stem, decode_index, &e);
                    break;
                }
            };
            outcome.frames_decoded += 1;
            outcome.candidates += 1;

            let path = store.frame_path(stem, decode_index);
            let persisted = processor
                .process(frame)
                .and_then(|processed| processor.write_jpeg(&processed, &path));

            match persisted {
                Ok(()) => {
                    outcome.artifacts.push(FrameArtifact {
                        sequence_index: decode_index,
                        url: links.url_for(&path),
                        file_path: path,
                    });

                    let saved = outcome.artifacts.len();
                    if saved % PROGRESS_INTERVAL == 0 {
                        info!(stem = %stem, saved, "Saved frames");
                    }
                    if saved as u64 >= config.max_frames() {
                        info!(
                            stem = %stem,
                            max_frames = config.max_frames(),
                            "Hit max_frames, stopping"
                        );
                        outcome.hit_cap = true;
                        break;
                    }
                }
                Err(e) => {
                    outcome.persist_failures += 1;
                    warn!(
                        stem = %stem,
                        decode_index,
                        path = %path.display(),
                        error = %e,
                        "Failed to persist frame, skipping"
                    );
                }
            }

            decode_index += 1;
        }

        drop(reader);
        outcome.elapsed = started.elapsed();

        debug!(
            stem = %stem,
            frames_decoded = outcome.frames_decoded,
            candidates = outcome.candidates,
            saved = outcome.frames_saved(),
            persist_failures = outcome.persist_failures,
            "Sampling finished"
        );

        Ok(outcome)
    }
}
