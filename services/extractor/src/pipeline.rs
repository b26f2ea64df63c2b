//! Per-request extraction pipeline.
//!
//! Videos are processed strictly one after another in input order. For each
//! video the frame sampler runs on the blocking pool, the manifest is
//! written, and the audio track is optionally extracted. The first video
//! that cannot be opened aborts the whole batch.

use crate::artifacts::{ArtifactLinks, ArtifactStore};
use crate::audio::{AudioExtractor, AudioMode, InvalidAudioMode};
use crate::decoder::DecodeError;
use crate::frame_processor::InvalidConversion;
use crate::manifest::{ManifestError, ManifestWriter};
use crate::sampler::{
    FrameSampler, SamplerError, SamplingConfig, SamplingConfigError, SamplingOutcome,
};
use crate::source::{SourceError, VideoSource};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("No video provided")]
    InputUnavailable,

    #[error("Failed to download video_url")]
    SourceFetchFailed(#[source] SourceError),

    #[error("Failed to read uploaded video: {0}")]
    UploadInterrupted(String),

    #[error("Failed to open video: {name}")]
    DecodeOpenFailed {
        name: String,
        #[source]
        source: DecodeError,
    },

    #[error("{0}")]
    InvalidSampling(String),

    #[error("Failed to stage video: {0}")]
    Source(#[source] SourceError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Frame sampling task failed: {0}")]
    Task(String),
}

impl ExtractError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputUnavailable => "NO_INPUT",
            Self::SourceFetchFailed(_) => "DOWNLOAD_FAILED",
            Self::UploadInterrupted(_) => "UPLOAD_FAILED",
            Self::DecodeOpenFailed { .. } => "OPEN_FAILED",
            Self::InvalidSampling(_) => "INVALID_PARAMETERS",
            Self::Source(_) | Self::Manifest(_) | Self::Task(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Source(_) | Self::Manifest(_) | Self::Task(_))
    }
}

impl From<SourceError> for ExtractError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::FetchFailed { .. } => Self::SourceFetchFailed(err),
            SourceError::UploadInterrupted(reason) => Self::UploadInterrupted(reason),
            other => Self::Source(other),
        }
    }
}

impl From<SamplingConfigError> for ExtractError {
    fn from(err: SamplingConfigError) -> Self {
        Self::InvalidSampling(err.to_string())
    }
}

impl From<InvalidConversion> for ExtractError {
    fn from(err: InvalidConversion) -> Self {
        Self::InvalidSampling(err.to_string())
    }
}

impl From<InvalidAudioMode> for ExtractError {
    fn from(err: InvalidAudioMode) -> Self {
        Self::InvalidSampling(err.to_string())
    }
}

/// Parameters shared by every video of a request.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub sampling: SamplingConfig,
    /// `None` skips audio extraction
    pub audio: Option<AudioMode>,
}

/// Outcome for one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    pub video: String,
    pub frames_saved: usize,
    pub frames_json_url: String,
    /// Audio URL or path, `null` when not requested or extraction failed
    pub wav: Option<String>,
}

#[derive(Clone)]
pub struct ExtractPipeline {
    sampler: FrameSampler,
    manifests: ManifestWriter,
    audio: AudioExtractor,
    store: ArtifactStore,
}

impl ExtractPipeline {
    pub fn new(sampler: FrameSampler, audio: AudioExtractor, store: ArtifactStore) -> Self {
        Self {
            sampler,
            manifests: ManifestWriter::new(store.clone()),
            audio,
            store,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Process `sources` in order. Staged files are left for the caller to
    /// release.
    pub async fn run(
        &self,
        sources: &[VideoSource],
        request: &ExtractionRequest,
        links: &ArtifactLinks,
    ) -> Result<Vec<ExtractionResult>, ExtractError> {
        if sources.is_empty() {
            return Err(ExtractError::InputUnavailable);
        }

        warn_on_stem_collisions(sources);

        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            results.push(self.process(source, request, links).await?);
        }

        Ok(results)
    }

    #[instrument(skip(self, source, request, links), fields(video = %source.display_name))]
    async fn process(
        &self,
        source: &VideoSource,
        request: &ExtractionRequest,
        links: &ArtifactLinks,
    ) -> Result<ExtractionResult, ExtractError> {
        let started = Instant::now();

        let sampler = self.sampler.clone();
        let manifests = self.manifests.clone();
        let store = self.store.clone();
        let sample_links = links.clone();
        let config = request.sampling.clone();
        let path = source.local_path.clone();
        let stem = source.stem.clone();
        let name = source.display_name.clone();

        // Sampling and the manifest write are both blocking filesystem work
        let (outcome, manifest) = tokio::task::spawn_blocking(move || {
            let outcome = sampler
                .sample(&path, &stem, &config, &store, &sample_links)
                .map_err(|e| match e {
                    SamplerError::OpenFailed { source: cause, .. } => {
                        metrics::counter!("extractor.videos.open_failed").increment(1);
                        ExtractError::DecodeOpenFailed { name, source: cause }
                    }
                })?;
            let manifest = manifests.write(&stem, &outcome.urls())?;
            Ok::<_, ExtractError>((outcome, manifest))
        })
        .await
        .map_err(|e| ExtractError::Task(e.to_string()))??;

        record_sampling_metrics(&outcome);

        let frames_json_url = links.url_for(&manifest);
        let frames_elapsed = started.elapsed();

        let audio_started = Instant::now();
        let wav = match request.audio {
            Some(mode) => self.audio.extract_for(source, mode, links).await,
            None => None,
        };
        let audio_elapsed = audio_started.elapsed();
        if request.audio.is_some() {
            metrics::histogram!("extractor.audio.duration_seconds")
                .record(audio_elapsed.as_secs_f64());
        }

        metrics::counter!("extractor.videos.processed").increment(1);
        metrics::histogram!("extractor.video.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            video = %source.display_name,
            frames_saved = outcome.frames_saved(),
            frames_ms = frames_elapsed.as_millis() as u64,
            audio_ms = audio_elapsed.as_millis() as u64,
            total_ms = started.elapsed().as_millis() as u64,
            "Processed video"
        );

        Ok(ExtractionResult {
            video: source.display_name.clone(),
            frames_saved: outcome.frames_saved(),
            frames_json_url,
            wav,
        })
    }
}

fn record_sampling_metrics(outcome: &SamplingOutcome) {
    metrics::counter!("extractor.frames.decoded").increment(outcome.frames_decoded);
    metrics::counter!("extractor.frames.saved").increment(outcome.frames_saved() as u64);
    metrics::counter!("extractor.frames.persist_failed").increment(outcome.persist_failures);
    if outcome.hit_cap {
        metrics::counter!("extractor.sampling.capped").increment(1);
    }
    if outcome.decode_failed {
        metrics::counter!("extractor.decode.errors").increment(1);
    }
    metrics::histogram!("extractor.sampling.duration_seconds")
        .record(outcome.elapsed.as_secs_f64());
}

/// Videos sharing a stem overwrite each other's artifacts.
fn warn_on_stem_collisions(sources: &[VideoSource]) {
    let mut seen = HashSet::new();
    for source in sources {
        if !seen.insert(source.stem.as_str()) {
            warn!(
                stem = %source.stem,
                video = %source.display_name,
                "Stem already used in this request, artifacts will be overwritten"
            );
        }
    }
}
