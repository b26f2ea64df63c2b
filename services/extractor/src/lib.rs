//! Video Extractor Service
//!
//! Samples frames and audio from uploaded or remote videos. Each request
//! stages its videos locally, decodes them frame by frame, keeps every Nth
//! frame up to a hard cap, and publishes the results under `/static`.
//!
//! ## Features
//!
//! - **Three input kinds**: streamed multipart uploads, raw byte payloads and
//!   remote URLs fetched as a stream
//! - **Bounded sampling**: decoding stops the moment `max_frames` frames have
//!   been saved
//! - **Per-frame transforms**: optional RGB or grayscale conversion and a
//!   fixed-size bilinear resize before JPEG encoding
//! - **Frame manifests**: one JSON list of frame URLs per video, replaced
//!   atomically
//! - **Audio tracks**: optional 16 kHz mono AAC via an external transcoder,
//!   degrading to `null` on failure
//!
//! ## Architecture
//!
//! ```text
//! POST /extract
//!      │
//!      ▼
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Source       │───▶│ Frame        │───▶│ Manifest     │
//! │ Materializer │    │ Sampler      │    │ Writer       │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌──────────────┐    ┌──────────────┐
//!                     │ Frame        │    │ Audio        │
//!                     │ Processor    │    │ Extractor    │
//!                     └──────────────┘    └──────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                      <output_root>  ◀── GET /static/*
//! ```

pub mod api;
pub mod artifacts;
pub mod audio;
pub mod config;
pub mod decoder;
pub mod frame_processor;
pub mod manifest;
pub mod pipeline;
pub mod sampler;
pub mod source;

pub use api::{create_router, start_api_server, AppState};
pub use artifacts::{ArtifactLinks, ArtifactStore};
pub use audio::{AudioExtractor, AudioMode, AudioProfile, AudioTranscoder, FfmpegTranscoder};
pub use config::Config;
pub use decoder::{FfmpegDecoder, FrameReader, VideoDecoder};
pub use frame_processor::{Conversion, FrameProcessor, TargetSize};
pub use manifest::ManifestWriter;
pub use pipeline::{ExtractError, ExtractPipeline, ExtractionRequest, ExtractionResult};
pub use sampler::{FrameArtifact, FrameSampler, SamplingConfig, SamplingOutcome};
pub use source::{SourceMaterializer, StagedSources, VideoSource};
