//! Materializes request inputs as local files.
//!
//! Uploads, raw byte payloads and remote URLs all end up as a uniquely named
//! `<uuid>.mp4` file in the staging directory, paired with a display name and
//! a sanitized stem that prefixes every artifact derived from the video.
//! Staged files belong to a [`StagedSources`] batch that deletes them when it
//! is dropped.

use crate::config::{FetchConfig, StorageConfig};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Url};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Write buffer for streamed inputs.
const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

/// Longest stem kept after sanitizing.
pub const MAX_STEM_LEN: usize = 128;

const DEFAULT_UPLOAD_NAME: &str = "upload.mp4";
const STAGED_EXTENSION: &str = "mp4";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to download {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Upload interrupted: {0}")]
    UploadInterrupted(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientInit(#[source] reqwest::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A video staged on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    /// Staged copy, owned by the request that created it
    pub local_path: PathBuf,
    /// Name reported back to the caller
    pub display_name: String,
    /// Prefix of every artifact derived from this video
    pub stem: String,
}

impl VideoSource {
    fn new(local_path: PathBuf, display_name: String) -> Self {
        let stem = safe_stem(&display_name);
        Self {
            local_path,
            display_name,
            stem,
        }
    }
}

/// The staged sources of one request.
///
/// Dropping the batch deletes every staged file unless sources are
/// retained, so cancelled requests clean up as well as finished ones.
#[derive(Debug)]
pub struct StagedSources {
    sources: Vec<VideoSource>,
    retain: bool,
}

impl StagedSources {
    pub fn push(&mut self, source: VideoSource) {
        self.sources.push(source);
    }

    /// Move every source of `other` to the end of this batch.
    pub fn append(&mut self, other: &mut StagedSources) {
        self.sources.append(&mut other.sources);
    }
}

impl Deref for StagedSources {
    type Target = [VideoSource];

    fn deref(&self) -> &[VideoSource] {
        &self.sources
    }
}

impl Drop for StagedSources {
    fn drop(&mut self) {
        if self.retain {
            if !self.sources.is_empty() {
                debug!(count = self.sources.len(), "Retaining staged sources");
            }
            return;
        }

        for source in &self.sources {
            match std::fs::remove_file(&source.local_path) {
                Ok(()) => {
                    debug!(path = %source.local_path.display(), "Released staged source")
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %source.local_path.display(),
                    error = %e,
                    "Failed to delete staged source"
                ),
            }
        }
    }
}

/// Turns uploads, byte payloads and URLs into [`VideoSource`]s.
#[derive(Clone)]
pub struct SourceMaterializer {
    staging_dir: PathBuf,
    retain_sources: bool,
    client: Client,
    read_timeout: Duration,
}

impl SourceMaterializer {
    pub fn new(storage: &StorageConfig, fetch: &FetchConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(fetch.connect_timeout())
            .user_agent(fetch.user_agent.clone())
            .build()
            .map_err(SourceError::ClientInit)?;

        Ok(Self {
            staging_dir: storage.staging_dir.clone(),
            retain_sources: storage.retain_sources,
            client,
            read_timeout: fetch.read_timeout(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Start an empty batch for one request.
    pub fn batch(&self) -> StagedSources {
        StagedSources {
            sources: Vec::new(),
            retain: self.retain_sources,
        }
    }

    /// Create the staging directory if it does not exist.
    pub fn ensure_staging_dir(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.staging_dir)
    }

    /// Stage a streamed upload without buffering it whole.
    pub async fn from_stream<S, E>(
        &self,
        declared_name: Option<&str>,
        stream: S,
    ) -> Result<VideoSource, SourceError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let display_name = declared_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_UPLOAD_NAME)
            .to_string();
        let path = self.staging_path().await?;

        let mut stream = std::pin::pin!(stream);
        let mut staged = StagedFile::create(&path).await?;
        let copied = async {
            let mut total = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| SourceError::UploadInterrupted(e.to_string()))?;
                staged.write(&chunk).await?;
                total += chunk.len() as u64;
            }
            Ok::<_, SourceError>(total)
        }
        .await;
        let written = staged.commit(copied).await?;
        record_staged(written);

        debug!(name = %display_name, bytes = written, "Staged upload");
        Ok(VideoSource::new(path, display_name))
    }

    /// Stage an in-memory payload. Without a hint the name is
    /// `video-<8 hex>.mp4`.
    pub async fn from_bytes(
        &self,
        data: &[u8],
        name_hint: Option<&str>,
    ) -> Result<VideoSource, SourceError> {
        let display_name = name_hint
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{STAGED_EXTENSION}", random_stem()));
        let path = self.staging_path().await?;

        let mut staged = StagedFile::create(&path).await?;
        let written = staged.write(data).await;
        staged.commit(written).await?;
        record_staged(data.len() as u64);

        debug!(name = %display_name, bytes = data.len(), "Staged byte payload");
        Ok(VideoSource::new(path, display_name))
    }

    /// Download `url` into the staging directory.
    ///
    /// Any transport failure, timeout or non-2xx status is a
    /// [`SourceError::FetchFailed`]. There are no retries.
    #[instrument(skip(self))]
    pub async fn from_url(&self, url: &str) -> Result<VideoSource, SourceError> {
        let fetch_failed = |reason: String| SourceError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| fetch_failed(e.to_string()))?;
        let display_name = name_from_url(&parsed);

        info!(url = %url, name = %display_name, "Fetching remote video");

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| fetch_failed(e.to_string()))?;

        let path = self.staging_path().await?;
        let read_timeout = self.read_timeout;
        let mut stream = response.bytes_stream();

        let mut staged = StagedFile::create(&path).await?;
        let copied = async {
            let mut total = 0u64;
            loop {
                let next = tokio::time::timeout(read_timeout, stream.next())
                    .await
                    .map_err(|_| {
                        fetch_failed(format!(
                            "no data received for {}s",
                            read_timeout.as_secs()
                        ))
                    })?;
                let Some(chunk) = next else { break };
                let chunk = chunk.map_err(|e| fetch_failed(e.to_string()))?;
                staged.write(&chunk).await?;
                total += chunk.len() as u64;
            }
            Ok::<_, SourceError>(total)
        }
        .await;
        let written = staged.commit(copied).await?;
        record_staged(written);

        info!(url = %url, bytes = written, "Fetched remote video");
        Ok(VideoSource::new(path, display_name))
    }

    /// A fresh `<uuid>.mp4` path in the staging directory.
    async fn staging_path(&self) -> Result<PathBuf, SourceError> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| io_error(&self.staging_dir, e))?;

        Ok(self
            .staging_dir
            .join(format!("{}.{STAGED_EXTENSION}", Uuid::new_v4().simple())))
    }
}

/// A staged file being written through a bounded buffer. Removed on drop
/// unless committed.
struct StagedFile {
    path: PathBuf,
    writer: BufWriter<File>,
    committed: bool,
}

impl StagedFile {
    async fn create(path: &Path) -> Result<Self, SourceError> {
        let file = File::create(path).await.map_err(|e| io_error(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(WRITE_BUFFER_BYTES, file),
            committed: false,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), SourceError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    /// Flush and keep the file if `copied` succeeded.
    async fn commit<T>(mut self, copied: Result<T, SourceError>) -> Result<T, SourceError> {
        let value = copied?;
        self.writer
            .flush()
            .await
            .map_err(|e| io_error(&self.path, e))?;
        self.committed = true;
        Ok(value)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial file");
            }
        }
    }
}

fn record_staged(bytes: u64) {
    metrics::counter!("extractor.sources.staged").increment(1);
    metrics::counter!("extractor.sources.bytes_staged").increment(bytes);
}

fn io_error(path: &Path, source: io::Error) -> SourceError {
    SourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn random_stem() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("video-{}", &id[..8])
}

/// Reduce a file name to a filesystem-safe artifact prefix.
///
/// The final extension is dropped, surrounding whitespace trimmed and only
/// ASCII alphanumerics, `-` and `_` kept, truncated to [`MAX_STEM_LEN`].
/// Falls back to `video-<8 hex>` when nothing usable remains.
pub fn safe_stem(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    if stem.is_empty() {
        return random_stem();
    }

    let clean: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_STEM_LEN)
        .collect();

    if clean.is_empty() {
        random_stem()
    } else {
        clean
    }
}

/// Display name for a fetched URL: its sanitized last path segment with an
/// `.mp4` suffix.
fn name_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("video");

    format!("{}.{STAGED_EXTENSION}", safe_stem(segment))
}
