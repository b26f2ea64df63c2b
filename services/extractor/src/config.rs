//! Configuration management for the extractor service.
//!
//! Configuration is layered: built-in defaults, optional config files,
//! `EXTRACTOR__*` environment variables, and finally the legacy
//! `OUTPUT_DIR` / `PUBLIC_BASE_URL` / `AUDIO_BITRATE` variables used by
//! earlier deployments.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the extractor service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Artifact and staging storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Default sampling parameters
    #[serde(default)]
    pub sampling: SamplingDefaults,
    /// Video decoder configuration
    #[serde(default)]
    pub decoder: DecoderConfig,
    /// Audio extraction configuration
    #[serde(default)]
    pub audio: AudioConfig,
    /// Remote fetch configuration
    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// External base URL used in returned links. Derived from the request
    /// `Host` header when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: u64,
}

/// Where artifacts and staged sources live
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Output root for frames, manifests and audio, served under /static
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for materialized source videos
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Keep staged source videos after a request completes
    #[serde(default)]
    pub retain_sources: bool,
}

/// Defaults applied when a request omits sampling parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingDefaults {
    /// Take every Nth decoded frame
    #[serde(default = "default_every_nth")]
    pub every_nth: i64,
    /// Maximum frames saved per video
    #[serde(default = "default_max_frames")]
    pub max_frames: i64,
    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// External decoder binaries
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

/// Audio transcoding configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Transcoder binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// AAC bitrate passed to the transcoder (e.g. "64k")
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: String,
    /// Kill the transcoder after this many seconds
    #[serde(default = "default_audio_timeout_secs")]
    pub timeout_secs: u64,
}

/// Remote video fetch configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum wait for the next body chunk in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub read_timeout_secs: u64,
    /// User-Agent header sent with fetches
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// Default value functions
fn default_service_name() -> String {
    "video-extractor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_body_limit_bytes() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GiB
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/app/outputs")
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("video-extractor")
}

fn default_every_nth() -> i64 {
    30
}

fn default_max_frames() -> i64 {
    200
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_audio_bitrate() -> String {
    "64k".to_string()
}

fn default_audio_timeout_secs() -> u64 {
    600
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    "video-extractor/1.0".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            public_base_url: None,
            cors_enabled: false,
            cors_origins: Vec::new(),
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            staging_dir: default_staging_dir(),
            retain_sources: false,
        }
    }
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            every_nth: default_every_nth(),
            max_frames: default_max_frames(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            bitrate: default_audio_bitrate(),
            timeout_secs: default_audio_timeout_secs(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_fetch_timeout_secs(),
            read_timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
            sampling: SamplingDefaults::default(),
            decoder: DecoderConfig::default(),
            audio: AudioConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from config files and the environment.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/extractor.*` and `/etc/video-extractor/extractor.*`
    /// 2. `EXTRACTOR__SECTION__KEY` environment variables
    /// 3. Legacy `OUTPUT_DIR`, `PUBLIC_BASE_URL`, `AUDIO_BITRATE`
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/extractor").required(false))
            .add_source(
                config::File::with_name("/etc/video-extractor/extractor").required(false),
            )
            // EXTRACTOR__STORAGE__OUTPUT_DIR -> storage.output_dir
            .add_source(
                config::Environment::with_prefix("EXTRACTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("storage.output_dir", non_empty_env("OUTPUT_DIR"))?
            .set_override_option(
                "api.public_base_url",
                non_empty_env("PUBLIC_BASE_URL"),
            )?
            .set_override_option("audio.bitrate", non_empty_env("AUDIO_BITRATE"))?
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.output_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.output_dir".to_string(),
            ));
        }

        if self.sampling.every_nth < 1 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.every_nth".to_string(),
                message: "Stride must be at least 1".to_string(),
            });
        }

        if self.sampling.max_frames < 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.max_frames".to_string(),
                message: "Frame cap cannot be negative".to_string(),
            });
        }

        if !(1..=100).contains(&self.sampling.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "sampling.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.audio.bitrate.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "audio.bitrate".to_string(),
            ));
        }

        if let Some(base) = &self.api.public_base_url {
            if !base.starts_with("http://") && !base.starts_with("https://") {
                return Err(ConfigValidationError::InvalidValue {
                    field: "api.public_base_url".to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Public base URL with any trailing slash removed
    pub fn public_base_url(&self) -> Option<String> {
        self.api
            .public_base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }

    /// Get audio transcode timeout as Duration
    pub fn audio_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.timeout_secs)
    }
}

impl ApiConfig {
    /// Body limit as a `usize`, saturating on targets with a narrower one.
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.body_limit_bytes).unwrap_or(usize::MAX)
    }
}

impl FetchConfig {
    /// Get connection timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get per-chunk read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
