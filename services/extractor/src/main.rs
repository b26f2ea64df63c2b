use anyhow::{Context, Result};
use extractor_service::{
    start_api_server, AppState, ArtifactStore, AudioExtractor, AudioProfile, Config,
    ExtractPipeline, FfmpegDecoder, FfmpegTranscoder, FrameSampler, SourceMaterializer,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        "Starting Video Extractor Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = ArtifactStore::new(&config.storage.output_dir);
    store
        .ensure_root()
        .with_context(|| format!("Failed to create output dir {}", store.root().display()))?;

    let materializer = SourceMaterializer::new(&config.storage, &config.fetch)
        .context("Failed to initialize source materializer")?;
    materializer.ensure_staging_dir().with_context(|| {
        format!(
            "Failed to create staging dir {}",
            materializer.staging_dir().display()
        )
    })?;

    let public_base_url = config.public_base_url();
    info!(
        output_dir = %store.root().display(),
        staging_dir = %materializer.staging_dir().display(),
        public_base_url = public_base_url.as_deref().unwrap_or("<request host>"),
        "Artifact storage ready"
    );

    let decoder = FfmpegDecoder::new(
        config.decoder.ffmpeg_path.clone(),
        config.decoder.ffprobe_path.clone(),
    );
    let sampler = FrameSampler::new(Arc::new(decoder), config.sampling.jpeg_quality);

    let transcoder =
        FfmpegTranscoder::new(config.audio.ffmpeg_path.clone(), config.audio_timeout());
    let audio = AudioExtractor::new(
        Arc::new(transcoder),
        store.clone(),
        AudioProfile::speech(config.audio.bitrate.clone()),
    );

    let state = AppState {
        materializer: Arc::new(materializer),
        pipeline: Arc::new(ExtractPipeline::new(sampler, audio, store)),
        public_base_url,
        sampling: config.sampling.clone(),
    };

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Video extractor service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down video extractor service");
}
