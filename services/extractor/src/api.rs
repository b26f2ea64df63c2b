use crate::artifacts::{ArtifactLinks, STATIC_ROUTE};
use crate::audio::AudioMode;
use crate::config::{ApiConfig, SamplingDefaults};
use crate::frame_processor::{Conversion, TargetSize};
use crate::pipeline::{ExtractError, ExtractPipeline, ExtractionRequest, ExtractionResult};
use crate::sampler::SamplingConfig;
use crate::source::{SourceMaterializer, StagedSources};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::QueryRejection, DefaultBodyLimit, Multipart, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub materializer: Arc<SourceMaterializer>,
    pub pipeline: Arc<ExtractPipeline>,
    /// Externally visible origin for artifact links, if configured
    pub public_base_url: Option<String>,
    pub sampling: SamplingDefaults,
}

/// Query parameters for extraction
#[derive(Debug, Default, Deserialize)]
pub struct ExtractQuery {
    /// Remote video, used only when no multipart video was supplied
    pub video_url: Option<String>,
    /// Keep every Nth decoded frame
    pub every_nth: Option<i64>,
    pub resize_w: Option<u32>,
    pub resize_h: Option<u32>,
    /// "", "rgb" or "gray"
    pub convert: Option<String>,
    /// Upper bound on saved frames per video
    pub max_frames: Option<i64>,
    /// "", "link" or "path"
    pub return_wav: Option<String>,
}

impl ExtractQuery {
    fn to_request(&self, defaults: &SamplingDefaults) -> Result<ExtractionRequest, ExtractError> {
        let conversion = match self.convert.as_deref() {
            Some(convert) => convert.parse::<Conversion>()?,
            None => Conversion::None,
        };

        let sampling = SamplingConfig::new(
            self.every_nth.unwrap_or(defaults.every_nth),
            self.max_frames.unwrap_or(defaults.max_frames),
        )?
        .with_conversion(conversion)
        .with_target_size(TargetSize::from_parts(self.resize_w, self.resize_h));

        let audio = match self.return_wav.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(mode) => Some(mode.parse::<AudioMode>()?),
        };

        Ok(ExtractionRequest { sampling, audio })
    }
}

/// Extraction response
#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub results: Vec<ExtractionResult>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let static_files = ServeDir::new(state.pipeline.store().root());

    Router::new()
        .route("/health", get(health_check))
        .route("/extract", post(extract))
        .nest_service(STATIC_ROUTE, static_files)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.body_limit()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Sample frames (and optionally audio) from every supplied video
#[instrument(skip_all)]
async fn extract(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ExtractQuery>, QueryRejection>,
    multipart: Option<Multipart>,
) -> Result<Json<ExtractResponse>, (StatusCode, Json<ErrorResponse>)> {
    let started = Instant::now();
    let Query(params) = query.map_err(|rejection| {
        error_response(ExtractError::InvalidSampling(rejection.body_text()))
    })?;
    let request = params.to_request(&state.sampling).map_err(error_response)?;
    let links = ArtifactLinks::new(&base_url(state.public_base_url.as_deref(), &headers));

    // Staged files are deleted when `sources` drops, including on cancellation
    let mut sources = state.materializer.batch();
    stage_sources(&state, multipart, params.video_url.as_deref(), &mut sources)
        .await
        .map_err(error_response)?;

    let results = state
        .pipeline
        .run(&sources, &request, &links)
        .await
        .map_err(error_response)?;

    metrics::counter!("extractor.requests.completed").increment(1);
    metrics::histogram!("extractor.request.duration_seconds")
        .record(started.elapsed().as_secs_f64());
    info!(
        videos = results.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Extraction request completed"
    );

    Ok(Json(ExtractResponse { results }))
}

/// Stage every input into `sources`: uploaded files first, then raw byte
/// payloads, then the URL when nothing else was supplied.
async fn stage_sources(
    state: &AppState,
    multipart: Option<Multipart>,
    video_url: Option<&str>,
    sources: &mut StagedSources,
) -> Result<(), ExtractError> {
    let mut payloads = state.materializer.batch();
    let staged = match multipart {
        Some(multipart) => {
            stage_multipart(&state.materializer, multipart, sources, &mut payloads).await
        }
        None => Ok(()),
    };
    sources.append(&mut payloads);
    staged?;

    if sources.is_empty() {
        if let Some(url) = video_url.map(str::trim).filter(|url| !url.is_empty()) {
            sources.push(state.materializer.from_url(url).await?);
        }
    }

    Ok(())
}

async fn stage_multipart(
    materializer: &SourceMaterializer,
    mut multipart: Multipart,
    uploads: &mut StagedSources,
    payloads: &mut StagedSources,
) -> Result<(), ExtractError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ExtractError::UploadInterrupted(e.body_text()))?
    {
        let part = field.name().unwrap_or_default().to_string();
        let file_name = field
            .file_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        match (part.as_str(), file_name) {
            ("videos", Some(file_name)) => {
                uploads.push(materializer.from_stream(Some(&file_name), field).await?);
            }
            // Parts without a filename carry the video as raw bytes
            ("videos", None) | ("videos_bytes", _) => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ExtractError::UploadInterrupted(e.body_text()))?;
                let name = format!("video-{}.mp4", payloads.len() + 1);
                payloads.push(materializer.from_bytes(&data, Some(&name)).await?);
            }
            _ => debug!(part = %part, "Ignoring unknown multipart field"),
        }
    }

    Ok(())
}

/// Configured public base URL, else the request's own origin.
fn base_url(configured: Option<&str>, headers: &HeaderMap) -> String {
    if let Some(configured) = configured {
        return configured.to_string();
    }

    let host = headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn error_response(err: ExtractError) -> (StatusCode, Json<ErrorResponse>) {
    metrics::counter!("extractor.requests.failed").increment(1);
    let status = if err.is_client_error() {
        warn!(error = %err, code = err.code(), "Rejected extraction request");
        StatusCode::BAD_REQUEST
    } else {
        error!(error = ?err, code = err.code(), "Extraction request failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().to_string(),
        }),
    )
}

/// Start the extraction API server and run until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting extraction API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::audio::fake::FakeTranscoder;
    use crate::audio::{AudioExtractor, AudioProfile};
    use crate::config::{FetchConfig, StorageConfig};
    use crate::decoder::synthetic::SyntheticDecoder;
    use crate::decoder::DecodeError;
    use crate::sampler::FrameSampler;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "extractor-test-boundary";

    struct TestApp {
        router: Router,
        outputs: tempfile::TempDir,
        staging: tempfile::TempDir,
    }

    fn app(public_base_url: Option<&str>) -> TestApp {
        app_with(SyntheticDecoder::new(100), public_base_url)
    }

    fn app_with(decoder: SyntheticDecoder, public_base_url: Option<&str>) -> TestApp {
        let outputs = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(outputs.path());

        let storage = StorageConfig {
            output_dir: outputs.path().to_path_buf(),
            staging_dir: staging.path().to_path_buf(),
            retain_sources: false,
        };
        let fetch = FetchConfig {
            connect_timeout_secs: 2,
            read_timeout_secs: 2,
            ..FetchConfig::default()
        };

        let pipeline = ExtractPipeline::new(
            FrameSampler::new(Arc::new(decoder), 90),
            AudioExtractor::new(
                Arc::new(FakeTranscoder::default()),
                store.clone(),
                AudioProfile::speech("64k"),
            ),
            store,
        );
        let state = AppState {
            materializer: Arc::new(SourceMaterializer::new(&storage, &fetch).unwrap()),
            pipeline: Arc::new(pipeline),
            public_base_url: public_base_url.map(str::to_string),
            sampling: SamplingDefaults::default(),
        };

        TestApp {
            router: create_router(state, &ApiConfig::default()),
            outputs,
            staging,
        }
    }

    /// (field name, optional filename, content)
    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn extract_request(query: &str, body: Option<Vec<u8>>) -> Request<Body> {
        let builder = Request::builder()
            .method("POST")
            .uri(format!("/extract{query}"))
            .header(header::HOST, "extractor.test:8000");
        match body {
            Some(body) => builder
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(body))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(None);

        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_extract_without_input() {
        let app = app(None);

        let response = app.router.oneshot(extract_request("", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({ "error": "No video provided", "code": "NO_INPUT" })
        );
    }

    #[tokio::test]
    async fn test_extract_rejects_zero_stride() {
        let app = app(None);
        let body = multipart_body(&[("videos", Some("clip.mp4"), b"data")]);

        let response = app
            .router
            .oneshot(extract_request("?every_nth=0", Some(body)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_PARAMETERS");
        assert_eq!(std::fs::read_dir(app.staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_extract_rejects_unknown_conversion() {
        let app = app(None);

        let response = app
            .router
            .oneshot(extract_request("?convert=sepia", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_PARAMETERS");
    }

    #[tokio::test]
    async fn test_extract_files_before_byte_payloads() {
        let app = app(None);
        let body = multipart_body(&[
            ("videos_bytes", None, b"raw"),
            ("videos", Some("clip.mp4"), b"upload"),
            ("videos", None, b"raw again"),
        ]);

        let response = app
            .router
            .oneshot(extract_request("?every_nth=30&max_frames=2", Some(body)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        let results = json["results"].as_array().unwrap();
        let videos: Vec<&str> = results
            .iter()
            .map(|r| r["video"].as_str().unwrap())
            .collect();
        assert_eq!(videos, vec!["clip.mp4", "video-1.mp4", "video-2.mp4"]);
        assert_eq!(results[0]["frames_saved"], 2);
        assert_eq!(
            results[0]["frames_json_url"],
            "http://extractor.test:8000/static/clip_frames.json"
        );
        assert_eq!(results[0]["wav"], serde_json::Value::Null);

        assert!(app.outputs.path().join("clip_0.jpg").exists());
        assert!(app.outputs.path().join("clip_30.jpg").exists());
        assert!(!app.outputs.path().join("clip_60.jpg").exists());
        // Staged sources are released after the request
        assert_eq!(std::fs::read_dir(app.staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_extract_rejects_malformed_query() {
        let app = app(None);

        let response = app
            .router
            .oneshot(extract_request("?every_nth=abc", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["code"], "INVALID_PARAMETERS");
        assert!(json["error"].as_str().unwrap().contains("every_nth"));
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_staged_sources() {
        let decoder = SyntheticDecoder::new(100).with_frame_delay(Duration::from_millis(20));
        let counters = decoder.counters.clone();
        let app = app_with(decoder, None);
        let body = multipart_body(&[("videos", Some("clip.mp4"), b"upload")]);

        let result = tokio::time::timeout(
            Duration::from_millis(300),
            app.router.oneshot(extract_request("?every_nth=1", Some(body))),
        )
        .await;

        assert!(result.is_err());
        // The request was dropped mid-sampling
        assert_eq!(counters.opened(), 1);
        assert_eq!(std::fs::read_dir(app.staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_extract_with_audio_and_public_base_url() {
        let app = app(Some("https://cdn.example.com"));
        let body = multipart_body(&[("videos", Some("talk.mp4"), b"upload")]);

        let response = app
            .router
            .oneshot(extract_request("?return_wav=link&max_frames=1", Some(body)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(
            json["results"][0]["wav"],
            "https://cdn.example.com/static/talk.m4a"
        );
        assert_eq!(
            json["results"][0]["frames_json_url"],
            "https://cdn.example.com/static/talk_frames.json"
        );
    }

    #[tokio::test]
    async fn test_open_failure_is_bad_request() {
        let (status, Json(body)) = error_response(ExtractError::DecodeOpenFailed {
            name: "broken.mp4".to_string(),
            source: DecodeError::NoVideoStream("/staging/x.mp4".into()),
        });

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "Failed to open video: broken.mp4");
        assert_eq!(body.code, "OPEN_FAILED");
    }

    #[tokio::test]
    async fn test_extract_url_download_failure() {
        let app = app(None);

        let response = app
            .router
            .oneshot(extract_request(
                "?video_url=http://127.0.0.1:1/clip.mp4",
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({
                "error": "Failed to download video_url",
                "code": "DOWNLOAD_FAILED"
            })
        );
    }

    #[tokio::test]
    async fn test_static_serves_output_root() {
        let app = app(None);
        std::fs::write(app.outputs.path().join("clip_frames.json"), "[]").unwrap();

        let response = app
            .router
            .oneshot(
                Request::get("/static/clip_frames.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"[]");
    }

    #[test]
    fn test_base_url() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "10.0.0.5:8000".parse().unwrap());

        assert_eq!(base_url(None, &headers), "http://10.0.0.5:8000");
        assert_eq!(
            base_url(Some("https://public.example.com"), &headers),
            "https://public.example.com"
        );
        assert_eq!(base_url(None, &HeaderMap::new()), "http://localhost");
    }

    #[test]
    fn test_query_defaults() {
        let request = ExtractQuery::default()
            .to_request(&SamplingDefaults::default())
            .unwrap();

        assert_eq!(request.sampling.stride(), 30);
        assert_eq!(request.sampling.max_frames(), 200);
        assert_eq!(request.sampling.conversion(), Conversion::None);
        assert_eq!(request.sampling.target_size(), None);
        assert_eq!(request.audio, None);
    }

    #[test]
    fn test_query_resize_needs_both_dimensions() {
        let defaults = SamplingDefaults::default();
        let partial = ExtractQuery {
            resize_w: Some(320),
            ..Default::default()
        };
        let full = ExtractQuery {
            resize_w: Some(320),
            resize_h: Some(240),
            convert: Some("gray".to_string()),
            return_wav: Some("path".to_string()),
            ..Default::default()
        };

        assert_eq!(partial.to_request(&defaults).unwrap().sampling.target_size(), None);

        let request = full.to_request(&defaults).unwrap();
        assert_eq!(
            request.sampling.target_size(),
            Some(TargetSize {
                width: 320,
                height: 240
            })
        );
        assert_eq!(request.sampling.conversion(), Conversion::Grayscale);
        assert_eq!(request.audio, Some(AudioMode::Path));
    }
}
