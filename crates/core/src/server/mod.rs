use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

mod upload;

use crate::config::{resolve_relative_to, AppConfig};
use crate::process::{ProcessStatus, ProcessStore, VideoSource};
use crate::processing::Processor;

const VIDEO_FIELD: &str = "video";
const PROCESS_NOT_FOUND: &str = "Process ID not found";
const MAX_URL_LENGTH: usize = 2083;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: ProcessStore,
    processor: Processor,
    uploads_dir: PathBuf,
    max_upload_bytes: usize,
    cors_origins: Vec<HeaderValue>,
    allow_credentials: bool,
    shutdown: CancellationToken,
}

impl AppState {
    /// Builds the service state. `uploads_dir` must already exist.
    pub fn new(config: &AppConfig, uploads_dir: PathBuf, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;
        let cors_origins = config.cors.origin_header_values()?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                store: ProcessStore::new(),
                processor: Processor::new(&config.processing, shutdown.clone()),
                uploads_dir,
                max_upload_bytes: config.server.max_upload_bytes,
                cors_origins,
                allow_credentials: config.cors.allow_credentials,
                shutdown,
            }),
        })
    }

    pub fn store(&self) -> &ProcessStore {
        &self.inner.store
    }

    pub fn processor(&self) -> &Processor {
        &self.inner.processor
    }

    pub fn uploads_dir(&self) -> &StdPath {
        &self.inner.uploads_dir
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancels sleeping tasks and waits until every spawned task returned.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.processor.drain().await;
    }

    fn next_process_id(&self) -> String {
        loop {
            let id = ProcessStore::generate_id();
            if !self.inner.store.contains(&id) {
                return id;
            }
        }
    }
}

/// Resolves the configured uploads dir against `base`, creates it, and
/// builds the state.
pub fn app_state_with_config(
    config: &AppConfig,
    base: &StdPath,
    shutdown: CancellationToken,
) -> Result<AppState> {
    let uploads_dir = resolve_relative_to(base, &config.paths.uploads_dir);
    crate::config::ensure_uploads_dir(&uploads_dir)?;
    info!(uploads_dir = %uploads_dir.display(), "Uploads directory ready");

    let state = AppState::new(config, uploads_dir, shutdown)?;
    info!(
        delay_ms = state.processor().delay().as_millis() as u64,
        tags = ?state.processor().tags(),
        "Placeholder processing configured"
    );
    Ok(state)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct HttpUrl(Url);

impl HttpUrl {
    pub fn into_inner(self) -> Url {
        self.0
    }
}

impl TryFrom<String> for HttpUrl {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let trimmed = raw.trim();
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(format!("URL must be at most {MAX_URL_LENGTH} characters"));
        }

        let url = Url::parse(trimmed).map_err(|e| format!("invalid URL: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("URL scheme should be 'http' or 'https', got '{}'", url.scheme()));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err("URL host is required".to_string());
        }

        Ok(Self(url))
    }
}

#[derive(Debug, Deserialize)]
pub struct VideoUrlRequest {
    pub url: HttpUrl,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VideoResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ProcessStatus,
    pub tags: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.inner.cors_origins, state.inner.allow_credentials);
    let upload_limit = DefaultBodyLimit::max(state.inner.max_upload_bytes);

    Router::new()
        .route("/health", get(health))
        .route(
            "/video/formData",
            post(upload_video_form_data).layer(upload_limit),
        )
        .route("/video/url", post(submit_video_url))
        .route("/video/{id}", get(get_video_status))
        .fallback(route_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub fn build_cors_layer(origins: &[HeaderValue], allow_credentials: bool) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins.iter().cloned()))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(allow_credentials)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn route_not_found() -> AppError {
    AppError::NotFound("Not Found".to_string())
}

async fn upload_video_form_data(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VideoResponse>, AppError> {
    let mut multipart = multipart?;
    let process_id = state.next_process_id();

    let mut stored = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(VIDEO_FIELD) {
            stored =
                Some(upload::store_video_field(&state.inner.uploads_dir, &process_id, field).await?);
            break;
        }
    }

    let Some(file_path) = stored else {
        return Err(AppError::Unprocessable(format!(
            "missing multipart field: {VIDEO_FIELD}"
        )));
    };

    info!(
        process_id = %process_id,
        path = %file_path.display(),
        "Video upload accepted"
    );
    submit(&state, process_id, VideoSource::File(file_path))
}

async fn submit_video_url(
    State(state): State<AppState>,
    payload: Result<Json<VideoUrlRequest>, JsonRejection>,
) -> Result<Json<VideoResponse>, AppError> {
    let Json(payload) = payload?;
    let url = payload.url.into_inner();
    let process_id = state.next_process_id();

    info!(process_id = %process_id, url = %url, "Video URL accepted");
    submit(&state, process_id, VideoSource::Url(url))
}

fn submit(
    state: &AppState,
    process_id: String,
    source: VideoSource,
) -> Result<Json<VideoResponse>, AppError> {
    if !state.inner.store.insert_queued(&process_id, source) {
        return Err(AppError::Internal(format!(
            "process id collision: {process_id}"
        )));
    }

    // Fire and forget: the handle is dropped and the task keeps running.
    let _detached = state
        .inner
        .processor
        .spawn(state.inner.store.clone(), process_id.clone());

    Ok(Json(VideoResponse { id: process_id }))
}

async fn get_video_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let record = state
        .inner
        .store
        .get(&id)
        .ok_or_else(|| AppError::NotFound(PROCESS_NOT_FOUND.to_string()))?;

    Ok(Json(StatusResponse {
        status: record.status,
        tags: record.visible_tags().map(<[String]>::to_vec),
    }))
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Unprocessable(String),
    Internal(String),
    /// Extractor rejection; keeps the status axum chose.
    Rejected(StatusCode, String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::Internal(msg) => {
                warn!(error = %msg, "Request failed with internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            AppError::Rejected(status, msg) => (status, msg),
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        AppError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::Rejected(err.status(), err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use std::collections::HashSet;
    use std::time::Duration;
    use tower::{Service, ServiceExt};

    const BOUNDARY: &str = "vidtag-test-boundary";

    struct TestApp {
        state: AppState,
        router: Router,
        _uploads: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        test_app_with(AppConfig::default())
    }

    fn test_app_with(config: AppConfig) -> TestApp {
        let uploads = tempfile::tempdir().expect("uploads tempdir");
        let state = AppState::new(&config, uploads.path().to_path_buf(), CancellationToken::new())
            .expect("build test state");
        TestApp {
            router: app_router(state.clone()),
            state,
            _uploads: uploads,
        }
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn url_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/video/url")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn multipart_request(field_name: &str, file_name: &str, contents: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field_name}\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/video/formData")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn status_request(id: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/video/{id}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn submit_url(router: &mut Router, url: &str) -> String {
        let resp = send_request(router, url_request(serde_json::json!({ "url": url }))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        json["id"].as_str().expect("id is a string").to_string()
    }

    async fn get_status(router: &mut Router, id: &str) -> serde_json::Value {
        let resp = send_request(router, status_request(id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        body_json(resp).await
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let mut app = test_app();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_url_returns_uuid_and_queues_record() {
        let mut app = test_app();
        let id = submit_url(&mut app.router, "https://example.com/v.mp4").await;

        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let json = get_status(&mut app.router, &id).await;
        assert_eq!(json["status"], "queued");
        assert!(json["tags"].is_null());

        let record = app.state.store().get(&id).unwrap();
        assert_eq!(
            record.source,
            VideoSource::Url(Url::parse("https://example.com/v.mp4").unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_submission_lifecycle_reaches_done() {
        let mut app = test_app();
        let id = submit_url(&mut app.router, "https://example.com/v.mp4").await;

        assert_eq!(get_status(&mut app.router, &id).await["status"], "queued");

        tokio::time::sleep(Duration::from_millis(1)).await;
        let json = get_status(&mut app.router, &id).await;
        assert_eq!(json["status"], "processing");
        assert!(json["tags"].is_null());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let json = get_status(&mut app.router, &id).await;
        assert_eq!(json["status"], "done");
        assert_eq!(json["tags"], serde_json::json!(["tag1", "tag2", "tag3"]));
    }

    #[tokio::test]
    async fn test_configured_tags_and_delay_are_used() {
        let mut config = AppConfig::default();
        config.processing.delay_ms = 20;
        config.processing.tags = vec!["anime".to_string(), "outdoor".to_string()];
        let mut app = test_app_with(config);

        let id = submit_url(&mut app.router, "http://example.com/clip").await;
        app.state.processor().drain().await;

        let json = get_status(&mut app.router, &id).await;
        assert_eq!(json["status"], "done");
        assert_eq!(json["tags"], serde_json::json!(["anime", "outdoor"]));
    }

    #[tokio::test]
    async fn test_submit_url_rejects_malformed_urls() {
        let mut app = test_app();

        for bad in ["not a url", "ftp://example.com/v.mp4", "mailto:someone@example.com", ""] {
            let resp =
                send_request(&mut app.router, url_request(serde_json::json!({ "url": bad })))
                    .await;
            assert_eq!(
                resp.status(),
                StatusCode::UNPROCESSABLE_ENTITY,
                "expected 422 for {bad:?}"
            );
            assert!(body_json(resp).await["detail"].is_string());
        }

        assert!(app.state.store().is_empty());
    }

    #[tokio::test]
    async fn test_submit_url_requires_url_field() {
        let mut app = test_app();
        let resp = send_request(
            &mut app.router,
            url_request(serde_json::json!({ "link": "https://example.com" })),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(app.state.store().is_empty());
    }

    #[tokio::test]
    async fn test_upload_writes_prefixed_file_and_queues_record() {
        let mut app = test_app();
        let resp = send_request(
            &mut app.router,
            multipart_request("video", "clip.mp4", b"fake video bytes"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let id = body_json(resp).await["id"].as_str().unwrap().to_string();

        let json = get_status(&mut app.router, &id).await;
        assert_eq!(json["status"], "queued");
        assert!(json["tags"].is_null());

        let expected_path = app.state.uploads_dir().join(format!("{id}_clip.mp4"));
        let contents = std::fs::read(&expected_path).expect("uploaded file exists");
        assert_eq!(contents, b"fake video bytes");

        let record = app.state.store().get(&id).unwrap();
        assert_eq!(record.source, VideoSource::File(expected_path));
    }

    #[tokio::test]
    async fn test_upload_strips_directories_from_file_name() {
        let mut app = test_app();
        let resp = send_request(
            &mut app.router,
            multipart_request("video", "../../escape.mp4", b"x"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let id = body_json(resp).await["id"].as_str().unwrap().to_string();

        assert!(app
            .state
            .uploads_dir()
            .join(format!("{id}_escape.mp4"))
            .exists());
    }

    #[tokio::test]
    async fn test_upload_without_video_field_is_unprocessable() {
        let mut app = test_app();
        let resp = send_request(
            &mut app.router,
            multipart_request("attachment", "clip.mp4", b"bytes"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            body_json(resp).await["detail"],
            "missing multipart field: video"
        );
        assert!(app.state.store().is_empty());
        assert_eq!(
            std::fs::read_dir(app.state.uploads_dir()).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_upload_rejects_non_multipart_body() {
        let mut app = test_app();
        let req = Request::builder()
            .method("POST")
            .uri("/video/formData")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let resp = send_request(&mut app.router, req).await;
        assert!(resp.status().is_client_error());
        assert!(app.state.store().is_empty());
    }

    #[tokio::test]
    async fn test_upload_write_failure_is_internal_error_without_record() {
        let config = AppConfig::default();
        let base = tempfile::tempdir().expect("base tempdir");
        let missing = base.path().join("missing-uploads");
        let state = AppState::new(&config, missing.clone(), CancellationToken::new())
            .expect("build test state");
        let mut router = app_router(state.clone());

        let resp = send_request(
            &mut router,
            multipart_request("video", "clip.mp4", b"fake video bytes"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body_json(resp).await["detail"].as_str().unwrap().to_string();
        assert_eq!(detail, upload::UPLOAD_STORAGE_FAILED);
        assert!(!detail.contains(&base.path().display().to_string()));
        assert!(state.store().is_empty());
        assert!(!missing.exists());
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_wildcard_origin_is_refused_before_router_build() {
        let mut config = AppConfig::default();
        config.cors.allowed_origins = vec!["*".to_string()];
        let uploads = tempfile::tempdir().expect("uploads tempdir");

        let result = AppState::new(&config, uploads.path().to_path_buf(), CancellationToken::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_status_unknown_id_is_not_found() {
        let mut app = test_app();
        let resp = send_request(&mut app.router, status_request("nonexistent-id")).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["detail"], PROCESS_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_json_not_found() {
        let mut app = test_app();
        let req = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["detail"], "Not Found");
    }

    #[tokio::test]
    async fn test_repeated_submissions_get_distinct_ids() {
        let mut app = test_app();
        let mut seen = HashSet::new();

        for i in 0..20 {
            let id = submit_url(&mut app.router, &format!("https://example.com/{i}.mp4")).await;
            assert!(seen.insert(id), "id reused");
        }
        assert_eq!(app.state.store().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_never_collide() {
        let app = test_app();

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let router = app.router.clone();
                tokio::spawn(async move {
                    let req = url_request(
                        serde_json::json!({ "url": format!("https://example.com/{i}.mp4") }),
                    );
                    let resp = router.oneshot(req).await.unwrap();
                    assert_eq!(resp.status(), StatusCode::OK);
                    body_json(resp).await["id"].as_str().unwrap().to_string()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()));
        }
        assert_eq!(seen.len(), 32);
        assert_eq!(app.state.store().len(), 32);
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_listed_origin() {
        let mut app = test_app();
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/video/url")
            .header(header::ORIGIN, "http://localhost")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let headers = resp.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        let allow_methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap();
        assert!(allow_methods.contains("POST"));
    }

    #[tokio::test]
    async fn test_cors_ignores_unlisted_origin() {
        let mut app = test_app();
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_upload_body_limit_is_enforced() {
        let mut config = AppConfig::default();
        config.server.max_upload_bytes = 64;
        let mut app = test_app_with(config);

        let resp = send_request(
            &mut app.router,
            multipart_request("video", "big.mp4", &[0u8; 4096]),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(app.state.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_tasks() {
        let mut app = test_app();
        let id = submit_url(&mut app.router, "https://example.com/v.mp4").await;

        tokio::time::sleep(Duration::from_millis(1)).await;
        app.state.shutdown().await;

        assert_eq!(app.state.processor().active_tasks(), 0);
        assert_eq!(get_status(&mut app.router, &id).await["status"], "processing");
    }

    #[test]
    fn test_http_url_validation() {
        assert!(HttpUrl::try_from("https://example.com/v.mp4".to_string()).is_ok());
        assert!(HttpUrl::try_from("  http://127.0.0.1:8080/a ".to_string()).is_ok());
        assert!(HttpUrl::try_from("file:///etc/passwd".to_string()).is_err());
        assert!(HttpUrl::try_from("https://".to_string()).is_err());

        let too_long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(HttpUrl::try_from(too_long).is_err());
    }
}
