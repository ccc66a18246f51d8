//! Web server entrypoints live here.

use std::{
    collections::HashSet,
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, FromRequest, MatchedPath, Multipart, Request, State,
        connect_info::ConnectInfo,
        multipart::Field,
    },
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::{CONTENT_TYPE, RETRY_AFTER}},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::watch,
};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admission::AdmissionController;
use crate::analyze::{AnalysisProvider, AnalyzeError, AnalyzeErrorKind, ByteStream, TranscriptRequest, UploadRequest};
use crate::config::{CorsConfig, ProxyMode, ServerConfig};

const ANALYZE_PATH: &str = "/analyze";
const HEALTH_PATH: &str = "/health";
const HEALTH_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_HEADER: &str = "x-request-id";
const SPOOL_CHUNK_BYTES: usize = 65536;

pub type DynAnalysisProvider = Arc<dyn AnalysisProvider>;

#[derive(Debug, serde::Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Deserialize)]
struct TranscriptBody {
    transcript: String,
    platform: String,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

/// User-visible failure rendered as `{"detail": <message>}` per the response
/// contract.
#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    detail: String,
    retry_after: Option<Duration>,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
            retry_after: None,
        }
    }

    fn missing_field(field: &str) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::bad_request(format!("missing required field `{field}`"))
    }

    fn internal(detail: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
            retry_after: None,
        }
    }

    fn rate_limited(retry_after: Duration) -> Self {
        debug_assert!(retry_after > Duration::ZERO);
        ApiError {
            status: StatusCode::TOO_MANY_REQUESTS,
            detail: "too many analyze requests for this client; retry later".to_string(),
            retry_after: Some(retry_after),
        }
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError {
            status: StatusCode::NOT_FOUND,
            detail: format!("resource `{path}` not found"),
            retry_after: None,
        }
    }
}

impl From<AnalyzeError> for ApiError {
    fn from(error: AnalyzeError) -> Self {
        match error.kind {
            AnalyzeErrorKind::InvalidParameter => {
                let detail = match &error.field {
                    Some(field) => format!("{field}: {}", error.message),
                    None => error.message,
                };
                ApiError::bad_request(detail)
            }
            AnalyzeErrorKind::Failed => {
                tracing::error!(message = %error.message, "analysis request failed");
                ApiError::internal(error.message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut response =
            (self.status, Json(json!({ "detail": self.detail }))).into_response();
        if let Some(wait) = self.retry_after {
            // Retry-After is whole seconds, minimum 1.
            let secs = std::cmp::max(1u64, wait.as_millis().div_ceil(1000) as u64);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Clone)]
struct AdmissionState {
    controller: Arc<AdmissionController>,
    proxy_mode: ProxyMode,
    trusted: Arc<HashSet<IpAddr>>,
}

async fn admission_middleware(
    State(state): State<AdmissionState>,
    req: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let path = matched_path_or_uri(&req);
    if path != ANALYZE_PATH {
        return next.run(req).await;
    }

    let ip = extract_client_ip(&req, state.proxy_mode, state.trusted.as_ref())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

    match state.controller.admit(&ip.to_string()).await {
        Ok(()) => next.run(req).await,
        Err(rejection) => {
            tracing::info!(client = %ip, "analyze request rejected by admission control");
            ApiError::rate_limited(rejection.retry_after).into_response()
        }
    }
}

fn extract_client_ip(
    req: &Request,
    mode: ProxyMode,
    trusted: &HashSet<IpAddr>,
) -> Option<IpAddr> {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())?;

    match mode {
        ProxyMode::Off => Some(peer_ip),
        ProxyMode::XForwardedFor => {
            // Only trust forwarding headers from known proxy addresses.
            if trusted.contains(&peer_ip) {
                parse_xff(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
        ProxyMode::Forwarded => {
            if trusted.contains(&peer_ip) {
                parse_forwarded(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
    }
}

fn parse_xff(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .and_then(|ip| ip.parse::<IpAddr>().ok())
}

fn parse_forwarded(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("forwarded")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| {
            s.split(';').flat_map(|part| part.split(',')).find_map(|kv| {
                let kv = kv.trim();
                if let Some(rest) = kv.strip_prefix("for=") {
                    let val = rest.trim_matches('"');
                    return val.parse::<IpAddr>().ok();
                }
                None
            })
        })
}

async fn health() -> impl IntoResponse {
    debug_assert_eq!(HEALTH_STATUS, "ok");

    Json(HealthResponse {
        status: HEALTH_STATUS,
    })
}

async fn analyze(
    Extension(provider): Extension<DynAnalysisProvider>,
    req: Request,
) -> Result<Json<Value>, ApiError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?;
        let upload = collect_upload(multipart).await?;
        let report = provider.analyze_upload(upload).await.map_err(ApiError::from)?;
        Ok(Json(report))
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<TranscriptBody>::from_request(req, &())
            .await
            .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))?;
        let platform = trim_non_empty("platform", body.platform)?;
        let transcript = trim_non_empty("transcript", body.transcript)?;
        let report = provider
            .analyze_transcript(TranscriptRequest {
                platform,
                transcript,
            })
            .await
            .map_err(ApiError::from)?;
        Ok(Json(report))
    } else {
        Err(ApiError::bad_request(
            "unsupported content type; expected multipart/form-data or application/json",
        ))
    }
}

/// Walk the multipart fields in arrival order, spooling the upload to scratch
/// storage so field ordering never forces the payload into memory.
async fn collect_upload(mut multipart: Multipart) -> Result<UploadRequest, ApiError> {
    let mut platform: Option<String> = None;
    let mut upload: Option<(Option<String>, NamedTempFile)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("platform") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid platform field: {err}")))?;
                platform = Some(value);
            }
            Some("file") => {
                let filename = field.file_name().map(str::to_string);
                let spool = spool_field(field).await?;
                upload = Some((filename, spool));
            }
            _ => {
                // Unknown fields are ignored rather than rejected.
            }
        }
    }

    let platform = trim_non_empty("platform", platform.ok_or_else(|| ApiError::missing_field("platform"))?)?;
    let (filename, spool) = upload.ok_or_else(|| ApiError::missing_field("file"))?;

    Ok(UploadRequest {
        platform,
        filename,
        payload: spooled_stream(spool)?,
    })
}

async fn spool_field(mut field: Field<'_>) -> Result<NamedTempFile, ApiError> {
    let temp = NamedTempFile::new()
        .map_err(|err| ApiError::internal(format!("failed to create spool file: {err}")))?;
    let mut file = tokio::fs::File::from_std(
        temp.reopen()
            .map_err(|err| ApiError::internal(format!("failed to reopen spool file: {err}")))?,
    );

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|err| ApiError::internal(format!("failed to spool upload: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| ApiError::internal(format!("failed to flush spool: {err}")))?;

    Ok(temp)
}

/// Stream a spooled upload back out in fixed-size chunks. The temp file is
/// owned by the stream and removed when the stream is dropped, whichever exit
/// path the request takes.
fn spooled_stream(temp: NamedTempFile) -> Result<ByteStream, ApiError> {
    debug_assert!(SPOOL_CHUNK_BYTES > 0);
    let reopened = temp
        .reopen()
        .map_err(|err| ApiError::internal(format!("failed to reopen spool file: {err}")))?;

    let stream = async_stream::try_stream! {
        let _spool_guard = temp;
        let mut file = tokio::fs::File::from_std(reopened);
        let mut buf = vec![0u8; SPOOL_CHUNK_BYTES];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    };

    Ok(Box::pin(stream))
}

fn trim_non_empty(field: &str, value: String) -> Result<String, ApiError> {
    debug_assert!(!field.is_empty());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

async fn not_found_handler(request: Request) -> axum::response::Response {
    let path = request.uri().path().to_string();
    ApiError::resource_not_found(&path).into_response()
}

fn matched_path_or_uri(request: &Request) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

pub fn build_router(
    config: &ServerConfig,
    provider: DynAnalysisProvider,
    admission: Arc<AdmissionController>,
) -> Result<Router, ServerError> {
    debug_assert!(config.max_upload_bytes > 0);
    let mut router = Router::new()
        .route(HEALTH_PATH, get(health))
        .route(ANALYZE_PATH, post(analyze))
        .fallback(not_found_handler);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    if config.admission.enabled {
        let state = AdmissionState {
            controller: admission,
            proxy_mode: config.admission.proxy_mode,
            trusted: Arc::new(config.admission.trusted_proxies.iter().copied().collect()),
        };
        router = router.layer(middleware::from_fn_with_state(state, admission_middleware));
    }

    if config.cors.enabled {
        router = router.layer(build_cors_layer(&config.cors)?);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid));

    router = router.layer(DefaultBodyLimit::max(config.max_upload_bytes));

    Ok(router.layer(AddExtensionLayer::new(provider)))
}

pub async fn serve(
    config: ServerConfig,
    provider: DynAnalysisProvider,
    admission: Arc<AdmissionController>,
) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "vigil server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_router(&config, provider, admission)?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let mut server_future = Box::pin(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .map(|method| {
            Method::from_bytes(method.as_bytes()).map_err(|_| ServerError::CorsConfig {
                reason: format!("method `{method}` is not a valid HTTP method"),
            })
        })
        .collect::<Result<_, _>>()?;

    let allow_headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| ServerError::CorsConfig {
                reason: format!("header `{name}` is invalid: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let mut cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(config.max_age_secs));

    if !allow_headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(allow_headers));
    }

    Ok(cors)
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::AnalysisProvider;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct MockProvider {
        upload_calls: AtomicUsize,
        transcript_calls: AtomicUsize,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                upload_calls: AtomicUsize::new(0),
                transcript_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalysisProvider for MockProvider {
        async fn analyze_upload(&self, request: UploadRequest) -> Result<Value, AnalyzeError> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            let mut payload = request.payload;
            let mut received = Vec::new();
            while let Some(chunk) = payload.next().await {
                received.extend_from_slice(&chunk.expect("spooled stream must not error"));
            }
            Ok(json!({
                "platform": request.platform,
                "risk_level": "Low",
                "issues": [],
                "received_bytes": received.len(),
            }))
        }

        async fn analyze_transcript(
            &self,
            request: TranscriptRequest,
        ) -> Result<Value, AnalyzeError> {
            self.transcript_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "platform": request.platform,
                "risk_level": "Low",
                "issues": [],
            }))
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            max_upload_bytes: 8 * 1024 * 1024,
            admission: crate::config::AdmissionConfig::default(),
            cors: CorsConfig::default(),
        }
    }

    async fn test_router(config: &ServerConfig) -> (Router, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let admission =
            Arc::new(AdmissionController::connect(&config.admission, None).await);
        let router = build_router(config, provider.clone(), admission).expect("router builds");
        (router, provider)
    }

    fn transcript_request() -> Request {
        axum::http::Request::builder()
            .method(Method::POST)
            .uri(ANALYZE_PATH)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "transcript": "hello world", "platform": "TikTok" }).to_string(),
            ))
            .expect("request builds")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body readable")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("body is JSON")
    }

    #[tokio::test]
    async fn health_returns_ok_json() {
        let config = test_config();
        let (router, _) = test_router(&config).await;

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::GET)
                    .uri(HEALTH_PATH)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("health responds");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn unknown_route_returns_detail_body() {
        let config = test_config();
        let (router, _) = test_router(&config).await;

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::GET)
                    .uri("/nope")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("fallback responds");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body.get("detail").is_some());
    }

    #[tokio::test]
    async fn sixth_analyze_request_is_rate_limited() {
        let config = test_config();
        let (router, provider) = test_router(&config).await;

        for attempt in 1..=5 {
            let response = router
                .clone()
                .oneshot(transcript_request())
                .await
                .expect("request succeeds");
            assert_eq!(
                response.status(),
                StatusCode::OK,
                "request {attempt} must be admitted"
            );
        }

        let response = router
            .clone()
            .oneshot(transcript_request())
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(RETRY_AFTER).is_some());
        let body = body_json(response).await;
        assert!(body["detail"].as_str().expect("detail present").contains("retry later"));

        // Admission ran before the provider, so only the five admitted
        // requests reached the pipeline.
        assert_eq!(provider.transcript_calls.load(Ordering::SeqCst), 5);

        // Health stays reachable for the same client.
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::GET)
                    .uri(HEALTH_PATH)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("health responds");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn multipart_upload_is_spooled_and_forwarded() {
        let config = test_config();
        let (router, provider) = test_router(&config).await;

        let boundary = "vigil-test-boundary";
        let payload = b"\x00\x00\x00\x18ftypmp42sixteenby".to_vec();
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"platform\"\r\n\r\nTikTok\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"clip.mp4\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&payload);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri(ANALYZE_PATH)
                    .header(
                        CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .expect("request builds"),
            )
            .await
            .expect("analyze responds");

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["platform"], "TikTok");
        assert_eq!(value["received_bytes"], payload.len());
        assert_eq!(provider.upload_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multipart_without_platform_is_rejected() {
        let config = test_config();
        let (router, provider) = test_router(&config).await;

        let boundary = "vigil-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"clip.mp4\"\r\nContent-Type: video/mp4\r\n\r\nabcd\r\n--{boundary}--\r\n"
            )
            .as_bytes(),
        );

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri(ANALYZE_PATH)
                    .header(
                        CONTENT_TYPE,
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .expect("request builds"),
            )
            .await
            .expect("analyze responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(provider.upload_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_content_type_is_rejected() {
        let config = test_config();
        let (router, _) = test_router(&config).await;

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri(ANALYZE_PATH)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("hello"))
                    .expect("request builds"),
            )
            .await
            .expect("analyze responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
