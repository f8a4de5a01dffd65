//! HTTP proxy server injecting OAuth credentials into Anthropic API traffic.
//!
//! Every `/v1/*` request is authenticated with the current access token,
//! rewritten by the [`RequestTransformer`], forwarded upstream and relayed
//! back. Event streams are relayed chunk by chunk as they arrive.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router as AxumRouter,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State, rejection::BytesRejection},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use claude_gate_storage::SharedBackend;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{OAuthError, Result};
use crate::openai::{self, ChatStreamConverter};
use crate::token_provider::{ANTHROPIC_PROVIDER, SharedTokenProvider, run_blocking};
use crate::transform::{
    ANTHROPIC_API_URL, CHAT_COMPLETIONS_PATH, MESSAGES_PATH, RequestTransformer,
};

/// Largest piece of a streamed body handed to the client in one write.
pub const STREAM_CHUNK_SIZE: usize = 4096;

/// Slack added to the request timeout for the upstream transport.
const TRANSPORT_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Upstream response headers that are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "transfer-encoding",
    "content-length",
    "content-encoding",
];

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub upstream_url: String,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_request_size: usize,
    pub enable_cors: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5789)),
            upstream_url: ANTHROPIC_API_URL.to_string(),
            request_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            max_request_size: 10 * 1024 * 1024,
            enable_cors: true,
        }
    }
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = url.into();
        self
    }
}

/// Shared state for the proxy server.
struct ProxyState {
    http: reqwest::Client,
    upstream_url: String,
    tokens: SharedTokenProvider,
    storage: SharedBackend,
    transformer: RequestTransformer,
}

/// The OAuth proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        tokens: SharedTokenProvider,
        storage: SharedBackend,
    ) -> Result<Self> {
        // Compression stays off so SSE framing reaches the client untouched.
        let http = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .timeout(config.request_timeout + TRANSPORT_TIMEOUT_MARGIN)
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| OAuthError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let state = ProxyState {
            http,
            upstream_url: config.upstream_url.trim_end_matches('/').to_string(),
            tokens,
            storage,
            transformer: RequestTransformer::new(),
        };

        Ok(Self {
            state: Arc::new(state),
            config,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Build the axum router.
    pub fn router(&self) -> AxumRouter {
        let mut router = AxumRouter::new()
            .route("/", get(handle_root))
            .route("/health", get(handle_health))
            .route("/v1/models", get(handle_models))
            .route("/v1/{*path}", any(handle_proxy))
            .layer(DefaultBodyLimit::max(self.config.max_request_size))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(cors_layer());
        }

        router
    }

    /// Run the proxy server until `shutdown` resolves.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let (_, handle) = self.run_with_shutdown(shutdown).await?;
        handle.await.map_err(std::io::Error::other)?
    }

    /// Bind, then serve in the background.
    ///
    /// Once `shutdown` resolves the listener stops accepting and in-flight
    /// requests (streams included) get `shutdown_grace` to finish before
    /// the server task returns regardless.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, upstream = %self.state.upstream_url, "Starting OAuth proxy server");

        let grace = self.config.shutdown_grace;
        let draining = Arc::new(Notify::new());
        let signal = draining.clone();
        let serve = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutdown requested, draining connections");
                signal.notify_one();
            })
            .into_future();

        let handle = tokio::spawn(async move {
            tokio::pin!(serve);
            tokio::select! {
                result = &mut serve => result,
                _ = draining.notified() => {
                    match tokio::time::timeout(grace, &mut serve).await {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::warn!(grace_secs = grace.as_secs(), "Grace period elapsed, closing remaining connections");
                            Ok(())
                        }
                    }
                }
            }
        });

        Ok((local_addr, handle))
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static("x-requested-with"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("anthropic-version"),
            HeaderName::from_static("anthropic-beta"),
        ])
        .max_age(Duration::from_secs(3600))
}

// ─────────────────────────────────────────────────────────────────────────────
// Local responders
// ─────────────────────────────────────────────────────────────────────────────

/// Handle GET /
async fn handle_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "Claude OAuth Proxy",
        "description": "Anthropic API proxy with OAuth authentication injection",
        "endpoints": {
            "health": "/health",
            "models": "/v1/models",
            "chat_completions": CHAT_COMPLETIONS_PATH,
            "anthropic_api": "/v1/*"
        },
        "oauth_required": true
    }))
}

/// Handle GET /health
///
/// Peeks at storage only; never waits on the token provider or upstream.
async fn handle_health(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    let storage = state.storage.clone();
    let oauth_status = match run_blocking(move || storage.get(ANTHROPIC_PROVIDER)).await {
        Ok(Some(record)) if record.is_oauth() => "ready",
        _ => "not_configured",
    };

    Json(serde_json::json!({
        "status": "healthy",
        "oauth_status": oauth_status,
        "storage": state.storage.name()
    }))
}

/// (id, release timestamp) of every advertised model.
const MODEL_CATALOG: &[(&str, i64)] = &[
    ("claude-3-opus-20240229", 1706745600),
    ("claude-3-5-sonnet-20241022", 1729555200),
    ("claude-3-5-haiku-20241022", 1729555200),
    ("claude-opus-4-20250514", 1747353600),
];

/// Handle GET /v1/models
async fn handle_models() -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp();
    let data: Vec<_> = MODEL_CATALOG
        .iter()
        .map(|&(id, created)| {
            let family = id.rsplit_once('-').map(|(family, _)| family).unwrap_or(id);
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "anthropic",
                "permission": [{
                    "id": format!("modelperm-{}", family),
                    "object": "model_permission",
                    "created": now,
                    "allow_create_engine": false,
                    "allow_sampling": true,
                    "allow_logprobs": false,
                    "allow_search_indices": false,
                    "allow_view": true,
                    "allow_fine_tuning": false,
                    "organization": "*",
                    "group": null,
                    "is_blocking": false
                }]
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxying
// ─────────────────────────────────────────────────────────────────────────────

/// Handle any /v1/* request not answered locally.
async fn handle_proxy(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> std::result::Result<Response, ProxyError> {
    let body = body.map_err(ProxyError::Body)?;
    let path = uri.path();
    let is_chat = path == CHAT_COMPLETIONS_PATH;
    tracing::info!(%method, path, "Proxying request");

    let token = state
        .tokens
        .get_access_token()
        .await
        .map_err(ProxyError::Unauthorized)?;

    let wants_stream =
        requests_stream(&body) || query_requests_stream(uri.query().unwrap_or_default());
    let body = state.transformer.transform_request_body(&body, path)?;
    let upstream_headers = state.transformer.inject_headers(&headers, &token)?;

    let upstream_path = if is_chat { MESSAGES_PATH } else { path };
    let url = match uri.query() {
        Some(query) => format!("{}{}?{}", state.upstream_url, upstream_path, query),
        None => format!("{}{}", state.upstream_url, upstream_path),
    };

    let upstream = state
        .http
        .request(method, &url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(ProxyError::Upstream)?;

    let status = upstream.status();
    let is_event_stream = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));
    let streaming = status.is_success() && (is_event_stream || wants_stream);
    tracing::info!(%status, streaming, "Upstream responded");

    let mut response_headers = relay_headers(upstream.headers());

    if streaming {
        response_headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if !response_headers.contains_key(header::CONTENT_TYPE) {
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
        }

        let chunks = upstream.bytes_stream().map_err(std::io::Error::other);
        let body = if is_chat {
            Body::from_stream(chat_stream(chunks))
        } else {
            Body::from_stream(bounded_stream(chunks))
        };
        return Ok((status, response_headers, body).into_response());
    }

    let bytes = upstream.bytes().await.map_err(ProxyError::Upstream)?;
    let bytes = if is_chat {
        match openai::anthropic_to_openai(&bytes) {
            Ok(converted) => Bytes::from(converted),
            Err(e) => {
                tracing::warn!(error = %e, "Could not convert response, relaying original");
                bytes
            }
        }
    } else {
        bytes
    };

    Ok((status, response_headers, bytes).into_response())
}

/// Whether a JSON request body asks for `"stream": true`, on any path.
fn requests_stream(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

fn query_requests_stream(query: &str) -> bool {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "stream" && value == "true")
}

fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers
}

/// Relay a native stream, splitting any large upstream chunk.
fn bounded_stream(
    chunks: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    chunks.flat_map(|result| {
        let pieces: Vec<std::io::Result<Bytes>> = match result {
            Ok(chunk) => {
                tracing::debug!(bytes = chunk.len(), "Relaying stream chunk");
                split_chunk(chunk).into_iter().map(Ok).collect()
            }
            Err(e) => vec![Err(e)],
        };
        futures::stream::iter(pieces)
    })
}

fn split_chunk(chunk: Bytes) -> Vec<Bytes> {
    (0..chunk.len())
        .step_by(STREAM_CHUNK_SIZE)
        .map(|start| chunk.slice(start..(start + STREAM_CHUNK_SIZE).min(chunk.len())))
        .collect()
}

/// Convert an Anthropic event stream to OpenAI chunks, ending with `[DONE]`.
fn chat_stream(
    chunks: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let state = (Box::pin(chunks), Some(ChatStreamConverter::new()));
    futures::stream::unfold(state, |(mut chunks, converter)| async move {
        let mut converter = converter?;
        match chunks.next().await {
            Some(Ok(chunk)) => {
                let events = converter.push(&chunk).concat();
                Some((Ok(Bytes::from(events)), (chunks, Some(converter))))
            }
            Some(Err(e)) => Some((Err(e), (chunks, None))),
            None => {
                let events = converter.finish().concat();
                Some((Ok(Bytes::from(events)), (chunks, None)))
            }
        }
    })
    .try_filter(|chunk| futures::future::ready(!chunk.is_empty()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for proxy responses.
#[derive(Debug)]
pub enum ProxyError {
    /// No usable access token.
    Unauthorized(OAuthError),
    /// Transport failure talking to upstream.
    Upstream(reqwest::Error),
    /// Anything else raised while preparing the request.
    Request(OAuthError),
    /// The inbound body could not be read, e.g. it exceeds the size limit.
    Body(BytesRejection),
}

impl From<OAuthError> for ProxyError {
    fn from(err: OAuthError) -> Self {
        Self::Request(err)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            ProxyError::Unauthorized(e) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                e.to_string(),
            ),
            ProxyError::Upstream(e) if e.is_timeout() => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                format!("Upstream request timed out: {}", e),
            ),
            ProxyError::Upstream(e) => (
                StatusCode::BAD_GATEWAY,
                "api_error",
                format!("Upstream request failed: {}", e),
            ),
            ProxyError::Request(OAuthError::InvalidRequest(msg)) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", msg.clone())
            }
            ProxyError::Request(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                e.to_string(),
            ),
            ProxyError::Body(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "request_too_large",
                rejection.body_text(),
            ),
            ProxyError::Body(rejection) => (
                rejection.status(),
                "invalid_request_error",
                rejection.body_text(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "Proxy request failed");
        } else {
            tracing::warn!(%status, error = %message, "Proxy request rejected");
        }

        let body = serde_json::json!({
            "error": {
                "type": error_type,
                "message": message
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_provider::TokenProvider;
    use async_trait::async_trait;
    use axum::http::Request;
    use claude_gate_storage::{FileStorage, StorageBackend, TokenRecord, now_secs};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[derive(Debug)]
    struct NoToken;

    #[async_trait]
    impl TokenProvider for NoToken {
        async fn get_access_token(&self) -> Result<String> {
            Err(OAuthError::AuthenticationRequired("no token".to_string()))
        }

        async fn clear_cache(&self) {}
    }

    fn server(dir: &TempDir) -> (ProxyServer, Arc<FileStorage>) {
        let storage = Arc::new(FileStorage::new(dir.path().join("auth.json")));
        let server = ProxyServer::new(
            ProxyConfig::default().with_upstream_url("http://127.0.0.1:9"),
            Arc::new(NoToken),
            storage.clone(),
        )
        .unwrap();
        (server, storage)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_oauth_status() {
        let dir = TempDir::new().unwrap();
        let (server, storage) = server(&dir);

        let response = server.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["oauth_status"], "not_configured");
        assert!(body["storage"].as_str().unwrap().starts_with("file:"));

        storage
            .set("anthropic", &TokenRecord::oauth("A", "R", now_secs() + 3600))
            .unwrap();
        let body = json_body(server.router().oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(body["oauth_status"], "ready");
    }

    #[tokio::test]
    async fn test_root_and_models() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir);

        let root = json_body(server.router().oneshot(get("/")).await.unwrap()).await;
        assert_eq!(root["service"], "Claude OAuth Proxy");
        assert_eq!(root["oauth_required"], true);

        let models = json_body(server.router().oneshot(get("/v1/models")).await.unwrap()).await;
        assert_eq!(models["object"], "list");
        let ids: Vec<_> = models["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 4);
        assert!(ids.contains(&"claude-opus-4-20250514".to_string()));
        assert_eq!(
            models["data"][0]["permission"][0]["id"],
            "modelperm-claude-3-opus"
        );
    }

    #[tokio::test]
    async fn test_missing_token_is_401_without_upstream_call() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir);

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"x","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("no token")
        );
    }

    #[tokio::test]
    async fn test_oversized_body_uses_error_envelope() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path().join("auth.json")));
        let config = ProxyConfig {
            max_request_size: 64,
            ..ProxyConfig::default().with_upstream_url("http://127.0.0.1:9")
        };
        let server = ProxyServer::new(config, Arc::new(NoToken), storage).unwrap();

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(vec![b' '; 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "request_too_large");
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_cors_preflight_answered_locally() {
        let dir = TempDir::new().unwrap();
        let (server, _) = server(&dir);

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1/messages")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        let headers = response.headers();
        assert_eq!(
            headers["access-control-allow-origin"],
            "http://localhost:3000"
        );
        assert_eq!(headers["access-control-allow-credentials"], "true");
        assert_eq!(headers["access-control-max-age"], "3600");
    }

    #[test]
    fn test_stream_detection() {
        assert!(requests_stream(br#"{"stream":true}"#));
        assert!(!requests_stream(br#"{"stream":false}"#));
        assert!(!requests_stream(br#"{"stream":"yes"}"#));
        assert!(!requests_stream(b"not json"));
        assert!(!requests_stream(b""));
        assert!(query_requests_stream("beta=true&stream=true"));
        assert!(!query_requests_stream("stream=false"));
    }

    #[test]
    fn test_split_chunk_bounds_pieces() {
        let chunk = Bytes::from(vec![b'x'; STREAM_CHUNK_SIZE * 2 + 10]);
        let pieces = split_chunk(chunk);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.len() <= STREAM_CHUNK_SIZE));
        assert_eq!(pieces[2].len(), 10);
        assert!(split_chunk(Bytes::new()).is_empty());
    }

    #[test]
    fn test_relay_headers_drops_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert("request-id", HeaderValue::from_static("req_1"));

        let relayed = relay_headers(&upstream);
        assert!(!relayed.contains_key(header::CONTENT_LENGTH));
        assert_eq!(relayed["request-id"], "req_1");
    }

    #[test]
    fn test_proxy_config_default() {
        let config = ProxyConfig::default();
        assert!(config.enable_cors);
        assert_eq!(config.bind_addr.port(), 5789);
        assert_eq!(config.request_timeout, Duration::from_secs(600));
        assert_eq!(config.max_request_size, 10 * 1024 * 1024);
    }
}
