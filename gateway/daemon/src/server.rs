//! HTTP Surface
//!
//! Axum front end over [`PipelineOrchestrator`]:
//!
//! ```text
//!   POST /v1/messages                      canonical request, JSON or SSE reply
//!   GET  /health                           liveness
//!   GET  /ready                            running and >= 1 healthy endpoint
//!   GET  /status                           SystemStatus as JSON
//!   POST /admin/endpoints/:id/unhealthy    take an endpoint out of rotation
//!   POST /admin/endpoints/:id/healthy      return it to rotation
//! ```
//!
//! A client that disconnects drops the handler future (unary) or the SSE
//! body (streaming); either way the request's cancellation token fires and
//! the upstream call is abandoned.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gateway_core::{
    CanonicalRequest, CorrelationId, EndpointId, ErrorKind, GatewayError, GatewayResponse,
    PipelineOrchestrator, RouteInfo,
};

const X_GATEWAY_ENDPOINT: &str = "x-gateway-endpoint";
const X_GATEWAY_CATEGORY: &str = "x-gateway-category";
const X_REQUEST_ID: &str = "x-request-id";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl AppState {
    /// Wrap a started orchestrator
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Build the route table
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/admin/endpoints/:id/unhealthy", post(mark_unhealthy))
        .route("/admin/endpoints/:id/healthy", post(mark_healthy))
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain open connections
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Gateway listening");

    let app = router(AppState::new(orchestrator));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// A [`GatewayError`] rendered as an HTTP response
#[derive(Debug)]
struct ApiError {
    error: GatewayError,
    request_id: CorrelationId,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UpstreamProtocol | ErrorKind::UpstreamStatus | ErrorKind::UpstreamConnection => {
            StatusCode::BAD_GATEWAY
        }
        ErrorKind::NoHealthyEndpoint => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Routing => StatusCode::INTERNAL_SERVER_ERROR,
        // Client closed request
        ErrorKind::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!(
                request_id = %self.request_id,
                kind = %kind,
                error = %self.error,
                "Request failed"
            );
        } else {
            debug!(
                request_id = %self.request_id,
                kind = %kind,
                error = %self.error,
                "Request rejected"
            );
        }

        let body = json!({
            "type": "error",
            "error": {"type": kind.as_str(), "message": self.error.to_string()},
        });

        let mut headers = HeaderMap::new();
        insert_header(&mut headers, X_REQUEST_ID, self.request_id.as_str());
        if let GatewayError::RateLimit {
            retry_after: Some(after),
            ..
        } = &self.error
        {
            insert_header(
                &mut headers,
                "retry-after",
                &after.as_secs().max(1).to_string(),
            );
        }
        (status, headers, Json(body)).into_response()
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => debug!(header = name, "Skipping unrepresentable header value"),
    }
}

fn route_headers(route: &RouteInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, X_GATEWAY_ENDPOINT, route.endpoint.as_str());
    insert_header(&mut headers, X_GATEWAY_CATEGORY, route.category.as_str());
    insert_header(&mut headers, X_REQUEST_ID, route.correlation_id.as_str());
    headers
}

// ============================================================================
// Handlers
// ============================================================================

/// Use the caller's `x-request-id` when it sent a usable one
fn correlation_id(headers: &HeaderMap) -> CorrelationId {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(CorrelationId::new, |v| CorrelationId::from(v.to_string()))
}

async fn messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request_id = correlation_id(&headers);

    let request: CanonicalRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return ApiError {
                error: GatewayError::InvalidRequest(format!("invalid request body: {e}")),
                request_id,
            }
            .into_response();
        }
    };
    let request = request.with_correlation_id(request_id.clone());
    debug!(
        request_id = %request_id,
        model = %request.model,
        stream = request.stream,
        "POST /v1/messages"
    );

    // Disconnects are handled by dropping: the orchestrator releases a
    // request whose future or stream goes away
    let cancel = CancellationToken::new();

    match state
        .orchestrator
        .process_incoming_request(request, &cancel)
        .await
    {
        Ok(GatewayResponse::Unary { response, route }) => {
            (route_headers(&route), Json(response)).into_response()
        }
        Ok(GatewayResponse::Stream { stream, route }) => {
            let events =
                stream.map(|event| Event::default().event(event.event_name()).json_data(&event));
            let sse = Sse::new(events).keep_alive(KeepAlive::default());
            (route_headers(&route), sse).into_response()
        }
        Err(error) => ApiError { error, request_id }.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.orchestrator.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"ready": ready})))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.get_system_status())
}

/// Body of `POST /admin/endpoints/:id/unhealthy`
#[derive(Debug, Default, Deserialize)]
struct MarkUnhealthy {
    #[serde(default)]
    reason: Option<String>,
}

fn unknown_endpoint(id: &EndpointId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "type": "error",
            "error": {"type": "not_found_error", "message": format!("unknown endpoint '{id}'")},
        })),
    )
        .into_response()
}

async fn mark_unhealthy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let id = EndpointId::from(id);
    let reason = serde_json::from_slice::<MarkUnhealthy>(&body)
        .unwrap_or_default()
        .reason
        .unwrap_or_else(|| "marked unhealthy by operator".to_string());

    if !state.orchestrator.router().mark_unhealthy(&id, reason) {
        return unknown_endpoint(&id);
    }
    Json(state.orchestrator.health().snapshot(&id)).into_response()
}

async fn mark_healthy(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = EndpointId::from(id);
    if !state.orchestrator.router().mark_healthy(&id) {
        return unknown_endpoint(&id);
    }
    info!(endpoint = %id, "Endpoint returned to rotation by operator");
    Json(state.orchestrator.health().snapshot(&id)).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use gateway_core::config::{CategoryRule, HealthPolicy, RetryPolicy, Timeouts};
    use gateway_core::providers::{UpstreamEvent, UpstreamRequest, UpstreamResponse, UpstreamStream};
    use gateway_core::{
        ContentBlock, Endpoint, GatewayConfig, GatewayResult, ProviderClient, ProviderKind,
        ProviderRegistry, RoutingCategory, StopReason, Usage,
    };

    use super::*;

    /// Answers "pong"; throttles forever when `throttled` is set
    struct Fixed {
        endpoint: Endpoint,
        throttled: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderClient for Fixed {
        fn kind(&self) -> ProviderKind {
            self.endpoint.provider
        }

        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        fn to_upstream(
            &self,
            category: RoutingCategory,
            _request: &CanonicalRequest,
        ) -> GatewayResult<UpstreamRequest> {
            Ok(UpstreamRequest {
                endpoint: self.endpoint.id.clone(),
                category,
                body: serde_json::Value::Null,
            })
        }

        async fn send_request(&self, _request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.throttled {
                return Err(GatewayError::rate_limited(
                    &self.endpoint.id,
                    Some(Duration::from_secs(7)),
                ));
            }
            Ok(UpstreamResponse {
                content: vec![ContentBlock::text("pong")],
                stop_reason: StopReason::End,
                usage: Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                },
            })
        }

        async fn send_stream_request(
            &self,
            _request: UpstreamRequest,
        ) -> GatewayResult<UpstreamStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(futures::stream::iter(vec![
                Ok(UpstreamEvent::TextDelta("po".into())),
                Ok(UpstreamEvent::TextDelta("ng".into())),
                Ok(UpstreamEvent::Finished(StopReason::End)),
            ])
            .boxed())
        }
    }

    fn app_with(throttled: bool) -> (Router, Arc<PipelineOrchestrator>) {
        let endpoint = Endpoint::new(
            "fast",
            ProviderKind::OpenaiCompatible,
            "fast-model",
            "http://unused",
        );
        let config = GatewayConfig::new(
            RetryPolicy {
                schedule: vec![Duration::from_millis(1)],
            },
            HealthPolicy {
                failure_threshold: 10,
                backoff_ladder: vec![Duration::from_secs(1)],
            },
            Timeouts {
                upstream: Duration::from_secs(5),
                request: Duration::from_secs(5),
            },
        )
        .with_endpoint(endpoint.clone())
        .with_rule(CategoryRule::model(RoutingCategory::Background, "haiku"))
        .with_rule(CategoryRule::catch_all(RoutingCategory::Default))
        .with_category(RoutingCategory::Background, &["fast"])
        .with_category(RoutingCategory::Default, &["fast"]);

        let mut providers = ProviderRegistry::new();
        providers.insert(Arc::new(Fixed {
            endpoint,
            throttled,
            calls: AtomicU32::new(0),
        }));
        let orchestrator =
            Arc::new(PipelineOrchestrator::with_providers(&config, providers).unwrap());
        orchestrator.start();
        (router(AppState::new(Arc::clone(&orchestrator))), orchestrator)
    }

    fn app() -> Router {
        app_with(false).0
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn header<'a>(response: &'a Response, name: &str) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    #[tokio::test]
    async fn test_unary_message_carries_route_headers() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .header("x-request-id", "req-123")
            .body(Body::from(
                json!({
                    "model": "claude-3-haiku",
                    "max_tokens": 16,
                    "messages": [{"role": "user", "content": "ping"}]
                })
                .to_string(),
            ))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-gateway-endpoint"), "fast");
        assert_eq!(header(&response, "x-gateway-category"), "background");
        assert_eq!(header(&response, "x-request-id"), "req-123");

        let body = body_json(response).await;
        assert_eq!(body["type"], "message");
        assert_eq!(body["model"], "fast-model");
        assert_eq!(body["content"][0]["text"], "pong");
        assert_eq!(body["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn test_streaming_message_is_sse() {
        let response = app()
            .oneshot(post_json(
                "/v1/messages",
                json!({
                    "model": "claude-sonnet",
                    "max_tokens": 16,
                    "stream": true,
                    "messages": [{"role": "user", "content": "ping"}]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "content-type").starts_with("text/event-stream"));
        assert_eq!(header(&response, "x-gateway-category"), "default");
        assert!(!header(&response, "x-request-id").is_empty());

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let names: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(text.contains(r#""type":"message_stop""#));
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_exhausted_throttling_is_429_with_retry_after() {
        let (app, orchestrator) = app_with(true);
        let response = app
            .oneshot(post_json(
                "/v1/messages",
                json!({
                    "model": "m",
                    "max_tokens": 16,
                    "messages": [{"role": "user", "content": "ping"}]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "retry-after"), "7");
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_probes() {
        let (app, orchestrator) = app_with(false);

        let response = app.clone().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.clone().oneshot(get_request("/status")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["endpoints"][0]["endpoint"], "fast");
        assert_eq!(body["routing"]["categories"].as_array().unwrap().len(), 2);

        orchestrator.shutdown();
        let response = app.oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_admin_overrides() {
        let (app, _orchestrator) = app_with(false);

        let response = app
            .clone()
            .oneshot(post_json(
                "/admin/endpoints/fast/unhealthy",
                json!({"reason": "maintenance"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "disabled");
        assert_eq!(body["disabled_reason"], "maintenance");

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/messages",
                json!({
                    "model": "m",
                    "max_tokens": 16,
                    "messages": [{"role": "user", "content": "ping"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/endpoints/fast/healthy")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");

        let response = app
            .oneshot(post_json("/admin/endpoints/nope/unhealthy", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::NoHealthyEndpoint), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::UpstreamTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::UpstreamConnection), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Cancelled).as_u16(), 499);
    }
}
