//! Pipeline Orchestrator
//!
//! Owns the router, health registry, retry controller, and provider clients,
//! and runs each inbound request through them:
//!
//! ```text
//! request --> Router.route --> ProviderClient.to_upstream
//!                                   |
//!              RetryController.execute( send_request | send_stream_request + prime )
//!                                   |
//!             unary: CanonicalResponse     stream: translate_stream -> CanonicalStream
//! ```
//!
//! # Cancellation
//!
//! Every request runs under its own token, a child of the orchestrator's
//! root token. The token fires when the caller's token fires, when the
//! request timeout elapses, or when [`PipelineOrchestrator::shutdown`] is
//! called. Backoff sleeps, in-flight upstream calls, and stream reads all
//! stop at that point; for streams the upstream connection is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::execution::{PipelineExecution, Stage};
use crate::config::{ConfigError, EndpointId, GatewayConfig, Timeouts};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{CanonicalRequest, CanonicalResponse, CorrelationId};
use crate::providers::{ProviderClient, ProviderRegistry, UpstreamRequest};
use crate::routing::{
    HealthRegistry, HealthSnapshot, RetryController, RouteDecision, Router, RoutingCategory,
    RoutingTableStatus,
};
use crate::streaming::{
    prime_stream, translate_stream, CanonicalStream, StreamOutcome, StreamTranslator,
};

// ============================================================================
// Response Types
// ============================================================================

/// Where a request was served
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    /// Request correlation id
    pub correlation_id: CorrelationId,
    /// Category the request was classified into
    pub category: RoutingCategory,
    /// Endpoint that served it
    pub endpoint: EndpointId,
    /// Upstream model of that endpoint
    pub model: String,
}

/// Result of [`PipelineOrchestrator::process_incoming_request`]
pub enum GatewayResponse {
    /// Complete answer
    Unary {
        /// Canonical message
        response: CanonicalResponse,
        /// Routing metadata
        route: RouteInfo,
    },
    /// Lazy canonical event stream
    Stream {
        /// Events, ending in exactly one `message_stop` unless cancelled
        stream: CanonicalStream,
        /// Routing metadata
        route: RouteInfo,
    },
}

impl GatewayResponse {
    /// Routing metadata
    #[must_use]
    pub fn route(&self) -> &RouteInfo {
        match self {
            Self::Unary { route, .. } | Self::Stream { route, .. } => route,
        }
    }
}

impl std::fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary { response, route } => f
                .debug_struct("Unary")
                .field("response", response)
                .field("route", route)
                .finish(),
            Self::Stream { route, .. } => f
                .debug_struct("Stream")
                .field("route", route)
                .finish_non_exhaustive(),
        }
    }
}

/// Snapshot for health and readiness probes
#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    /// Accepting requests
    pub running: bool,
    /// Running and at least one endpoint healthy
    pub healthy: bool,
    /// Requests currently being processed (open streams included)
    pub in_flight: usize,
    /// Per-endpoint health
    pub endpoints: Vec<HealthSnapshot>,
    /// Routing table with live health
    pub routing: RoutingTableStatus,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// In-Flight Accounting
// ============================================================================

/// Decrements the in-flight counter when the request's last resource drops
#[derive(Debug)]
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything that must live exactly as long as one request
struct RequestScope {
    token: CancellationToken,
    _cancel_on_drop: DropGuard,
    _in_flight: InFlightGuard,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs requests through routing, upstream calls, and translation
pub struct PipelineOrchestrator {
    router: Router,
    health: Arc<HealthRegistry>,
    retry: RetryController,
    providers: ProviderRegistry,
    timeouts: Timeouts,
    root: CancellationToken,
    running: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl PipelineOrchestrator {
    /// Build from configuration, creating one provider client per endpoint
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid or a
    /// provider client cannot be built.
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let providers = ProviderRegistry::from_config(config)?;
        Self::with_providers(config, providers)
    }

    /// Build with caller-supplied provider clients
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid or an
    /// endpoint has no client.
    pub fn with_providers(
        config: &GatewayConfig,
        providers: ProviderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(missing) = config
            .endpoints
            .iter()
            .find(|e| providers.get(&e.id).is_none())
        {
            return Err(ConfigError::ValidationError(format!(
                "no provider client for endpoint '{}'",
                missing.id
            )));
        }

        let health = Arc::new(HealthRegistry::new(config.health.clone()));
        let router = Router::new(config, Arc::clone(&health))?;
        let retry = RetryController::new(&config.retry, Arc::clone(&health));

        Ok(Self {
            router,
            health,
            retry,
            providers,
            timeouts: config.timeouts,
            root: CancellationToken::new(),
            running: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Start accepting requests
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!(
                endpoints = self.providers.len(),
                max_attempts = self.retry.max_attempts(),
                "Orchestrator started"
            );
        }
    }

    /// Stop accepting requests and cancel everything in flight
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(
                in_flight = self.in_flight.load(Ordering::SeqCst),
                "Orchestrator shutting down"
            );
        }
        self.root.cancel();
    }

    /// Whether requests are being accepted
    #[must_use]
    pub fn is_system_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.root.is_cancelled()
    }

    /// Running and at least one endpoint can take traffic
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_system_running() && self.health.healthy_count() > 0
    }

    /// Requests currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Status snapshot for external probes
    #[must_use]
    pub fn get_system_status(&self) -> SystemStatus {
        SystemStatus {
            running: self.is_system_running(),
            healthy: self.is_ready(),
            in_flight: self.in_flight(),
            endpoints: self.health.all_snapshots(),
            routing: self.router.routing_table_status(),
            timestamp: Utc::now(),
        }
    }

    /// Router (for explicit health overrides and table inspection)
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Shared health registry
    #[must_use]
    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Set up the token, timeout, and accounting for one request
    fn open_scope(&self, caller: &CancellationToken) -> RequestScope {
        let token = self.root.child_token();
        let caller = caller.clone();
        let linked = token.clone();
        let deadline = self.timeouts.request;

        // Ends as soon as the request token fires, whatever the cause
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = linked.cancelled() => {}
                () = caller.cancelled() => linked.cancel(),
                () = tokio::time::sleep(deadline) => {
                    tracing::warn!(timeout_ms = duration_ms(deadline), "Request timed out");
                    linked.cancel();
                }
            }
        });

        RequestScope {
            _cancel_on_drop: token.clone().drop_guard(),
            token,
            _in_flight: InFlightGuard::enter(&self.in_flight),
        }
    }

    /// Run one request through the pipeline
    ///
    /// Non-streaming requests resolve to [`GatewayResponse::Unary`]; streaming
    /// requests resolve once the upstream has produced its first content and
    /// return [`GatewayResponse::Stream`]. Errors that happen before that
    /// point are returned here; later ones arrive as an `error` event.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`]; see the error module for the taxonomy.
    pub async fn process_incoming_request(
        &self,
        request: CanonicalRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<GatewayResponse> {
        if !self.is_system_running() {
            return Err(GatewayError::Cancelled);
        }
        request.validate()?;

        let scope = self.open_scope(cancel);
        let correlation_id = request.correlation_id.clone();
        let mut exec = PipelineExecution::new(correlation_id.clone());

        exec.advance(Stage::Routing);
        let (decision, client) = match self.bind(&request) {
            Ok(bound) => bound,
            Err(err) => {
                exec.fail(&err);
                return Err(err);
            }
        };
        exec.bind(decision.endpoint.id.clone());

        let route = RouteInfo {
            correlation_id,
            category: decision.category,
            endpoint: decision.endpoint.id.clone(),
            model: decision.endpoint.model.clone(),
        };

        let upstream = match client.to_upstream(decision.category, &request) {
            Ok(upstream) => upstream,
            Err(err) => {
                exec.fail(&err);
                return Err(err);
            }
        };

        if request.stream {
            self.run_stream(exec, scope, client, upstream, route).await
        } else {
            self.run_unary(exec, scope, client, upstream, route).await
        }
    }

    fn bind(
        &self,
        request: &CanonicalRequest,
    ) -> GatewayResult<(RouteDecision, Arc<dyn ProviderClient>)> {
        let decision = self.router.route(request)?;
        let client = self.providers.get(&decision.endpoint.id).ok_or_else(|| {
            GatewayError::Routing(format!("no client for endpoint '{}'", decision.endpoint.id))
        })?;
        Ok((decision, client))
    }

    async fn run_unary(
        &self,
        mut exec: PipelineExecution,
        scope: RequestScope,
        client: Arc<dyn ProviderClient>,
        upstream: UpstreamRequest,
        route: RouteInfo,
    ) -> GatewayResult<GatewayResponse> {
        let mut attempts = 0;
        let result = self
            .retry
            .execute(&route.endpoint, &scope.token, |attempt| {
                attempts = attempt;
                let client = Arc::clone(&client);
                let upstream = upstream.clone();
                async move { client.send_request(upstream).await }
            })
            .await;
        exec.set_attempts(attempts);

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                exec.fail(&err);
                return Err(err);
            }
        };

        exec.advance(Stage::Translating);
        let response = CanonicalResponse::new(
            route.model.clone(),
            reply.content,
            reply.stop_reason,
            reply.usage,
        );
        exec.complete();
        drop(scope);

        Ok(GatewayResponse::Unary { response, route })
    }

    async fn run_stream(
        &self,
        mut exec: PipelineExecution,
        scope: RequestScope,
        client: Arc<dyn ProviderClient>,
        upstream: UpstreamRequest,
        route: RouteInfo,
    ) -> GatewayResult<GatewayResponse> {
        let mut attempts = 0;
        let result = self
            .retry
            .execute(&route.endpoint, &scope.token, |attempt| {
                attempts = attempt;
                let client = Arc::clone(&client);
                let upstream = upstream.clone();
                async move {
                    let stream = client.send_stream_request(upstream).await?;
                    prime_stream(stream).await
                }
            })
            .await;
        exec.set_attempts(attempts);

        let primed = match result {
            Ok(primed) => primed,
            Err(err) => {
                exec.fail(&err);
                return Err(err);
            }
        };

        exec.advance(Stage::Translating);
        let health = Arc::clone(&self.health);
        let endpoint = route.endpoint.clone();
        let token = scope.token.clone();

        let observer = move |outcome: StreamOutcome| {
            match outcome {
                StreamOutcome::Completed(_) => exec.complete(),
                StreamOutcome::Failed(err) => {
                    if err.counts_against_endpoint() {
                        health.record_failure(&endpoint);
                    }
                    exec.fail(&err);
                }
                StreamOutcome::Cancelled => exec.fail(&GatewayError::Cancelled),
            }
            // Releases the request token and the in-flight slot
            drop(scope);
        };

        let translator = StreamTranslator::new(route.model.clone());
        let stream = translate_stream(primed, translator, token, observer);
        Ok(GatewayResponse::Stream { stream, route })
    }
}

impl Drop for PipelineOrchestrator {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("providers", &self.providers)
            .field("running", &self.is_system_running())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
