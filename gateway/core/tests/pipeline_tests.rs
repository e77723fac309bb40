//! Pipeline behaviour with scripted upstreams
//!
//! These tests drive [`PipelineOrchestrator`] end to end with in-process
//! provider clients, so timing can be checked on tokio's paused clock:
//! - retry schedule timing and exhaustion
//! - health ladder and rerouting around bad endpoints
//! - load-balancer distribution
//! - cancellation of unary calls and open streams
//! - request deadline

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use gateway_core::config::{BalancerPolicy, CategoryRule, HealthPolicy, RetryPolicy, Timeouts};
use gateway_core::messages::CanonicalEvent;
use gateway_core::providers::{UpstreamEvent, UpstreamRequest, UpstreamResponse, UpstreamStream};
use gateway_core::{
    CanonicalRequest, ContentBlock, Endpoint, EndpointId, ErrorKind, GatewayConfig, GatewayError,
    GatewayResponse, GatewayResult, HealthRegistry, HealthStatus, PipelineOrchestrator,
    ProviderClient, ProviderKind, ProviderRegistry, RoutingCategory, StopReason, Usage,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// What a scripted client does on each call
#[derive(Clone, Copy, Debug)]
enum Script {
    /// Throttle the first N calls, then answer
    ThrottleFirst(u32),
    /// Always fail with a 500
    AlwaysFail,
    /// Never answer
    Hang,
}

struct ScriptedClient {
    endpoint: Endpoint,
    script: Script,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    stream_rx: Mutex<Option<mpsc::Receiver<GatewayResult<UpstreamEvent>>>>,
}

impl ScriptedClient {
    fn new(id: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint(id),
            script,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            stream_rx: Mutex::new(None),
        })
    }

    /// Client whose stream is fed from the returned sender
    fn channel(id: &str) -> (Arc<Self>, mpsc::Sender<GatewayResult<UpstreamEvent>>) {
        let (tx, rx) = mpsc::channel(16);
        let client = Self::new(id, Script::ThrottleFirst(0));
        *client.stream_rx.lock() = Some(rx);
        (client, tx)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn attempt(&self) -> GatewayResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(Instant::now());
        match self.script {
            Script::ThrottleFirst(limit) if n < limit => {
                Err(GatewayError::rate_limited(&self.endpoint.id, None))
            }
            Script::ThrottleFirst(_) => Ok(()),
            Script::AlwaysFail => Err(GatewayError::UpstreamStatus {
                endpoint: self.endpoint.id.clone(),
                status: 500,
                message: "boom".into(),
            }),
            Script::Hang => futures::future::pending().await,
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
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
        self.attempt().await?;
        Ok(UpstreamResponse {
            content: vec![ContentBlock::text(format!("from {}", self.endpoint.id))],
            stop_reason: StopReason::End,
            usage: Usage {
                input_tokens: 4,
                output_tokens: 2,
            },
        })
    }

    async fn send_stream_request(
        &self,
        _request: UpstreamRequest,
    ) -> GatewayResult<UpstreamStream> {
        self.attempt().await?;
        let scripted = self.stream_rx.lock().take();
        if let Some(rx) = scripted {
            return Ok(ReceiverStream::new(rx).boxed());
        }
        Ok(futures::stream::iter(vec![
            Ok(UpstreamEvent::TextDelta("hello".into())),
            Ok(UpstreamEvent::Finished(StopReason::End)),
        ])
        .boxed())
    }
}

fn endpoint(id: &str) -> Endpoint {
    Endpoint::new(id, ProviderKind::OpenaiCompatible, format!("{id}-model"), "http://unused")
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|s| Duration::from_secs(*s)).collect()
}

/// Default category served by `ids`, schedule `[1s, 5s, 60s]`
fn config(ids: &[&str], failure_threshold: u32) -> GatewayConfig {
    let mut config = GatewayConfig::new(
        RetryPolicy {
            schedule: secs(&[1, 5, 60]),
        },
        HealthPolicy {
            failure_threshold,
            backoff_ladder: secs(&[1, 5, 30]),
        },
        Timeouts {
            upstream: Duration::from_secs(30),
            request: Duration::from_secs(600),
        },
    )
    .with_rule(CategoryRule::catch_all(RoutingCategory::Default))
    .with_category(RoutingCategory::Default, ids);
    for id in ids {
        config = config.with_endpoint(endpoint(id));
    }
    config
}

fn start(config: &GatewayConfig, clients: &[Arc<ScriptedClient>]) -> PipelineOrchestrator {
    let mut providers = ProviderRegistry::new();
    for client in clients {
        providers.insert(Arc::clone(client) as Arc<dyn ProviderClient>);
    }
    let orch = PipelineOrchestrator::with_providers(config, providers).unwrap();
    orch.start();
    orch
}

fn request() -> CanonicalRequest {
    CanonicalRequest::new("claude-3-5-sonnet", "hello", 64)
}

async fn unary(orch: &PipelineOrchestrator) -> GatewayResult<(String, EndpointId)> {
    match orch
        .process_incoming_request(request(), &CancellationToken::new())
        .await?
    {
        GatewayResponse::Unary { response, route } => Ok((response.text(), route.endpoint)),
        GatewayResponse::Stream { .. } => panic!("expected unary response"),
    }
}

// =============================================================================
// Retry Schedule
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_waits_follow_schedule() {
    let client = ScriptedClient::new("a", Script::ThrottleFirst(3));
    let orch = start(&config(&["a"], 100), &[Arc::clone(&client)]);

    let began = Instant::now();
    let (text, endpoint) = unary(&orch).await.unwrap();

    assert_eq!(text, "from a");
    assert_eq!(endpoint.as_str(), "a");
    assert_eq!(client.calls(), 4);

    let offsets: Vec<u64> = client
        .call_times
        .lock()
        .iter()
        .map(|t| t.duration_since(began).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 1, 6, 66]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_returns_rate_limit() {
    let client = ScriptedClient::new("a", Script::ThrottleFirst(u32::MAX));
    let orch = start(&config(&["a"], 100), &[Arc::clone(&client)]);

    let err = unary(&orch).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert_eq!(client.calls(), 4);
    assert_eq!(orch.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_throttle_errors_are_not_retried() {
    let client = ScriptedClient::new("a", Script::AlwaysFail);
    let orch = start(&config(&["a"], 100), &[Arc::clone(&client)]);

    let err = unary(&orch).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UpstreamStatus);
    assert_eq!(client.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_streaming_retries_before_first_content() {
    let client = ScriptedClient::new("a", Script::ThrottleFirst(1));
    let orch = start(&config(&["a"], 100), &[Arc::clone(&client)]);

    let response = orch
        .process_incoming_request(request().with_stream(true), &CancellationToken::new())
        .await
        .unwrap();
    let GatewayResponse::Stream { stream, route } = response else {
        panic!("expected stream");
    };
    let names: Vec<&str> = stream.map(|e| e.event_name()).collect().await;

    assert_eq!(route.endpoint.as_str(), "a");
    assert_eq!(client.calls(), 2);
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}

// =============================================================================
// Health and Load Balancing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_ladder_windows() {
    let health = HealthRegistry::new(HealthPolicy {
        failure_threshold: 2,
        backoff_ladder: secs(&[1, 5]),
    });
    let id = EndpointId::from("a");

    health.record_failure(&id);
    assert!(health.is_healthy(&id), "below threshold stays healthy");

    health.record_failure(&id);
    assert_eq!(health.snapshot(&id).status, HealthStatus::BackingOff);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(health.is_healthy(&id));

    health.record_failure(&id);
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(!health.is_healthy(&id), "second step backs off for 5s");
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(health.is_healthy(&id));

    health.record_failure(&id);
    tokio::time::advance(Duration::from_millis(4_999)).await;
    assert!(!health.is_healthy(&id), "last ladder entry repeats");

    health.record_success(&id);
    assert!(health.is_healthy(&id));
    assert_eq!(health.snapshot(&id).consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_endpoint_is_routed_around() {
    let bad = ScriptedClient::new("bad", Script::AlwaysFail);
    let good = ScriptedClient::new("good", Script::ThrottleFirst(0));
    let orch = start(
        &config(&["bad", "good"], 1),
        &[Arc::clone(&bad), Arc::clone(&good)],
    );

    // Round robin starts at "bad"; one failure reaches the threshold
    assert!(unary(&orch).await.is_err());

    for _ in 0..3 {
        let (_, endpoint) = unary(&orch).await.unwrap();
        assert_eq!(endpoint.as_str(), "good");
    }
    assert_eq!(bad.calls(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(orch.health().is_healthy(&EndpointId::from("bad")));
}

#[tokio::test(start_paused = true)]
async fn test_all_backing_off_is_no_healthy_endpoint() {
    let client = ScriptedClient::new("a", Script::AlwaysFail);
    let orch = start(&config(&["a"], 1), &[Arc::clone(&client)]);

    assert_eq!(unary(&orch).await.unwrap_err().kind(), ErrorKind::UpstreamStatus);
    assert_eq!(
        unary(&orch).await.unwrap_err().kind(),
        ErrorKind::NoHealthyEndpoint
    );
    assert_eq!(client.calls(), 1);
    assert!(!orch.is_ready());
}

#[tokio::test]
async fn test_round_robin_splits_evenly() {
    let a = ScriptedClient::new("a", Script::ThrottleFirst(0));
    let b = ScriptedClient::new("b", Script::ThrottleFirst(0));
    let orch = start(&config(&["a", "b"], 3), &[Arc::clone(&a), Arc::clone(&b)]);

    for _ in 0..10 {
        unary(&orch).await.unwrap();
    }

    assert_eq!(a.calls(), 5);
    assert_eq!(b.calls(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_splits_concurrent_requests() {
    let a = ScriptedClient::new("a", Script::ThrottleFirst(0));
    let b = ScriptedClient::new("b", Script::ThrottleFirst(0));
    let orch = Arc::new(start(
        &config(&["a", "b"], 3),
        &[Arc::clone(&a), Arc::clone(&b)],
    ));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { unary(&orch).await })
        })
        .collect();
    let served: Vec<EndpointId> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().1)
        .collect();

    let on_a = served.iter().filter(|id| id.as_str() == "a").count();
    assert_eq!(on_a, 50);
    assert_eq!(served.len() - on_a, 50);
    assert_eq!(a.calls(), 50);
    assert_eq!(b.calls(), 50);
    assert_eq!(orch.in_flight(), 0);
}

#[tokio::test]
async fn test_least_recently_used_alternates() {
    let a = ScriptedClient::new("a", Script::ThrottleFirst(0));
    let b = ScriptedClient::new("b", Script::ThrottleFirst(0));
    let config = config(&["a", "b"], 3).with_balancer(BalancerPolicy::LeastRecentlyUsed, 0);
    let orch = start(&config, &[Arc::clone(&a), Arc::clone(&b)]);

    let mut served = Vec::new();
    for _ in 0..4 {
        served.push(unary(&orch).await.unwrap().1.as_str().to_string());
    }

    assert_eq!(served, vec!["a", "b", "a", "b"]);
}

#[tokio::test]
async fn test_operator_override_reroutes() {
    let a = ScriptedClient::new("a", Script::ThrottleFirst(0));
    let b = ScriptedClient::new("b", Script::ThrottleFirst(0));
    let orch = start(&config(&["a", "b"], 3), &[Arc::clone(&a), Arc::clone(&b)]);

    assert!(orch.router().mark_unhealthy(&EndpointId::from("a"), "maintenance"));
    for _ in 0..4 {
        assert_eq!(unary(&orch).await.unwrap().1.as_str(), "b");
    }

    assert!(orch.router().mark_healthy(&EndpointId::from("a")));
    assert!(!orch.router().mark_healthy(&EndpointId::from("missing")));
    assert_eq!(a.calls(), 0);
}

// =============================================================================
// Cancellation and Deadlines
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_caller_cancel_aborts_hung_call() {
    let client = ScriptedClient::new("a", Script::Hang);
    let orch = Arc::new(start(&config(&["a"], 1), &[Arc::clone(&client)]));
    let cancel = CancellationToken::new();

    let task = {
        let orch = Arc::clone(&orch);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orch.process_incoming_request(request(), &cancel)
                .await
                .map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(orch.in_flight(), 0);
    assert!(orch.health().is_healthy(&EndpointId::from("a")));
}

#[tokio::test(start_paused = true)]
async fn test_request_deadline_cancels() {
    let client = ScriptedClient::new("a", Script::Hang);
    let mut config = config(&["a"], 1);
    config.timeouts.request = Duration::from_secs(2);
    let orch = start(&config, &[Arc::clone(&client)]);

    let began = Instant::now();
    let err = unary(&orch).await.unwrap_err();

    assert!(matches!(err, GatewayError::Cancelled));
    assert_eq!(began.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancel_mid_stream_drops_upstream() {
    let (client, tx) = ScriptedClient::channel("a");
    let orch = start(&config(&["a"], 1), &[client]);
    let cancel = CancellationToken::new();

    tx.send(Ok(UpstreamEvent::TextDelta("partial".into())))
        .await
        .unwrap();
    let response = orch
        .process_incoming_request(request().with_stream(true), &cancel)
        .await
        .unwrap();
    let GatewayResponse::Stream { mut stream, .. } = response else {
        panic!("expected stream");
    };

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(stream.next().await.unwrap());
    }
    assert!(matches!(seen[0], CanonicalEvent::MessageStart { .. }));
    assert!(matches!(seen[2], CanonicalEvent::ContentBlockDelta { .. }));

    cancel.cancel();
    assert!(stream.next().await.is_none(), "no events after cancel");

    tokio::time::timeout(Duration::from_secs(1), tx.closed())
        .await
        .expect("upstream receiver released");
    assert_eq!(orch.in_flight(), 0);
}

#[tokio::test]
async fn test_mid_stream_error_is_terminal_event() {
    let (client, tx) = ScriptedClient::channel("a");
    let orch = start(&config(&["a"], 1), &[client]);

    tx.send(Ok(UpstreamEvent::TextDelta("partial".into())))
        .await
        .unwrap();
    tx.send(Err(GatewayError::protocol(&EndpointId::from("a"), "bad frame")))
        .await
        .unwrap();
    drop(tx);

    let response = orch
        .process_incoming_request(request().with_stream(true), &CancellationToken::new())
        .await
        .unwrap();
    let GatewayResponse::Stream { stream, .. } = response else {
        panic!("expected stream");
    };
    let events: Vec<CanonicalEvent> = stream.collect().await;

    let errors = events
        .iter()
        .filter(|e| matches!(e, CanonicalEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(
        events.last(),
        Some(&CanonicalEvent::MessageStop {
            stop_reason: StopReason::Error
        })
    );
    assert_eq!(
        orch.health()
            .snapshot(&EndpointId::from("a"))
            .consecutive_failures,
        1
    );
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests() {
    let client = ScriptedClient::new("a", Script::ThrottleFirst(0));
    let orch = start(&config(&["a"], 1), &[client]);

    orch.shutdown();

    assert!(matches!(unary(&orch).await, Err(GatewayError::Cancelled)));
    assert!(!orch.get_system_status().running);
}
