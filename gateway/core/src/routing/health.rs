//! Endpoint Health Registry
//!
//! The only cross-request shared mutable state in the gateway. Each endpoint
//! gets an [`EndpointHealth`] record, created lazily on first use and never
//! removed. Records live in a `DashMap` so unrelated endpoints never contend,
//! and each record guards its fields with its own mutex so a reader always
//! sees a consistent snapshot.
//!
//! # Backoff Ladder
//!
//! ```text
//! failures:   1 .. threshold-1   threshold   threshold+1   threshold+2 ...
//! window:     none               ladder[0]   ladder[1]     ladder[2] (capped at last)
//! ```
//!
//! While a window is open the endpoint is unhealthy. When it elapses the
//! endpoint is offered again, but the failure count is kept, so the next
//! failure escalates. Any success clears the window and the count.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{EndpointId, HealthPolicy};

// ============================================================================
// Health Status
// ============================================================================

/// Externally visible health of an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Accepting requests
    Healthy,
    /// Inside a backoff window after consecutive failures
    BackingOff,
    /// Taken out of rotation by an operator
    Disabled,
}

impl HealthStatus {
    /// Whether requests should be sent
    #[must_use]
    pub fn allows_requests(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

// ============================================================================
// Endpoint Health
// ============================================================================

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: u32,
    unhealthy_until: Option<Instant>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    disabled_reason: Option<String>,
    total_successes: u64,
    total_failures: u64,
}

/// Health record for a single endpoint
pub struct EndpointHealth {
    /// Endpoint identifier
    pub endpoint: EndpointId,
    policy: Arc<HealthPolicy>,
    state: Mutex<HealthState>,
}

impl EndpointHealth {
    fn new(endpoint: EndpointId, policy: Arc<HealthPolicy>) -> Self {
        Self {
            endpoint,
            policy,
            state: Mutex::new(HealthState::default()),
        }
    }

    fn status_at(state: &HealthState, now: Instant) -> HealthStatus {
        if state.disabled_reason.is_some() {
            HealthStatus::Disabled
        } else if state.unhealthy_until.is_some_and(|until| now < until) {
            HealthStatus::BackingOff
        } else {
            HealthStatus::Healthy
        }
    }

    /// Current status
    pub fn status(&self) -> HealthStatus {
        Self::status_at(&self.state.lock(), Instant::now())
    }

    /// Whether the endpoint may receive requests now
    pub fn is_healthy(&self) -> bool {
        self.status().allows_requests()
    }

    /// Backoff window for the given consecutive-failure count
    fn window_for(&self, consecutive: u32) -> Option<Duration> {
        let threshold = self.policy.failure_threshold.max(1);
        if consecutive < threshold {
            return None;
        }
        let step = (consecutive - threshold) as usize;
        let ladder = &self.policy.backoff_ladder;
        ladder.get(step).or_else(|| ladder.last()).copied()
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        let was_backing_off = state.consecutive_failures > 0;
        state.consecutive_failures = 0;
        state.unhealthy_until = None;
        state.last_success = Some(Instant::now());
        state.total_successes += 1;
        drop(state);

        if was_backing_off {
            tracing::info!(endpoint = %self.endpoint, "Endpoint recovered");
        }
    }

    /// Record a failed call, opening or widening the backoff window
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(now);
        state.total_failures += 1;
        let consecutive = state.consecutive_failures;

        if let Some(window) = self.window_for(consecutive) {
            state.unhealthy_until = Some(now + window);
            drop(state);
            tracing::warn!(
                endpoint = %self.endpoint,
                consecutive_failures = consecutive,
                backoff_ms = window.as_millis() as u64,
                "Endpoint entering backoff"
            );
        }
    }

    /// Take the endpoint out of rotation until [`EndpointHealth::mark_healthy`]
    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(endpoint = %self.endpoint, reason = %reason, "Endpoint marked unhealthy");
        self.state.lock().disabled_reason = Some(reason);
    }

    /// Return the endpoint to rotation and clear any backoff
    pub fn mark_healthy(&self) {
        let mut state = self.state.lock();
        state.disabled_reason = None;
        state.consecutive_failures = 0;
        state.unhealthy_until = None;
        drop(state);
        tracing::info!(endpoint = %self.endpoint, "Endpoint marked healthy");
    }

    /// Consecutive failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Consistent point-in-time view
    pub fn snapshot(&self) -> HealthSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        let since = |t: Option<Instant>| {
            t.map(|t| {
                let elapsed = now.saturating_duration_since(t).as_millis();
                u64::try_from(elapsed).unwrap_or(u64::MAX)
            })
        };
        HealthSnapshot {
            endpoint: self.endpoint.clone(),
            status: Self::status_at(&state, now),
            consecutive_failures: state.consecutive_failures,
            backoff_remaining_ms: state
                .unhealthy_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_millis() as u64),
            ms_since_last_success: since(state.last_success),
            ms_since_last_failure: since(state.last_failure),
            disabled_reason: state.disabled_reason.clone(),
            total_successes: state.total_successes,
            total_failures: state.total_failures,
        }
    }
}

impl std::fmt::Debug for EndpointHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHealth")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Immutable snapshot of an endpoint's health
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Endpoint identifier
    pub endpoint: EndpointId,
    /// Status at snapshot time
    pub status: HealthStatus,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Time left in the backoff window
    pub backoff_remaining_ms: Option<u64>,
    /// Time since the last success
    pub ms_since_last_success: Option<u64>,
    /// Time since the last failure
    pub ms_since_last_failure: Option<u64>,
    /// Operator-supplied reason when disabled
    pub disabled_reason: Option<String>,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
}

// ============================================================================
// Health Registry
// ============================================================================

/// Per-endpoint health records, shared by the router and retry controller
#[derive(Debug)]
pub struct HealthRegistry {
    policy: Arc<HealthPolicy>,
    endpoints: DashMap<EndpointId, Arc<EndpointHealth>>,
}

impl HealthRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            endpoints: DashMap::new(),
        }
    }

    /// Get or lazily create the record for an endpoint
    pub fn get_or_create(&self, id: &EndpointId) -> Arc<EndpointHealth> {
        if let Some(existing) = self.endpoints.get(id) {
            return Arc::clone(existing.value());
        }
        self.endpoints
            .entry(id.clone())
            .or_insert_with(|| Arc::new(EndpointHealth::new(id.clone(), Arc::clone(&self.policy))))
            .clone()
    }

    /// Whether the endpoint may receive requests now
    pub fn is_healthy(&self, id: &EndpointId) -> bool {
        self.get_or_create(id).is_healthy()
    }

    /// Record a failed call against the endpoint
    pub fn record_failure(&self, id: &EndpointId) {
        self.get_or_create(id).record_failure();
    }

    /// Record a successful call against the endpoint
    pub fn record_success(&self, id: &EndpointId) {
        self.get_or_create(id).record_success();
    }

    /// Operator override: take out of rotation
    pub fn mark_unhealthy(&self, id: &EndpointId, reason: impl Into<String>) {
        self.get_or_create(id).mark_unhealthy(reason);
    }

    /// Operator override: return to rotation
    pub fn mark_healthy(&self, id: &EndpointId) {
        self.get_or_create(id).mark_healthy();
    }

    /// Snapshot of a single endpoint
    pub fn snapshot(&self, id: &EndpointId) -> HealthSnapshot {
        self.get_or_create(id).snapshot()
    }

    /// Snapshots of every known endpoint, sorted by id
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<_> = self.endpoints.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }

    /// Number of endpoints currently accepting requests
    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.value().is_healthy()).count()
    }
}
