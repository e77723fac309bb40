//! Per-request pipeline state
//!
//! ```text
//! created -> routing -> calling_upstream -> translating -> completed
//!    |          |              |                 |
//!    +----------+--------------+-----------------+------> failed
//! ```
//!
//! Retries happen inside `calling_upstream` and are only visible as a
//! counter on [`PipelineExecution`].

use serde::Serialize;
use tokio::time::Instant;

use crate::config::EndpointId;
use crate::error::GatewayError;
use crate::messages::CorrelationId;

/// Pipeline stage of one request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Accepted, nothing done yet
    Created,
    /// Classifying and picking an endpoint
    Routing,
    /// Bound to an endpoint; upstream call (with retries) in progress
    CallingUpstream,
    /// Upstream answered; producing canonical output
    Translating,
    /// Finished successfully
    Completed,
    /// Finished with an error or cancelled
    Failed,
}

impl Stage {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: Stage) -> bool {
        match (self, next) {
            (from, Self::Failed) => !from.is_terminal(),
            (Self::Created, Self::Routing)
            | (Self::Routing, Self::CallingUpstream)
            | (Self::CallingUpstream, Self::Translating)
            | (Self::Translating, Self::Completed) => true,
            _ => false,
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Routing => "routing",
            Self::CallingUpstream => "calling_upstream",
            Self::Translating => "translating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracking record for one request moving through the pipeline
#[derive(Debug)]
pub struct PipelineExecution {
    /// Request correlation id
    pub correlation_id: CorrelationId,
    /// Bound endpoint, set when leaving `routing`
    pub endpoint: Option<EndpointId>,
    stage: Stage,
    retries: u32,
    started_at: Instant,
}

impl PipelineExecution {
    /// Start tracking a request in [`Stage::Created`]
    #[must_use]
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            endpoint: None,
            stage: Stage::Created,
            retries: 0,
            started_at: Instant::now(),
        }
    }

    /// Current stage
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Retries performed during `calling_upstream`
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Milliseconds since the request was accepted
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Move to `next`; illegal transitions are ignored and return `false`
    pub fn advance(&mut self, next: Stage) -> bool {
        if !self.stage.can_transition_to(next) {
            tracing::warn!(
                correlation_id = %self.correlation_id,
                from = %self.stage,
                to = %next,
                "Ignoring illegal pipeline transition"
            );
            return false;
        }
        tracing::debug!(
            correlation_id = %self.correlation_id,
            from = %self.stage,
            to = %next,
            "Pipeline stage"
        );
        self.stage = next;
        true
    }

    /// Bind the endpoint and enter `calling_upstream`
    pub fn bind(&mut self, endpoint: EndpointId) -> bool {
        self.endpoint = Some(endpoint);
        self.advance(Stage::CallingUpstream)
    }

    /// Record how many attempts the upstream call took
    pub fn set_attempts(&mut self, attempts: u32) {
        self.retries = attempts.saturating_sub(1);
    }

    /// Finish successfully
    pub fn complete(&mut self) {
        if self.advance(Stage::Completed) {
            tracing::info!(
                correlation_id = %self.correlation_id,
                endpoint = ?self.endpoint.as_ref().map(EndpointId::as_str),
                retries = self.retries,
                elapsed_ms = self.elapsed_ms(),
                "Request completed"
            );
        }
    }

    /// Finish with `err`
    pub fn fail(&mut self, err: &GatewayError) {
        if self.advance(Stage::Failed) {
            tracing::info!(
                correlation_id = %self.correlation_id,
                endpoint = ?self.endpoint.as_ref().map(EndpointId::as_str),
                kind = err.kind().as_str(),
                retries = self.retries,
                elapsed_ms = self.elapsed_ms(),
                error = %err,
                "Request failed"
            );
        }
    }
}
