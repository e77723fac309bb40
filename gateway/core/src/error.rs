//! Gateway Error Taxonomy
//!
//! Every failure a request can end in maps to exactly one [`GatewayError`]
//! variant. The retry controller and stream translator pass these through
//! untouched, so the kind a caller observes is the kind that was raised by the
//! component closest to the fault.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::EndpointId;

/// Result alias used throughout the core
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Stable, serializable tag for a [`GatewayError`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No endpoint for the request's category
    Routing,
    /// Every candidate endpoint is backing off
    NoHealthyEndpoint,
    /// Upstream throttled the request
    RateLimit,
    /// Upstream went silent past the deadline
    UpstreamTimeout,
    /// Upstream sent something we could not interpret
    UpstreamProtocol,
    /// Caller went away or the request deadline fired
    Cancelled,
    /// Could not reach the upstream at all
    UpstreamConnection,
    /// Upstream answered with a non-throttling error status
    UpstreamStatus,
    /// Inbound request failed validation
    InvalidRequest,
}

impl ErrorKind {
    /// Snake-case name, as used in error payloads
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "routing_error",
            Self::NoHealthyEndpoint => "no_healthy_endpoint",
            Self::RateLimit => "rate_limit_error",
            Self::UpstreamTimeout => "timeout_error",
            Self::UpstreamProtocol => "upstream_protocol_error",
            Self::Cancelled => "cancelled",
            Self::UpstreamConnection => "upstream_connection_error",
            Self::UpstreamStatus => "upstream_error",
            Self::InvalidRequest => "invalid_request_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the gateway core
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// No endpoint configured for the category, or the category is undetermined
    #[error("routing failed: {0}")]
    Routing(String),

    /// All candidates for the category are unhealthy
    #[error("no healthy endpoint for category '{category}'")]
    NoHealthyEndpoint {
        /// Category whose candidates were all excluded
        category: String,
    },

    /// Upstream reported throttling
    #[error("rate limited by {endpoint}{}", retry_after_suffix(*retry_after))]
    RateLimit {
        /// Endpoint that throttled us
        endpoint: EndpointId,
        /// Server-suggested wait, if the upstream sent one
        retry_after: Option<Duration>,
    },

    /// No data within the configured deadline
    #[error("upstream {endpoint} timed out after {}ms", elapsed.as_millis())]
    UpstreamTimeout {
        /// Endpoint that went silent
        endpoint: EndpointId,
        /// Deadline that was exceeded
        elapsed: Duration,
    },

    /// Malformed or unexpected upstream payload
    #[error("upstream {endpoint} protocol error: {message}")]
    UpstreamProtocol {
        /// Endpoint that sent the payload
        endpoint: EndpointId,
        /// What was wrong with it
        message: String,
    },

    /// Caller disconnected or the request deadline fired
    #[error("request cancelled")]
    Cancelled,

    /// Transport-level failure talking to the upstream
    #[error("connection to {endpoint} failed: {message}")]
    UpstreamConnection {
        /// Endpoint we tried to reach
        endpoint: EndpointId,
        /// Transport error text
        message: String,
    },

    /// Non-throttling HTTP error status from upstream
    #[error("upstream {endpoint} returned {status}: {message}")]
    UpstreamStatus {
        /// Endpoint that answered
        endpoint: EndpointId,
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        message: String,
    },

    /// Inbound request failed validation before routing
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn retry_after_suffix(retry_after: Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}ms)", d.as_millis()))
        .unwrap_or_default()
}

impl GatewayError {
    /// Stable tag for this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Routing(_) => ErrorKind::Routing,
            Self::NoHealthyEndpoint { .. } => ErrorKind::NoHealthyEndpoint,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            Self::UpstreamProtocol { .. } => ErrorKind::UpstreamProtocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::UpstreamConnection { .. } => ErrorKind::UpstreamConnection,
            Self::UpstreamStatus { .. } => ErrorKind::UpstreamStatus,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether the retry controller may try again after this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    /// Whether this outcome counts against the endpoint's health
    ///
    /// Cancellation and inbound validation failures say nothing about the
    /// upstream, so they are not recorded.
    #[must_use]
    pub fn counts_against_endpoint(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::InvalidRequest(_)
                | Self::Routing(_)
                | Self::NoHealthyEndpoint { .. }
        )
    }

    /// Shorthand for a protocol error
    pub fn protocol(endpoint: &EndpointId, message: impl Into<String>) -> Self {
        Self::UpstreamProtocol {
            endpoint: endpoint.clone(),
            message: message.into(),
        }
    }

    /// Shorthand for a throttling error
    #[must_use]
    pub fn rate_limited(endpoint: &EndpointId, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            endpoint: endpoint.clone(),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rate_limit_is_retryable() {
        let ep = EndpointId::from("ep-1");
        assert!(GatewayError::rate_limited(&ep, None).is_retryable());
        assert!(!GatewayError::protocol(&ep, "bad json").is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(!GatewayError::UpstreamTimeout {
            endpoint: ep,
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_display_includes_retry_after() {
        let err =
            GatewayError::rate_limited(&EndpointId::from("ep-1"), Some(Duration::from_secs(2)));
        assert_eq!(err.to_string(), "rate limited by ep-1 (retry after 2000ms)");
        assert_eq!(err.kind(), ErrorKind::RateLimit);
    }

    #[test]
    fn test_cancelled_does_not_count_against_endpoint() {
        assert!(!GatewayError::Cancelled.counts_against_endpoint());
        assert!(GatewayError::protocol(&EndpointId::from("x"), "m").counts_against_endpoint());
    }
}
