//! Request Router
//!
//! Maps a request to one concrete [`Endpoint`]:
//!
//! ```text
//! CanonicalRequest --rules--> RoutingCategory --table--> [Endpoint]
//!                                                         | health filter
//!                                                         v
//!                                                    LoadBalancer --> Endpoint
//! ```
//!
//! A category with no configured endpoint is a routing error, and a category
//! whose endpoints are all backing off is a no-healthy-endpoint error. The
//! router never falls through to another category.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::balancer::LoadBalancer;
use super::category::{CategoryClassifier, RoutingCategory};
use super::health::{HealthRegistry, HealthStatus};
use crate::config::{ConfigError, Endpoint, EndpointId, GatewayConfig, ProviderKind};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::CanonicalRequest;

/// Outcome of routing one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    /// Category the request was classified into
    pub category: RoutingCategory,
    /// Endpoint bound to the request
    pub endpoint: Endpoint,
}

/// Routes requests to endpoints
#[derive(Debug)]
pub struct Router {
    classifier: CategoryClassifier,
    endpoints: HashMap<EndpointId, Endpoint>,
    table: BTreeMap<RoutingCategory, Vec<EndpointId>>,
    balancers: HashMap<RoutingCategory, LoadBalancer>,
    health: Arc<HealthRegistry>,
}

impl Router {
    /// Build a router from configuration
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the rules do not compile or lack a
    /// catch-all, or a category references an unknown endpoint.
    pub fn new(config: &GatewayConfig, health: Arc<HealthRegistry>) -> Result<Self, ConfigError> {
        let classifier = CategoryClassifier::new(&config.rules)?;
        let endpoints: HashMap<_, _> = config
            .endpoints
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();

        for (category, ids) in &config.categories {
            if let Some(missing) = ids.iter().find(|id| !endpoints.contains_key(*id)) {
                return Err(ConfigError::ValidationError(format!(
                    "category '{category}' references unknown endpoint '{missing}'"
                )));
            }
        }

        let balancers = config
            .categories
            .keys()
            .map(|c| (*c, LoadBalancer::new(*c, &config.balancer)))
            .collect();

        // Health records exist from startup so status output lists every endpoint
        for id in endpoints.keys() {
            health.get_or_create(id);
        }

        tracing::info!(
            endpoints = endpoints.len(),
            categories = config.categories.len(),
            rules = config.rules.len(),
            "Router built"
        );

        Ok(Self {
            classifier,
            endpoints,
            table: config.categories.clone(),
            balancers,
            health,
        })
    }

    /// Pick the endpoint for `request`
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Routing`] if the category has no configured endpoint
    /// - [`GatewayError::NoHealthyEndpoint`] if every candidate is unhealthy
    pub fn route(&self, request: &CanonicalRequest) -> GatewayResult<RouteDecision> {
        let category = self.classifier.classify(request)?;

        let ids = self
            .table
            .get(&category)
            .filter(|ids| !ids.is_empty())
            .ok_or_else(|| {
                GatewayError::Routing(format!("no endpoint configured for category '{category}'"))
            })?;

        let healthy: Vec<&Endpoint> = ids
            .iter()
            .filter_map(|id| self.endpoints.get(id))
            .filter(|e| self.health.is_healthy(&e.id))
            .collect();

        let balancer = self.balancers.get(&category).ok_or_else(|| {
            GatewayError::Routing(format!("no balancer for category '{category}'"))
        })?;
        let endpoint = balancer.select(&healthy)?.clone();

        tracing::debug!(
            correlation_id = %request.correlation_id,
            category = %category,
            endpoint = %endpoint.id,
            candidates = ids.len(),
            healthy = healthy.len(),
            "Request routed"
        );

        Ok(RouteDecision { category, endpoint })
    }

    /// Operator override: take an endpoint out of rotation
    ///
    /// Returns `false` if the endpoint is not configured.
    pub fn mark_unhealthy(&self, id: &EndpointId, reason: impl Into<String>) -> bool {
        if !self.endpoints.contains_key(id) {
            return false;
        }
        self.health.mark_unhealthy(id, reason);
        true
    }

    /// Operator override: return an endpoint to rotation
    ///
    /// Returns `false` if the endpoint is not configured.
    pub fn mark_healthy(&self, id: &EndpointId) -> bool {
        if !self.endpoints.contains_key(id) {
            return false;
        }
        self.health.mark_healthy(id);
        true
    }

    /// Read-only view of the routing table with live health
    #[must_use]
    pub fn routing_table_status(&self) -> RoutingTableStatus {
        let categories = self
            .table
            .iter()
            .map(|(category, ids)| CategoryStatus {
                category: *category,
                policy: self
                    .balancers
                    .get(category)
                    .map_or("none", LoadBalancer::policy_name),
                endpoints: ids
                    .iter()
                    .filter_map(|id| self.endpoints.get(id))
                    .map(|e| RoutedEndpoint {
                        id: e.id.clone(),
                        provider: e.provider,
                        model: e.model.clone(),
                        status: self.health.get_or_create(&e.id).status(),
                    })
                    .collect(),
            })
            .collect();
        RoutingTableStatus { categories }
    }
}

/// Endpoint entry in [`RoutingTableStatus`]
#[derive(Clone, Debug, Serialize)]
pub struct RoutedEndpoint {
    /// Endpoint id
    pub id: EndpointId,
    /// Protocol kind
    pub provider: ProviderKind,
    /// Upstream model
    pub model: String,
    /// Live health
    pub status: HealthStatus,
}

/// One category row in [`RoutingTableStatus`]
#[derive(Clone, Debug, Serialize)]
pub struct CategoryStatus {
    /// Category
    pub category: RoutingCategory,
    /// Balancer policy name
    pub policy: &'static str,
    /// Configured endpoints, in order
    pub endpoints: Vec<RoutedEndpoint>,
}

/// Snapshot of the routing table
#[derive(Clone, Debug, Serialize)]
pub struct RoutingTableStatus {
    /// Category rows
    pub categories: Vec<CategoryStatus>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{BalancerPolicy, CategoryRule, HealthPolicy, RetryPolicy, Timeouts};

    fn config() -> GatewayConfig {
        GatewayConfig::new(
            RetryPolicy {
                schedule: vec![Duration::from_secs(1)],
            },
            HealthPolicy {
                failure_threshold: 1,
                backoff_ladder: vec![Duration::from_secs(1)],
            },
            Timeouts {
                upstream: Duration::from_secs(5),
                request: Duration::from_secs(30),
            },
        )
        .with_endpoint(Endpoint::new("a", ProviderKind::Ollama, "llama3.2", "http://a"))
        .with_endpoint(Endpoint::new("b", ProviderKind::OpenaiCompatible, "gpt-4o", "http://b"))
        .with_endpoint(Endpoint::new("c", ProviderKind::Gemini, "gemini-2.0-flash", "http://c"))
        .with_rule(CategoryRule::model(RoutingCategory::Background, "^fast"))
        .with_rule(CategoryRule::model(RoutingCategory::Think, "think"))
        .with_rule(CategoryRule::catch_all(RoutingCategory::Default))
        .with_category(RoutingCategory::Background, &["a"])
        .with_category(RoutingCategory::Default, &["b", "c"])
        .with_balancer(BalancerPolicy::RoundRobin, 0)
    }

    fn router() -> (Router, Arc<HealthRegistry>) {
        let config = config();
        let health = Arc::new(HealthRegistry::new(config.health.clone()));
        (Router::new(&config, Arc::clone(&health)).unwrap(), health)
    }

    #[test]
    fn test_routes_within_category() {
        let (router, _) = router();
        let d = router.route(&CanonicalRequest::new("fast-model", "hi", 8)).unwrap();
        assert_eq!(d.category, RoutingCategory::Background);
        assert_eq!(d.endpoint.id.as_str(), "a");

        for _ in 0..4 {
            let d = router.route(&CanonicalRequest::new("sonnet", "hi", 8)).unwrap();
            assert!(["b", "c"].contains(&d.endpoint.id.as_str()));
        }
    }

    #[test]
    fn test_unconfigured_category_is_routing_error() {
        let (router, _) = router();
        let err = router
            .route(&CanonicalRequest::new("deep-think", "hi", 8))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Routing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_unhealthy_is_no_healthy_endpoint() {
        let (router, health) = router();
        health.record_failure(&EndpointId::from("a"));
        let err = router
            .route(&CanonicalRequest::new("fast-model", "hi", 8))
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyEndpoint { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(router.route(&CanonicalRequest::new("fast-model", "hi", 8)).is_ok());
    }

    #[test]
    fn test_unhealthy_endpoint_is_skipped() {
        let (router, _) = router();
        assert!(router.mark_unhealthy(&EndpointId::from("b"), "draining"));
        for _ in 0..3 {
            let d = router.route(&CanonicalRequest::new("sonnet", "hi", 8)).unwrap();
            assert_eq!(d.endpoint.id.as_str(), "c");
        }
        assert!(router.mark_healthy(&EndpointId::from("b")));
        assert!(!router.mark_healthy(&EndpointId::from("zzz")));
    }

    #[test]
    fn test_routing_table_status() {
        let (router, _) = router();
        router.mark_unhealthy(&EndpointId::from("c"), "test");
        let status = router.routing_table_status();
        assert_eq!(status.categories.len(), 2);
        let default = status
            .categories
            .iter()
            .find(|c| c.category == RoutingCategory::Default)
            .unwrap();
        assert_eq!(default.policy, "round_robin");
        assert_eq!(default.endpoints[1].status, HealthStatus::Disabled);
    }
}
