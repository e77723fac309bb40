//! Routing, Health, and Retry
//!
//! - [`category`]: rule-based request classification
//! - [`health`]: per-endpoint backoff state (the only shared mutable state)
//! - [`balancer`]: selection among healthy endpoints of one category
//! - [`router`]: request to endpoint binding
//! - [`retry`]: rate-limit retry around a single upstream call

pub mod balancer;
pub mod category;
pub mod health;
pub mod retry;
pub mod router;

pub use balancer::{LoadBalancer, SelectionPolicy};
pub use category::{CategoryClassifier, RoutingCategory};
pub use health::{EndpointHealth, HealthRegistry, HealthSnapshot, HealthStatus};
pub use retry::RetryController;
pub use router::{RouteDecision, Router, RoutingTableStatus};
