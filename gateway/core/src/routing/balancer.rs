//! Load Balancing
//!
//! Picks one endpoint among the healthy candidates of a category. The router
//! filters out unhealthy endpoints before calling in, so policies only ever
//! see live candidates.
//!
//! Every policy is deterministic for a given call sequence: round-robin and
//! least-recently-used keep their own cursor, and the random policy draws
//! from a seeded generator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{BalancerConfig, BalancerPolicy, Endpoint, EndpointId};
use crate::error::{GatewayError, GatewayResult};
use crate::routing::RoutingCategory;

/// Strategy for choosing among healthy candidates
pub trait SelectionPolicy: Send + Sync + std::fmt::Debug {
    /// Index into `candidates`, which is never empty
    fn pick(&self, candidates: &[&Endpoint]) -> usize;

    /// Policy name for status output
    fn name(&self) -> &'static str;
}

/// Cycles through candidates in order
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl SelectionPolicy for RoundRobinPolicy {
    fn pick(&self, candidates: &[&Endpoint]) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Picks the candidate whose last selection is oldest (never-used first,
/// ties broken by configuration order)
#[derive(Debug, Default)]
pub struct LeastRecentlyUsedPolicy {
    state: Mutex<LruState>,
}

#[derive(Debug, Default)]
struct LruState {
    tick: u64,
    last_used: HashMap<EndpointId, u64>,
}

impl SelectionPolicy for LeastRecentlyUsedPolicy {
    fn pick(&self, candidates: &[&Endpoint]) -> usize {
        let mut state = self.state.lock();
        let chosen = candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, e)| (state.last_used.get(&e.id).copied().unwrap_or(0), *i))
            .map_or(0, |(i, _)| i);
        state.tick += 1;
        let tick = state.tick;
        state.last_used.insert(candidates[chosen].id.clone(), tick);
        chosen
    }

    fn name(&self) -> &'static str {
        "least_recently_used"
    }
}

/// Seeded pseudo-random choice
#[derive(Debug)]
pub struct RandomPolicy {
    rng: Mutex<StdRng>,
}

impl RandomPolicy {
    /// Create with a fixed seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl SelectionPolicy for RandomPolicy {
    fn pick(&self, candidates: &[&Endpoint]) -> usize {
        self.rng.lock().gen_range(0..candidates.len())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Build the configured policy
#[must_use]
pub fn create_policy(config: &BalancerConfig) -> Box<dyn SelectionPolicy> {
    match config.policy {
        BalancerPolicy::RoundRobin => Box::<RoundRobinPolicy>::default(),
        BalancerPolicy::LeastRecentlyUsed => Box::<LeastRecentlyUsedPolicy>::default(),
        BalancerPolicy::Random => Box::new(RandomPolicy::new(config.seed)),
    }
}

/// Load balancer for one routing category
#[derive(Debug)]
pub struct LoadBalancer {
    category: RoutingCategory,
    policy: Box<dyn SelectionPolicy>,
}

impl LoadBalancer {
    /// Create a balancer for `category`
    #[must_use]
    pub fn new(category: RoutingCategory, config: &BalancerConfig) -> Self {
        Self {
            category,
            policy: create_policy(config),
        }
    }

    /// Select one of the healthy `candidates`
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoHealthyEndpoint`] when `candidates` is empty.
    pub fn select<'a>(&self, candidates: &[&'a Endpoint]) -> GatewayResult<&'a Endpoint> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyEndpoint {
                category: self.category.to_string(),
            });
        }
        if candidates.len() == 1 {
            return Ok(candidates[0]);
        }
        let index = self.policy.pick(candidates);
        Ok(candidates[index.min(candidates.len() - 1)])
    }

    /// Name of the active policy
    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}
