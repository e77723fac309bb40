//! Gateway Configuration
//!
//! Loads the gateway's routing table, retry schedule, health ladder, and
//! timeouts from a TOML file at `~/.config/llm-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (applied by the daemon after loading)
//! 2. Environment variables (`GATEWAY_LISTEN`, `GATEWAY_UPSTREAM_TIMEOUT_MS`,
//!    `GATEWAY_REQUEST_TIMEOUT_MS`)
//! 3. TOML configuration file
//!
//! Unlike most settings, the retry schedule, backoff ladder, and timeouts
//! have no built-in values. A file that omits them is rejected at startup.
//!
//! # Example Configuration
//!
//! ```toml
//! [retry]
//! schedule_ms = [1000, 5000, 60000]
//!
//! [health]
//! failure_threshold = 1
//! backoff_ladder_ms = [1000, 5000, 60000]
//!
//! [timeouts]
//! upstream_ms = 30000
//! request_ms = 300000
//!
//! [balancer]
//! policy = "round_robin"
//!
//! [[endpoints]]
//! id = "local-llama"
//! provider = "ollama"
//! model = "llama3.2"
//! base_url = "http://localhost:11434"
//!
//! [[rules]]
//! category = "background"
//! model = "haiku|fast"
//!
//! [[rules]]
//! category = "default"
//!
//! [categories]
//! background = ["local-llama"]
//! default = ["local-llama"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::RoutingCategory;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// No config file could be located
    #[error("No config file found (looked for {0})")]
    NotFound(String),

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A required value has no default and was not supplied
    #[error("Missing required configuration value: {0}")]
    MissingValue(&'static str),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Built in code (tests, embedding)
    Programmatic,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Programmatic => write!(f, "programmatic"),
        }
    }
}

// =============================================================================
// Endpoint Model
// =============================================================================

/// Stable identifier of a configured endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Borrow the id text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire protocol an endpoint speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `/chat/completions` with SSE streaming
    OpenaiCompatible,
    /// Local Ollama server, NDJSON streaming
    Ollama,
    /// Bedrock Converse API, binary event-stream frames
    Bedrock,
    /// Gemini `generateContent` REST surface
    Gemini,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::OpenaiCompatible => "openai_compatible",
            Self::Ollama => "ollama",
            Self::Bedrock => "bedrock",
            Self::Gemini => "gemini",
        };
        f.write_str(name)
    }
}

/// Secret used to authenticate against an upstream
///
/// Never printed: `Debug` shows a redacted placeholder.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret for a request header
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// One (provider, model, credential) triple
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier
    pub id: EndpointId,
    /// Protocol kind
    pub provider: ProviderKind,
    /// Upstream model identifier
    pub model: String,
    /// Base URL of the upstream API
    pub base_url: String,
    /// Name of the environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Endpoint {
    /// Create an endpoint without a credential reference
    pub fn new(
        id: impl Into<EndpointId>,
        provider: ProviderKind,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            model: model.into(),
            base_url: base_url.into(),
            api_key_env: None,
        }
    }

    /// Reference a credential by environment variable
    #[must_use]
    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }

    /// Look up the referenced credential
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when `api_key_env` names a
    /// variable that is unset or empty.
    pub fn resolve_credential(&self) -> Result<Option<Credential>, ConfigError> {
        let Some(var) = &self.api_key_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(Credential::new(value))),
            _ => Err(ConfigError::ValidationError(format!(
                "endpoint '{}' references credential variable {var}, which is not set",
                self.id
            ))),
        }
    }
}

// =============================================================================
// Policy Sections
// =============================================================================

/// Rule mapping request attributes to a category
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Category assigned when the rule matches
    pub category: RoutingCategory,
    /// Regex matched against the request's model name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Minimum estimated prompt tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tokens: Option<usize>,
}

impl CategoryRule {
    /// Rule with no conditions
    #[must_use]
    pub fn catch_all(category: RoutingCategory) -> Self {
        Self {
            category,
            model: None,
            min_tokens: None,
        }
    }

    /// Rule matching a model-name regex
    pub fn model(category: RoutingCategory, pattern: impl Into<String>) -> Self {
        Self {
            category,
            model: Some(pattern.into()),
            min_tokens: None,
        }
    }

    /// Whether this rule matches every request
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.model.is_none() && self.min_tokens.is_none()
    }
}

/// Rate-limit retry schedule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before each retry; its length is the number of retries
    pub schedule: Vec<Duration>,
}

/// Endpoint backoff behavior
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive failures before the endpoint starts backing off
    pub failure_threshold: u32,
    /// Backoff window per step past the threshold, last entry repeats
    pub backoff_ladder: Vec<Duration>,
}

/// Deadlines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// First-byte and inter-event silence limit for upstream calls
    pub upstream: Duration,
    /// Whole-request limit enforced by the orchestrator
    pub request: Duration,
}

/// Load-balancer selection strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPolicy {
    /// Rotate through healthy candidates
    #[default]
    RoundRobin,
    /// Pick the candidate that was selected longest ago
    LeastRecentlyUsed,
    /// Seeded pseudo-random choice
    Random,
}

/// Load-balancer section
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalancerConfig {
    /// Strategy
    pub policy: BalancerPolicy,
    /// Seed for [`BalancerPolicy::Random`]
    pub seed: u64,
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub listen: Option<String>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retry delays in milliseconds
    pub schedule_ms: Option<Vec<u64>>,
}

/// `[health]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Consecutive failures before backoff starts
    pub failure_threshold: Option<u32>,
    /// Backoff windows in milliseconds
    pub backoff_ladder_ms: Option<Vec<u64>>,
}

/// `[timeouts]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsToml {
    /// Upstream silence limit in milliseconds
    pub upstream_ms: Option<u64>,
    /// Whole-request limit in milliseconds
    pub request_ms: Option<u64>,
}

/// `[balancer]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerToml {
    /// Strategy name
    pub policy: Option<BalancerPolicy>,
    /// Random seed
    pub seed: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Server section
    pub server: ServerToml,
    /// Retry section
    pub retry: RetryToml,
    /// Health section
    pub health: HealthToml,
    /// Timeouts section
    pub timeouts: TimeoutsToml,
    /// Balancer section
    pub balancer: BalancerToml,
    /// Endpoint list
    pub endpoints: Vec<Endpoint>,
    /// Ordered category rules, first match wins
    pub rules: Vec<CategoryRule>,
    /// Category name to ordered endpoint ids
    pub categories: BTreeMap<String, Vec<EndpointId>>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Default listen address for the HTTP surface
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

/// Validated, read-only gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// HTTP listen address
    pub listen: SocketAddr,
    /// Retry schedule
    pub retry: RetryPolicy,
    /// Health ladder
    pub health: HealthPolicy,
    /// Deadlines
    pub timeouts: Timeouts,
    /// Load-balancer settings
    pub balancer: BalancerConfig,
    /// All endpoints
    pub endpoints: Vec<Endpoint>,
    /// Ordered category rules
    pub rules: Vec<CategoryRule>,
    /// Category to ordered endpoint ids
    pub categories: BTreeMap<RoutingCategory, Vec<EndpointId>>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl GatewayConfig {
    /// Assemble a configuration in code
    ///
    /// The result is not validated; call [`GatewayConfig::validate`].
    #[must_use]
    pub fn new(retry: RetryPolicy, health: HealthPolicy, timeouts: Timeouts) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            retry,
            health,
            timeouts,
            balancer: BalancerConfig::default(),
            endpoints: Vec::new(),
            rules: Vec::new(),
            categories: BTreeMap::new(),
            config_file_path: None,
            source: ConfigSource::Programmatic,
        }
    }

    /// Add an endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Append a category rule
    #[must_use]
    pub fn with_rule(mut self, rule: CategoryRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Map a category to endpoint ids
    #[must_use]
    pub fn with_category(mut self, category: RoutingCategory, ids: &[&str]) -> Self {
        self.categories
            .insert(category, ids.iter().map(|s| EndpointId::from(*s)).collect());
        self
    }

    /// Set the load-balancer policy
    #[must_use]
    pub fn with_balancer(mut self, policy: BalancerPolicy, seed: u64) -> Self {
        self.balancer = BalancerConfig { policy, seed };
        self
    }

    /// Where the effective configuration came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check structural invariants
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.retry.schedule.is_empty() {
            return invalid("retry.schedule_ms must not be empty".into());
        }
        if self.health.failure_threshold == 0 {
            return invalid("health.failure_threshold must be at least 1".into());
        }
        if self.health.backoff_ladder.is_empty() {
            return invalid("health.backoff_ladder_ms must not be empty".into());
        }
        if self.health.backoff_ladder.iter().any(Duration::is_zero) {
            return invalid("health.backoff_ladder_ms entries must be non-zero".into());
        }
        if self.timeouts.upstream.is_zero() || self.timeouts.request.is_zero() {
            return invalid("timeouts must be non-zero".into());
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(&endpoint.id) {
                return invalid(format!("duplicate endpoint id '{}'", endpoint.id));
            }
            if reqwest::Url::parse(&endpoint.base_url).is_err() {
                return invalid(format!(
                    "endpoint '{}' has invalid base_url '{}'",
                    endpoint.id, endpoint.base_url
                ));
            }
        }

        if !self.rules.iter().any(CategoryRule::is_catch_all) {
            return invalid("no catch-all rule (a [[rules]] entry with no conditions)".into());
        }
        for rule in &self.rules {
            if let Some(pattern) = &rule.model {
                if let Err(e) = regex::Regex::new(pattern) {
                    return invalid(format!("rule pattern '{pattern}' does not compile: {e}"));
                }
            }
        }

        for (category, ids) in &self.categories {
            for id in ids {
                if !seen.contains(id) {
                    return invalid(format!(
                        "category '{category}' references unknown endpoint '{id}'"
                    ));
                }
            }
        }

        if let Some(pos) = self.rules.iter().position(CategoryRule::is_catch_all) {
            if pos + 1 < self.rules.len() {
                tracing::warn!(
                    position = pos,
                    "catch-all rule is not last; later rules will never match"
                );
            }
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-gateway/gateway.toml` or
/// `~/.config/llm-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-gateway").join("gateway.toml"))
}

/// Load configuration from the default location
///
/// # Errors
///
/// Returns an error if no config file exists or it fails validation.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load, override from the environment, and validate a configuration file
///
/// # Errors
///
/// Returns an error if the file is missing, unreadable, unparsable, lacks a
/// required value, or fails [`GatewayConfig::validate`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let config_path = path.ok_or_else(|| {
        ConfigError::NotFound("a platform config directory (none available)".into())
    })?;
    if !config_path.exists() {
        return Err(ConfigError::NotFound(config_path.display().to_string()));
    }

    let toml_content =
        std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
            path: config_path.clone(),
            source: e,
        })?;
    let mut config = parse_config(&toml_content)?;
    config.config_file_path = Some(config_path.clone());

    tracing::info!(
        path = %config_path.display(),
        endpoints = config.endpoints.len(),
        "Loaded configuration from file"
    );

    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse TOML text into an unvalidated configuration
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] for malformed TOML and
/// [`ConfigError::MissingValue`] for absent required values.
pub fn parse_config(text: &str) -> Result<GatewayConfig, ConfigError> {
    let toml: GatewayToml = toml::from_str(text)?;
    apply_toml_config(toml)
}

fn millis(values: Vec<u64>) -> Vec<Duration> {
    values.into_iter().map(Duration::from_millis).collect()
}

/// Convert the TOML structure, enforcing required values
fn apply_toml_config(toml: GatewayToml) -> Result<GatewayConfig, ConfigError> {
    let schedule = toml
        .retry
        .schedule_ms
        .ok_or(ConfigError::MissingValue("retry.schedule_ms"))?;
    let failure_threshold = toml
        .health
        .failure_threshold
        .ok_or(ConfigError::MissingValue("health.failure_threshold"))?;
    let ladder = toml
        .health
        .backoff_ladder_ms
        .ok_or(ConfigError::MissingValue("health.backoff_ladder_ms"))?;
    let upstream = toml
        .timeouts
        .upstream_ms
        .ok_or(ConfigError::MissingValue("timeouts.upstream_ms"))?;
    let request = toml
        .timeouts
        .request_ms
        .ok_or(ConfigError::MissingValue("timeouts.request_ms"))?;

    let mut config = GatewayConfig::new(
        RetryPolicy {
            schedule: millis(schedule),
        },
        HealthPolicy {
            failure_threshold,
            backoff_ladder: millis(ladder),
        },
        Timeouts {
            upstream: Duration::from_millis(upstream),
            request: Duration::from_millis(request),
        },
    );

    if let Some(listen) = toml.server.listen {
        config.listen = parse_listen(&listen)?;
    }
    config.balancer = BalancerConfig {
        policy: toml.balancer.policy.unwrap_or_default(),
        seed: toml.balancer.seed.unwrap_or(0),
    };
    config.endpoints = toml.endpoints;
    config.rules = toml.rules;
    for (name, ids) in toml.categories {
        let category: RoutingCategory = name.parse().map_err(ConfigError::ValidationError)?;
        config.categories.insert(category, ids);
    }
    config.source = ConfigSource::File;
    Ok(config)
}

fn parse_listen(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("invalid listen address '{value}': {e}")))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::ValidationError(format!("{key}='{value}' is not a number")))
}

/// Apply environment variable overrides to the config
///
/// `lookup` abstracts the environment so overrides can be tested without
/// touching process state.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] for unparsable override values.
pub fn apply_env_config<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(listen) = lookup("GATEWAY_LISTEN") {
        config.listen = parse_listen(&listen)?;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("GATEWAY_UPSTREAM_TIMEOUT_MS") {
        config.timeouts.upstream = parse_millis("GATEWAY_UPSTREAM_TIMEOUT_MS", &ms)?;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("GATEWAY_REQUEST_TIMEOUT_MS") {
        config.timeouts.request = parse_millis("GATEWAY_REQUEST_TIMEOUT_MS", &ms)?;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
listen = "0.0.0.0:9000"

[retry]
schedule_ms = [1000, 5000, 60000]

[health]
failure_threshold = 2
backoff_ladder_ms = [1000, 5000]

[timeouts]
upstream_ms = 30000
request_ms = 120000

[balancer]
policy = "least_recently_used"

[[endpoints]]
id = "local"
provider = "ollama"
model = "llama3.2"
base_url = "http://localhost:11434"

[[endpoints]]
id = "cloud"
provider = "openai_compatible"
model = "gpt-4o-mini"
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"

[[rules]]
category = "background"
model = "haiku"

[[rules]]
category = "long_context"
min_tokens = 60000

[[rules]]
category = "default"

[categories]
background = ["local"]
long_context = ["cloud"]
default = ["local", "cloud"]
"#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(
            config.retry.schedule,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(60)
            ]
        );
        assert_eq!(config.health.failure_threshold, 2);
        assert_eq!(config.balancer.policy, BalancerPolicy::LeastRecentlyUsed);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1].provider, ProviderKind::OpenaiCompatible);
        assert_eq!(config.rules.len(), 3);
        assert_eq!(
            config.categories[&RoutingCategory::Default],
            vec![EndpointId::from("local"), EndpointId::from("cloud")]
        );
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_missing_retry_schedule_is_an_error() {
        let text = SAMPLE.replace("schedule_ms = [1000, 5000, 60000]", "");
        let err = parse_config(&text).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue("retry.schedule_ms")));
    }

    #[test]
    fn test_missing_timeouts_is_an_error() {
        let text = SAMPLE.replace("request_ms = 120000", "");
        assert!(matches!(
            parse_config(&text),
            Err(ConfigError::MissingValue("timeouts.request_ms"))
        ));
    }

    #[test]
    fn test_validate_requires_catch_all() {
        let text = SAMPLE.replace("[[rules]]\ncategory = \"default\"\n", "");
        let config = parse_config(&text).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("catch-all"));
    }

    #[test]
    fn test_validate_rejects_unknown_endpoint_reference() {
        let text = SAMPLE.replace("background = [\"local\"]", "background = [\"nope\"]");
        let err = parse_config(&text).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("unknown endpoint 'nope'"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let text = SAMPLE.replace("model = \"haiku\"", "model = \"(unclosed\"");
        let err = parse_config(&text).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("does not compile"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse_config(SAMPLE).unwrap();
        apply_env_config(&mut config, |key| match key {
            "GATEWAY_UPSTREAM_TIMEOUT_MS" => Some("2500".to_string()),
            "GATEWAY_LISTEN" => Some("127.0.0.1:1234".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.timeouts.upstream, Duration::from_millis(2500));
        assert_eq!(config.timeouts.request, Duration::from_secs(120));
        assert_eq!(config.listen.port(), 1234);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = parse_config(SAMPLE).unwrap();
        let result = apply_env_config(&mut config, |key| {
            (key == "GATEWAY_REQUEST_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config_from_path(Some(path.clone())).unwrap();
        assert_eq!(config.config_file_path, Some(path));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config_from_path(Some(dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("sk-secret");
        assert_eq!(format!("{cred:?}"), "Credential(***)");
        assert_eq!(cred.expose(), "sk-secret");
    }

    #[test]
    fn test_unset_credential_env_is_an_error() {
        let endpoint = Endpoint::new("x", ProviderKind::Gemini, "m", "http://h")
            .with_api_key_env("GATEWAY_TEST_SURELY_UNSET_VAR");
        assert!(endpoint.resolve_credential().is_err());
    }
}
