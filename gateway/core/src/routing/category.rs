//! Request Classification
//!
//! Maps a [`CanonicalRequest`] to a [`RoutingCategory`] by walking the
//! configured rules in order. The first rule whose conditions all hold wins.

use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CategoryRule, ConfigError};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::CanonicalRequest;

/// Named class of request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingCategory {
    /// Anything not matched by a more specific rule
    Default,
    /// Cheap, latency-tolerant work (titles, summaries)
    Background,
    /// Extended reasoning
    Think,
    /// Prompts beyond a token threshold
    LongContext,
    /// Requests that need a search-capable model
    WebSearch,
}

impl RoutingCategory {
    /// All categories, in declaration order
    pub const ALL: [Self; 5] = [
        Self::Default,
        Self::Background,
        Self::Think,
        Self::LongContext,
        Self::WebSearch,
    ];

    /// Config / header name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Background => "background",
            Self::Think => "think",
            Self::LongContext => "long_context",
            Self::WebSearch => "web_search",
        }
    }
}

impl std::fmt::Display for RoutingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown routing category '{s}'"))
    }
}

/// A rule with its pattern compiled
#[derive(Debug)]
struct CompiledRule {
    category: RoutingCategory,
    model: Option<Regex>,
    min_tokens: Option<usize>,
}

impl CompiledRule {
    fn matches(&self, model: &str, tokens: usize) -> bool {
        self.model.as_ref().map_or(true, |re| re.is_match(model))
            && self.min_tokens.map_or(true, |min| tokens >= min)
    }
}

/// Ordered, compiled category rules
#[derive(Debug)]
pub struct CategoryClassifier {
    rules: Vec<CompiledRule>,
}

impl CategoryClassifier {
    /// Compile the configured rules
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if a pattern does not compile
    /// or no catch-all rule exists.
    pub fn new(rules: &[CategoryRule]) -> Result<Self, ConfigError> {
        if !rules.iter().any(CategoryRule::is_catch_all) {
            return Err(ConfigError::ValidationError(
                "no catch-all routing rule configured".into(),
            ));
        }
        let rules = rules
            .iter()
            .map(|rule| {
                let model = rule
                    .model
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
                Ok(CompiledRule {
                    category: rule.category,
                    model,
                    min_tokens: rule.min_tokens,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    /// Category of `request`
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Routing`] if no rule matches, which only
    /// happens when the rule set was built without validation.
    pub fn classify(&self, request: &CanonicalRequest) -> GatewayResult<RoutingCategory> {
        let tokens = request.estimated_tokens();
        self.rules
            .iter()
            .find(|rule| rule.matches(&request.model, tokens))
            .map(|rule| rule.category)
            .ok_or_else(|| {
                GatewayError::Routing(format!(
                    "no rule matched model '{}' ({tokens} estimated tokens)",
                    request.model
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> CategoryClassifier {
        CategoryClassifier::new(&[
            CategoryRule::model(RoutingCategory::Background, "haiku|^fast-"),
            CategoryRule::model(RoutingCategory::Think, "thinking"),
            CategoryRule {
                category: RoutingCategory::LongContext,
                model: None,
                min_tokens: Some(1000),
            },
            CategoryRule::catch_all(RoutingCategory::Default),
        ])
        .unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let c = classifier();
        let req = CanonicalRequest::new("fast-model", "x".repeat(8000), 16);
        // Matches both background and long_context; background comes first
        assert_eq!(c.classify(&req).unwrap(), RoutingCategory::Background);
    }

    #[test]
    fn test_token_threshold() {
        let c = classifier();
        let short = CanonicalRequest::new("sonnet", "hello", 16);
        let long = CanonicalRequest::new("sonnet", "x".repeat(4000), 16);
        assert_eq!(c.classify(&short).unwrap(), RoutingCategory::Default);
        assert_eq!(c.classify(&long).unwrap(), RoutingCategory::LongContext);
    }

    #[test]
    fn test_missing_catch_all_rejected() {
        let err = CategoryClassifier::new(&[CategoryRule::model(RoutingCategory::Think, "x")])
            .unwrap_err();
        assert!(err.to_string().contains("catch-all"));
    }

    #[test]
    fn test_parse_category_names() {
        assert_eq!(
            "long_context".parse::<RoutingCategory>().unwrap(),
            RoutingCategory::LongContext
        );
        assert!("bulk".parse::<RoutingCategory>().is_err());
    }
}
