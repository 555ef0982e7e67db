use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How aliases for relationship hops are named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AliasStyle {
    /// `group-1`, `student-2`, `t-1` for link tables
    Simple,
    /// Derived from the traversal path: `d-groups-students`
    Path,
}

/// Translator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Maximum number of compiled plans kept in the cache
    pub plan_cache_capacity: u64,
    /// Optional time-to-live of cached plans
    pub plan_cache_ttl: Option<Duration>,
    pub alias_style: AliasStyle,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            plan_cache_capacity: 1000,
            plan_cache_ttl: None,
            alias_style: AliasStyle::Simple,
        }
    }
}

impl TranslatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.plan_cache_ttl = Some(ttl);
        self
    }

    pub fn with_alias_style(mut self, style: AliasStyle) -> Self {
        self.alias_style = style;
        self
    }

    /// Create a config from environment variables
    /// ENTQL_PLAN_CACHE_CAPACITY=1000
    /// ENTQL_PLAN_CACHE_TTL_SECS=300
    /// ENTQL_SIMPLE_ALIASES=true
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let plan_cache_capacity = std::env::var("ENTQL_PLAN_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.plan_cache_capacity);
        let plan_cache_ttl = std::env::var("ENTQL_PLAN_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let simple = std::env::var("ENTQL_SIMPLE_ALIASES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Self {
            plan_cache_capacity,
            plan_cache_ttl,
            alias_style: if simple {
                AliasStyle::Simple
            } else {
                AliasStyle::Path
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = TranslatorConfig::new()
            .with_cache_capacity(10)
            .with_cache_ttl(Duration::from_secs(5))
            .with_alias_style(AliasStyle::Path);
        assert_eq!(config.plan_cache_capacity, 10);
        assert_eq!(config.plan_cache_ttl, Some(Duration::from_secs(5)));
        assert_eq!(config.alias_style, AliasStyle::Path);
    }

    #[test]
    fn test_defaults() {
        let config = TranslatorConfig::default();
        assert_eq!(config.plan_cache_capacity, 1000);
        assert!(config.plan_cache_ttl.is_none());
        assert_eq!(config.alias_style, AliasStyle::Simple);
    }
}
