//! Per-endpoint deduplication configuration.

use std::time::Duration;

/// Deduplication policy for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDedupConfig {
    /// TTL the fingerprint key is held for.
    pub ttl: Duration,
    /// Whether a successful response is cached and replayed verbatim to
    /// the duplicate caller.
    pub cache_responses: bool,
}

impl EndpointDedupConfig {
    /// Creates a config with response caching disabled.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache_responses: false,
        }
    }

    /// Enables response caching on this config.
    pub fn with_response_caching(mut self) -> Self {
        self.cache_responses = true;
        self
    }
}

/// Maps endpoint paths to their deduplication policy, with a default for
/// unlisted endpoints.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    default: EndpointDedupConfig,
    overrides: Vec<(String, EndpointDedupConfig)>,
}

impl DedupConfig {
    /// Creates a config with the given default policy and no overrides.
    pub fn new(default: EndpointDedupConfig) -> Self {
        Self {
            default,
            overrides: Vec::new(),
        }
    }

    /// Registers a per-endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, config: EndpointDedupConfig) -> Self {
        self.overrides.push((endpoint.into(), config));
        self
    }

    /// Resolves the policy for `endpoint`, falling back to the default.
    pub fn for_endpoint(&self, endpoint: &str) -> EndpointDedupConfig {
        self.overrides
            .iter()
            .find(|(path, _)| path == endpoint)
            .map(|(_, cfg)| *cfg)
            .unwrap_or(self.default)
    }
}

/// Returns `true` when `endpoint`/`method`/`content_type` should bypass
/// deduplication entirely: GET requests, health/metrics/static paths, and
/// multipart uploads are independent or idempotent by construction.
pub fn should_skip(method: &str, endpoint: &str, content_type: &str) -> bool {
    if method.eq_ignore_ascii_case("GET") {
        return true;
    }
    if endpoint.starts_with("/health") || endpoint.starts_with("/metrics") || endpoint.starts_with("/static") {
        return true;
    }
    if content_type.contains("multipart/form-data") {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_override_then_default() {
        let config = DedupConfig::new(EndpointDedupConfig::new(Duration::from_secs(300)))
            .with_endpoint("/api/v1/agent/query", EndpointDedupConfig::new(Duration::from_secs(60)));

        assert_eq!(config.for_endpoint("/api/v1/agent/query").ttl, Duration::from_secs(60));
        assert_eq!(config.for_endpoint("/api/v1/other").ttl, Duration::from_secs(300));
    }

    #[test]
    fn skip_rules() {
        assert!(should_skip("GET", "/api/v1/agent/query", "application/json"));
        assert!(should_skip("POST", "/health/protection", "application/json"));
        assert!(should_skip("POST", "/api/v1/data/upload", "multipart/form-data; boundary=x"));
        assert!(!should_skip("POST", "/api/v1/agent/query", "application/json"));
    }
}
