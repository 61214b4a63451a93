//! Process-wide, immutable-after-load configuration.
//!
//! [`ProtectionSettings`] is built once at startup from environment
//! variables (`spec.md` §6) and handed by reference to every component.
//! Unlike the per-pattern `*ConfigBuilder`s used elsewhere in this
//! workspace, settings here are not meant to be constructed fluently by
//! call sites — they come from the process environment, with documented
//! defaults, and are validated once before the coordinator starts serving
//! traffic.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// What to do when a backing dependency (Redis, persistence store) is
/// unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationPolicy {
    /// Admit the request and degrade to in-memory/local behavior.
    FailOpen,
    /// Reject the request with a 503-class error.
    FailClosed,
}

/// Named rate limit bucket configuration (`requests:window_seconds`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitBucketConfig {
    /// Maximum number of requests allowed within the window.
    pub requests: u64,
    /// Sliding window length.
    pub window: Duration,
    /// Whether this bucket is active.
    pub enabled: bool,
}

impl RateLimitBucketConfig {
    fn new(requests: u64, window_secs: u64) -> Self {
        Self {
            requests,
            window: Duration::from_secs(window_secs),
            enabled: true,
        }
    }

    /// Parses a `requests:window_seconds` formatted string.
    pub fn parse(value: &str) -> Option<Self> {
        let (req, win) = value.split_once(':')?;
        let requests: u64 = req.trim().parse().ok()?;
        let window: u64 = win.trim().parse().ok()?;
        Some(Self::new(requests, window))
    }
}

/// Rate limit settings for all named buckets.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Per-bucket configuration, keyed by limit type name.
    pub buckets: HashMap<String, RateLimitBucketConfig>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert("global".to_string(), RateLimitBucketConfig::new(1000, 60));
        buckets.insert("per_session".to_string(), RateLimitBucketConfig::new(10, 60));
        buckets.insert(
            "per_session_hourly".to_string(),
            RateLimitBucketConfig::new(100, 3600),
        );
        buckets.insert(
            "title_generation".to_string(),
            RateLimitBucketConfig::new(1, 300),
        );
        Self { buckets }
    }
}

/// Deduplication settings.
#[derive(Debug, Clone)]
pub struct DedupSettings {
    /// Default TTL for a dedup entry.
    pub default_ttl: Duration,
    /// TTL for agent-query endpoints.
    pub agent_query_ttl: Duration,
    /// TTL for title-generation endpoints.
    pub title_generation_ttl: Duration,
    /// Whether deduplication is active at all.
    pub enabled: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            agent_query_ttl: Duration::from_secs(60),
            title_generation_ttl: Duration::from_secs(300),
            enabled: true,
        }
    }
}

/// Hierarchical timeout settings.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSettings {
    /// Total time budget for a whole agent run.
    pub agent_total: Duration,
    /// Time budget per processing phase.
    pub agent_phase: Duration,
    /// Time budget per individual LLM call.
    pub llm_call: Duration,
    /// Absolute emergency cap; anything beyond this is force-cancelled.
    pub emergency_shutdown: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            agent_total: Duration::from_secs(300),
            agent_phase: Duration::from_secs(120),
            llm_call: Duration::from_secs(30),
            emergency_shutdown: Duration::from_secs(600),
        }
    }
}

impl TimeoutSettings {
    /// Validates the total ≥ phase ≥ LLM inequality required by `spec.md` §4.4.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent_total < self.agent_phase {
            return Err(format!(
                "agent_total ({:?}) must be >= agent_phase ({:?})",
                self.agent_total, self.agent_phase
            ));
        }
        if self.agent_phase < self.llm_call {
            return Err(format!(
                "agent_phase ({:?}) must be >= llm_call ({:?})",
                self.agent_phase, self.llm_call
            ));
        }
        if self.emergency_shutdown < self.agent_total {
            return Err(format!(
                "emergency_shutdown ({:?}) must be >= agent_total ({:?})",
                self.emergency_shutdown, self.agent_total
            ));
        }
        Ok(())
    }
}

/// Toggles for the "intelligent" layers (§6).
#[derive(Debug, Clone, Copy)]
pub struct IntelligentLayerToggles {
    /// Enable the behavioral analyzer (C5).
    pub behavioral_analysis: bool,
    /// Enable the ML anomaly detector (C6).
    pub ml_anomaly_detection: bool,
    /// Enable the reputation engine (C7).
    pub reputation_system: bool,
    /// Enable adaptive/smart circuit breakers (C8).
    pub smart_circuit_breakers: bool,
}

impl Default for IntelligentLayerToggles {
    fn default() -> Self {
        Self {
            behavioral_analysis: true,
            ml_anomaly_detection: true,
            reputation_system: true,
            smart_circuit_breakers: true,
        }
    }
}

/// Process-wide protection settings, built once at startup.
#[derive(Debug, Clone)]
pub struct ProtectionSettings {
    /// Master kill switch; when `false` the coordinator admits everything.
    pub enabled: bool,
    /// Degradation policy applied uniformly across all components.
    pub degradation_policy: DegradationPolicy,
    /// Header names that bypass protection entirely (e.g. internal health probes).
    pub bypass_headers: Vec<String>,
    /// Redis connection string, if configured.
    pub redis_url: Option<String>,
    /// Prefix applied to all Redis keys written by this process.
    pub redis_key_prefix: String,
    /// Rate limiter settings.
    pub rate_limits: RateLimitSettings,
    /// Deduplication settings.
    pub dedup: DedupSettings,
    /// Timeout hierarchy settings.
    pub timeouts: TimeoutSettings,
    /// Intelligent-layer toggles.
    pub toggles: IntelligentLayerToggles,
    /// Directory used to persist anomaly-detector models between restarts.
    pub ml_model_path: Option<String>,
    /// How often the monitoring background loop runs.
    pub monitoring_interval: Duration,
    /// How often the cleanup background loop runs.
    pub cleanup_interval: Duration,
}

impl Default for ProtectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            degradation_policy: DegradationPolicy::FailOpen,
            bypass_headers: Vec::new(),
            redis_url: None,
            redis_key_prefix: "fm:protect".to_string(),
            rate_limits: RateLimitSettings::default(),
            dedup: DedupSettings::default(),
            timeouts: TimeoutSettings::default(),
            toggles: IntelligentLayerToggles::default(),
            ml_model_path: None,
            monitoring_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl ProtectionSettings {
    /// Loads settings from environment variables, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self, String> {
        let mut settings = Self::default();

        if let Ok(v) = env::var("PROTECTION_ENABLED") {
            settings.enabled = parse_bool(&v).unwrap_or(settings.enabled);
        }

        if let Ok(v) = env::var("PROTECTION_FAIL_OPEN") {
            settings.degradation_policy = match parse_bool(&v) {
                Some(true) => DegradationPolicy::FailOpen,
                Some(false) => DegradationPolicy::FailClosed,
                None => settings.degradation_policy,
            };
        }

        if let Ok(v) = env::var("PROTECTION_BYPASS_HEADERS") {
            settings.bypass_headers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(v) = env::var("REDIS_URL") {
            settings.redis_url = Some(v);
        }
        if let Ok(v) = env::var("REDIS_KEY_PREFIX") {
            settings.redis_key_prefix = v;
        }

        for (env_key, bucket_key) in [
            ("RATE_LIMIT_GLOBAL", "global"),
            ("RATE_LIMIT_PER_SESSION", "per_session"),
            ("RATE_LIMIT_PER_SESSION_HOURLY", "per_session_hourly"),
            ("RATE_LIMIT_TITLE_GENERATION", "title_generation"),
        ] {
            if let Ok(v) = env::var(env_key) {
                match RateLimitBucketConfig::parse(&v) {
                    Some(cfg) => {
                        settings.rate_limits.buckets.insert(bucket_key.to_string(), cfg);
                    }
                    None => {
                        return Err(format!("invalid {env_key} value: {v:?} (expected requests:window_seconds)"));
                    }
                }
            }
        }

        if let Ok(v) = env::var("DEDUP_DEFAULT_TTL") {
            settings.dedup.default_ttl = parse_secs(&v, "DEDUP_DEFAULT_TTL")?;
        }
        if let Ok(v) = env::var("DEDUP_AGENT_QUERY_TTL") {
            settings.dedup.agent_query_ttl = parse_secs(&v, "DEDUP_AGENT_QUERY_TTL")?;
        }

        if let Ok(v) = env::var("TIMEOUT_AGENT_TOTAL") {
            settings.timeouts.agent_total = parse_secs(&v, "TIMEOUT_AGENT_TOTAL")?;
        }
        if let Ok(v) = env::var("TIMEOUT_AGENT_PHASE") {
            settings.timeouts.agent_phase = parse_secs(&v, "TIMEOUT_AGENT_PHASE")?;
        }
        if let Ok(v) = env::var("TIMEOUT_LLM_CALL") {
            settings.timeouts.llm_call = parse_secs(&v, "TIMEOUT_LLM_CALL")?;
        }
        if let Ok(v) = env::var("TIMEOUT_EMERGENCY_SHUTDOWN") {
            settings.timeouts.emergency_shutdown = parse_secs(&v, "TIMEOUT_EMERGENCY_SHUTDOWN")?;
        }
        settings.timeouts.validate()?;

        if let Ok(v) = env::var("BEHAVIORAL_ANALYSIS_ENABLED") {
            settings.toggles.behavioral_analysis =
                parse_bool(&v).unwrap_or(settings.toggles.behavioral_analysis);
        }
        if let Ok(v) = env::var("ML_ANOMALY_DETECTION_ENABLED") {
            settings.toggles.ml_anomaly_detection =
                parse_bool(&v).unwrap_or(settings.toggles.ml_anomaly_detection);
        }
        if let Ok(v) = env::var("REPUTATION_SYSTEM_ENABLED") {
            settings.toggles.reputation_system =
                parse_bool(&v).unwrap_or(settings.toggles.reputation_system);
        }
        if let Ok(v) = env::var("SMART_CIRCUIT_BREAKERS_ENABLED") {
            settings.toggles.smart_circuit_breakers =
                parse_bool(&v).unwrap_or(settings.toggles.smart_circuit_breakers);
        }

        if let Ok(v) = env::var("ML_MODEL_PATH") {
            settings.ml_model_path = Some(v);
        }

        Ok(settings)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_secs(v: &str, field: &str) -> Result<Duration, String> {
    v.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("invalid {field} value: {v:?} (expected integer seconds)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_timeout_inequality() {
        ProtectionSettings::default().timeouts.validate().unwrap();
    }

    #[test]
    fn bucket_parsing() {
        let cfg = RateLimitBucketConfig::parse("10:60").unwrap();
        assert_eq!(cfg.requests, 10);
        assert_eq!(cfg.window, Duration::from_secs(60));
        assert!(RateLimitBucketConfig::parse("garbage").is_none());
    }

    #[test]
    fn rejects_inverted_timeout_hierarchy() {
        let mut settings = TimeoutSettings::default();
        settings.agent_phase = Duration::from_secs(1000);
        assert!(settings.validate().is_err());
    }
}
