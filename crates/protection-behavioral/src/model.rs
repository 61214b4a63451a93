//! Behavioral domain types.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A single request as observed by the analyzer.
#[derive(Debug, Clone)]
pub struct RequestObservation {
    pub endpoint: String,
    pub method: String,
    pub response_time_ms: f64,
    pub status_code: u16,
    pub payload_size: u64,
}

impl RequestObservation {
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Coarse risk assessment derived from a [`BehaviorScore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The dimension a sub-score was computed along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BehaviorType {
    RequestPattern,
    TimingPattern,
    ErrorPattern,
    ResourcePattern,
}

/// Kind of temporal anomaly surfaced alongside a behavior score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalAnomalyKind {
    Frequency,
    Timing,
    Pattern,
    Sequence,
}

/// Direction an error pattern's rate is trending. The original analyzer
/// never recomputes this after creation; neither do we.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Stable,
    Declining,
    Volatile,
}

/// Per-(endpoint, method) request statistics, updated by exponential moving
/// average with `alpha = 0.1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPattern {
    pub endpoint: String,
    pub method: String,
    pub avg_response_time_ms: f64,
    pub error_rate: f64,
    pub payload_size_avg: u64,
    pub last_updated_unix: i64,
}

/// A client's inter-request timing characteristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingProfile {
    pub avg_request_interval_secs: f64,
    pub interval_stddev: f64,
    pub peak_activity_hours: Vec<u8>,
    pub burst_frequency: f64,
}

/// Errors grouped by `HTTP_{status}` code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub error_type: String,
    pub frequency: u64,
    pub endpoints_affected: Vec<String>,
    pub first_occurrence_unix: i64,
    pub last_occurrence_unix: i64,
    pub error_rate_trend: Trend,
}

/// One of the bounded sequence of recent feature vectors kept per session,
/// consumed by `protection-anomaly`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorVector {
    pub features: HashMap<String, f64>,
    pub feature_names: Vec<String>,
    pub extraction_timestamp_unix: i64,
    pub window_size: u32,
    pub confidence: f64,
}

/// The seven named features extracted per interaction, in the fixed order
/// `protection-anomaly` expects.
pub const FEATURE_NAMES: [&str; 7] = [
    "response_time",
    "payload_size",
    "avg_interval",
    "interval_stddev",
    "request_frequency",
    "error_rate",
    "endpoint_diversity",
];

/// A time-bounded behavioral anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalAnomaly {
    pub kind: TemporalAnomalyKind,
    pub timestamp_unix: i64,
    pub severity: f64,
    pub duration_secs: f64,
    pub affected_patterns: Vec<String>,
    pub description: String,
}

/// Comprehensive behavior profile for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub session_id: String,
    pub request_patterns: Vec<RequestPattern>,
    pub timing_characteristics: Option<TimingProfile>,
    pub endpoint_preferences: HashMap<String, f64>,
    pub error_patterns: Vec<ErrorPattern>,
    pub behavior_vectors: Vec<BehaviorVector>,
    pub first_seen_unix: i64,
    pub last_updated_unix: i64,
    pub total_requests: u64,
    pub confidence_score: f64,
    pub current_risk_level: RiskLevel,
}

/// Caps applied to [`BehaviorProfile::behavior_vectors`]: once the sequence
/// passes `MAX_BEHAVIOR_VECTORS`, it's trimmed down to the most recent
/// `RETAINED_BEHAVIOR_VECTORS`.
pub const MAX_BEHAVIOR_VECTORS: usize = 100;
pub const RETAINED_BEHAVIOR_VECTORS: usize = 50;

impl BehaviorProfile {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = now_unix();
        Self {
            session_id: session_id.into(),
            request_patterns: Vec::new(),
            timing_characteristics: None,
            endpoint_preferences: HashMap::new(),
            error_patterns: Vec::new(),
            behavior_vectors: Vec::new(),
            first_seen_unix: now,
            last_updated_unix: now,
            total_requests: 0,
            confidence_score: 0.0,
            current_risk_level: RiskLevel::Low,
        }
    }
}

/// Result of scoring one session's current behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorScore {
    pub session_id: String,
    pub overall_behavior_score: f64,
    pub pattern_scores: HashMap<BehaviorType, f64>,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub risk_factors: Vec<String>,
    pub positive_indicators: Vec<String>,
    pub timestamp_unix: i64,
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}
