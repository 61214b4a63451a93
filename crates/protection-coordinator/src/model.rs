//! Orchestration-level domain types.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use protection_behavioral::RiskLevel;

/// A single incoming request's identity and shape, as seen by the
/// coordinator. Deliberately framework-agnostic: callers (an HTTP
/// middleware, a test, a CLI harness) construct this from whatever
/// request type they have.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub endpoint: String,
    pub method: String,
    pub payload_size: usize,
    pub body: Option<Vec<u8>>,
    pub query_params: Vec<(String, serde_json::Value)>,
    pub headers: Vec<(String, String)>,
    pub client_ip: String,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn bypasses(&self, bypass_headers: &[String]) -> bool {
        bypass_headers.iter().any(|name| {
            self.headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(name))
        })
    }
}

/// The result of a completed request, reported back to the coordinator so
/// it can feed the behavioral/anomaly/reputation/circuit-breaker loops.
#[derive(Debug, Clone, Copy)]
pub struct ResponseOutcome {
    pub status_code: u16,
    pub duration: Duration,
}

impl ResponseOutcome {
    pub fn is_server_error(&self) -> bool {
        self.status_code >= 500
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    pub fn is_fast_success(&self) -> bool {
        self.status_code == 200 && self.duration < Duration::from_millis(500)
    }
}

/// An admission decision for one request, per `spec.md` §4.9.
#[derive(Debug, Clone)]
pub struct ProtectionDecision {
    pub decision_id: String,
    pub session_id: String,
    pub allowed: bool,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub applied_restrictions: Vec<String>,
    pub reason: Option<String>,
    /// Fingerprint computed by the deduplicator, carried through so a
    /// caller can store the response body under it on success.
    pub dedup_fingerprint: Option<String>,
}

impl ProtectionDecision {
    pub fn allow(session_id: impl Into<String>, risk_level: RiskLevel, confidence: f64) -> Self {
        Self {
            decision_id: new_decision_id(),
            session_id: session_id.into(),
            allowed: true,
            risk_level,
            confidence,
            applied_restrictions: Vec::new(),
            reason: None,
            dedup_fingerprint: None,
        }
    }
}

/// The JSON body returned to a denied caller, per `spec.md` §6.
#[derive(Debug, Clone, Serialize)]
pub struct DenialResponse {
    pub error_type: String,
    pub message: String,
    pub error_code: &'static str,
    pub correlation_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub suggestions: Vec<String>,
}

impl DenialResponse {
    pub fn from_error(error: &protection_core::ProtectionError, correlation_id: impl Into<String>) -> Self {
        Self {
            error_type: format!("{:?}", error.denial_class()),
            message: error.to_string(),
            error_code: error.error_code(),
            correlation_id: correlation_id.into(),
            timestamp: now_unix(),
            retry_after: error.retry_after().map(|d| d.as_secs()),
            suggestions: suggestions_for(error),
        }
    }

    /// Status code this denial should be surfaced with.
    pub fn status_code(&self, error: &protection_core::ProtectionError) -> u16 {
        error.denial_class().http_status()
    }
}

fn suggestions_for(error: &protection_core::ProtectionError) -> Vec<String> {
    use protection_core::ProtectionError::*;
    match error {
        RateLimitExceeded { .. } => vec!["Reduce request frequency".to_string(), "Retry after the indicated delay".to_string()],
        DuplicateRequest { .. } => vec!["Wait for the original request to complete".to_string()],
        OperationTimeout { .. } => vec!["Retry with a smaller request".to_string()],
        CircuitOpen { .. } | CircuitThrottled { .. } => vec!["The backend is recovering, retry shortly".to_string()],
        ReputationBlocked { .. } => vec!["Contact support if you believe this is an error".to_string()],
        DependencyUnavailable { .. } => vec!["Retry shortly".to_string()],
        InternalError { .. } => vec![],
    }
}

/// Point-in-time component health, surfaced on `/health/protection`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub enabled: bool,
    pub degraded: bool,
    pub behavioral_sessions: usize,
    pub anomaly_trained: bool,
    pub timeout_emergency: bool,
    pub circuit_states: HashMap<String, String>,
}

/// Aggregated counters, surfaced on `/health/protection/metrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests_evaluated: u64,
    pub requests_denied: u64,
    /// Requests admitted fail-open after an [`ProtectionError::InternalError`]
    /// in the pipeline, per `spec.md` §7. A nonzero, climbing value here is a
    /// bug signal, not normal traffic.
    ///
    /// [`ProtectionError::InternalError`]: protection_core::ProtectionError::InternalError
    pub requests_admitted_after_internal_error: u64,
    pub denials_by_code: HashMap<&'static str, u64>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

fn new_decision_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("decision-{}-{n}", now_unix())
}
