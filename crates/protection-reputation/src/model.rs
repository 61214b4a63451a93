//! Reputation domain types.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Coarse-grained access tier derived from a client's overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationLevel {
    Trusted,
    Normal,
    Suspicious,
    Restricted,
    Blocked,
}

impl ReputationLevel {
    /// Classifies an overall score in `[0, 100]` into a level.
    pub fn from_score(score: i32) -> Self {
        match score {
            90..=100 => ReputationLevel::Trusted,
            70..=89 => ReputationLevel::Normal,
            50..=69 => ReputationLevel::Suspicious,
            30..=49 => ReputationLevel::Restricted,
            _ => ReputationLevel::Blocked,
        }
    }
}

/// Short-term direction of a client's reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Declining,
    Volatile,
    Stable,
}

/// Severity of a recorded policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Raw score penalty before diminishing returns, per `spec.md` §4.7.
    pub fn penalty(self) -> f64 {
        match self {
            Severity::Low => -5.0,
            Severity::Medium => -15.0,
            Severity::High => -30.0,
            Severity::Critical => -50.0,
        }
    }
}

/// A single recorded policy violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    pub timestamp_unix: i64,
    pub session_id: String,
}

/// A kind of event that moves a client's reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationEventType {
    Violation,
    Compliance,
    Efficiency,
    GoodBehavior,
    Error,
}

/// A single reputation-affecting event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub event_type: ReputationEventType,
    pub impact: f64,
    pub description: String,
    pub timestamp_unix: i64,
    pub severity: Option<Severity>,
    pub violation_type: Option<String>,
    pub session_id: Option<String>,
}

impl ReputationEvent {
    pub fn violation(description: impl Into<String>, severity: Severity, session_id: impl Into<String>, violation_type: impl Into<String>) -> Self {
        Self {
            event_type: ReputationEventType::Violation,
            impact: severity.penalty(),
            description: description.into(),
            timestamp_unix: now_unix(),
            severity: Some(severity),
            violation_type: Some(violation_type.into()),
            session_id: Some(session_id.into()),
        }
    }

    pub fn positive(event_type: ReputationEventType, description: impl Into<String>) -> Self {
        Self {
            event_type,
            impact: 0.0,
            description: description.into(),
            timestamp_unix: now_unix(),
            severity: None,
            violation_type: None,
            session_id: None,
        }
    }
}

/// A client's complete reputation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationScore {
    pub client_id: String,
    pub overall_score: i32,
    pub compliance_score: f64,
    pub efficiency_score: f64,
    pub stability_score: f64,
    pub reliability_score: f64,
    pub reputation_trend: Trend,
    pub first_scored_unix: i64,
    pub last_updated_unix: i64,
    pub last_violation_unix: Option<i64>,
    pub last_positive_event_unix: Option<i64>,
    pub historical_violations: Vec<Violation>,
    pub reputation_events: Vec<ReputationEvent>,
}

/// Caps on per-client history kept in a [`ReputationScore`], so a very
/// active client's record doesn't grow without bound.
pub const MAX_RETAINED_EVENTS: usize = 50;
pub const MAX_RETAINED_VIOLATIONS: usize = 50;

impl ReputationScore {
    /// Creates a fresh, neutral-good reputation for a client seen for the
    /// first time.
    pub fn new(client_id: impl Into<String>) -> Self {
        let now = now_unix();
        Self {
            client_id: client_id.into(),
            overall_score: 75,
            compliance_score: 75.0,
            efficiency_score: 75.0,
            stability_score: 75.0,
            reliability_score: 75.0,
            reputation_trend: Trend::Stable,
            first_scored_unix: now,
            last_updated_unix: now,
            last_violation_unix: None,
            last_positive_event_unix: None,
            historical_violations: Vec::new(),
            reputation_events: Vec::new(),
        }
    }

    pub fn reputation_level(&self) -> ReputationLevel {
        ReputationLevel::from_score(self.overall_score)
    }
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

/// Rate multiplier, queue priority, and restrictions attached to one
/// reputation level.
#[derive(Debug, Clone)]
pub struct AccessLevel {
    pub level: ReputationLevel,
    pub rate_multiplier: f64,
    pub priority: u8,
    pub restrictions: Vec<&'static str>,
}

/// Returns the static access-level configuration for `level`.
pub fn access_level_for(level: ReputationLevel) -> AccessLevel {
    match level {
        ReputationLevel::Trusted => AccessLevel { level, rate_multiplier: 1.5, priority: 5, restrictions: vec![] },
        ReputationLevel::Normal => AccessLevel { level, rate_multiplier: 1.0, priority: 3, restrictions: vec![] },
        ReputationLevel::Suspicious => AccessLevel {
            level,
            rate_multiplier: 0.7,
            priority: 2,
            restrictions: vec!["enhanced_monitoring"],
        },
        ReputationLevel::Restricted => AccessLevel {
            level,
            rate_multiplier: 0.3,
            priority: 1,
            restrictions: vec!["enhanced_monitoring", "limited_endpoints"],
        },
        ReputationLevel::Blocked => AccessLevel {
            level,
            rate_multiplier: 0.0,
            priority: 0,
            restrictions: vec!["access_denied"],
        },
    }
}

/// A milestone on the way back to a healthier reputation.
#[derive(Debug, Clone, Serialize)]
pub struct Milestone {
    pub score: i32,
    pub estimated_days: i64,
    pub description: String,
}

/// A plan for a client to climb back out of a degraded reputation level.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPlan {
    pub current_score: i32,
    pub target_score: i32,
    pub estimated_days: i64,
    pub required_actions: Vec<String>,
    pub milestones: Vec<Milestone>,
}
