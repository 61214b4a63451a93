//! Persistent, multi-factor client reputation scoring.
//!
//! [`ReputationEngine`] maintains a 0-100 score per client, split across
//! four weighted components (compliance, efficiency, stability,
//! reliability). Violations push the score down with diminishing returns
//! for repeat offenders; good behavior pushes it back up, also with
//! diminishing returns so a client can't farm trivial "compliance" events
//! to buy back a score cheaply. A client that goes quiet recovers slowly
//! through temporal decay even without positive events. Reads are served
//! from a 15-minute in-process cache in front of a
//! [`protection_core::PersistenceStore`], so a hot client doesn't
//! round-trip storage on every request.
//!
//! # Example
//!
//! ```
//! use protection_core::{DegradationPolicy, InMemoryStore};
//! use protection_reputation::ReputationEngine;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let engine = ReputationEngine::new(Arc::new(InMemoryStore::new()), DegradationPolicy::FailOpen);
//! let score = engine.calculate_reputation("client_abc").await.unwrap();
//! assert_eq!(score.overall_score, 75);
//! # }
//! ```

mod model;

pub use model::{
    access_level_for, AccessLevel, Milestone, RecoveryPlan, ReputationEvent, ReputationEventType,
    ReputationLevel, ReputationScore, Severity, Trend, Violation, MAX_RETAINED_EVENTS,
    MAX_RETAINED_VIOLATIONS,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use protection_core::persistence::StoreError;
use protection_core::{DegradationPolicy, PersistenceStore, ProtectionError};

const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const PERSIST_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const RECENT_WINDOW_SECS: i64 = 7 * 24 * 3600;
const DAILY_DECAY_RATE: f64 = 0.05;

struct CacheEntry {
    score: ReputationScore,
    cached_at: Instant,
}

/// Persistent, cached reputation scoring engine.
pub struct ReputationEngine {
    store: Arc<dyn PersistenceStore>,
    policy: DegradationPolicy,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ReputationEngine {
    /// Creates an engine backed by `store`.
    pub fn new(store: Arc<dyn PersistenceStore>, policy: DegradationPolicy) -> Self {
        Self {
            store,
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Computes (or loads and refreshes) a client's current reputation.
    pub async fn calculate_reputation(&self, client_id: &str) -> Result<ReputationScore, ProtectionError> {
        if let Some(score) = self.cached(client_id) {
            return Ok(score);
        }

        let mut score = self.load(client_id).await?.unwrap_or_else(|| ReputationScore::new(client_id));
        self.recompute_component_scores(&mut score);
        self.apply_temporal_decay(&mut score);
        self.update_trend(&mut score);
        self.save(&score).await?;
        self.cache_insert(score.clone());
        Ok(score)
    }

    /// Applies `event` to a client's reputation and persists the result.
    pub async fn update_reputation(&self, client_id: &str, event: ReputationEvent) -> Result<ReputationScore, ProtectionError> {
        let mut score = self.calculate_reputation(client_id).await?;
        let old_score = score.overall_score;

        match event.event_type {
            ReputationEventType::Violation => self.apply_violation(&mut score, &event),
            ReputationEventType::Compliance | ReputationEventType::Efficiency | ReputationEventType::GoodBehavior => {
                self.apply_positive(&mut score, &event)
            }
            ReputationEventType::Error => {}
        }

        self.update_component_for_event(&mut score, &event);
        score.overall_score = Self::weighted_overall(&score).round() as i32;
        score.overall_score = score.overall_score.clamp(0, 100);

        score.reputation_events.push(event);
        if score.reputation_events.len() > MAX_RETAINED_EVENTS {
            let excess = score.reputation_events.len() - MAX_RETAINED_EVENTS;
            score.reputation_events.drain(0..excess);
        }
        score.last_updated_unix = model::now_unix();

        let _score_change = score.overall_score - old_score;

        self.save(&score).await?;
        self.invalidate(client_id);
        self.cache_insert(score.clone());
        Ok(score)
    }

    /// Returns the access-level configuration for `score`'s current level.
    pub fn access_level(&self, score: &ReputationScore) -> AccessLevel {
        access_level_for(score.reputation_level())
    }

    /// Computes a path back to a healthier reputation level.
    pub async fn recovery_path(&self, client_id: &str) -> Result<RecoveryPlan, ProtectionError> {
        let score = self.calculate_reputation(client_id).await?;
        let current = score.overall_score;

        let target = if current < 30 {
            30
        } else if current < 50 {
            50
        } else if current < 70 {
            70
        } else if current < 90 {
            90
        } else {
            100
        };

        let daily_natural_recovery = DAILY_DECAY_RATE * (100 - current) as f64;
        let daily_possible_improvement = (daily_natural_recovery + 10.0).max(0.1);
        let required_improvement = (target - current) as f64;
        let estimated_days = (required_improvement / daily_possible_improvement).ceil().max(1.0) as i64;

        let mut required_actions = Vec::new();
        if score.compliance_score < 80.0 {
            required_actions.push("Follow rate limits consistently".to_string());
            required_actions.push("Avoid policy violations".to_string());
        }
        if score.reliability_score < 80.0 {
            required_actions.push("Reduce error-generating requests".to_string());
            required_actions.push("Use valid request formats".to_string());
        }
        if score.efficiency_score < 80.0 {
            required_actions.push("Optimize resource usage".to_string());
            required_actions.push("Reduce unnecessary requests".to_string());
        }
        if score.stability_score < 80.0 {
            required_actions.push("Maintain consistent behavior patterns".to_string());
            required_actions.push("Avoid sudden usage spikes".to_string());
        }

        let score_gap = target - current;
        let mut milestone_scores = Vec::new();
        if score_gap > 20 {
            milestone_scores.push(current + score_gap / 3);
            milestone_scores.push(current + 2 * score_gap / 3);
        }
        milestone_scores.push(target);

        let milestones = milestone_scores
            .into_iter()
            .map(|milestone_score| Milestone {
                score: milestone_score,
                estimated_days: (((milestone_score - current) as f64) / daily_possible_improvement)
                    .ceil()
                    .max(0.0) as i64,
                description: format!("Reach reputation score of {milestone_score}"),
            })
            .collect();

        Ok(RecoveryPlan {
            current_score: current,
            target_score: target,
            estimated_days,
            required_actions,
            milestones,
        })
    }

    /// Summary statistics across currently cached clients. Mirrors the
    /// upstream system's cache-scoped view rather than a full storage scan.
    pub fn statistics(&self) -> ReputationStatistics {
        let cache = self.cache.lock().expect("reputation cache mutex poisoned");
        let mut by_level: HashMap<String, u64> = HashMap::new();
        let mut by_trend: HashMap<String, u64> = HashMap::new();
        let mut total = 0.0;
        for entry in cache.values() {
            *by_level.entry(format!("{:?}", entry.score.reputation_level())).or_default() += 1;
            *by_trend.entry(format!("{:?}", entry.score.reputation_trend)).or_default() += 1;
            total += entry.score.overall_score as f64;
        }
        let average_score = if cache.is_empty() { 0.0 } else { total / cache.len() as f64 };
        ReputationStatistics {
            total_clients: cache.len() as u64,
            average_score,
            by_level,
            by_trend,
        }
    }

    /// Evicts cache entries that are older than their TTL, even if they
    /// haven't been naturally superseded by a read.
    pub fn cleanup_expired_cache(&self) {
        let mut cache = self.cache.lock().expect("reputation cache mutex poisoned");
        cache.retain(|_, entry| entry.cached_at.elapsed() < CACHE_TTL);
    }

    fn cached(&self, client_id: &str) -> Option<ReputationScore> {
        let cache = self.cache.lock().expect("reputation cache mutex poisoned");
        cache.get(client_id).and_then(|entry| {
            if entry.cached_at.elapsed() < CACHE_TTL {
                Some(entry.score.clone())
            } else {
                None
            }
        })
    }

    fn cache_insert(&self, score: ReputationScore) {
        let mut cache = self.cache.lock().expect("reputation cache mutex poisoned");
        cache.insert(score.client_id.clone(), CacheEntry { score, cached_at: Instant::now() });
    }

    fn invalidate(&self, client_id: &str) {
        self.cache.lock().expect("reputation cache mutex poisoned").remove(client_id);
    }

    async fn load(&self, client_id: &str) -> Result<Option<ReputationScore>, ProtectionError> {
        let key = format!("reputation:{client_id}");
        match self.store.get(&key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProtectionError::InternalError { message: e.to_string() }),
            Ok(None) => Ok(None),
            Err(StoreError::Unavailable(_)) => match self.policy {
                DegradationPolicy::FailOpen => Ok(None),
                DegradationPolicy::FailClosed => Err(ProtectionError::DependencyUnavailable {
                    dependency: "persistence_store".to_string(),
                }),
            },
            Err(StoreError::Corrupt(msg)) => Err(ProtectionError::InternalError { message: msg }),
        }
    }

    async fn save(&self, score: &ReputationScore) -> Result<(), ProtectionError> {
        let key = format!("reputation:{}", score.client_id);
        let bytes = serde_json::to_vec(score).expect("ReputationScore always serializes");
        match self.store.set(&key, bytes, PERSIST_TTL).await {
            Ok(()) => Ok(()),
            Err(StoreError::Unavailable(_)) => match self.policy {
                DegradationPolicy::FailOpen => Ok(()),
                DegradationPolicy::FailClosed => Err(ProtectionError::DependencyUnavailable {
                    dependency: "persistence_store".to_string(),
                }),
            },
            Err(StoreError::Corrupt(msg)) => Err(ProtectionError::InternalError { message: msg }),
        }
    }

    fn recompute_component_scores(&self, score: &mut ReputationScore) {
        let now = model::now_unix();
        let recent: Vec<&ReputationEvent> = score
            .reputation_events
            .iter()
            .filter(|e| now - e.timestamp_unix < RECENT_WINDOW_SECS)
            .collect();

        if recent.is_empty() {
            return;
        }

        let compliance_penalty: f64 = recent
            .iter()
            .filter(|e| e.event_type == ReputationEventType::Violation)
            .map(|e| e.impact.abs())
            .sum();
        score.compliance_score = (100.0 - compliance_penalty).clamp(0.0, 100.0);

        let efficiency_boost: f64 = recent
            .iter()
            .filter(|e| e.event_type == ReputationEventType::Efficiency)
            .map(|e| e.impact.max(0.0))
            .sum();
        score.efficiency_score = (50.0 + efficiency_boost).clamp(0.0, 100.0);

        let error_penalty: f64 = recent
            .iter()
            .filter(|e| e.event_type == ReputationEventType::Error)
            .map(|e| e.impact.abs())
            .sum();
        score.reliability_score = (100.0 - error_penalty).clamp(0.0, 100.0);

        let stability_boost: f64 = recent
            .iter()
            .filter(|e| matches!(e.event_type, ReputationEventType::GoodBehavior | ReputationEventType::Compliance))
            .map(|e| e.impact.max(0.0))
            .sum();
        score.stability_score = (50.0 + stability_boost).clamp(0.0, 100.0);
    }

    fn apply_temporal_decay(&self, score: &mut ReputationScore) {
        let now = model::now_unix();
        let days_since_update = (now - score.last_updated_unix) / 86_400;
        if days_since_update <= 0 {
            return;
        }
        for _ in 0..days_since_update {
            let recovery_rate = DAILY_DECAY_RATE * (100 - score.overall_score) as f64 / 100.0;
            let improvement = recovery_rate * 100.0;
            score.overall_score = (score.overall_score as f64 + improvement).min(100.0).round() as i32;
            score.compliance_score = (score.compliance_score + improvement * 0.5).min(100.0);
            score.efficiency_score = (score.efficiency_score + improvement * 0.3).min(100.0);
            score.stability_score = (score.stability_score + improvement * 0.4).min(100.0);
            score.reliability_score = (score.reliability_score + improvement * 0.3).min(100.0);
        }
    }

    fn update_trend(&self, score: &mut ReputationScore) {
        let recent: Vec<&ReputationEvent> = score
            .reputation_events
            .iter()
            .rev()
            .take(10)
            .collect();

        if recent.len() < 3 {
            score.reputation_trend = Trend::Stable;
            return;
        }

        let impacts: Vec<f64> = recent.iter().map(|e| e.impact).collect();
        let positive = impacts.iter().filter(|i| **i > 0.0).count();
        let negative = impacts.iter().filter(|i| **i < 0.0).count();

        score.reputation_trend = if positive as f64 > negative as f64 * 1.5 {
            Trend::Improving
        } else if negative as f64 > positive as f64 * 1.5 {
            Trend::Declining
        } else {
            let mean = impacts.iter().sum::<f64>() / impacts.len() as f64;
            let variance: f64 = impacts.iter().map(|i| (i - mean).powi(2)).sum();
            if variance > 100.0 {
                Trend::Volatile
            } else {
                Trend::Stable
            }
        };
    }

    fn apply_violation(&self, score: &mut ReputationScore, event: &ReputationEvent) {
        let severity = event.severity.unwrap_or(Severity::Medium);
        let violation = Violation {
            violation_type: event.violation_type.clone().unwrap_or_else(|| "unknown".to_string()),
            severity,
            description: event.description.clone(),
            timestamp_unix: event.timestamp_unix,
            session_id: event.session_id.clone().unwrap_or_else(|| "unknown".to_string()),
        };
        score.historical_violations.push(violation);
        if score.historical_violations.len() > MAX_RETAINED_VIOLATIONS {
            let excess = score.historical_violations.len() - MAX_RETAINED_VIOLATIONS;
            score.historical_violations.drain(0..excess);
        }
        score.last_violation_unix = Some(event.timestamp_unix);

        let violation_count = score.historical_violations.len() as f64;
        let diminishing_factor = 1.0 / (1.0 + violation_count * 0.1);
        let adjusted_penalty = severity.penalty() * diminishing_factor;
        score.overall_score = ((score.overall_score as f64 + adjusted_penalty).max(0.0)).round() as i32;
    }

    fn apply_positive(&self, score: &mut ReputationScore, event: &ReputationEvent) {
        let reward = match event.event_type {
            ReputationEventType::Compliance => 2.0,
            ReputationEventType::Efficiency => 1.0,
            ReputationEventType::GoodBehavior => 3.0,
            _ => 1.0,
        };
        let recent_positive = score
            .reputation_events
            .iter()
            .rev()
            .take(20)
            .filter(|e| e.impact > 0.0)
            .count() as f64;
        let diminishing_factor = 1.0 / (1.0 + recent_positive * 0.05);
        let adjusted_reward = reward * diminishing_factor;
        score.overall_score = ((score.overall_score as f64 + adjusted_reward).min(100.0)).round() as i32;
        score.last_positive_event_unix = Some(event.timestamp_unix);
    }

    fn update_component_for_event(&self, score: &mut ReputationScore, event: &ReputationEvent) {
        let impact = event.impact.abs() * 0.1;
        match event.event_type {
            ReputationEventType::Violation => score.compliance_score = (score.compliance_score - impact).max(0.0),
            ReputationEventType::Efficiency => score.efficiency_score = (score.efficiency_score + impact).min(100.0),
            ReputationEventType::Compliance => score.compliance_score = (score.compliance_score + impact).min(100.0),
            ReputationEventType::GoodBehavior => score.stability_score = (score.stability_score + impact).min(100.0),
            ReputationEventType::Error => {}
        }
    }

    fn weighted_overall(score: &ReputationScore) -> f64 {
        score.compliance_score * 0.3 + score.efficiency_score * 0.2 + score.stability_score * 0.2 + score.reliability_score * 0.3
    }
}

/// Point-in-time summary across currently cached reputations.
#[derive(Debug, Clone)]
pub struct ReputationStatistics {
    pub total_clients: u64,
    pub average_score: f64,
    pub by_level: HashMap<String, u64>,
    pub by_trend: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use protection_core::InMemoryStore;

    fn engine() -> ReputationEngine {
        ReputationEngine::new(Arc::new(InMemoryStore::new()), DegradationPolicy::FailOpen)
    }

    #[tokio::test]
    async fn new_client_starts_neutral_good() {
        let engine = engine();
        let score = engine.calculate_reputation("c1").await.unwrap();
        assert_eq!(score.overall_score, 75);
        assert_eq!(score.reputation_level(), ReputationLevel::Normal);
    }

    #[tokio::test]
    async fn repeated_violations_push_score_down_with_diminishing_penalty() {
        let engine = engine();
        let mut last = 75;
        for _ in 0..5 {
            let event = ReputationEvent::violation("rate limit exceeded", Severity::High, "s1", "rate_limit");
            let score = engine.update_reputation("c1", event).await.unwrap();
            assert!(score.overall_score <= last);
            last = score.overall_score;
        }
        assert!(last < 75);
    }

    #[tokio::test]
    async fn good_behavior_improves_score_but_not_past_100() {
        let engine = engine();
        for _ in 0..50 {
            let event = ReputationEvent::positive(ReputationEventType::GoodBehavior, "clean request");
            let _ = engine.update_reputation("c1", event).await.unwrap();
        }
        let score = engine.calculate_reputation("c1").await.unwrap();
        assert!(score.overall_score <= 100);
    }

    #[tokio::test]
    async fn access_level_tightens_as_score_drops() {
        let engine = engine();
        for _ in 0..10 {
            let event = ReputationEvent::violation("abuse", Severity::Critical, "s1", "abuse");
            let _ = engine.update_reputation("c1", event).await.unwrap();
        }
        let score = engine.calculate_reputation("c1").await.unwrap();
        let access = engine.access_level(&score);
        assert!(access.rate_multiplier < 1.0);
    }

    #[tokio::test]
    async fn recovery_path_targets_next_level_up() {
        let engine = engine();
        for _ in 0..10 {
            let event = ReputationEvent::violation("abuse", Severity::Critical, "s1", "abuse");
            let _ = engine.update_reputation("c1", event).await.unwrap();
        }
        let plan = engine.recovery_path("c1").await.unwrap();
        assert!(plan.target_score > plan.current_score);
        assert!(!plan.milestones.is_empty());
    }

    #[tokio::test]
    async fn reads_are_served_from_cache_between_loads() {
        let engine = engine();
        let first = engine.calculate_reputation("c1").await.unwrap();
        let second = engine.calculate_reputation("c1").await.unwrap();
        assert_eq!(first.last_updated_unix, second.last_updated_unix);
    }
}
