//! Orchestration pipeline for the client protection core.
//!
//! [`ProtectionCoordinator`] is the single entry point every other crate in
//! this workspace is built to support: it resolves a request's identity,
//! walks it through rate limiting, deduplication, behavioral scoring,
//! anomaly detection, reputation lookup and circuit breaking, and combines
//! their verdicts into one [`ProtectionDecision`]. A companion
//! [`after_response`](ProtectionCoordinator::after_response) call closes
//! the loop by feeding the outcome back into the components that learn
//! from it.
//!
//! # Example
//!
//! ```
//! use protection_coordinator::{ProtectionCoordinator, RequestContext};
//! use protection_core::settings::ProtectionSettings;
//!
//! # async fn example() {
//! let coordinator = ProtectionCoordinator::new(ProtectionSettings::default());
//! let ctx = RequestContext {
//!     session_id: "session-1".to_string(),
//!     endpoint: "/api/v1/agent/query".to_string(),
//!     method: "POST".to_string(),
//!     payload_size: 128,
//!     body: Some(br#"{"query":"hi"}"#.to_vec()),
//!     query_params: vec![],
//!     headers: vec![],
//!     client_ip: "127.0.0.1".to_string(),
//!     user_agent: Some("curl/8.0".to_string()),
//! };
//! let decision = coordinator.before_request(ctx).await;
//! assert!(decision.is_ok());
//! # }
//! ```

mod layer;
mod model;

pub use layer::{ProtectionLayer, ProtectionService, ProtectionServiceError, RequestContextSource, ResponseStatusSource};
pub use model::{DenialResponse, HealthSnapshot, MetricsSnapshot, ProtectionDecision, RequestContext, ResponseOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use protection_anomaly::AnomalyDetector;
use protection_behavioral::{BehavioralAnalyzer, RequestObservation, RiskLevel};
use protection_circuitbreaker::{SmartCircuitBreaker, SystemLoad};
use protection_core::identity::{resolve_session_id, RequestIdentity};
use protection_core::persistence::RedisStore;
use protection_core::settings::ProtectionSettings;
use protection_core::{InMemoryStore, PersistenceStore, ProtectionError};
use protection_dedup::{DedupConfig, Deduplicator, EndpointDedupConfig};
use protection_hasher::RequestHasher;
use protection_ratelimiter::{RateLimiter, RateLimiterConfigBuilder};
use protection_reputation::{ReputationEngine, ReputationEvent, ReputationEventType, Severity};
use protection_timeout::TimeoutHandler;

/// Score below which a request is denied outright, per the combined
/// protection score's deny threshold.
const DENY_THRESHOLD: f64 = 0.3;
/// Score below which a HIGH-risk request is also denied.
const HIGH_RISK_DENY_THRESHOLD: f64 = 0.6;

struct Counters {
    evaluated: AtomicU64,
    denied: AtomicU64,
    internal_errors: AtomicU64,
}

/// Ties every protection component together into one request/response
/// lifecycle.
pub struct ProtectionCoordinator {
    settings: ProtectionSettings,
    rate_limiters: HashMap<String, RateLimiter>,
    dedup: Deduplicator,
    timeouts: TimeoutHandler,
    behavioral: BehavioralAnalyzer,
    anomaly: AnomalyDetector,
    reputation: ReputationEngine,
    circuit_breakers: Mutex<HashMap<String, SmartCircuitBreaker>>,
    counters: Counters,
    denials_by_code: Mutex<HashMap<&'static str, u64>>,
}

impl ProtectionCoordinator {
    /// Builds a coordinator from process-wide settings, wiring every
    /// sub-component to a shared persistence store (Redis if configured,
    /// otherwise an in-process fallback).
    pub fn new(settings: ProtectionSettings) -> Self {
        let store: Arc<dyn PersistenceStore> = match &settings.redis_url {
            Some(url) => match RedisStore::new(url, settings.redis_key_prefix.clone()) {
                Ok(store) => Arc::new(store),
                Err(_) => Arc::new(InMemoryStore::new()),
            },
            None => Arc::new(InMemoryStore::new()),
        };

        let mut rate_limiters = HashMap::new();
        for (name, bucket) in settings.rate_limits.buckets.iter() {
            if !bucket.enabled {
                continue;
            }
            let config = RateLimiterConfigBuilder::new(name.clone(), bucket.requests, bucket.window).build();
            rate_limiters.insert(
                name.clone(),
                RateLimiter::new(config, Arc::clone(&store), settings.degradation_policy),
            );
        }

        let dedup_config = DedupConfig::new(EndpointDedupConfig::new(settings.dedup.default_ttl))
            .with_endpoint("/api/v1/agent/query", EndpointDedupConfig::new(settings.dedup.agent_query_ttl))
            .with_endpoint(
                "/api/v1/conversations/title",
                EndpointDedupConfig::new(settings.dedup.title_generation_ttl),
            );
        let dedup = Deduplicator::new(
            dedup_config,
            Arc::new(RequestHasher::default()),
            Arc::clone(&store),
            settings.degradation_policy,
        );

        let timeouts = TimeoutHandler::new(settings.timeouts);
        let behavioral = BehavioralAnalyzer::new();
        let anomaly = AnomalyDetector::new();
        let reputation = ReputationEngine::new(Arc::clone(&store), settings.degradation_policy);

        Self {
            settings,
            rate_limiters,
            dedup,
            timeouts,
            behavioral,
            anomaly,
            reputation,
            circuit_breakers: Mutex::new(HashMap::new()),
            counters: Counters {
                evaluated: AtomicU64::new(0),
                denied: AtomicU64::new(0),
                internal_errors: AtomicU64::new(0),
            },
            denials_by_code: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates an incoming request against every configured protection
    /// layer, returning either an admission decision or the error to deny
    /// the caller with.
    pub async fn before_request(&self, ctx: RequestContext) -> Result<ProtectionDecision, ProtectionError> {
        self.counters.evaluated.fetch_add(1, Ordering::Relaxed);

        if !self.settings.enabled || ctx.bypasses(&self.settings.bypass_headers) {
            return Ok(ProtectionDecision::allow(ctx.session_id, RiskLevel::Low, 1.0));
        }

        match self.evaluate(&ctx).await {
            Ok(decision) => Ok(decision),
            // An internal failure is a bug in this pipeline, not a
            // deliberate denial: admit the request (fail-open) per
            // spec.md §7 rather than reject the caller over our own
            // fault, and never surface the diagnostic message.
            Err(ProtectionError::InternalError { message }) => {
                self.counters.internal_errors.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::error!(error = %message, "protection pipeline failed internally, admitting fail-open");
                #[cfg(not(feature = "tracing"))]
                let _ = message;
                Ok(ProtectionDecision::allow(ctx.session_id, RiskLevel::Low, 1.0))
            }
            Err(err) => {
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
                *self
                    .denials_by_code
                    .lock()
                    .expect("denial counter mutex poisoned")
                    .entry(err.error_code())
                    .or_insert(0) += 1;
                Err(err)
            }
        }
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Result<ProtectionDecision, ProtectionError> {
        // 1. rate limiting: global bucket, then per-session buckets, then
        //    any endpoint-specific bucket (title generation).
        for bucket in ["global", "per_session", "per_session_hourly"] {
            if let Some(limiter) = self.rate_limiters.get(bucket) {
                let key = if bucket == "global" { "all" } else { ctx.session_id.as_str() };
                limiter.check(key).await?;
            }
        }
        if protection_hasher::is_title_generation(&ctx.endpoint) {
            if let Some(limiter) = self.rate_limiters.get("title_generation") {
                limiter.check(&ctx.session_id).await?;
            }
        }

        // 2. deduplication.
        let mut dedup_fingerprint = None;
        if self.settings.dedup.enabled {
            let outcome = self
                .dedup
                .check(
                    &ctx.session_id,
                    &ctx.endpoint,
                    &ctx.method,
                    ctx.body.as_deref(),
                    &ctx.query_params,
                    &ctx.headers,
                )
                .await?;
            dedup_fingerprint = Some(outcome.fingerprint.clone());
            if outcome.is_duplicate {
                return Err(ProtectionError::DuplicateRequest {
                    original_timestamp_unix: outcome.original_timestamp_unix.unwrap_or_default(),
                    ttl_remaining: self.settings.dedup.default_ttl,
                });
            }
        }

        // 3. reputation lookup, used both for the circuit breaker's
        //    reputation-aware decision and the final combination.
        let client_id = client_identifier(ctx);
        let reputation_factor = if self.settings.toggles.reputation_system {
            let score = self.reputation.calculate_reputation(&client_id).await?;
            let access = self.reputation.access_level(&score);
            if access.rate_multiplier <= 0.0 {
                return Err(ProtectionError::ReputationBlocked { client_id: client_id.clone() });
            }
            access.rate_multiplier.min(1.0)
        } else {
            1.0
        };

        // 4. circuit breaker for this endpoint.
        let (breaker, load_factor) = if self.settings.toggles.smart_circuit_breakers {
            let breaker = self.breaker_for(&ctx.endpoint).await;
            let multiplier = self.settings.toggles.reputation_system.then_some(reputation_factor);
            breaker.try_acquire(multiplier).await?;
            let load = breaker.load_factor().await;
            (Some(breaker), load)
        } else {
            (None, 0.0)
        };
        let _ = breaker;

        // 5. behavioral analysis, scored from the session's existing
        //    profile — this request's own outcome isn't known yet, so it
        //    has nothing to contribute until `after_response` records it.
        let behavior_score = if self.settings.toggles.behavioral_analysis {
            self.behavioral.current_behavior_score(&ctx.session_id).await
        } else {
            None
        };

        // 6. anomaly detection over the session's current behavior vector.
        let anomaly_score = if self.settings.toggles.ml_anomaly_detection {
            match self.behavioral.get_behavior_profile(&ctx.session_id).await {
                Some(profile) => match profile.behavior_vectors.last() {
                    Some(vector) => Some(self.anomaly.detect(vector).await.overall_score),
                    None => None,
                },
                None => None,
            }
        } else {
            None
        };

        // 7. combine into one overall admission score:
        //    overall = behavior * (1 - anomaly) * reputation * (1 - load)
        let behavior_component = behavior_score.as_ref().map(|s| s.overall_behavior_score).unwrap_or(1.0);
        let anomaly_component = 1.0 - anomaly_score.unwrap_or(0.0);
        let overall = behavior_component * anomaly_component * reputation_factor * (1.0 - load_factor).max(0.0);

        let risk_level = behavior_score.as_ref().map(|s| s.risk_level).unwrap_or(RiskLevel::Low);

        if overall <= DENY_THRESHOLD || risk_level == RiskLevel::Critical {
            return Err(ProtectionError::CircuitThrottled {
                reason: format!("combined protection score {overall:.2} below threshold"),
                predicted_risk: Some(1.0 - overall),
            });
        }
        if risk_level == RiskLevel::High && overall < HIGH_RISK_DENY_THRESHOLD {
            return Err(ProtectionError::CircuitThrottled {
                reason: format!("elevated risk with combined score {overall:.2}"),
                predicted_risk: Some(1.0 - overall),
            });
        }

        let mut decision = ProtectionDecision::allow(ctx.session_id.clone(), risk_level, overall);
        decision.dedup_fingerprint = dedup_fingerprint;
        Ok(decision)
    }

    /// Feeds a completed request's outcome back into the components that
    /// learn from it: behavioral profiling, reputation, and circuit
    /// breaker call recording.
    pub async fn after_response(&self, ctx: &RequestContext, _decision: &ProtectionDecision, outcome: ResponseOutcome) {
        if !self.settings.enabled {
            return;
        }

        if self.settings.toggles.behavioral_analysis {
            let observation = RequestObservation {
                endpoint: ctx.endpoint.clone(),
                method: ctx.method.clone(),
                response_time_ms: outcome.duration.as_secs_f64() * 1000.0,
                status_code: outcome.status_code,
                payload_size: ctx.payload_size as u64,
            };
            self.behavioral.analyze_request_pattern(&ctx.session_id, observation).await;
            self.behavioral.update_behavior_model(&ctx.session_id).await;
        }

        if self.settings.toggles.reputation_system {
            let client_id = client_identifier(ctx);
            let event = if outcome.is_server_error() {
                ReputationEvent::violation("server error response", Severity::Medium, ctx.session_id.clone(), "server_error")
            } else if outcome.is_client_error() {
                ReputationEvent::violation("client error response", Severity::Low, ctx.session_id.clone(), "client_error")
            } else if outcome.is_fast_success() {
                ReputationEvent::positive(ReputationEventType::GoodBehavior, "fast successful response")
            } else {
                ReputationEvent::positive(ReputationEventType::Compliance, "successful response")
            };
            let _ = self.reputation.update_reputation(&client_id, event).await;
        }

        let breaker = self
            .circuit_breakers
            .lock()
            .expect("breaker map mutex poisoned")
            .get(&ctx.endpoint)
            .cloned();
        if let Some(breaker) = breaker {
            if outcome.is_server_error() {
                breaker.record_failure(outcome.duration).await;
            } else {
                breaker.record_success(outcome.duration).await;
            }
        }
    }

    /// Stores a successful response body for later dedup replay. Separate
    /// from [`after_response`](Self::after_response) because the
    /// coordinator doesn't otherwise need to hold response bodies.
    pub async fn store_response(&self, decision: &ProtectionDecision, endpoint: &str, status: u16, body: &[u8]) {
        if let Some(fingerprint) = &decision.dedup_fingerprint {
            let _ = self.dedup.store_response(fingerprint, endpoint, status, body).await;
        }
    }

    async fn breaker_for(&self, endpoint: &str) -> SmartCircuitBreaker {
        let mut breakers = self.circuit_breakers.lock().expect("breaker map mutex poisoned");
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                SmartCircuitBreaker::new(
                    SmartCircuitBreaker::builder()
                        .name(endpoint)
                        .failure_rate_threshold(0.5)
                        .sliding_window_size(20)
                        .build(),
                )
            })
            .clone()
    }

    /// Runs `fut` under the appropriate timeout budget for `operation`.
    pub async fn with_timeout<F, T>(&self, operation: impl Into<String>, fut: F) -> Result<T, ProtectionError>
    where
        F: std::future::Future<Output = T>,
    {
        self.timeouts.with_timeout(operation, None, fut).await
    }

    /// One iteration of the background monitoring loop: refreshes
    /// circuit-breaker thresholds from current load signals. Callers
    /// typically drive this from a `tokio::time::interval` ticking at
    /// `settings.monitoring_interval`.
    pub async fn run_monitoring_tick(&self) {
        let breakers: Vec<SmartCircuitBreaker> = self
            .circuit_breakers
            .lock()
            .expect("breaker map mutex poisoned")
            .values()
            .cloned()
            .collect();
        let health = 1.0 - self.timeouts.statistics().timeout_rate;
        for breaker in breakers {
            breaker.adjust_thresholds(health, SystemLoad::default()).await;
        }
    }

    /// One iteration of the background cleanup loop: prunes stale
    /// behavioral profiles and reputation cache entries. Callers typically
    /// drive this from a `tokio::time::interval` ticking at
    /// `settings.cleanup_interval`.
    pub async fn run_cleanup_tick(&self) {
        self.behavioral.cleanup_old_data().await;
        self.reputation.cleanup_expired_cache();
    }

    /// Spawns the monitoring and cleanup background loops on the current
    /// Tokio runtime, ticking at the intervals configured in settings.
    /// Both loops stop cooperatively once `shutdown` is sent or dropped.
    pub fn spawn_background_loops(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let monitoring = {
            let coordinator = Arc::clone(self);
            let interval = self.settings.monitoring_interval;
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => coordinator.run_monitoring_tick().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };
        let cleanup = {
            let coordinator = Arc::clone(self);
            let interval = self.settings.cleanup_interval;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => coordinator.run_cleanup_tick().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };
        (monitoring, cleanup)
    }

    /// Point-in-time health snapshot for `/health/protection`.
    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let mut circuit_states = HashMap::new();
        for (name, breaker) in self.circuit_breakers.lock().expect("breaker map mutex poisoned").iter() {
            circuit_states.insert(name.clone(), format!("{:?}", breaker.state().await));
        }
        HealthSnapshot {
            enabled: self.settings.enabled,
            degraded: false,
            behavioral_sessions: self.behavioral.session_count().await,
            anomaly_trained: self.anomaly.is_trained().await,
            timeout_emergency: self.timeouts.is_emergency(),
            circuit_states,
        }
    }

    /// Point-in-time counters for `/health/protection/metrics`.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_evaluated: self.counters.evaluated.load(Ordering::Relaxed),
            requests_denied: self.counters.denied.load(Ordering::Relaxed),
            requests_admitted_after_internal_error: self.counters.internal_errors.load(Ordering::Relaxed),
            denials_by_code: self.denials_by_code.lock().expect("denial counter mutex poisoned").clone(),
        }
    }

    /// Builds a [`DenialResponse`] body for `error`, tagged with
    /// `correlation_id`.
    pub fn denial_response(&self, error: &ProtectionError, correlation_id: impl Into<String>) -> DenialResponse {
        DenialResponse::from_error(error, correlation_id)
    }
}

fn client_identifier(ctx: &RequestContext) -> String {
    if !ctx.session_id.is_empty() {
        return ctx.session_id.clone();
    }
    let identity = RequestIdentity {
        session_header: None,
        session_query: None,
        session_cookie: None,
        client_ip: &ctx.client_ip,
        user_agent: ctx.user_agent.as_deref(),
    };
    resolve_session_id(&identity)
}
