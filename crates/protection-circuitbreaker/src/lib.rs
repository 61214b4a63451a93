//! Adaptive, reputation-aware circuit breaking.
//!
//! Wraps the closed/open/half-open state machine every circuit breaker has
//! with two things the plain version doesn't: a simple predictive risk score
//! derived from recent call history, and a decision that can consult a
//! caller-supplied reputation multiplier before falling back to the sliding
//! window. Callers record outcomes directly (`record_success`/
//! `record_failure`) instead of the breaker inspecting a `Result`, since
//! client protection call sites already know whether a call failed by the
//! time they get here.
//!
//! ## Basic usage
//!
//! ```rust
//! use protection_circuitbreaker::SmartCircuitBreaker;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = SmartCircuitBreaker::new(
//!     SmartCircuitBreaker::builder()
//!         .name("llm-backend")
//!         .failure_rate_threshold(0.5)
//!         .sliding_window_size(10)
//!         .build(),
//! );
//!
//! match breaker.try_acquire(None).await {
//!     Ok(()) => {
//!         // call the dependency, then:
//!         breaker.record_success(Duration::from_millis(120)).await;
//!     }
//!     Err(err) => eprintln!("denied: {err}"),
//! }
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protection_core::ProtectionError;
use tokio::sync::Mutex;

pub use circuit::{CircuitMetrics, CircuitState};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, SlidingWindowType};
pub use events::CircuitBreakerEvent;

mod circuit;
mod config;
mod events;

use circuit::Circuit;

/// Consecutive failures, independent of the sliding window, used for the
/// predictive risk score.
const RISK_RECENT_WINDOW: usize = 20;

/// A point-in-time risk prediction, per `smart_circuit_breaker`'s
/// `RiskPrediction`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskPrediction {
    /// Risk score in `[0.0, 1.0]`; higher means more likely to fail soon.
    pub risk_score: f64,
    /// How many of the confidence sample's calls are predicted to fail.
    pub predicted_failures: u32,
    /// Confidence in the prediction, scaled by how much history is available.
    pub confidence: f64,
}

/// Optional system load signals used to adjust thresholds and throttle
/// decisions, mirroring `adjust_thresholds`'s `cpu_usage`/`memory_usage`
/// parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

#[derive(Debug, Default)]
struct RecentCall {
    duration: Duration,
    failed: bool,
}

struct Inner {
    circuit: Mutex<Circuit>,
    config: Mutex<CircuitBreakerConfig>,
    state_atomic: Arc<AtomicU8>,
    consecutive_failures: AtomicU64,
    half_open_probes: AtomicU64,
    last_open_at: Mutex<Option<Instant>>,
    recent: Mutex<std::collections::VecDeque<RecentCall>>,
    /// Base failure-rate threshold stored as bits so `adjust_thresholds` can
    /// update it without requiring `&mut self`.
    base_failure_rate_threshold_bits: AtomicU64,
}

/// Reputation- and load-aware circuit breaker.
///
/// Unlike the underlying [`Circuit`] state machine, a `SmartCircuitBreaker`
/// is cheap to clone (it's an `Arc` handle) and exposes plain async/sync
/// methods rather than a `tower::Service`; the coordinator decides when to
/// call it.
pub struct SmartCircuitBreaker {
    inner: Arc<Inner>,
}

impl Clone for SmartCircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SmartCircuitBreaker {
    /// Returns a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Builds a breaker from an already-constructed configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let state_atomic = Arc::new(AtomicU8::new(CircuitState::Closed as u8));
        let base_threshold = config.failure_rate_threshold;
        Self {
            inner: Arc::new(Inner {
                circuit: Mutex::new(Circuit::new_with_atomic(Arc::clone(&state_atomic))),
                config: Mutex::new(config),
                state_atomic,
                consecutive_failures: AtomicU64::new(0),
                half_open_probes: AtomicU64::new(0),
                last_open_at: Mutex::new(None),
                recent: Mutex::new(std::collections::VecDeque::with_capacity(RISK_RECENT_WINDOW)),
                base_failure_rate_threshold_bits: AtomicU64::new(base_threshold.to_bits()),
            }),
        }
    }

    /// Returns the current state without requiring async context.
    pub fn state_sync(&self) -> CircuitState {
        CircuitState::from_u8(self.inner.state_atomic.load(Ordering::Acquire))
    }

    /// Returns the current state.
    pub async fn state(&self) -> CircuitState {
        self.inner.circuit.lock().await.state()
    }

    /// Returns a metrics snapshot of the underlying sliding window.
    pub async fn metrics(&self) -> CircuitMetrics {
        let circuit = self.inner.circuit.lock().await;
        let config = self.inner.config.lock().await;
        circuit.metrics(&config)
    }

    /// Decides whether a call should be permitted.
    ///
    /// `reputation_multiplier` comes from the reputation engine's
    /// [`protection_reputation::AccessLevel::rate_multiplier`] for the
    /// calling client, if known: `Some(0.0)` (a blocked client) denies
    /// unconditionally regardless of circuit state, mirroring
    /// `_reputation_based_decision`'s handling of
    /// `ReputationLevel::BLOCKED`.
    pub async fn try_acquire(&self, reputation_multiplier: Option<f64>) -> Result<(), ProtectionError> {
        if reputation_multiplier == Some(0.0) {
            return Err(ProtectionError::CircuitThrottled {
                reason: "client reputation is blocked".into(),
                predicted_risk: None,
            });
        }

        let state = self.state_sync();
        if state == CircuitState::Open {
            let risk = self.predict_failure_risk().await;
            return Err(ProtectionError::CircuitOpen {
                reason: format!("circuit '{}' is open", self.name().await),
                predicted_risk: Some(risk.risk_score),
            });
        }

        if state == CircuitState::Closed {
            let risk = self.predict_failure_risk().await;
            if risk.risk_score > 0.8 && risk.confidence > 0.7 {
                let config = self.inner.config.lock().await;
                config.event_listeners.emit(&CircuitBreakerEvent::CallThrottled {
                    pattern_name: config.name.clone(),
                    timestamp: Instant::now(),
                    reason: "predicted failure risk".into(),
                });
                drop(config);
                return Err(ProtectionError::CircuitThrottled {
                    reason: "predicted failure risk exceeds threshold".into(),
                    predicted_risk: Some(risk.risk_score),
                });
            }
        }

        if state == CircuitState::HalfOpen {
            let probes = self.inner.half_open_probes.load(Ordering::Acquire);
            if probes >= 3 {
                return Err(ProtectionError::CircuitThrottled {
                    reason: "half-open probe budget exhausted".into(),
                    predicted_risk: None,
                });
            }
        }

        if let Some(multiplier) = reputation_multiplier {
            if multiplier < 0.7 {
                let load = self.load_factor().await;
                if load > 0.7 {
                    return Err(ProtectionError::CircuitThrottled {
                        reason: "low-reputation client throttled under load".into(),
                        predicted_risk: None,
                    });
                }
            }
        }

        let mut circuit = self.inner.circuit.lock().await;
        let config = self.inner.config.lock().await;
        let permitted = circuit.try_acquire(&config);
        if state == CircuitState::HalfOpen && permitted {
            self.inner.half_open_probes.fetch_add(1, Ordering::AcqRel);
        }
        if permitted {
            Ok(())
        } else {
            Err(ProtectionError::CircuitOpen {
                reason: format!("circuit '{}' rejected call", config.name),
                predicted_risk: None,
            })
        }
    }

    /// Records a successful call of the given duration.
    pub async fn record_success(&self, duration: Duration) {
        self.inner.consecutive_failures.store(0, Ordering::Release);
        self.push_recent(duration, false).await;

        let mut circuit = self.inner.circuit.lock().await;
        let config = self.inner.config.lock().await;
        let was_half_open = circuit.state() == CircuitState::HalfOpen;
        circuit.record_success(&config, duration);
        if was_half_open && circuit.state() == CircuitState::Closed {
            self.inner.half_open_probes.store(0, Ordering::Release);
        }
    }

    /// Records a failed call of the given duration.
    pub async fn record_failure(&self, duration: Duration) {
        self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        self.push_recent(duration, true).await;

        let mut circuit = self.inner.circuit.lock().await;
        let config = self.inner.config.lock().await;
        let was_half_open = circuit.state() == CircuitState::HalfOpen;
        circuit.record_failure(&config, duration);
        if was_half_open {
            self.inner.half_open_probes.store(0, Ordering::Release);
        }
        if circuit.state() == CircuitState::Open {
            *self.inner.last_open_at.lock().await = Some(Instant::now());
        }
    }

    async fn push_recent(&self, duration: Duration, failed: bool) {
        let mut recent = self.inner.recent.lock().await;
        if recent.len() >= RISK_RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(RecentCall { duration, failed });
    }

    /// Estimates the likelihood of failure in the near future from recent
    /// call outcomes, per `smart_circuit_breaker.predict_failure_risk`.
    pub async fn predict_failure_risk(&self) -> RiskPrediction {
        let recent = self.inner.recent.lock().await;
        if recent.is_empty() {
            return RiskPrediction {
                risk_score: 0.0,
                predicted_failures: 0,
                confidence: 0.0,
            };
        }

        let failures = recent.iter().filter(|c| c.failed).count();
        let failure_rate = failures as f64 / recent.len() as f64;
        let avg_response_ms = recent.iter().map(|c| c.duration.as_secs_f64() * 1000.0).sum::<f64>()
            / recent.len() as f64;

        let mut risk_score: f64 = 0.0;
        if failure_rate > 0.5 {
            risk_score += 0.4;
        }
        if avg_response_ms > 5000.0 {
            risk_score += 0.3;
        }
        let consecutive = self.inner.consecutive_failures.load(Ordering::Acquire);
        let threshold = {
            let config = self.inner.config.lock().await;
            config.minimum_number_of_calls as u64 / 2
        };
        if consecutive >= threshold {
            risk_score += 0.4;
        }

        let confidence = (recent.len() as f64 / RISK_RECENT_WINDOW as f64).min(1.0);
        let predicted_failures = (failure_rate * 10.0) as u32;

        RiskPrediction {
            risk_score: risk_score.min(1.0),
            predicted_failures,
            confidence,
        }
    }

    /// Current request-rate/response-time based load factor in `[0.0, 1.0]`,
    /// per `_calculate_load_factor`.
    pub async fn load_factor(&self) -> f64 {
        let recent = self.inner.recent.lock().await;
        if recent.is_empty() {
            return 0.0;
        }
        let rate_factor = (recent.len() as f64 / 60.0 / 10.0).min(1.0);
        let avg_ms = recent.iter().map(|c| c.duration.as_secs_f64() * 1000.0).sum::<f64>()
            / recent.len() as f64;
        let time_factor = (avg_ms / 1000.0).min(1.0);
        (rate_factor + time_factor) / 2.0
    }

    /// Adapts the failure-rate threshold to current health and system load,
    /// per `smart_circuit_breaker.adjust_thresholds`: a low health score
    /// tightens the threshold (opens sooner), high CPU/memory loosens the
    /// slow-call bar so load alone doesn't trip the breaker.
    pub async fn adjust_thresholds(&self, health_score: f64, load: SystemLoad) {
        let base = f64::from_bits(
            self.inner
                .base_failure_rate_threshold_bits
                .load(Ordering::Acquire),
        );

        let adjusted = if health_score < 0.3 {
            (base * 0.5).max(0.1)
        } else if health_score > 0.8 {
            (base * 1.5).min(0.9)
        } else {
            base
        };

        let load_factor = 1.0 + (load.cpu_usage.max(load.memory_usage) * 0.5);

        let mut config = self.inner.config.lock().await;
        config.failure_rate_threshold = adjusted;
        if let Some(slow_threshold) = config.slow_call_duration_threshold {
            config.slow_call_duration_threshold =
                Some(slow_threshold.mul_f64(load_factor.clamp(1.0, 2.0)));
        }
        config.event_listeners.emit(&CircuitBreakerEvent::ThresholdsAdjusted {
            pattern_name: config.name.clone(),
            timestamp: Instant::now(),
            failure_rate_threshold: adjusted,
        });
    }

    /// Forces the circuit open regardless of the sliding window.
    pub async fn force_open(&self) {
        let mut circuit = self.inner.circuit.lock().await;
        let config = self.inner.config.lock().await;
        circuit.force_open(&config);
    }

    /// Forces the circuit closed and clears counts.
    pub async fn force_closed(&self) {
        let mut circuit = self.inner.circuit.lock().await;
        let config = self.inner.config.lock().await;
        circuit.force_closed(&config);
        self.inner.half_open_probes.store(0, Ordering::Release);
        self.inner.consecutive_failures.store(0, Ordering::Release);
    }

    /// Resets the circuit to closed and clears all accumulated state.
    pub async fn reset(&self) {
        self.force_closed().await;
        self.inner.recent.lock().await.clear();
    }

    async fn name(&self) -> String {
        self.inner.config.lock().await.name.clone()
    }

    /// Registers an event listener for this breaker's config. Must be called
    /// before the breaker is shared, since listeners attach to the
    /// live config under a lock.
    pub async fn add_event_listener<L>(&self, listener: L)
    where
        L: protection_core::events::EventListener<CircuitBreakerEvent> + 'static,
    {
        self.inner.config.lock().await.event_listeners.add(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> SmartCircuitBreaker {
        SmartCircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .name("test")
                .failure_rate_threshold(0.5)
                .sliding_window_size(10)
                .minimum_number_of_calls(10)
                .wait_duration_in_open(Duration::from_millis(50))
                .permitted_calls_in_half_open(3)
                .build(),
        )
    }

    #[tokio::test]
    async fn opens_on_high_failure_rate() {
        let cb = breaker();
        for _ in 0..6 {
            cb.record_failure(Duration::from_millis(10)).await;
        }
        for _ in 0..4 {
            cb.record_success(Duration::from_millis(10)).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.try_acquire(None).await.is_err());
    }

    #[tokio::test]
    async fn stays_closed_on_low_failure_rate() {
        let cb = breaker();
        for _ in 0..2 {
            cb.record_failure(Duration::from_millis(10)).await;
        }
        for _ in 0..8 {
            cb.record_success(Duration::from_millis(10)).await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.try_acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn half_open_recovers_to_closed_after_successes() {
        let cb = breaker();
        for _ in 0..10 {
            cb.record_failure(Duration::from_millis(10)).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.try_acquire(None).await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        for _ in 0..3 {
            cb.record_success(Duration::from_millis(10)).await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn blocked_reputation_denies_even_when_closed() {
        let cb = breaker();
        let result = cb.try_acquire(Some(0.0)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_circuit());
    }

    #[tokio::test]
    async fn adjust_thresholds_tightens_on_low_health() {
        let cb = breaker();
        cb.adjust_thresholds(0.1, SystemLoad::default()).await;
        let config = cb.inner.config.lock().await;
        assert!(config.failure_rate_threshold < 0.5);
    }

    #[tokio::test]
    async fn predicted_risk_is_zero_with_no_history() {
        let cb = breaker();
        let risk = cb.predict_failure_risk().await;
        assert_eq!(risk.risk_score, 0.0);
        assert_eq!(risk.confidence, 0.0);
    }

    #[tokio::test]
    async fn manual_force_open_and_reset() {
        let cb = breaker();
        cb.force_open().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
