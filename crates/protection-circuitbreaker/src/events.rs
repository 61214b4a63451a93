//! Observability events emitted by a circuit breaker.

use std::time::{Duration, Instant};

use protection_core::ResilienceEvent;

use crate::circuit::CircuitState;

/// Events emitted by [`crate::SmartCircuitBreaker`].
#[derive(Debug, Clone)]
pub enum CircuitBreakerEvent {
    StateTransition {
        pattern_name: String,
        timestamp: Instant,
        from_state: CircuitState,
        to_state: CircuitState,
    },
    CallPermitted {
        pattern_name: String,
        timestamp: Instant,
        state: CircuitState,
    },
    CallRejected {
        pattern_name: String,
        timestamp: Instant,
    },
    CallThrottled {
        pattern_name: String,
        timestamp: Instant,
        reason: String,
    },
    SuccessRecorded {
        pattern_name: String,
        timestamp: Instant,
        state: CircuitState,
    },
    FailureRecorded {
        pattern_name: String,
        timestamp: Instant,
        state: CircuitState,
    },
    SlowCallDetected {
        pattern_name: String,
        timestamp: Instant,
        duration: Duration,
        state: CircuitState,
    },
    ThresholdsAdjusted {
        pattern_name: String,
        timestamp: Instant,
        failure_rate_threshold: f64,
    },
}

impl ResilienceEvent for CircuitBreakerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CircuitBreakerEvent::StateTransition { .. } => "state_transition",
            CircuitBreakerEvent::CallPermitted { .. } => "call_permitted",
            CircuitBreakerEvent::CallRejected { .. } => "call_rejected",
            CircuitBreakerEvent::CallThrottled { .. } => "call_throttled",
            CircuitBreakerEvent::SuccessRecorded { .. } => "success_recorded",
            CircuitBreakerEvent::FailureRecorded { .. } => "failure_recorded",
            CircuitBreakerEvent::SlowCallDetected { .. } => "slow_call_detected",
            CircuitBreakerEvent::ThresholdsAdjusted { .. } => "thresholds_adjusted",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CircuitBreakerEvent::StateTransition { timestamp, .. }
            | CircuitBreakerEvent::CallPermitted { timestamp, .. }
            | CircuitBreakerEvent::CallRejected { timestamp, .. }
            | CircuitBreakerEvent::CallThrottled { timestamp, .. }
            | CircuitBreakerEvent::SuccessRecorded { timestamp, .. }
            | CircuitBreakerEvent::FailureRecorded { timestamp, .. }
            | CircuitBreakerEvent::SlowCallDetected { timestamp, .. }
            | CircuitBreakerEvent::ThresholdsAdjusted { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            CircuitBreakerEvent::StateTransition { pattern_name, .. }
            | CircuitBreakerEvent::CallPermitted { pattern_name, .. }
            | CircuitBreakerEvent::CallRejected { pattern_name, .. }
            | CircuitBreakerEvent::CallThrottled { pattern_name, .. }
            | CircuitBreakerEvent::SuccessRecorded { pattern_name, .. }
            | CircuitBreakerEvent::FailureRecorded { pattern_name, .. }
            | CircuitBreakerEvent::SlowCallDetected { pattern_name, .. }
            | CircuitBreakerEvent::ThresholdsAdjusted { pattern_name, .. } => pattern_name,
        }
    }
}
