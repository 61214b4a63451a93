//! Observability events emitted by the rate limiter.

use std::time::Instant;

use protection_core::ResilienceEvent;

/// Events emitted by [`crate::RateLimiter`].
#[derive(Debug, Clone)]
pub enum RateLimiterEvent {
    /// A request was admitted under the limit.
    RequestAllowed {
        /// Name of this limiter instance.
        name: String,
        /// The limit-type bucket checked (`global`, `per_session`, ...).
        limit_type: String,
        /// Count observed after admission.
        current: u64,
        /// When the event occurred.
        timestamp: Instant,
    },
    /// A request was denied for exceeding the configured limit.
    RequestDenied {
        /// Name of this limiter instance.
        name: String,
        /// The limit-type bucket checked.
        limit_type: String,
        /// Seconds the caller should wait before retrying.
        retry_after_secs: f64,
        /// Total violations recorded for this bucket so far.
        violation_count: u64,
        /// When the event occurred.
        timestamp: Instant,
    },
}

impl ResilienceEvent for RateLimiterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RateLimiterEvent::RequestAllowed { .. } => "request_allowed",
            RateLimiterEvent::RequestDenied { .. } => "request_denied",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            RateLimiterEvent::RequestAllowed { timestamp, .. }
            | RateLimiterEvent::RequestDenied { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            RateLimiterEvent::RequestAllowed { name, .. }
            | RateLimiterEvent::RequestDenied { name, .. } => name,
        }
    }
}
