//! Unified error taxonomy for the client protection core.
//!
//! Every component (rate limiter, deduplicator, timeout manager, reputation
//! engine, circuit breaker, ...) returns either a well-typed success value or
//! one of the variants of [`ProtectionError`]. The coordinator is the only
//! place that converts this enum into an HTTP-shaped denial; individual
//! components never know about status codes.
//!
//! # Example
//!
//! ```
//! use protection_core::ProtectionError;
//! use std::time::Duration;
//!
//! fn handle(err: ProtectionError) {
//!     match err {
//!         ProtectionError::RateLimitExceeded { retry_after, .. } => {
//!             eprintln!("rate limited, retry after {:?}", retry_after);
//!         }
//!         ProtectionError::CircuitOpen { reason, .. } => {
//!             eprintln!("circuit open: {reason}");
//!         }
//!         other => eprintln!("denied: {other}"),
//!     }
//! }
//! # handle(ProtectionError::ReputationBlocked { client_id: "c1".into() });
//! ```

use std::time::Duration;

/// The HTTP-ish status class a [`ProtectionError`] should be surfaced as.
/// The coordinator is the only consumer; components never construct this
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialClass {
    /// 429 Too Many Requests
    TooManyRequests,
    /// 409 Conflict
    Conflict,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 403 Forbidden
    Forbidden,
}

impl DenialClass {
    /// The HTTP status code this class corresponds to.
    pub fn http_status(&self) -> u16 {
        match self {
            DenialClass::TooManyRequests => 429,
            DenialClass::Conflict => 409,
            DenialClass::ServiceUnavailable => 503,
            DenialClass::Forbidden => 403,
        }
    }
}

/// Unified error type returned by protection components.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtectionError {
    /// The caller exceeded a configured rate limit bucket.
    #[error("rate limit exceeded for {limit_type} ({current}/{limit}), retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Name of the limit bucket (`global`, `per_session`, ...).
        limit_type: String,
        /// How long the caller should wait before retrying.
        retry_after: Duration,
        /// Observed count at the time of denial.
        current: u64,
        /// Configured limit for the bucket.
        limit: u64,
    },

    /// The request is a near-identical repeat of one already in flight or
    /// recently completed.
    #[error("duplicate request (original at {original_timestamp_unix}s, {ttl_remaining:?} remaining)")]
    DuplicateRequest {
        /// Unix timestamp (seconds) of the original request.
        original_timestamp_unix: i64,
        /// Time remaining before the dedup entry expires.
        ttl_remaining: Duration,
    },

    /// A hierarchical timeout scope elapsed before completion.
    #[error("operation '{operation}' timed out after {duration:?}")]
    OperationTimeout {
        /// Name of the operation that timed out (e.g. `llm_call`).
        operation: String,
        /// The configured duration that elapsed.
        duration: Duration,
    },

    /// The endpoint's circuit breaker is open and rejecting calls.
    #[error("circuit open: {reason}")]
    CircuitOpen {
        /// Human-readable reason for the open state.
        reason: String,
        /// Predicted risk score, if a prediction triggered the opening.
        predicted_risk: Option<f64>,
    },

    /// The endpoint's circuit breaker is throttling (not fully denying).
    #[error("circuit throttled: {reason}")]
    CircuitThrottled {
        /// Human-readable reason for the throttle.
        reason: String,
        /// Predicted risk score, if available.
        predicted_risk: Option<f64>,
    },

    /// The client's reputation level is BLOCKED.
    #[error("client {client_id} is blocked by reputation")]
    ReputationBlocked {
        /// Identifier of the blocked client.
        client_id: String,
    },

    /// A backing dependency (Redis, persistence store) is unavailable and
    /// the configured degradation policy is fail-closed.
    #[error("dependency '{dependency}' unavailable")]
    DependencyUnavailable {
        /// Name of the unavailable dependency.
        dependency: String,
    },

    /// An unexpected internal failure. Never surfaced to callers with
    /// details; the request is admitted (fail-open) and a critical metric is
    /// incremented.
    #[error("internal protection error: {message}")]
    InternalError {
        /// Internal diagnostic message (never sent to the caller).
        message: String,
    },
}

impl ProtectionError {
    /// The denial class this error maps to, per `spec.md` §6.
    pub fn denial_class(&self) -> DenialClass {
        match self {
            ProtectionError::RateLimitExceeded { .. } => DenialClass::TooManyRequests,
            ProtectionError::CircuitThrottled { .. } => DenialClass::TooManyRequests,
            ProtectionError::DuplicateRequest { .. } => DenialClass::Conflict,
            ProtectionError::CircuitOpen { .. } => DenialClass::ServiceUnavailable,
            ProtectionError::DependencyUnavailable { .. } => DenialClass::ServiceUnavailable,
            ProtectionError::ReputationBlocked { .. } => DenialClass::Forbidden,
            ProtectionError::OperationTimeout { .. } => DenialClass::ServiceUnavailable,
            ProtectionError::InternalError { .. } => DenialClass::ServiceUnavailable,
        }
    }

    /// `Retry-After` seconds to surface, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProtectionError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns `true` if this is a rate-limit denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProtectionError::RateLimitExceeded { .. })
    }

    /// Returns `true` if this is a circuit-breaker denial (open or throttled).
    pub fn is_circuit(&self) -> bool {
        matches!(
            self,
            ProtectionError::CircuitOpen { .. } | ProtectionError::CircuitThrottled { .. }
        )
    }

    /// Returns `true` if this came from an unavailable dependency.
    pub fn is_dependency_unavailable(&self) -> bool {
        matches!(self, ProtectionError::DependencyUnavailable { .. })
    }
}

/// A stable machine-readable error code, used in the JSON denial body.
impl ProtectionError {
    /// Returns the `error_code` field used in denial response bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtectionError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ProtectionError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            ProtectionError::OperationTimeout { .. } => "OPERATION_TIMEOUT",
            ProtectionError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            ProtectionError::CircuitThrottled { .. } => "CIRCUIT_THROTTLED",
            ProtectionError::ReputationBlocked { .. } => "REPUTATION_BLOCKED",
            ProtectionError::DependencyUnavailable { .. } => "DEPENDENCY_UNAVAILABLE",
            ProtectionError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_to_429() {
        let err = ProtectionError::RateLimitExceeded {
            limit_type: "per_session".into(),
            retry_after: Duration::from_secs(30),
            current: 11,
            limit: 10,
        };
        assert_eq!(err.denial_class(), DenialClass::TooManyRequests);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(err.denial_class().http_status(), 429);
    }

    #[test]
    fn reputation_blocked_maps_to_403() {
        let err = ProtectionError::ReputationBlocked {
            client_id: "c1".into(),
        };
        assert_eq!(err.denial_class(), DenialClass::Forbidden);
        assert!(err.retry_after().is_none());
    }

    #[test]
    fn circuit_open_maps_to_503() {
        let err = ProtectionError::CircuitOpen {
            reason: "failure threshold reached".into(),
            predicted_risk: None,
        };
        assert!(err.is_circuit());
        assert_eq!(err.denial_class(), DenialClass::ServiceUnavailable);
    }
}
