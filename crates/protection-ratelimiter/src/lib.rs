//! Redis-backed sliding-window rate limiter with progressive penalties.
//!
//! One [`RateLimiter`] instance guards one named bucket (`global`,
//! `per_session`, `title_generation`, ...). The admission check and the
//! counter advance happen atomically server-side
//! ([`protection_core::PersistenceStore::sliding_window_check`]); repeated
//! violations are penalized with an escalating `retry_after` via a parallel
//! violation counter, jittered to avoid synchronized retry storms.
//!
//! # Example
//!
//! ```
//! use protection_core::{InMemoryStore, DegradationPolicy};
//! use protection_ratelimiter::{RateLimiter, RateLimiterConfigBuilder};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = RateLimiterConfigBuilder::new("per_session", 10, Duration::from_secs(60)).build();
//! let limiter = RateLimiter::new(config, Arc::new(InMemoryStore::new()), DegradationPolicy::FailOpen);
//!
//! let outcome = limiter.check("session-1").await.unwrap();
//! assert!(outcome.allowed);
//! # }
//! ```

mod config;
mod events;

pub use config::{RateLimiterConfig, RateLimiterConfigBuilder};
pub use events::RateLimiterEvent;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use protection_core::persistence::StoreError;
use protection_core::{DegradationPolicy, InMemoryStore, PersistenceStore, ProtectionError};
use rand::Rng;

/// Outcome of an admitted rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Requests counted in the current window, including this one if admitted.
    pub current: u64,
    /// The configured limit.
    pub limit: u64,
}

fn penalty_multiplier(violation_count: u64) -> u64 {
    match violation_count {
        0 | 1 => 1,
        2 => 2,
        3 => 4,
        4 => 8,
        _ => 16,
    }
}

/// A single-bucket sliding-window rate limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn PersistenceStore>,
    fallback: InMemoryStore,
    policy: DegradationPolicy,
}

impl RateLimiter {
    /// Creates a rate limiter for one bucket, backed by `store` with the
    /// given degradation policy applied if `store` is unreachable.
    pub fn new(
        config: RateLimiterConfig,
        store: Arc<dyn PersistenceStore>,
        policy: DegradationPolicy,
    ) -> Self {
        Self {
            config,
            store,
            fallback: InMemoryStore::new(),
            policy,
        }
    }

    /// Checks and, if admitted, advances the counter for `key` (typically a
    /// session id or client id). All checks for one bucket are serialized by
    /// the store's atomic sliding-window script, so concurrent callers can
    /// never jointly exceed the configured limit.
    pub async fn check(&self, key: &str) -> Result<RateLimitOutcome, ProtectionError> {
        let bucket_key = format!("{}:{}", self.config.limit_type, key);
        let now_millis = now_millis();

        let result = match self
            .store
            .sliding_window_check(&bucket_key, now_millis, self.config.window, self.config.limit)
            .await
        {
            Ok(result) => result,
            Err(StoreError::Unavailable(_)) => match self.policy {
                DegradationPolicy::FailOpen => self
                    .fallback
                    .sliding_window_check(&bucket_key, now_millis, self.config.window, self.config.limit)
                    .await
                    .map_err(|e| ProtectionError::InternalError {
                        message: e.to_string(),
                    })?,
                DegradationPolicy::FailClosed => {
                    return Err(ProtectionError::DependencyUnavailable {
                        dependency: "persistence_store".to_string(),
                    });
                }
            },
            Err(StoreError::Corrupt(msg)) => {
                return Err(ProtectionError::InternalError { message: msg });
            }
        };

        if result.allowed {
            self.config.event_listeners.emit(&RateLimiterEvent::RequestAllowed {
                name: self.config.name.clone(),
                limit_type: self.config.limit_type.clone(),
                current: result.current,
                timestamp: Instant::now(),
            });
            return Ok(RateLimitOutcome {
                allowed: true,
                current: result.current,
                limit: result.limit,
            });
        }

        let violation_key = format!("violations:{}:{}", self.config.limit_type, key);
        let violation_count = match self
            .store
            .incr(&violation_key, 1, self.config.violation_ttl)
            .await
        {
            Ok(count) => count.max(0) as u64,
            Err(_) => self
                .fallback
                .incr(&violation_key, 1, self.config.violation_ttl)
                .await
                .unwrap_or(1)
                .max(0) as u64,
        };

        let retry_after = self.retry_after(violation_count);

        self.config.event_listeners.emit(&RateLimiterEvent::RequestDenied {
            name: self.config.name.clone(),
            limit_type: self.config.limit_type.clone(),
            retry_after_secs: retry_after.as_secs_f64(),
            violation_count,
            timestamp: Instant::now(),
        });

        Err(ProtectionError::RateLimitExceeded {
            limit_type: self.config.limit_type.clone(),
            retry_after,
            current: result.current,
            limit: result.limit,
        })
    }

    fn retry_after(&self, violation_count: u64) -> Duration {
        let multiplier = penalty_multiplier(violation_count);
        let jitter = rand::rng().random_range(0.0..0.1);
        let seconds = self.config.window.as_secs_f64() * multiplier as f64 * (1.0 + jitter);
        Duration::from_secs_f64(seconds).min(self.config.max_retry_after)
    }

    /// Operator escape hatch: clears this bucket's counters and violation
    /// history for `key`. Not reachable from the request path.
    pub async fn reset(&self, key: &str) -> Result<(), ProtectionError> {
        let bucket_key = format!("{}:{}", self.config.limit_type, key);
        let violation_key = format!("violations:{}:{}", self.config.limit_type, key);
        self.store
            .delete(&bucket_key)
            .await
            .map_err(|e| ProtectionError::InternalError { message: e.to_string() })?;
        self.store
            .delete(&violation_key)
            .await
            .map_err(|e| ProtectionError::InternalError { message: e.to_string() })?;
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}
