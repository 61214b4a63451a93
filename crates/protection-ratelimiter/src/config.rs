use std::time::Duration;

use protection_core::events::{EventListeners, FnListener};

use crate::events::RateLimiterEvent;

/// Configuration for a single named rate limiter bucket.
pub struct RateLimiterConfig {
    pub(crate) limit_type: String,
    pub(crate) limit: u64,
    pub(crate) window: Duration,
    /// TTL applied to the violation counter: `4 * window` per the spec's
    /// progressive-penalty design.
    pub(crate) violation_ttl: Duration,
    pub(crate) max_retry_after: Duration,
    pub(crate) event_listeners: EventListeners<RateLimiterEvent>,
    pub(crate) name: String,
}

/// Builder for [`RateLimiterConfig`].
pub struct RateLimiterConfigBuilder {
    limit_type: String,
    limit: u64,
    window: Duration,
    max_retry_after: Duration,
    event_listeners: EventListeners<RateLimiterEvent>,
    name: String,
}

impl RateLimiterConfigBuilder {
    /// Creates a new builder for the named bucket, with a limit and window.
    pub fn new(limit_type: impl Into<String>, limit: u64, window: Duration) -> Self {
        let limit_type = limit_type.into();
        Self {
            name: limit_type.clone(),
            limit_type,
            limit,
            window,
            max_retry_after: Duration::from_secs(300),
            event_listeners: EventListeners::new(),
        }
    }

    /// Overrides the display name used in emitted events (defaults to the
    /// limit-type string).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Caps `retry_after`, regardless of penalty multiplier (default 300s,
    /// per the spec).
    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    /// Registers a callback invoked when a request is admitted.
    pub fn on_allowed<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RateLimiterEvent::RequestAllowed { current, .. } = event {
                f(*current);
            }
        }));
        self
    }

    /// Registers a callback invoked when a request is denied.
    pub fn on_denied<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, u64) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event| {
            if let RateLimiterEvent::RequestDenied {
                retry_after_secs,
                violation_count,
                ..
            } = event
            {
                f(*retry_after_secs, *violation_count);
            }
        }));
        self
    }

    /// Builds the final configuration.
    pub fn build(self) -> RateLimiterConfig {
        RateLimiterConfig {
            violation_ttl: self.window * 4,
            limit_type: self.limit_type,
            limit: self.limit,
            window: self.window,
            max_retry_after: self.max_retry_after,
            event_listeners: self.event_listeners,
            name: self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = RateLimiterConfigBuilder::new("per_session", 10, Duration::from_secs(60)).build();
        assert_eq!(config.limit, 10);
        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.violation_ttl, Duration::from_secs(240));
        assert_eq!(config.max_retry_after, Duration::from_secs(300));
    }

    #[test]
    fn custom_name_and_cap() {
        let config = RateLimiterConfigBuilder::new("global", 1000, Duration::from_secs(60))
            .name("global-limiter")
            .max_retry_after(Duration::from_secs(30))
            .build();
        assert_eq!(config.name, "global-limiter");
        assert_eq!(config.max_retry_after, Duration::from_secs(30));
    }
}
