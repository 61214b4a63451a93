//! Client protection core: rate limiting, deduplication, timeouts, and
//! risk-aware admission control for Tower services.
//!
//! `protection` is a meta-crate over a family of independent components,
//! each available standalone or bundled here behind a feature flag. Each
//! component can be used on its own, but they're designed to be combined
//! by [`protection_coordinator::ProtectionCoordinator`] into one admission
//! decision per request.
//!
//! # Quick Start
//!
//! ```toml
//! [dependencies]
//! protection = { version = "0.8", features = ["coordinator"] }
//! ```
//!
//! # Components
//!
//! - **[Rate Limiter]** - Sliding-window limiting with escalating penalties for repeat offenders
//! - **[Deduplicator]** - Suppresses near-identical repeat requests within a TTL window
//! - **[Timeout Handler]** - Hierarchical timeout budgets with emergency shutdown on repeated breaches
//! - **[Behavioral Analyzer]** - Scores request patterns for bot-like or abusive behavior
//! - **[Anomaly Detector]** - Isolation-forest scoring over behavioral feature vectors
//! - **[Reputation Engine]** - Tracks a client's standing over time and throttles accordingly
//! - **[Circuit Breaker]** - Reputation- and load-aware failure isolation per endpoint
//!
//! [Rate Limiter]: #rate-limiter
//! [Deduplicator]: #deduplicator
//! [Timeout Handler]: #timeout-handler
//! [Behavioral Analyzer]: #behavioral-analyzer
//! [Anomaly Detector]: #anomaly-detector
//! [Reputation Engine]: #reputation-engine
//! [Circuit Breaker]: #circuit-breaker
//!
//! ## Rate Limiter
//!
//! Sliding-window request limiting, keyed per client or globally, with an
//! escalating retry-after penalty for repeat violators.
//!
//! ```rust,no_run
//! # #[cfg(feature = "ratelimiter")]
//! # {
//! use protection::ratelimiter::{RateLimiter, RateLimiterConfigBuilder};
//! use protection::core::{InMemoryStore, DegradationPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = RateLimiterConfigBuilder::new("per_session", 10, Duration::from_secs(60)).build();
//! let limiter = RateLimiter::new(config, Arc::new(InMemoryStore::new()), DegradationPolicy::FailOpen);
//! let outcome = limiter.check("session-1").await;
//! # }
//! # }
//! ```
//!
//! ## Deduplicator
//!
//! Hashes a request's stable fields (endpoint, body, query, a filtered
//! header set) and rejects exact repeats within a configurable TTL —
//! protects against accidental double-submits and retry storms.
//!
//! ## Timeout Handler
//!
//! Hierarchical timeout scopes (agent run → phase → LLM call), each
//! capped to its parent's remaining budget, with an emergency-shutdown
//! flag after repeated breaches in a short window.
//!
//! ## Behavioral Analyzer
//!
//! Builds a rolling feature vector per session (request rate, payload
//! size variance, timing regularity) and scores it against known
//! abusive patterns.
//!
//! ## Anomaly Detector
//!
//! A small isolation forest trained online over behavioral feature
//! vectors; flags points that separate from the rest of the population
//! in few random splits.
//!
//! ## Reputation Engine
//!
//! Accumulates violation and compliance events per client into a
//! decaying score, translated into an access level that throttles or
//! blocks outright.
//!
//! ## Circuit Breaker
//!
//! Per-endpoint failure isolation that also consults a caller's
//! reputation multiplier and the process's current load before
//! admitting a call.
//!
//! # Composition
//!
//! Individual components can be wired by hand, but most applications
//! want the [`coordinator`] feature's [`protection_coordinator::ProtectionCoordinator`],
//! which runs every enabled component in the order `spec.md` §4.9
//! defines (rate limit → dedup → reputation → circuit breaker →
//! behavioral analysis → anomaly detection → combined-score threshold)
//! and exposes the result as one [`tower::Layer`]:
//!
//! ```rust,no_run
//! # #[cfg(feature = "coordinator")]
//! # {
//! use protection::coordinator::{ProtectionCoordinator, ProtectionLayer};
//! use protection::core::settings::ProtectionSettings;
//! use std::sync::Arc;
//! use tower::ServiceBuilder;
//!
//! # fn example<S: Clone>(handler: S) {
//! let coordinator = Arc::new(ProtectionCoordinator::new(ProtectionSettings::from_env()));
//! let service = ServiceBuilder::new()
//!     .layer(ProtectionLayer::new(coordinator))
//!     .service(handler);
//! # }
//! # }
//! ```
//!
//! # Observability
//!
//! Every component emits structured `tracing` spans behind the
//! `tracing` feature and Prometheus-style counters/histograms behind the
//! `metrics` feature, matching the names their standalone crate docs
//! describe. Enable both to get end-to-end visibility into why a
//! request was denied.

// Re-export core (always available)
pub use protection_core as core;

// Re-export components based on features
#[cfg(feature = "ratelimiter")]
pub use protection_ratelimiter as ratelimiter;

#[cfg(feature = "dedup")]
pub use protection_dedup as dedup;

#[cfg(feature = "dedup")]
pub use protection_hasher as hasher;

#[cfg(feature = "timeout")]
pub use protection_timeout as timeout;

#[cfg(feature = "behavioral")]
pub use protection_behavioral as behavioral;

#[cfg(feature = "anomaly")]
pub use protection_anomaly as anomaly;

#[cfg(feature = "reputation")]
pub use protection_reputation as reputation;

#[cfg(feature = "circuitbreaker")]
pub use protection_circuitbreaker as circuitbreaker;

#[cfg(feature = "coordinator")]
pub use protection_coordinator as coordinator;
