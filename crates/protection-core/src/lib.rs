//! Shared infrastructure for the client protection core.
//!
//! This crate provides the pieces every protection component depends on:
//! - [`events`]: observability event system (`EventListener`, `EventListeners`)
//! - [`error`]: the unified [`ProtectionError`] taxonomy
//! - [`settings`]: process-wide [`ProtectionSettings`], loaded from the environment
//! - [`persistence`]: the [`PersistenceStore`] trait plus in-memory and Redis backends
//! - [`identity`]: client/session identifier resolution
//! - [`aimd`]: a generic additive-increase/multiplicative-decrease controller,
//!   used by the circuit breaker's adaptive threshold adjustment
//! - [`health_integration`]: trait for wiring external health checks into
//!   resilience patterns

pub mod aimd;
pub mod error;
pub mod events;
pub mod health_integration;
pub mod identity;
pub mod persistence;
pub mod settings;

pub use error::{DenialClass, ProtectionError};
pub use events::{EventListener, EventListeners, ResilienceEvent};
pub use health_integration::{HealthTriggerable, TriggerHealth};
pub use identity::resolve_session_id;
pub use persistence::{InMemoryStore, PersistenceStore};
pub use settings::{DegradationPolicy, ProtectionSettings};
