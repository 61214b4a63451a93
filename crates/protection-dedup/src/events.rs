//! Observability events emitted by the deduplicator.

use std::time::Instant;

use protection_core::ResilienceEvent;

/// Events emitted by [`crate::Deduplicator`].
#[derive(Debug, Clone)]
pub enum DedupEvent {
    /// A non-duplicate request was recorded under its fingerprint.
    Recorded {
        /// Endpoint the request targeted.
        endpoint: String,
        /// When the event occurred.
        timestamp: Instant,
    },
    /// A duplicate request was detected.
    DuplicateDetected {
        /// Endpoint the request targeted.
        endpoint: String,
        /// Whether a cached response body was available to replay.
        had_cached_response: bool,
        /// When the event occurred.
        timestamp: Instant,
    },
}

impl ResilienceEvent for DedupEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DedupEvent::Recorded { .. } => "recorded",
            DedupEvent::DuplicateDetected { .. } => "duplicate_detected",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            DedupEvent::Recorded { timestamp, .. } | DedupEvent::DuplicateDetected { timestamp, .. } => *timestamp,
        }
    }

    fn pattern_name(&self) -> &str {
        match self {
            DedupEvent::Recorded { endpoint, .. } | DedupEvent::DuplicateDetected { endpoint, .. } => endpoint,
        }
    }
}
