//! Content-addressed request deduplication.
//!
//! [`Deduplicator`] uses [`protection_hasher::RequestHasher`] to fingerprint
//! a request, then performs a Redis-atomic check-and-set against that
//! fingerprint: the first request within the TTL window "wins" and
//! proceeds; any identical repeat is reported as a duplicate. Endpoints can
//! opt into response caching, in which case the winning request's body is
//! stored and replayed verbatim to every duplicate; endpoints that don't
//! opt in return a stock polite notice instead, so a duplicate never
//! reveals whether it hit the cache or the real handler.
//!
//! # Example
//!
//! ```
//! use protection_core::{DegradationPolicy, InMemoryStore};
//! use protection_dedup::{Deduplicator, DedupConfig, EndpointDedupConfig};
//! use protection_hasher::RequestHasher;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = DedupConfig::new(EndpointDedupConfig::new(Duration::from_secs(300)));
//! let dedup = Deduplicator::new(
//!     config,
//!     Arc::new(RequestHasher::default()),
//!     Arc::new(InMemoryStore::new()),
//!     DegradationPolicy::FailOpen,
//! );
//!
//! let outcome = dedup
//!     .check("session-1", "/api/v1/agent/query", "POST", Some(b"{\"query\":\"x\"}"), &[], &[])
//!     .await
//!     .unwrap();
//! assert!(!outcome.is_duplicate);
//! # }
//! ```

mod config;
mod events;

pub use config::{should_skip, DedupConfig, EndpointDedupConfig};
pub use events::DedupEvent;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use protection_core::persistence::StoreError;
use protection_core::{
    DegradationPolicy, EventListeners, InMemoryStore, PersistenceStore, ProtectionError,
};
use protection_hasher::{HashingError, RequestHasher};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// The stock, non-revealing message returned to a duplicate caller when no
/// cached response body is available.
pub const POLITE_DUPLICATE_MESSAGE: &str =
    "This appears to be a recent request. If you need a fresh response, please wait a moment and try again.";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DedupRecord {
    timestamp_unix: i64,
}

/// Outcome of a deduplication check.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    /// Whether this request is a duplicate of one already recorded.
    pub is_duplicate: bool,
    /// A cached response body to replay verbatim, if response caching was
    /// enabled for this endpoint and a prior response was stored.
    pub cached_response: Option<Vec<u8>>,
    /// Unix timestamp of the original request, when this is a duplicate.
    pub original_timestamp_unix: Option<i64>,
    /// The fingerprint computed for this request, so a caller can later
    /// call [`Deduplicator::store_response`] without rehashing.
    pub fingerprint: String,
}

/// Content-addressed request deduplicator.
pub struct Deduplicator {
    config: DedupConfig,
    hasher: Arc<RequestHasher>,
    store: Arc<dyn PersistenceStore>,
    fallback: InMemoryStore,
    policy: DegradationPolicy,
    event_listeners: EventListeners<DedupEvent>,
}

impl Deduplicator {
    /// Creates a deduplicator backed by `store`, with `policy` applied if
    /// the store is unreachable.
    pub fn new(
        config: DedupConfig,
        hasher: Arc<RequestHasher>,
        store: Arc<dyn PersistenceStore>,
        policy: DegradationPolicy,
    ) -> Self {
        Self {
            config,
            hasher,
            store,
            fallback: InMemoryStore::new(),
            policy,
            event_listeners: EventListeners::new(),
        }
    }

    /// Attaches an event listener, replacing any previously configured set.
    pub fn with_event_listeners(mut self, listeners: EventListeners<DedupEvent>) -> Self {
        self.event_listeners = listeners;
        self
    }

    /// Checks whether this request is a duplicate, recording it as the
    /// canonical instance if not. Returns `Ok` with `is_duplicate: false`
    /// for requests the skip rules exempt, without touching storage.
    #[allow(clippy::too_many_arguments)]
    pub async fn check(
        &self,
        session_id: &str,
        endpoint: &str,
        method: &str,
        body: Option<&[u8]>,
        query_params: &[(String, serde_json::Value)],
        headers: &[(String, String)],
    ) -> Result<DedupOutcome, ProtectionError> {
        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
            .unwrap_or("");

        if should_skip(method, endpoint, content_type) {
            return Ok(DedupOutcome {
                is_duplicate: false,
                cached_response: None,
                original_timestamp_unix: None,
                fingerprint: String::new(),
            });
        }

        let fingerprint = if protection_hasher::is_title_generation(endpoint) {
            let has_context = query_params.iter().any(|(k, _)| k == "conversation_id");
            self.hasher.hash_title_generation_request(
                session_id,
                has_context.then_some("present"),
            )
        } else {
            match self.hasher.hash_request(session_id, endpoint, method, body, query_params, headers) {
                Ok(fingerprint) => fingerprint,
                Err(HashingError::InvalidEncoding) => {
                    // Body isn't valid UTF-8 and can't be normalized; per
                    // spec.md §4.1 fall back to an uncanonicalized digest
                    // over session/endpoint/method rather than refuse to
                    // dedup the request at all.
                    self.hasher.hash_raw(&format!("{session_id}|{}|{endpoint}", method.to_uppercase()))
                }
            }
        };

        let endpoint_config = self.config.for_endpoint(endpoint);
        let key = format!("dedup:{fingerprint}");

        let existing = self.read(&key).await?;

        if let Some(record) = existing {
            let cached_response = self.read_raw(&format!("{key}:response")).await?;
            self.event_listeners.emit(&DedupEvent::DuplicateDetected {
                endpoint: endpoint.to_string(),
                had_cached_response: cached_response.is_some(),
                timestamp: Instant::now(),
            });
            return Ok(DedupOutcome {
                is_duplicate: true,
                cached_response,
                original_timestamp_unix: Some(record.timestamp_unix),
                fingerprint,
            });
        }

        let record = DedupRecord {
            timestamp_unix: now_unix(),
        };
        self.write(&key, &record, endpoint_config.ttl).await?;
        self.event_listeners.emit(&DedupEvent::Recorded {
            endpoint: endpoint.to_string(),
            timestamp: Instant::now(),
        });

        Ok(DedupOutcome {
            is_duplicate: false,
            cached_response: None,
            original_timestamp_unix: None,
            fingerprint,
        })
    }

    /// Stores a successful response body under `fingerprint`'s key, if the
    /// endpoint opted into response caching. Called by the coordinator
    /// after a 200 response completes.
    pub async fn store_response(
        &self,
        fingerprint: &str,
        endpoint: &str,
        status: u16,
        body: &[u8],
    ) -> Result<(), ProtectionError> {
        if status != 200 || fingerprint.is_empty() {
            return Ok(());
        }
        let endpoint_config = self.config.for_endpoint(endpoint);
        if !endpoint_config.cache_responses {
            return Ok(());
        }
        let key = format!("dedup:{fingerprint}:response");
        match self.store.set(&key, body.to_vec(), endpoint_config.ttl).await {
            Ok(()) => Ok(()),
            Err(StoreError::Unavailable(_)) if self.policy == DegradationPolicy::FailOpen => self
                .fallback
                .set(&key, body.to_vec(), endpoint_config.ttl)
                .await
                .map_err(|e| ProtectionError::InternalError { message: e.to_string() }),
            Err(e) => Err(ProtectionError::InternalError { message: e.to_string() }),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<DedupRecord>, ProtectionError> {
        let raw = self.read_raw(key).await?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProtectionError::InternalError { message: e.to_string() }),
            None => Ok(None),
        }
    }

    async fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>, ProtectionError> {
        match self.store.get(key).await {
            Ok(value) => Ok(value),
            Err(StoreError::Unavailable(_)) => match self.policy {
                DegradationPolicy::FailOpen => self
                    .fallback
                    .get(key)
                    .await
                    .map_err(|e| ProtectionError::InternalError { message: e.to_string() }),
                DegradationPolicy::FailClosed => Err(ProtectionError::DependencyUnavailable {
                    dependency: "persistence_store".to_string(),
                }),
            },
            Err(StoreError::Corrupt(msg)) => Err(ProtectionError::InternalError { message: msg }),
        }
    }

    async fn write(&self, key: &str, record: &DedupRecord, ttl: std::time::Duration) -> Result<(), ProtectionError> {
        let bytes = serde_json::to_vec(record).expect("DedupRecord always serializes");
        match self.store.set(key, bytes.clone(), ttl).await {
            Ok(()) => Ok(()),
            Err(StoreError::Unavailable(_)) => match self.policy {
                DegradationPolicy::FailOpen => self
                    .fallback
                    .set(key, bytes, ttl)
                    .await
                    .map_err(|e| ProtectionError::InternalError { message: e.to_string() }),
                DegradationPolicy::FailClosed => Err(ProtectionError::DependencyUnavailable {
                    dependency: "persistence_store".to_string(),
                }),
            },
            Err(StoreError::Corrupt(msg)) => Err(ProtectionError::InternalError { message: msg }),
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dedup() -> Deduplicator {
        let config = DedupConfig::new(EndpointDedupConfig::new(Duration::from_secs(300)));
        Deduplicator::new(
            config,
            Arc::new(RequestHasher::default()),
            Arc::new(InMemoryStore::new()),
            DegradationPolicy::FailOpen,
        )
    }

    #[tokio::test]
    async fn identical_bodies_with_different_request_ids_are_duplicates() {
        let dedup = dedup();
        let body_a = br#"{"query":"X","request_id":"a"}"#;
        let body_b = br#"{"query":"X","request_id":"b"}"#;

        let first = dedup
            .check("s1", "/api/v1/agent/query", "POST", Some(body_a), &[], &[])
            .await
            .unwrap();
        assert!(!first.is_duplicate);

        let second = dedup
            .check("s1", "/api/v1/agent/query", "POST", Some(body_b), &[], &[])
            .await
            .unwrap();
        assert!(second.is_duplicate);
        assert!(second.cached_response.is_none());
    }

    #[tokio::test]
    async fn response_caching_replays_stored_body() {
        let config = DedupConfig::new(
            EndpointDedupConfig::new(Duration::from_secs(300)).with_response_caching(),
        );
        let dedup = Deduplicator::new(
            config,
            Arc::new(RequestHasher::default()),
            Arc::new(InMemoryStore::new()),
            DegradationPolicy::FailOpen,
        );
        let body = br#"{"query":"X"}"#;

        let first = dedup
            .check("s1", "/api/v1/agent/query", "POST", Some(body), &[], &[])
            .await
            .unwrap();
        dedup
            .store_response(&first.fingerprint, "/api/v1/agent/query", 200, b"cached-body")
            .await
            .unwrap();

        let second = dedup
            .check("s1", "/api/v1/agent/query", "POST", Some(body), &[], &[])
            .await
            .unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.cached_response, Some(b"cached-body".to_vec()));
    }

    #[tokio::test]
    async fn get_requests_skip_deduplication() {
        let dedup = dedup();
        let body = br#"{"query":"X"}"#;
        let first = dedup
            .check("s1", "/api/v1/agent/query", "GET", Some(body), &[], &[])
            .await
            .unwrap();
        let second = dedup
            .check("s1", "/api/v1/agent/query", "GET", Some(body), &[], &[])
            .await
            .unwrap();
        assert!(!first.is_duplicate);
        assert!(!second.is_duplicate);
    }

    #[tokio::test]
    async fn non_utf8_bodies_fall_back_to_an_uncanonicalized_digest_instead_of_erroring() {
        let dedup = dedup();
        let invalid_utf8: &[u8] = &[0x66, 0x6f, 0xff, 0x6f];

        let first = dedup
            .check("s1", "/api/v1/agent/query", "POST", Some(invalid_utf8), &[], &[])
            .await
            .expect("a non-UTF-8 body falls back rather than failing the request");
        assert!(!first.is_duplicate);
        assert!(!first.fingerprint.is_empty());

        let second = dedup
            .check("s1", "/api/v1/agent/query", "POST", Some(invalid_utf8), &[], &[])
            .await
            .unwrap();
        assert!(second.is_duplicate, "repeat non-UTF-8 bodies from the same session/endpoint/method still dedup");
    }

    #[tokio::test]
    async fn title_generation_ignores_prompt_text() {
        let dedup = dedup();
        let a = dedup
            .check("s1", "/api/v1/conversations/title", "POST", Some(b"prompt one"), &[], &[])
            .await
            .unwrap();
        let b = dedup
            .check("s1", "/api/v1/conversations/title", "POST", Some(b"totally different"), &[], &[])
            .await
            .unwrap();
        assert!(!a.is_duplicate);
        assert!(b.is_duplicate);
    }
}
