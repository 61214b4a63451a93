//! Deterministic request fingerprinting for deduplication.
//!
//! [`RequestHasher::hash_request`] turns a request's identity-bearing
//! components into a stable 256-bit digest: two requests that differ only
//! in timestamps, request IDs, or other excluded fields hash identically.
//! The digest is key-stretched with PBKDF2-HMAC-SHA256 so that an attacker
//! who observes fingerprints cannot cheaply enumerate plausible request
//! bodies to find collisions.

use std::collections::BTreeSet;

use hmac::Hmac;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::Sha256;

const PBKDF2_ITERATIONS: u32 = 100_000;
const DEFAULT_SALT: &str = "protection_core_dedup_salt";

/// Errors raised by [`RequestHasher`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum HashingError {
    /// The request body could not be decoded as UTF-8.
    #[error("request body is not valid UTF-8")]
    InvalidEncoding,
}

static EXCLUDED_FIELDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        // Timestamps
        "timestamp",
        "created_at",
        "updated_at",
        "request_time",
        "client_timestamp",
        "server_timestamp",
        // Request IDs
        "request_id",
        "correlation_id",
        "trace_id",
        "span_id",
        "transaction_id",
        "uuid",
        "guid",
        // Session/auth
        "session_token",
        "auth_token",
        "access_token",
        "csrf_token",
        // Browser/client specific
        "user_agent",
        "browser_info",
        "client_version",
        "screen_resolution",
        "viewport_size",
        // Caching/optimization
        "cache_buster",
        "v",
        "version",
        "_",
        "t",
    ]
    .into_iter()
    .collect()
});

static RELEVANT_HEADERS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    ["content-type", "accept", "accept-language", "accept-encoding"]
        .into_iter()
        .collect()
});

static NORMALIZATION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}").unwrap(), "[TIMESTAMP]"),
        (Regex::new(r"(?i)\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").unwrap(), "[TIMESTAMP]"),
        (Regex::new(r"(?i)\d{13}").unwrap(), "[EPOCH_MS]"),
        (Regex::new(r"(?i)\d{10}").unwrap(), "[EPOCH_S]"),
        (
            Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap(),
            "[UUID]",
        ),
        (Regex::new(r"(?i)[0-9a-f]{32}").unwrap(), "[HASH32]"),
        (Regex::new(r"(?i)req_[a-zA-Z0-9]+").unwrap(), "[REQUEST_ID]"),
        (Regex::new(r"(?i)trace_[a-zA-Z0-9]+").unwrap(), "[TRACE_ID]"),
        (Regex::new(r"(?i)/tmp/[^/\s]+").unwrap(), "[TEMP_PATH]"),
        (Regex::new(r"(?i)/var/log/[^/\s]+").unwrap(), "[LOG_PATH]"),
    ]
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// A single query parameter after normalization, kept ordered for a
/// deterministic `serde_json` rendering.
#[derive(Debug, Clone, serde::Serialize)]
struct NormalizedParam(String, Value);

/// Secure, salted request fingerprinter.
///
/// One instance is created per process (the salt is fixed per-process, not
/// per-request) and shared behind an `Arc` by every caller.
#[derive(Debug, Clone)]
pub struct RequestHasher {
    salt: String,
}

impl Default for RequestHasher {
    fn default() -> Self {
        Self::new(DEFAULT_SALT)
    }
}

impl RequestHasher {
    /// Creates a hasher with an explicit salt. Use [`RequestHasher::default`]
    /// unless the deployment needs a non-default salt.
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Hashes a full request into a 64-character hex digest.
    ///
    /// Returns [`HashingError::InvalidEncoding`] if `body` is present but
    /// not valid UTF-8 — normalization needs to parse it as text or JSON.
    /// Per the hasher's contract, the caller is expected to fall back to
    /// [`RequestHasher::hash_raw`] over `session_id`, `endpoint`, and
    /// `method` alone in that case, rather than treat the request as
    /// unhashable.
    pub fn hash_request(
        &self,
        session_id: &str,
        endpoint: &str,
        method: &str,
        body: Option<&[u8]>,
        query_params: &[(String, Value)],
        headers: &[(String, String)],
    ) -> Result<String, HashingError> {
        let body_text = match body {
            Some(bytes) => Some(
                std::str::from_utf8(bytes)
                    .map_err(|_| HashingError::InvalidEncoding)?
                    .to_string(),
            ),
            None => None,
        };

        let normalized_endpoint = normalize_endpoint(endpoint);
        let normalized_body = normalize_body(body_text.as_deref());
        let normalized_params = normalize_params(query_params);
        let normalized_headers = normalize_headers(headers);

        let content = [
            session_id,
            &method.to_uppercase(),
            &normalized_endpoint,
            &normalized_body,
            &normalized_params,
            &normalized_headers,
        ]
        .join("|");

        Ok(self.secure_hash(&content))
    }

    /// Specialized hash for title-generation requests: only session id and
    /// presence/absence of conversation context participate, so repeated
    /// title-generation attempts for the same conversation collapse to one
    /// fingerprint regardless of the exact prompt text.
    pub fn hash_title_generation_request(
        &self,
        session_id: &str,
        conversation_context: Option<&str>,
    ) -> String {
        let has_conversation = match conversation_context {
            Some(ctx) if !ctx.trim().is_empty() => "yes",
            _ => "no",
        };
        let content = format!("title_generation:{session_id}:{has_conversation}");
        self.secure_hash(&content)
    }

    /// Hashes arbitrary pre-joined content with the same salted,
    /// key-stretched digest `hash_request` uses internally. Exposed so
    /// callers can build an uncanonicalized fallback key (e.g. when a
    /// request body isn't valid UTF-8) without reimplementing the KDF.
    pub fn hash_raw(&self, content: &str) -> String {
        self.secure_hash(content)
    }

    fn secure_hash(&self, content: &str) -> String {
        let mut output = [0u8; 32];
        pbkdf2::pbkdf2::<Hmac<Sha256>>(
            content.as_bytes(),
            self.salt.as_bytes(),
            PBKDF2_ITERATIONS,
            &mut output,
        )
        .expect("32-byte output is always valid for PBKDF2-HMAC-SHA256");
        output.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Returns `true` if a hash has the expected PBKDF2-SHA256 hex format.
pub fn validate_hash(hash_value: &str) -> bool {
    hash_value.len() == 64 && hash_value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Statistics about the hasher's static configuration, surfaced on the
/// health/metrics endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HashStats {
    /// Number of statically excluded field names.
    pub excluded_fields_count: usize,
    /// Number of compiled normalization patterns.
    pub normalization_patterns_count: usize,
    /// Name of the digest algorithm in use.
    pub hash_algorithm: &'static str,
    /// Number of PBKDF2 iterations applied.
    pub iterations: u32,
    /// Length of the returned digest, in hex characters.
    pub output_length: usize,
}

/// Returns the hasher's static configuration stats.
pub fn hash_stats() -> HashStats {
    HashStats {
        excluded_fields_count: EXCLUDED_FIELDS.len(),
        normalization_patterns_count: NORMALIZATION_PATTERNS.len(),
        hash_algorithm: "PBKDF2-SHA256",
        iterations: PBKDF2_ITERATIONS,
        output_length: 64,
    }
}

/// Pure predicate: is `endpoint` a title-generation endpoint?
///
/// Kept as a standalone, testable function rather than an inline string
/// check scattered across callers.
pub fn is_title_generation(endpoint: &str) -> bool {
    normalize_endpoint(endpoint).contains("title")
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.is_empty() {
        return String::new();
    }
    let without_query = endpoint.split('?').next().unwrap_or("");
    let forward_slashes = without_query.replace('\\', "/");
    let trimmed = forward_slashes.trim_end_matches('/');
    trimmed.to_lowercase()
}

fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut normalized = text.to_string();
    for (pattern, replacement) in NORMALIZATION_PATTERNS.iter() {
        normalized = pattern.replace_all(&normalized, *replacement).into_owned();
    }
    WHITESPACE.replace_all(normalized.trim(), " ").into_owned()
}

fn normalize_body(body: Option<&str>) -> String {
    let body = match body {
        Some(b) if !b.is_empty() => b,
        _ => return String::new(),
    };
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => {
                let normalized = normalize_json_value(value);
                serde_json::to_string(&normalized).unwrap_or_default()
            }
            Err(_) => normalize_text(body),
        }
    } else {
        normalize_text(body)
    }
}

/// Recursively normalizes a JSON value: drops excluded object keys,
/// rewrites string values through the normalization patterns, and leaves
/// numbers/bools/null untouched. `serde_json` serializes object keys in
/// insertion order by default but sorts them when the `preserve_order`
/// feature is absent, which is what this crate relies on for determinism.
fn normalize_json_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            let mut keys: Vec<_> = map.into_iter().collect();
            keys.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, val) in keys {
                if EXCLUDED_FIELDS.contains(key.to_lowercase().as_str()) {
                    continue;
                }
                normalized.insert(key, normalize_json_value(val));
            }
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_json_value).collect()),
        Value::String(s) => Value::String(normalize_text(&s)),
        other => other,
    }
}

fn normalize_params(params: &[(String, Value)]) -> String {
    if params.is_empty() {
        return String::new();
    }
    let mut filtered: Vec<NormalizedParam> = params
        .iter()
        .filter(|(key, _)| !EXCLUDED_FIELDS.contains(key.to_lowercase().as_str()))
        .map(|(key, value)| {
            let normalized_value = match value {
                Value::String(s) => Value::String(normalize_text(s)),
                Value::Array(items) => {
                    let mut normalized_items: Vec<String> = items
                        .iter()
                        .map(|v| normalize_text(&value_to_string(v)))
                        .collect();
                    normalized_items.sort();
                    Value::Array(normalized_items.into_iter().map(Value::String).collect())
                }
                other => other.clone(),
            };
            NormalizedParam(key.clone(), normalized_value)
        })
        .collect();
    filtered.sort_by(|a, b| a.0.cmp(&b.0));
    serde_json::to_string(&filtered).unwrap_or_default()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize_headers(headers: &[(String, String)]) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let mut normalized: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(key, value)| {
            let key_lower = key.to_lowercase();
            RELEVANT_HEADERS
                .contains(key_lower.as_str())
                .then(|| (key_lower, value.to_lowercase().trim().to_string()))
        })
        .collect();
    normalized.sort_by(|a, b| a.0.cmp(&b.0));
    serde_json::to_string(&normalized).unwrap_or_default()
}
