//! Client and session identifier resolution.
//!
//! The coordinator needs a stable identifier to key rate limits, dedup
//! entries and reputation records against, but most requests never carry
//! an explicit session. [`resolve_session_id`] tries, in order: the
//! `X-Session-ID` header, the `session_id` query parameter, the
//! `session_id` cookie, and finally falls back to a fingerprint of the
//! client's IP and user agent so anonymous traffic is still attributable
//! to a consistent (if coarse) bucket.

use sha2::{Digest, Sha256};

/// The minimal request surface [`resolve_session_id`] needs. Kept as a
/// plain struct rather than depending on any particular HTTP framework's
/// request type, so this crate stays framework-agnostic.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity<'a> {
    /// Value of the `X-Session-ID` header, if present.
    pub session_header: Option<&'a str>,
    /// Value of the `session_id` query parameter, if present.
    pub session_query: Option<&'a str>,
    /// Value of the `session_id` cookie, if present.
    pub session_cookie: Option<&'a str>,
    /// The caller's IP address, as seen after proxy header resolution.
    pub client_ip: &'a str,
    /// The caller's `User-Agent` header, if present.
    pub user_agent: Option<&'a str>,
}

/// Resolves a stable session identifier for `identity`.
///
/// Returns a borrowed string when an explicit session identifier was
/// supplied, or an owned synthetic identifier (`client_<16 hex digits>`)
/// derived from IP + user agent when none was.
pub fn resolve_session_id(identity: &RequestIdentity<'_>) -> String {
    if let Some(id) = identity.session_header.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = identity.session_query.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = identity.session_cookie.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    synthetic_client_id(identity.client_ip, identity.user_agent.unwrap_or("unknown"))
}

/// Derives a stable synthetic client identifier from IP and user agent,
/// for requests that carry no explicit session identifier.
pub fn synthetic_client_id(client_ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_ip.as_bytes());
    hasher.update(b":");
    hasher.update(user_agent.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("client_{}", &hex[..16])
}

/// Extracts the real client IP from `X-Forwarded-For` (first hop) or
/// `X-Real-IP`, falling back to the transport-layer peer address.
pub fn resolve_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer_addr: &str,
) -> String {
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real) = real_ip.filter(|s| !s.is_empty()) {
        return real.to_string();
    }
    peer_addr.to_string()
}
