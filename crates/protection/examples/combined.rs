//! Example demonstrating rate limiting and deduplication checked together
//! ahead of a downstream service, without the full coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protection::core::DegradationPolicy;
use protection::core::InMemoryStore;
use protection::dedup::{DedupConfig, Deduplicator, EndpointDedupConfig};
use protection::hasher::RequestHasher;
use protection::ratelimiter::{RateLimiter, RateLimiterConfigBuilder};

#[tokio::main]
async fn main() {
    let store = Arc::new(InMemoryStore::new());

    let rate_limiter = RateLimiter::new(
        RateLimiterConfigBuilder::new("per_session", 5, Duration::from_secs(60)).build(),
        Arc::clone(&store) as _,
        DegradationPolicy::FailOpen,
    );

    let dedup = Deduplicator::new(
        DedupConfig::new(EndpointDedupConfig::new(Duration::from_secs(30))),
        Arc::new(RequestHasher::default()),
        Arc::clone(&store) as _,
        DegradationPolicy::FailOpen,
    );

    let handled = Arc::new(AtomicUsize::new(0));

    println!("Sending 8 requests from session 'demo', 4 of them exact repeats\n");

    for i in 1..=8 {
        let body = if i % 2 == 0 { b"{\"query\":\"a\"}".to_vec() } else { b"{\"query\":\"b\"}".to_vec() };

        if let Err(err) = rate_limiter.check("demo").await {
            println!("Request {i}: {err}");
            continue;
        }

        match dedup.check("demo", "/api/v1/agent/query", "POST", Some(&body), &[], &[]).await {
            Ok(outcome) if !outcome.is_duplicate => {
                handled.fetch_add(1, Ordering::SeqCst);
                println!("Request {i}: handled");
            }
            Ok(_) => println!("Request {i}: duplicate, skipped"),
            Err(err) => println!("Request {i}: dedup error: {err}"),
        }
    }

    println!("\nTotal requests actually handled: {}", handled.load(Ordering::SeqCst));
}
