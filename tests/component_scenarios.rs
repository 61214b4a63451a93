//! Scenario tests exercising the reputation, circuit breaker, and timeout
//! crates directly, independent of the coordinator.

use std::sync::Arc;
use std::time::Duration;

use protection_circuitbreaker::{CircuitBreakerConfig, CircuitState, SmartCircuitBreaker};
use protection_core::{DegradationPolicy, InMemoryStore};
use protection_reputation::{ReputationEngine, ReputationEvent, ReputationLevel, Severity};
use protection_timeout::{TimeoutContext, TimeoutHandler};

#[tokio::test]
async fn three_critical_violations_block_a_client() {
    let engine = ReputationEngine::new(Arc::new(InMemoryStore::new()), DegradationPolicy::FailOpen);

    let mut score = engine.calculate_reputation("abuser").await.unwrap();
    assert_eq!(score.overall_score, 75);

    for i in 0..3 {
        let event = ReputationEvent::violation(
            format!("policy breach #{i}"),
            Severity::Critical,
            "sess-1",
            "abuse",
        );
        score = engine.update_reputation("abuser", event).await.unwrap();
    }

    assert_eq!(score.reputation_level(), ReputationLevel::Blocked);
    assert_eq!(engine.access_level(&score).rate_multiplier, 0.0);
}

#[tokio::test]
async fn circuit_opens_after_five_consecutive_failures_then_recovers() {
    let config = CircuitBreakerConfig::builder()
        .name("agent-troubleshoot")
        .sliding_window_size(5)
        .minimum_number_of_calls(5)
        .failure_rate_threshold(0.5)
        .wait_duration_in_open(Duration::from_millis(50))
        .permitted_calls_in_half_open(2)
        .build();
    let breaker = SmartCircuitBreaker::new(config);

    for _ in 0..5 {
        breaker.try_acquire(None).await.expect("closed circuit admits calls");
        breaker.record_failure(Duration::from_millis(10)).await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);
    breaker.try_acquire(None).await.expect_err("an open circuit rejects calls");

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    breaker.try_acquire(None).await.expect("half-open circuit admits a probe call");
    breaker.record_success(Duration::from_millis(5)).await;
    breaker.try_acquire(None).await.expect("half-open circuit admits a second probe call");
    breaker.record_success(Duration::from_millis(5)).await;

    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn a_child_timeout_fires_before_a_longer_parent_timeout() {
    let mut settings = protection_core::settings::TimeoutSettings::default();
    settings.agent_total = Duration::from_secs(5);
    settings.llm_call = Duration::from_millis(30);
    let handler = TimeoutHandler::new(settings);

    let agent_context = TimeoutContext::root("agent_execution", Duration::from_secs(5));

    let result = handler
        .with_llm_timeout(Some(&agent_context), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "should not get here"
        })
        .await;

    assert!(result.is_err(), "the 30ms llm_call budget should fire well before the 5s agent budget");
}
