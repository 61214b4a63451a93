//! Hierarchical timeout management for agent operations.
//!
//! [`TimeoutHandler`] wraps a future with [`tokio::time::timeout`] and
//! records its outcome regardless of how the wrapped future resolves. A
//! call tree built from nested [`TimeoutContext`]s can never outlive its
//! outermost deadline: each child context is capped to its parent's
//! remaining budget before the timeout fires.
//!
//! Independent of that per-operation budget, every call is also raced
//! against `settings.emergency_shutdown` — a separate, longer cap. An
//! operation that is somehow still running once its emergency cap elapses
//! (its own ordinary timeout failed to bound it) triggers an emergency
//! shutdown: every other active context for that operation name (or every
//! context at all, for `"all"`) is force-cancelled, mirroring the
//! runaway-process circuit breaker the Python implementation calls an
//! "emergency shutdown".
//!
//! # Example
//!
//! ```
//! use protection_core::settings::TimeoutSettings;
//! use protection_timeout::TimeoutHandler;
//!
//! # async fn example() {
//! let handler = TimeoutHandler::new(TimeoutSettings::default());
//! let result = handler.with_agent_timeout(async { 42 }).await;
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```

mod context;
mod events;

pub use context::TimeoutContext;
pub use events::TimeoutEvent;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use protection_core::settings::TimeoutSettings;
use protection_core::{EventListeners, ProtectionError};

/// Aggregated timing statistics for one operation name.
#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    /// Completed or timed-out calls recorded for this operation.
    pub count: u64,
    /// How many of those calls timed out.
    pub timeouts: u64,
    /// Running average duration, in seconds.
    pub avg_duration_secs: f64,
    /// Longest duration observed, in seconds.
    pub max_duration_secs: f64,
}

impl OperationStats {
    fn record(&mut self, duration: Duration, timed_out: bool) {
        self.count += 1;
        if timed_out {
            self.timeouts += 1;
        }
        let secs = duration.as_secs_f64();
        self.avg_duration_secs += (secs - self.avg_duration_secs) / self.count as f64;
        if secs > self.max_duration_secs {
            self.max_duration_secs = secs;
        }
    }
}

/// Snapshot of the handler's lifetime statistics, surfaced on the
/// protection health endpoint.
#[derive(Debug, Clone)]
pub struct TimeoutStatistics {
    /// Total operations recorded, successful or not.
    pub total_operations: u64,
    /// Total timeouts triggered.
    pub timeouts_triggered: u64,
    /// Fraction of operations that timed out, in `[0, 1]`.
    pub timeout_rate: f64,
    /// Number of operations currently in flight.
    pub active_operations: u64,
    /// Number of emergency shutdowns triggered in this handler's lifetime.
    pub emergency_shutdowns: u64,
    /// Per-operation-name breakdown.
    pub by_operation: HashMap<String, OperationStats>,
}

/// A registered in-flight call, reachable so an emergency shutdown for its
/// operation name (or `"all"`) can force-cancel it.
struct ActiveContext {
    operation: String,
    cancel: watch::Sender<bool>,
}

struct Inner {
    stats: Mutex<HashMap<String, OperationStats>>,
    active: AtomicU64,
    total_operations: AtomicU64,
    timeouts_triggered: AtomicU64,
    emergency_shutdowns: AtomicU64,
    active_contexts: Mutex<HashMap<u64, ActiveContext>>,
    next_context_id: AtomicU64,
}

/// Hierarchical, stats-tracking timeout enforcer.
pub struct TimeoutHandler {
    settings: TimeoutSettings,
    event_listeners: EventListeners<TimeoutEvent>,
    inner: Inner,
}

/// Above this many emergency shutdowns in the process lifetime, a critical
/// alert is raised per `spec.md` §4.4.
const CRITICAL_ALERT_THRESHOLD: u64 = 5;

/// How one [`TimeoutHandler::run`] call resolved.
enum RunOutcome<T> {
    Finished(Result<T, tokio::time::error::Elapsed>),
    EmergencyCapExceeded,
    ForceCancelled,
}

impl TimeoutHandler {
    /// Creates a handler using `settings`' default durations for
    /// operations that don't specify their own.
    pub fn new(settings: TimeoutSettings) -> Self {
        Self {
            settings,
            event_listeners: EventListeners::new(),
            inner: Inner {
                stats: Mutex::new(HashMap::new()),
                active: AtomicU64::new(0),
                total_operations: AtomicU64::new(0),
                timeouts_triggered: AtomicU64::new(0),
                emergency_shutdowns: AtomicU64::new(0),
                active_contexts: Mutex::new(HashMap::new()),
                next_context_id: AtomicU64::new(0),
            },
        }
    }

    /// Attaches an event listener set, replacing any previously configured.
    pub fn with_event_listeners(mut self, listeners: EventListeners<TimeoutEvent>) -> Self {
        self.event_listeners = listeners;
        self
    }

    /// Runs `fut` to completion, until `context`'s deadline elapses, or
    /// until the operation's emergency cap elapses, whichever comes
    /// first, recording the outcome either way.
    ///
    /// The emergency cap (`settings.emergency_shutdown`) is independent of
    /// `context`'s own budget and strictly longer by configuration
    /// validation: it exists as a backstop for an operation that somehow
    /// outlives its ordinary timeout, not as the common case. Tripping it
    /// force-cancels every other active context for the same operation
    /// name (or, for `"all"`, every active context).
    pub async fn run<F, T>(&self, context: &TimeoutContext, fut: F) -> Result<T, ProtectionError>
    where
        F: Future<Output = T>,
    {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let context_id = self.inner.next_context_id.fetch_add(1, Ordering::SeqCst);
        self.inner.active_contexts.lock().expect("timeout active-context mutex poisoned").insert(
            context_id,
            ActiveContext {
                operation: context.operation().to_string(),
                cancel: cancel_tx,
            },
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(context.remaining(), fut) => RunOutcome::Finished(result),
            _ = tokio::time::sleep(self.settings.emergency_shutdown) => RunOutcome::EmergencyCapExceeded,
            _ = cancel_rx.changed() => RunOutcome::ForceCancelled,
        };

        self.inner
            .active_contexts
            .lock()
            .expect("timeout active-context mutex poisoned")
            .remove(&context_id);
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.total_operations.fetch_add(1, Ordering::SeqCst);
        let duration = start.elapsed();

        match outcome {
            RunOutcome::Finished(Ok(value)) => {
                self.record(context.operation(), duration, false);
                self.event_listeners.emit(&TimeoutEvent::Completed {
                    operation: context.operation().to_string(),
                    duration,
                    timestamp: Instant::now(),
                });
                Ok(value)
            }
            RunOutcome::Finished(Err(_elapsed)) => {
                self.record(context.operation(), duration, true);
                self.inner.timeouts_triggered.fetch_add(1, Ordering::SeqCst);
                self.event_listeners.emit(&TimeoutEvent::TimedOut {
                    operation: context.operation().to_string(),
                    duration,
                    limit: context.duration(),
                    timestamp: Instant::now(),
                });
                Err(ProtectionError::OperationTimeout {
                    operation: context.operation().to_string(),
                    duration: context.duration(),
                })
            }
            RunOutcome::EmergencyCapExceeded => {
                self.record(context.operation(), duration, true);
                self.inner.timeouts_triggered.fetch_add(1, Ordering::SeqCst);
                self.trigger_emergency_shutdown(context.operation(), "operation exceeded the emergency cap");
                Err(ProtectionError::OperationTimeout {
                    operation: context.operation().to_string(),
                    duration: self.settings.emergency_shutdown,
                })
            }
            RunOutcome::ForceCancelled => {
                self.record(context.operation(), duration, true);
                self.inner.timeouts_triggered.fetch_add(1, Ordering::SeqCst);
                Err(ProtectionError::OperationTimeout {
                    operation: context.operation().to_string(),
                    duration: context.duration(),
                })
            }
        }
    }

    /// Runs `fut` under a freshly created root context named `operation`,
    /// using `duration` or, if `None`, the settings default for that name.
    pub async fn with_timeout<F, T>(
        &self,
        operation: impl Into<String>,
        duration: Option<Duration>,
        fut: F,
    ) -> Result<T, ProtectionError>
    where
        F: Future<Output = T>,
    {
        let operation = operation.into();
        let duration = duration.unwrap_or_else(|| self.default_duration(&operation));
        let context = TimeoutContext::root(operation, duration);
        self.run(&context, fut).await
    }

    /// Runs `fut` under the top-level, whole-agent-run budget.
    pub async fn with_agent_timeout<F, T>(&self, fut: F) -> Result<T, ProtectionError>
    where
        F: Future<Output = T>,
    {
        let context = TimeoutContext::root("agent_execution", self.settings.agent_total);
        self.run(&context, fut).await
    }

    /// Runs `fut` under a per-phase budget, capped to `parent`'s remaining
    /// time if given.
    pub async fn with_phase_timeout<F, T>(
        &self,
        phase_name: &str,
        parent: Option<&TimeoutContext>,
        fut: F,
    ) -> Result<T, ProtectionError>
    where
        F: Future<Output = T>,
    {
        let operation = format!("agent_phase_{phase_name}");
        let context = match parent {
            Some(parent) => parent.child(operation, self.settings.agent_phase),
            None => TimeoutContext::root(operation, self.settings.agent_phase),
        };
        self.run(&context, fut).await
    }

    /// Runs `fut` under the per-LLM-call budget, capped to `parent`'s
    /// remaining time if given.
    pub async fn with_llm_timeout<F, T>(
        &self,
        parent: Option<&TimeoutContext>,
        fut: F,
    ) -> Result<T, ProtectionError>
    where
        F: Future<Output = T>,
    {
        let context = match parent {
            Some(parent) => parent.child("llm_call", self.settings.llm_call),
            None => TimeoutContext::root("llm_call", self.settings.llm_call),
        };
        self.run(&context, fut).await
    }

    /// Number of emergency shutdowns triggered in this handler's lifetime.
    pub fn emergency_shutdowns(&self) -> u64 {
        self.inner.emergency_shutdowns.load(Ordering::SeqCst)
    }

    /// Whether the handler has ever triggered an emergency shutdown.
    /// Callers can use this to refuse new work until an operator
    /// intervenes.
    pub fn is_emergency(&self) -> bool {
        self.emergency_shutdowns() > 0
    }

    /// Force-cancels every active context matching `operation` (or every
    /// active context, for `"all"`) and records the emergency shutdown.
    fn trigger_emergency_shutdown(&self, operation: &str, reason: &str) {
        let total = self.inner.emergency_shutdowns.fetch_add(1, Ordering::SeqCst) + 1;

        let cancelled = {
            let active = self.inner.active_contexts.lock().expect("timeout active-context mutex poisoned");
            let mut cancelled = 0u64;
            for entry in active.values() {
                if entry.operation == operation || operation == "all" {
                    let _ = entry.cancel.send(true);
                    cancelled += 1;
                }
            }
            cancelled
        };

        self.event_listeners.emit(&TimeoutEvent::EmergencyShutdown {
            operation: operation.to_string(),
            reason: reason.to_string(),
            total_shutdowns: total,
            cancelled_contexts: cancelled,
            timestamp: Instant::now(),
        });

        #[cfg(feature = "tracing")]
        if total >= CRITICAL_ALERT_THRESHOLD {
            tracing::error!(total_shutdowns = total, "repeated emergency shutdowns, system may be unstable");
        }
    }

    fn record(&self, operation: &str, duration: Duration, timed_out: bool) {
        let mut stats = self.inner.stats.lock().expect("timeout stats mutex poisoned");
        stats.entry(operation.to_string()).or_default().record(duration, timed_out);
    }

    fn default_duration(&self, operation: &str) -> Duration {
        let lower = operation.to_lowercase();
        if lower.contains("llm") {
            self.settings.llm_call
        } else if lower.contains("phase") {
            self.settings.agent_phase
        } else if lower.contains("agent") {
            self.settings.agent_total
        } else {
            self.settings.agent_phase
        }
    }

    /// Returns a point-in-time snapshot of this handler's statistics.
    pub fn statistics(&self) -> TimeoutStatistics {
        let by_operation = self.inner.stats.lock().expect("timeout stats mutex poisoned").clone();
        let total_operations = self.inner.total_operations.load(Ordering::SeqCst);
        let timeouts_triggered = self.inner.timeouts_triggered.load(Ordering::SeqCst);
        let timeout_rate = if total_operations > 0 {
            timeouts_triggered as f64 / total_operations as f64
        } else {
            0.0
        };
        TimeoutStatistics {
            total_operations,
            timeouts_triggered,
            timeout_rate,
            active_operations: self.inner.active.load(Ordering::SeqCst),
            emergency_shutdowns: self.inner.emergency_shutdowns.load(Ordering::SeqCst),
            by_operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_settings() -> TimeoutSettings {
        TimeoutSettings {
            agent_total: Duration::from_millis(200),
            agent_phase: Duration::from_millis(80),
            llm_call: Duration::from_millis(20),
            emergency_shutdown: Duration::from_millis(400),
        }
    }

    #[tokio::test]
    async fn completes_within_budget() {
        let handler = TimeoutHandler::new(fast_settings());
        let result = handler.with_llm_timeout(None, async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(handler.statistics().total_operations, 1);
        assert_eq!(handler.statistics().timeouts_triggered, 0);
    }

    #[tokio::test]
    async fn exceeding_budget_times_out() {
        let handler = TimeoutHandler::new(fast_settings());
        let result = handler
            .with_llm_timeout(None, async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await;
        assert!(!result.unwrap_err().is_dependency_unavailable());
        assert_eq!(handler.statistics().timeouts_triggered, 1);
    }

    #[tokio::test]
    async fn phase_is_capped_to_parent_remaining() {
        let handler = TimeoutHandler::new(fast_settings());
        let parent = TimeoutContext::root("agent_execution", Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = handler
            .with_phase_timeout("ingest", Some(&parent), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ordinary_timeouts_alone_never_trigger_emergency_shutdown() {
        let handler = TimeoutHandler::new(fast_settings());
        for _ in 0..10 {
            let _ = handler
                .with_llm_timeout(None, async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .await;
        }
        assert!(!handler.is_emergency());
        assert_eq!(handler.emergency_shutdowns(), 0);
        assert_eq!(handler.statistics().timeouts_triggered, 10);
    }

    #[tokio::test]
    async fn exceeding_the_emergency_cap_triggers_shutdown_and_cancels_siblings() {
        let settings = TimeoutSettings {
            agent_total: Duration::from_secs(10),
            agent_phase: Duration::from_secs(5),
            llm_call: Duration::from_secs(5),
            emergency_shutdown: Duration::from_millis(40),
        };
        let handler = Arc::new(TimeoutHandler::new(settings));

        let runaway = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .with_llm_timeout(None, std::future::pending::<()>())
                    .await
            })
        };
        // Started after `runaway` but before its own 40ms emergency cap
        // would elapse, so it should be force-cancelled by `runaway`'s
        // watchdog rather than tripping its own.
        tokio::time::sleep(Duration::from_millis(15)).await;
        let sibling = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .with_llm_timeout(None, std::future::pending::<()>())
                    .await
            })
        };

        let (runaway_result, sibling_result) = tokio::join!(runaway, sibling);
        assert!(runaway_result.unwrap().is_err());
        assert!(sibling_result.unwrap().is_err());
        assert_eq!(handler.emergency_shutdowns(), 1);
        assert!(handler.is_emergency());
    }

    #[tokio::test]
    async fn stats_are_recorded_per_operation_name() {
        let handler = TimeoutHandler::new(fast_settings());
        let _ = handler.with_llm_timeout(None, async { 1 }).await;
        let _ = handler.with_llm_timeout(None, async { 2 }).await;
        let stats = handler.statistics();
        let llm_stats = stats.by_operation.get("llm_call").unwrap();
        assert_eq!(llm_stats.count, 2);
        assert_eq!(llm_stats.timeouts, 0);
    }
}
