//! Hierarchical timeout context.

use std::time::{Duration, Instant};

/// A single timeout scope. Children created under a parent are capped to
/// the parent's remaining budget, so a deeply nested call tree can never
/// outlive the outermost deadline.
#[derive(Debug, Clone)]
pub struct TimeoutContext {
    operation: String,
    duration: Duration,
    start: Instant,
}

impl TimeoutContext {
    /// Creates a root context with no parent.
    pub fn root(operation: impl Into<String>, duration: Duration) -> Self {
        Self {
            operation: operation.into(),
            duration,
            start: Instant::now(),
        }
    }

    /// Creates a child context, capping `duration` to the parent's
    /// remaining budget.
    pub fn child(&self, operation: impl Into<String>, duration: Duration) -> Self {
        Self {
            operation: operation.into(),
            duration: duration.min(self.remaining()),
            start: Instant::now(),
        }
    }

    /// The operation name this context was created for.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The budget this context was given.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time elapsed since this context started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time remaining before this context's deadline, floored at zero.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.elapsed())
    }
}
