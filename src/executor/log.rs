//! Task-local log scope of the step being executed.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;

tokio::task_local! {
    static STEP_SCOPE: std::sync::Arc<StepScope>;
}

/// Log buffer and deadline of one executing step.
#[derive(Debug, Default)]
pub(crate) struct StepScope {
    lines: Mutex<Vec<String>>,
    data: Mutex<Option<Value>>,
    deadline: Mutex<Option<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StepScope {
    pub(crate) fn push(&self, line: String) {
        lock(&self.lines).push(line);
    }

    pub(crate) fn extend(&self, lines: Vec<String>) {
        lock(&self.lines).extend(lines);
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        *lock(&self.deadline) = Some(deadline);
    }

    pub(crate) fn text(&self) -> String {
        lock(&self.lines).join("\n")
    }

    pub(crate) fn take_data(&self) -> Option<Value> {
        lock(&self.data).take()
    }

    fn remaining(&self) -> Option<Duration> {
        lock(&self.deadline).map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Runs `future` with `scope` as the current step scope.
pub(crate) async fn scoped<F: std::future::Future>(
    scope: std::sync::Arc<StepScope>,
    future: F,
) -> F::Output {
    STEP_SCOPE.scope(scope, future).await
}

/// Prefixes `message` with the current UTC time.
pub(crate) fn stamp(message: &str) -> String {
    format!("[{}] {message}", Utc::now().format("%Y-%m-%dT%H:%M:%S"))
}

/// Appends a line to the current step; `false` outside a step.
pub(crate) fn append(line: &str) -> bool {
    STEP_SCOPE
        .try_with(|scope| scope.push(line.to_owned()))
        .is_ok()
}

/// Attaches structured data to the current step; `false` outside a step.
pub(crate) fn attach_data(data: Value) -> bool {
    STEP_SCOPE
        .try_with(move |scope| *lock(&scope.data) = Some(data))
        .is_ok()
}

/// Time left before the current step's deadline.
pub(crate) fn remaining_in_step() -> Option<Duration> {
    STEP_SCOPE.try_with(|scope| scope.remaining()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn lines_land_in_the_active_scope_only() {
        assert!(!append("outside"));
        let scope = Arc::new(StepScope::default());
        scoped(Arc::clone(&scope), async {
            assert!(append("first"));
            assert!(append("second"));
        })
        .await;
        assert_eq!(scope.text(), "first\nsecond");
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_counts_down_to_the_deadline() {
        let scope = Arc::new(StepScope::default());
        scope.set_deadline(Instant::now() + Duration::from_secs(10));
        let left = scoped(Arc::clone(&scope), async {
            tokio::time::sleep(Duration::from_secs(4)).await;
            remaining_in_step()
        })
        .await;
        assert_eq!(left, Some(Duration::from_secs(6)));
        assert_eq!(remaining_in_step(), None);
    }

    #[test]
    fn stamps_use_second_precision() {
        let line = stamp("hello");
        assert!(line.ends_with("] hello"));
        assert_eq!(line.find(']'), Some(20));
    }
}
