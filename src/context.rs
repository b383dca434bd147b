//! Per-run state shared by every step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::device::DeviceType;
use crate::error::StepError;
use crate::executor::log;
use crate::fanout::Fanout;
use crate::nodes_data::NodesData;
use crate::registry::DeviceRegistry;
use crate::sink::{ActionId, ResultSink, RunId, SetupId, TeamId, require_ctf_data};
use crate::test_args::TestArgs;

/// Default per-step budget.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);
/// Default budget for post-run log collection.
pub const DEFAULT_LOG_COLLECT_TIMEOUT: Duration = Duration::from_secs(300);
/// Default budget for a batch of file copies.
pub const DEFAULT_SCP_TIMEOUT: Duration = Duration::from_secs(180);
/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 10;
/// How long a cancelled action may keep running to clean up.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Timing and sizing knobs of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSettings {
    /// Budget of a step without its own timeout.
    pub step_timeout: Duration,
    /// Budget of the log collection step.
    pub log_collect_timeout: Duration,
    /// Budget of a batch of file copies.
    pub scp_timeout: Duration,
    /// Worker pool size.
    pub max_workers: usize,
    /// Overall budget of the run; steps never outlive it.
    pub run_budget: Option<Duration>,
    /// How long a cancelled action may keep running.
    pub cancel_grace: Duration,
    /// Where collected logs are kept; a temporary directory when `None`.
    pub store_logs_locally: Option<Utf8PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            log_collect_timeout: DEFAULT_LOG_COLLECT_TIMEOUT,
            scp_timeout: DEFAULT_SCP_TIMEOUT,
            max_workers: DEFAULT_MAX_WORKERS,
            run_budget: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            store_logs_locally: None,
        }
    }
}

/// Bounded pool of device work slots shared by fanout and file transfer.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool with `size` slots (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let slots = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(slots)),
            size: slots,
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Cancelled`] when `cancel` fires first or the
    /// pool no longer accepts work.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, StepError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StepError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| StepError::Cancelled)
            }
        }
    }

    /// Stops handing out slots; waiters and later callers get `Cancelled`.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Identity of a run on the result server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunIdentity {
    /// Run id returned by `create_run`.
    pub run_id: RunId,
    /// Owning team.
    pub team_id: TeamId,
    /// Reserved setup.
    pub setup_id: SetupId,
    /// Replay index within the worker.
    pub run_index: u32,
    /// Parent action when nested under an outer worker.
    pub parent_action: Option<ActionId>,
}

#[derive(Debug)]
struct RunShared {
    identity: RunIdentity,
    started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    pool: WorkerPool,
    settings: RunSettings,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn ResultSink>,
    test_args: TestArgs,
    nodes_data: NodesData,
    fanout_type: DeviceType,
    pre_step: Mutex<Vec<String>>,
    steps_started: AtomicBool,
}

/// Handle to the run, threaded through every step action.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone, Debug)]
pub struct RunContext {
    inner: Arc<RunShared>,
}

/// Ingredients of a [`RunContext`].
#[derive(Debug)]
pub struct RunContextParts {
    /// Server-side identity.
    pub identity: RunIdentity,
    /// Timing and sizing knobs.
    pub settings: RunSettings,
    /// Reserved devices.
    pub registry: Arc<DeviceRegistry>,
    /// Result store.
    pub sink: Arc<dyn ResultSink>,
    /// Resolved test arguments.
    pub test_args: TestArgs,
    /// Composed nodes data.
    pub nodes_data: NodesData,
    /// Run-wide cancellation.
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Builds the context; the worker pool is sized from the settings.
    #[must_use]
    pub fn new(parts: RunContextParts) -> Self {
        let pool = WorkerPool::new(parts.settings.max_workers);
        Self {
            inner: Arc::new(RunShared {
                identity: parts.identity,
                started_at: Utc::now(),
                started: Instant::now(),
                cancel: parts.cancel,
                pool,
                settings: parts.settings,
                registry: parts.registry,
                sink: parts.sink,
                test_args: parts.test_args,
                nodes_data: parts.nodes_data,
                fanout_type: DeviceType::RadioNode,
                pre_step: Mutex::new(Vec::new()),
                steps_started: AtomicBool::new(false),
            }),
        }
    }

    /// Server-side identity of the run.
    #[must_use]
    pub fn identity(&self) -> RunIdentity {
        self.inner.identity
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.inner.identity.run_id
    }

    /// Wall-clock start of the run.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Run-wide cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Whether the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Shared worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Timing and sizing knobs.
    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    /// Reserved devices.
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// Result store.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.inner.sink
    }

    /// Resolved test arguments.
    #[must_use]
    pub fn test_args(&self) -> &TestArgs {
        &self.inner.test_args
    }

    /// Composed nodes data.
    #[must_use]
    pub fn nodes_data(&self) -> &NodesData {
        &self.inner.nodes_data
    }

    /// Device type targeted by broadcasts without explicit nodes.
    #[must_use]
    pub fn fanout_type(&self) -> DeviceType {
        self.inner.fanout_type
    }

    /// Command fanout bound to this run.
    #[must_use]
    pub fn fanout(&self) -> Fanout {
        Fanout::new(self.clone())
    }

    /// Remaining run budget, or `None` when the run is unbounded.
    #[must_use]
    pub fn remaining_budget(&self) -> Option<Duration> {
        self.inner
            .settings
            .run_budget
            .map(|budget| budget.saturating_sub(self.inner.started.elapsed()))
    }

    /// Timeout for one device command: `requested` (or the step default),
    /// never beyond the current step's deadline.
    #[must_use]
    pub fn command_timeout(&self, requested: Option<Duration>) -> Duration {
        let wanted = requested.unwrap_or(self.inner.settings.step_timeout);
        log::remaining_in_step().map_or(wanted, |left| wanted.min(left))
    }

    /// Appends a timestamped line to the current step's log.
    ///
    /// Outside a step the line is kept for the first step, prefixed with
    /// `[pre step 1]`, until steps have started.
    pub fn log(&self, message: &str) {
        info!(run_id = self.run_id(), "{message}");
        let line = log::stamp(message);
        if log::append(&line) || self.inner.steps_started.load(Ordering::SeqCst) {
            return;
        }
        self.inner
            .pre_step
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("[pre step 1] {line}"));
    }

    /// Sleeps for `duration`, waking early on cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Cancelled`] when the run is cancelled.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.inner.cancel.cancelled() => Err(StepError::Cancelled),
        }
    }

    /// Attaches structured data to the current step.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::DeviceConfig`] when `data` lacks the `ctf_data`
    /// key, and [`StepError::TestUsage`] outside a step.
    pub fn save_json(&self, data: Value) -> Result<(), StepError> {
        require_ctf_data(&data).map_err(|err| StepError::device_config(err.to_string()))?;
        if log::attach_data(data) {
            Ok(())
        } else {
            Err(StepError::usage("structured data can only be saved inside a step"))
        }
    }

    /// Retries `op` until it succeeds or `total` elapses. See
    /// [`crate::retry::try_until_timeout`].
    ///
    /// # Errors
    ///
    /// Returns the last error once the budget is spent, or
    /// [`StepError::Cancelled`].
    pub async fn try_until_timeout<T, F, Fut>(
        &self,
        interval: Duration,
        total: Duration,
        op: F,
    ) -> Result<T, StepError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, StepError>> + Send,
    {
        crate::retry::try_until_timeout(&self.inner.cancel, interval, total, op).await
    }

    /// Marks steps as started and returns the lines logged before that.
    pub(crate) fn take_pre_step_log(&self) -> Vec<String> {
        self.inner.steps_started.store(true, Ordering::SeqCst);
        std::mem::take(
            &mut *self
                .inner
                .pre_step
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, bare_context};

    fn context(settings: RunSettings) -> RunContext {
        bare_context(settings, Arc::new(RecordingSink::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_early_on_cancel() {
        let ctx = context(RunSettings::default());
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(60)).await;
        assert_eq!(result, Err(StepError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn pool_refuses_work_after_cancel() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        let held = pool.acquire(&cancel).await.expect("first slot");
        cancel.cancel();
        assert_eq!(pool.acquire(&cancel).await.err(), Some(StepError::Cancelled));
        drop(held);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn pool_with_free_slots_refuses_work_after_cancel() {
        let pool = WorkerPool::new(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        for _ in 0..50 {
            assert_eq!(pool.acquire(&cancel).await.err(), Some(StepError::Cancelled));
        }
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn closed_pool_rejects_callers() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
        pool.close();
        let result = pool.acquire(&CancellationToken::new()).await;
        assert_eq!(result.err(), Some(StepError::Cancelled));
    }

    #[tokio::test]
    async fn lines_logged_before_steps_go_to_the_first_step() {
        let ctx = context(RunSettings::default());
        ctx.log("reserved setup 1");
        let lines = ctx.take_pre_step_log();
        assert_eq!(lines.len(), 1);
        assert!(lines.first().expect("line").starts_with("[pre step 1] ["));
        ctx.log("after steps started");
        assert!(ctx.take_pre_step_log().is_empty());
    }

    #[test]
    fn save_json_requires_ctf_data() {
        let ctx = context(RunSettings::default());
        let err = ctx
            .save_json(serde_json::json!({"rssi": 1}))
            .expect_err("missing key");
        assert_eq!(err.kind(), crate::error::StepErrorKind::DeviceConfig);
    }

    #[test]
    fn unbounded_runs_have_no_budget() {
        let ctx = context(RunSettings::default());
        assert!(ctx.remaining_budget().is_none());
        assert_eq!(ctx.command_timeout(None), DEFAULT_STEP_TIMEOUT);
        assert_eq!(
            ctx.command_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }
}
