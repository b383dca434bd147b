//! Steps and their results.
//!
//! A [`Step`] is a value: a name, an async action and the scheduling flags
//! the runner honours. Tests produce ordered lists of steps; the runner
//! turns each into exactly one [`StepResult`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::context::RunContext;
use crate::device::NodeId;
use crate::error::{StepError, StepErrorKind};
use crate::fanout::CommandSpec;

/// Future returned by a step action.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'static>>;

/// Callable invoked with the run context when the step executes.
pub type StepAction = Arc<dyn Fn(RunContext) -> StepFuture + Send + Sync>;

/// Final outcome of a step.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Outcome {
    /// The action succeeded.
    Pass,
    /// The action failed.
    Fail,
    /// The step never ran.
    Skipped,
    /// The action failed but the step is marked `never_fail`.
    Warning,
}

impl Outcome {
    /// Wire code: `0` success, `1` failure, `16` warning. Skipped steps
    /// are reported as failures.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail | Self::Skipped => 1,
            Self::Warning => 16,
        }
    }

    /// Label used in result lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIPPED",
            Self::Warning => "WARNING",
        }
    }

    /// Whether the outcome counts against the run.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Fail)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Free-form tag attached to a step result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Tag {
    /// Tag text.
    pub description: String,
    /// Severity or grouping level.
    pub level: u8,
}

impl Tag {
    /// Builds a level-0 tag.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            level: 0,
        }
    }
}

/// One unit of work in a test.
#[derive(Clone)]
pub struct Step {
    /// Name shown to operators.
    pub name: String,
    /// Action invoked with the run context.
    pub action: StepAction,
    /// Logged when the step passes.
    pub success_message: Option<String>,
    /// Per-step budget; the run default applies when `None`.
    pub timeout: Option<Duration>,
    /// Keep scheduling later steps when this one fails.
    pub continue_on_failure: bool,
    /// Invert pass and fail.
    pub negate_result: bool,
    /// Run alongside the adjacent concurrent steps.
    pub concurrent: bool,
    /// Wait before starting; honoured only for concurrent steps.
    pub delay: Duration,
    /// Wait after the action when the step passed, or when it may fail.
    pub post_delay: Duration,
    /// Report failures as warnings.
    pub never_fail: bool,
    /// Substeps run when the step fails.
    pub error_handler: Vec<Step>,
    /// Tags copied onto the result.
    pub tags: Vec<Tag>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("continue_on_failure", &self.continue_on_failure)
            .field("negate_result", &self.negate_result)
            .field("concurrent", &self.concurrent)
            .field("delay", &self.delay)
            .field("post_delay", &self.post_delay)
            .field("never_fail", &self.never_fail)
            .field("error_handler", &self.error_handler)
            .finish_non_exhaustive()
    }
}

impl Step {
    /// Builds a sequential step around `action`.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(move |ctx| Box::pin(action(ctx))),
            success_message: None,
            timeout: None,
            continue_on_failure: false,
            negate_result: false,
            concurrent: false,
            delay: Duration::ZERO,
            post_delay: Duration::ZERO,
            never_fail: false,
            error_handler: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// A step that does nothing but log `message`.
    pub fn noop(name: impl Into<String>, message: impl Into<String>) -> Self {
        let shared: Arc<str> = Arc::from(message.into());
        Self::new(name, move |ctx| {
            let text = Arc::clone(&shared);
            async move {
                ctx.log(&text);
                Ok(())
            }
        })
    }

    /// A step that sleeps for `duration`, observing cancellation.
    pub fn sleep(name: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, move |ctx| async move { ctx.sleep(duration).await })
    }

    /// A step that runs `spec` on `nodes` (the default targets when `None`)
    /// and fails unless every node succeeds.
    pub fn fanout(name: impl Into<String>, spec: CommandSpec, nodes: Option<Vec<NodeId>>) -> Self {
        let shared_spec = Arc::new(spec);
        let shared_nodes: Option<Arc<[NodeId]>> = nodes.map(Arc::from);
        Self::new(name, move |ctx| {
            let command = Arc::clone(&shared_spec);
            let targets = shared_nodes.clone();
            async move {
                let results = ctx.fanout().run(&command, targets.as_deref(), None)?;
                let collected = crate::fanout::wait_for_cmds(results).await?;
                crate::fanout::require_all_success(&collected)
            }
        })
    }

    /// Sets the per-step budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keeps the run going when this step fails.
    #[must_use]
    pub const fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Inverts the step's outcome.
    #[must_use]
    pub const fn negate(mut self) -> Self {
        self.negate_result = true;
        self
    }

    /// Marks the step as part of a concurrent group.
    #[must_use]
    pub const fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    /// Delays a concurrent step's start.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Waits after the action.
    #[must_use]
    pub const fn post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = delay;
        self
    }

    /// Reports failures as warnings.
    #[must_use]
    pub const fn never_fail(mut self) -> Self {
        self.never_fail = true;
        self
    }

    /// Logs `message` when the step passes.
    #[must_use]
    pub fn success_message(mut self, message: impl Into<String>) -> Self {
        self.success_message = Some(message.into());
        self
    }

    /// Runs `handlers` when the step fails.
    #[must_use]
    pub fn on_error(mut self, handlers: Vec<Self>) -> Self {
        self.error_handler = handlers;
        self
    }

    /// Adds a tag to the result.
    #[must_use]
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }
}

/// Checks that no error-handler substep carries handlers of its own.
///
/// # Errors
///
/// Returns [`StepError::TestUsage`] naming the offending step.
pub fn validate_nesting(steps: &[Step]) -> Result<(), StepError> {
    for step in steps {
        if let Some(handler) = step
            .error_handler
            .iter()
            .find(|handler| !handler.error_handler.is_empty())
        {
            return Err(StepError::usage(format!(
                "error handler '{}' of step '{}' has its own error handler",
                handler.name, step.name
            )));
        }
    }
    Ok(())
}

/// Immutable record of one executed (or skipped) step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    /// 1-based position in the run.
    pub step_id: usize,
    /// Step name.
    pub name: String,
    /// Final outcome.
    pub outcome: Outcome,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Time spent from start to finish on the runtime clock.
    pub elapsed: Duration,
    /// Runtime-clock start, used to order steps relative to each other.
    pub started: tokio::time::Instant,
    /// Runtime-clock end.
    pub finished: tokio::time::Instant,
    /// Captured log text.
    pub log: String,
    /// Data attached with [`RunContext::save_json`].
    pub structured_data: Option<Value>,
    /// Tags copied from the step, plus `skipped` for skipped steps.
    pub tags: Vec<Tag>,
    /// Classification of the failure, if any.
    pub error: Option<StepErrorKind>,
}

impl StepResult {
    /// Result for a step that never ran.
    #[must_use]
    pub fn skipped(step_id: usize, step: &Step) -> Self {
        let now = Utc::now();
        let instant = tokio::time::Instant::now();
        let mut tags = step.tags.clone();
        tags.push(Tag::new("skipped"));
        Self {
            step_id,
            name: step.name.clone(),
            outcome: Outcome::Skipped,
            started_at: now,
            finished_at: now,
            elapsed: Duration::ZERO,
            started: instant,
            finished: instant,
            log: String::new(),
            structured_data: None,
            tags,
            error: None,
        }
    }
}
