//! Executes one step: timing, deadline, cancellation, negation, error
//! handlers and result persistence.

pub(crate) mod log;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::StepError;
use crate::sink::{ActionId, StepSubmission};
use crate::step::{Outcome, Step, StepAction, StepResult};

use self::log::StepScope;

/// What the runner needs to know after a step.
#[derive(Clone, Debug)]
pub struct StepReport {
    /// The recorded result.
    pub result: StepResult,
    /// Failure that produced the result, if any.
    pub error: Option<StepError>,
    /// Later steps must be skipped.
    pub halts: bool,
    /// The whole run must stop.
    pub aborts: bool,
    /// Action id assigned by the sink, when saving succeeded.
    pub action_id: Option<ActionId>,
}

/// Runs `step` as step number `step_id`, waiting `delay` first, and saves
/// its result to the run's sink.
pub async fn execute_step(
    ctx: &RunContext,
    step: &Step,
    step_id: usize,
    delay: Duration,
) -> StepReport {
    let scope = Arc::new(StepScope::default());
    scope.extend(ctx.take_pre_step_log());
    let mut report = log::scoped(
        Arc::clone(&scope),
        run_in_scope(ctx, step, step_id, delay, &scope),
    )
    .await;
    report.action_id = save(ctx, &report.result).await;
    report
}

/// Saves an already finished (typically skipped) result.
pub async fn record_result(ctx: &RunContext, result: &StepResult) -> Option<ActionId> {
    save(ctx, result).await
}

async fn save(ctx: &RunContext, result: &StepResult) -> Option<ActionId> {
    let identity = ctx.identity();
    let submission = StepSubmission {
        run_id: identity.run_id,
        result,
        parent_action: identity.parent_action,
        run_index: identity.run_index,
    };
    match ctx.sink().save_step(submission).await {
        Ok(action_id) => Some(action_id),
        Err(err) => {
            warn!(step = result.step_id, name = %result.name, error = %err, "failed to save step result");
            None
        }
    }
}

async fn run_in_scope(
    ctx: &RunContext,
    step: &Step,
    step_id: usize,
    delay: Duration,
    scope: &StepScope,
) -> StepReport {
    if !delay.is_zero() {
        ctx.log(&format!(
            "Delaying step {step_id} {} for {}s",
            step.name,
            delay.as_secs()
        ));
    }
    let delayed = if delay.is_zero() {
        Ok(())
    } else {
        ctx.sleep(delay).await
    };

    let started_at = Utc::now();
    let started = Instant::now();
    debug!(step = step_id, name = %step.name, "step started");

    let raw = match delayed {
        Ok(()) => run_with_deadline(ctx, &step.action, step.timeout, scope).await,
        Err(err) => Err(err),
    };
    let verdict = apply_negation(ctx, step, step_id, raw);

    if let Err(err) = &verdict {
        ctx.log(&format!("Failed to run step [{}]: {err}", step.name));
        if !err.aborts_run() {
            run_error_handlers(ctx, step, step_id, scope).await;
        }
    }

    let outcome = match &verdict {
        Ok(()) => {
            if let Some(message) = &step.success_message {
                ctx.log(message);
            }
            Outcome::Pass
        }
        Err(_) if step.never_fail => Outcome::Warning,
        Err(_) => Outcome::Fail,
    };
    let error = verdict.err();
    let aborts = error.as_ref().is_some_and(StepError::aborts_run);

    let finished = Instant::now();
    let finished_at = Utc::now();
    let may_wait = outcome == Outcome::Pass || step.continue_on_failure || step.never_fail;
    if !step.post_delay.is_zero() && may_wait && !aborts {
        ctx.log(&format!(
            "Waiting for {}s after executing step {step_id} {}",
            step.post_delay.as_secs(),
            step.name
        ));
        if ctx.sleep(step.post_delay).await.is_err() {
            debug!(step = step_id, "post delay cut short by cancellation");
        }
    }

    debug!(step = step_id, outcome = %outcome, "step finished");
    let result = StepResult {
        step_id,
        name: step.name.clone(),
        outcome,
        started_at,
        finished_at,
        elapsed: finished.saturating_duration_since(started),
        started,
        finished,
        log: scope.text(),
        structured_data: scope.take_data(),
        tags: step.tags.clone(),
        error: error.as_ref().map(StepError::kind),
    };
    StepReport {
        halts: outcome == Outcome::Fail && !step.continue_on_failure,
        aborts,
        result,
        error,
        action_id: None,
    }
}

/// Runs `action` under the step deadline, the run budget and the run's
/// cancellation token.
async fn run_with_deadline(
    ctx: &RunContext,
    action: &StepAction,
    timeout: Option<Duration>,
    scope: &StepScope,
) -> Result<(), StepError> {
    let requested = timeout.unwrap_or(ctx.settings().step_timeout);
    let budget = ctx.remaining_budget();
    let limit = budget.map_or(requested, |left| requested.min(left));
    if budget.is_some_and(|left| left.is_zero()) {
        return Err(StepError::DeadlineExceeded { limit });
    }
    let deadline = Instant::now() + limit;
    scope.set_deadline(deadline);

    let work = AssertUnwindSafe(action(ctx.clone())).catch_unwind();
    tokio::pin!(work);
    tokio::select! {
        finished = &mut work => finished.unwrap_or_else(|panic| Err(panic_error(&*panic))),
        () = tokio::time::sleep_until(deadline) => Err(StepError::DeadlineExceeded { limit }),
        () = ctx.cancel_token().cancelled() => {
            if tokio::time::timeout(ctx.settings().cancel_grace, &mut work).await.is_err() {
                debug!("step action outlived the cancel grace period");
            }
            Err(StepError::Cancelled)
        }
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> StepError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("step action panicked"));
    StepError::Unexpected(message)
}

fn apply_negation(
    ctx: &RunContext,
    step: &Step,
    step_id: usize,
    raw: Result<(), StepError>,
) -> Result<(), StepError> {
    if !step.negate_result {
        return raw;
    }
    match raw {
        Err(err) if err.aborts_run() => Err(err),
        Err(err) => {
            ctx.log(&format!("Test step {step_id} result negated ({err})"));
            Ok(())
        }
        Ok(()) => {
            ctx.log(&format!("Test step {step_id} result negated"));
            Err(StepError::test_failed(format!(
                "step '{}' succeeded but its result is negated",
                step.name
            )))
        }
    }
}

async fn run_error_handlers(ctx: &RunContext, step: &Step, step_id: usize, scope: &StepScope) {
    for handler in &step.error_handler {
        ctx.log(&format!("Running error handler [{}]", handler.name));
        if let Err(err) = run_handler(ctx, handler, step_id, scope).await {
            ctx.log(&format!("Error handler [{}] failed: {err}", handler.name));
            if err.aborts_run() {
                break;
            }
        }
    }
}

/// Runs an error handler substep inside its parent's log scope. Delay,
/// deadline, negation and the success message apply; no result is saved.
async fn run_handler(
    ctx: &RunContext,
    handler: &Step,
    step_id: usize,
    scope: &StepScope,
) -> Result<(), StepError> {
    if !handler.delay.is_zero() {
        ctx.sleep(handler.delay).await?;
    }
    let raw = run_with_deadline(ctx, &handler.action, handler.timeout, scope).await;
    let verdict = apply_negation(ctx, handler, step_id, raw);
    if let (Ok(()), Some(message)) = (&verdict, &handler.success_message) {
        ctx.log(message);
    }
    verdict
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::context::RunSettings;
    use crate::error::StepErrorKind;
    use crate::test_support::{RecordingSink, bare_context};

    fn ctx_with(settings: RunSettings) -> (RunContext, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (bare_context(settings, Arc::clone(&sink) as _), sink)
    }

    fn failing(name: &str, error: StepError) -> Step {
        Step::new(name, move |_ctx| {
            let err = error.clone();
            async move { Err(err) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn passing_steps_are_saved_with_their_log() {
        let (ctx, sink) = ctx_with(RunSettings::default());
        let step = Step::noop("greet", "hello").success_message("all good");
        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;
        assert_eq!(report.result.outcome, Outcome::Pass);
        assert!(!report.halts);
        assert_eq!(report.action_id, Some(100));
        let saved = sink.step("greet").expect("saved");
        assert!(saved.log.contains("hello"));
        assert!(saved.log.contains("all good"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_actions_hit_the_step_deadline() {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let step = Step::sleep("slow", Duration::from_secs(30)).timeout(Duration::from_secs(2));
        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;
        assert_eq!(report.result.outcome, Outcome::Fail);
        assert_eq!(report.result.error, Some(StepErrorKind::DeadlineExceeded));
        assert_eq!(report.result.elapsed, Duration::from_secs(2));
        assert!(report.halts);
        assert!(!report.aborts);
    }

    #[rstest]
    #[case(false, false, Outcome::Fail, true)]
    #[case(true, false, Outcome::Fail, false)]
    #[case(false, true, Outcome::Warning, false)]
    #[tokio::test(start_paused = true)]
    async fn failure_flags_shape_the_outcome(
        #[case] continue_on_failure: bool,
        #[case] never_fail: bool,
        #[case] expected: Outcome,
        #[case] halts: bool,
    ) {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let mut step = failing("ping", StepError::test_failed("no reply"));
        step.continue_on_failure = continue_on_failure;
        step.never_fail = never_fail;
        let report = execute_step(&ctx, &step, 2, Duration::ZERO).await;
        assert_eq!(report.result.outcome, expected);
        assert_eq!(report.halts, halts);
        assert!(report.result.log.contains("Failed to run step [ping]"));
    }

    #[tokio::test(start_paused = true)]
    async fn negation_flips_ordinary_outcomes_only() {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let negated_fail = failing("expect-fail", StepError::device_cmd("rc 1")).negate();
        let report = execute_step(&ctx, &negated_fail, 1, Duration::ZERO).await;
        assert_eq!(report.result.outcome, Outcome::Pass);
        assert!(report.result.log.contains("Test step 1 result negated"));

        let negated_pass = Step::noop("expect-pass", "").negate();
        let report = execute_step(&ctx, &negated_pass, 2, Duration::ZERO).await;
        assert_eq!(report.result.outcome, Outcome::Fail);

        let usage = failing("bad", StepError::usage("wrong node")).negate();
        let report = execute_step(&ctx, &usage, 3, Duration::ZERO).await;
        assert_eq!(report.result.outcome, Outcome::Fail);
        assert!(report.aborts);
    }

    #[tokio::test(start_paused = true)]
    async fn error_handlers_run_inline_after_failures() {
        let (ctx, sink) = ctx_with(RunSettings::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handler = Step::new("recover", move |ctx| {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                ctx.log("cleaning up");
                Ok(())
            }
        });
        let step = failing("flaky", StepError::device_cmd("boom")).on_error(vec![handler]);
        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(report.result.outcome, Outcome::Fail);
        assert!(report.result.log.contains("cleaning up"));
        assert_eq!(sink.steps().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_handlers_honour_negation_and_success_messages() {
        let (ctx, sink) = ctx_with(RunSettings::default());
        let link_down = failing("link must be down", StepError::test_failed("link is up"))
            .negate()
            .success_message("link is down as expected");
        let report_step = Step::new("report", |_ctx| async { Ok(()) }).success_message("reported");
        let step =
            failing("flaky", StepError::device_cmd("boom")).on_error(vec![link_down, report_step]);

        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;

        let log = &report.result.log;
        assert_eq!(report.result.outcome, Outcome::Fail);
        assert!(log.contains("Test step 1 result negated"), "{log}");
        assert!(log.contains("link is down as expected"), "{log}");
        assert!(!log.contains("Error handler [link must be down] failed"), "{log}");
        assert!(log.contains("reported"), "{log}");
        assert_eq!(sink.steps().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn post_delay_is_outside_the_step_window() {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let step = Step::sleep("short", Duration::from_secs(1))
            .timeout(Duration::from_secs(2))
            .post_delay(Duration::from_secs(10));
        let started = Instant::now();

        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;

        assert_eq!(started.elapsed(), Duration::from_secs(11));
        assert_eq!(report.result.elapsed, Duration::from_secs(1));
        assert!(report.result.finished < Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn panics_become_unexpected_failures() {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let step = Step::new("explode", |_ctx| async move { panic!("kaboom") });
        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;
        assert_eq!(report.result.error, Some(StepErrorKind::Unexpected));
        assert!(report.result.log.contains("kaboom"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_steps() {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let step = Step::sleep("wait", Duration::from_secs(50)).continue_on_failure();
        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;
        assert_eq!(report.result.error, Some(StepErrorKind::Cancelled));
        assert!(report.aborts);
        assert!(report.result.elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn spent_run_budget_fails_without_running() {
        let settings = RunSettings {
            run_budget: Some(Duration::from_secs(1)),
            ..RunSettings::default()
        };
        let (ctx, _sink) = ctx_with(settings);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let step = Step::new("late", move |_ctx| {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;
        assert_eq!(report.result.error, Some(StepErrorKind::DeadlineExceeded));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_and_post_delays_are_logged() {
        let (ctx, _sink) = ctx_with(RunSettings::default());
        let step = Step::noop("settle", "done").post_delay(Duration::from_secs(3));
        let started = Instant::now();
        let report = execute_step(&ctx, &step, 4, Duration::from_secs(2)).await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(report.result.log.contains("Delaying step 4 settle for 2s"));
        assert!(report.result.log.contains("Waiting for 3s after executing step 4 settle"));
        assert_eq!(report.result.elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn sink_failures_do_not_fail_the_step() {
        let (ctx, sink) = ctx_with(RunSettings::default());
        sink.fail_saves();
        let report = execute_step(&ctx, &Step::noop("quiet", ""), 1, Duration::ZERO).await;
        assert_eq!(report.result.outcome, Outcome::Pass);
        assert_eq!(report.action_id, None);
    }
}
