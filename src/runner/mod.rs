//! Walks a step list: sequential steps one by one, adjacent concurrent
//! steps as a group, and the finalising steps at the end.

mod group;
pub mod session;

use std::io::Write;
use std::time::Duration;

use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::StepErrorKind;
use crate::executor::{StepReport, execute_step, record_result};
use crate::step::{Outcome, Step, StepResult};

/// Lifecycle of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    /// Nothing prepared yet.
    Init,
    /// Devices reserved and the run created.
    Ready,
    /// Steps are being dispatched.
    Running,
    /// A step aborted the run; remaining steps are skipped.
    Aborting,
    /// Post-run and log collection.
    Finalising,
    /// Everything emitted.
    Done,
}

/// Steps of one run, split by phase.
#[derive(Debug, Default)]
pub struct StepPlan {
    /// Test info, pre-run and the test's own steps.
    pub steps: Vec<Step>,
    /// Steps that run after the others whatever happened to them.
    pub finalising: Vec<Step>,
}

/// What happened during a run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Every result, in emission order.
    pub results: Vec<StepResult>,
    /// First failed step, by step number.
    pub failed_step: Option<usize>,
    /// Kind of the error that aborted the run, if any.
    pub aborted_by: Option<StepErrorKind>,
    /// Final state.
    pub state: RunState,
}

impl RunSummary {
    /// Whether the run passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.failed_step.is_none() && self.aborted_by.is_none()
    }

    /// Whether the run was cancelled.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.aborted_by == Some(StepErrorKind::Cancelled)
    }

    /// Looks a result up by name.
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&StepResult> {
        self.results.iter().find(|result| result.name == name)
    }
}

/// Executes step plans, writing one result line per step to `out`.
#[derive(Debug)]
pub struct TestRunner<W> {
    out: W,
    state: RunState,
    results: Vec<StepResult>,
    failed_step: Option<usize>,
    aborted_by: Option<StepErrorKind>,
    halted: bool,
}

impl<W: Write + Send> TestRunner<W> {
    /// Runner writing result lines to `out`.
    #[must_use]
    pub const fn new(out: W) -> Self {
        Self {
            out,
            state: RunState::Ready,
            results: Vec::new(),
            failed_step: None,
            aborted_by: None,
            halted: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Gives the writer back.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Runs `plan` and reports what happened. Steps are numbered from 1 in
    /// declaration order; skipped steps keep their numbers.
    pub async fn run(&mut self, ctx: &RunContext, plan: StepPlan) -> RunSummary {
        self.state = RunState::Running;
        let StepPlan { steps, finalising } = plan;
        let finalising_from = steps.len() + 1;

        let mut pending = steps.into_iter().enumerate().map(|(index, step)| (index + 1, step)).peekable();
        while let Some((step_id, step)) = pending.next() {
            if self.must_skip(ctx) {
                self.skip(ctx, step_id, &step).await;
                continue;
            }
            if step.concurrent {
                let mut members = vec![(step_id, step)];
                while let Some(next) = pending.next_if(|(_, candidate)| candidate.concurrent) {
                    members.push(next);
                }
                info!(size = members.len(), "running concurrent group");
                for report in group::run_group(ctx, members).await {
                    self.absorb(report);
                }
            } else {
                let report = execute_step(ctx, &step, step_id, Duration::ZERO).await;
                self.absorb(report);
            }
        }

        self.state = RunState::Finalising;
        for (offset, step) in finalising.into_iter().enumerate() {
            let step_id = finalising_from + offset;
            if ctx.is_cancelled() {
                self.skip(ctx, step_id, &step).await;
                continue;
            }
            let report = execute_step(ctx, &step, step_id, Duration::ZERO).await;
            self.absorb(report);
        }

        self.state = RunState::Done;
        RunSummary {
            results: std::mem::take(&mut self.results),
            failed_step: self.failed_step,
            aborted_by: self.aborted_by,
            state: self.state,
        }
    }

    fn must_skip(&mut self, ctx: &RunContext) -> bool {
        if ctx.is_cancelled() && self.aborted_by.is_none() {
            self.aborted_by = Some(StepErrorKind::Cancelled);
            self.state = RunState::Aborting;
        }
        self.halted || self.aborted_by.is_some()
    }

    async fn skip(&mut self, ctx: &RunContext, step_id: usize, step: &Step) {
        let result = StepResult::skipped(step_id, step);
        record_result(ctx, &result).await;
        self.emit(&result);
        self.results.push(result);
    }

    fn absorb(&mut self, report: StepReport) {
        self.emit(&report.result);
        if report.result.outcome == Outcome::Fail {
            let step_id = report.result.step_id;
            self.failed_step = Some(self.failed_step.map_or(step_id, |first| first.min(step_id)));
        }
        if report.halts {
            self.halted = true;
        }
        if report.aborts && self.aborted_by.is_none() {
            self.aborted_by = report.error.as_ref().map(crate::error::StepError::kind);
            self.state = RunState::Aborting;
        }
        self.results.push(report.result);
    }

    fn emit(&mut self, result: &StepResult) {
        if let Err(err) = writeln!(self.out, "[{}] {}", result.outcome, result.name) {
            warn!(error = %err, "failed to write result line");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::context::RunSettings;
    use crate::error::StepError;
    use crate::test_support::{RecordingSink, SharedBuffer, bare_context};

    fn failing(name: &str) -> Step {
        Step::new(name, |_ctx| async { Err(StepError::test_failed("boom")) })
    }

    async fn run(steps: Vec<Step>, finalising: Vec<Step>) -> (RunSummary, String, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let ctx = bare_context(RunSettings::default(), Arc::clone(&sink) as _);
        let out = SharedBuffer::new();
        let mut runner = TestRunner::new(out.clone());
        let summary = runner.run(&ctx, StepPlan { steps, finalising }).await;
        (summary, out.contents(), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_groups_drain_before_the_next_step() {
        let started = Instant::now();
        let (summary, lines, _sink) = run(
            vec![
                Step::sleep("A", Duration::from_secs(1)).concurrent(),
                Step::sleep("B", Duration::from_secs(1))
                    .concurrent()
                    .delay(Duration::from_secs(2)),
                Step::noop("C", ""),
            ],
            Vec::new(),
        )
        .await;
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        let a = summary.result("A").expect("A");
        let b = summary.result("B").expect("B");
        let c = summary.result("C").expect("C");
        assert!(c.started >= a.finished.max(b.finished));
        assert_eq!(lines, "[PASS] A\n[PASS] B\n[PASS] C\n");
        assert!(summary.passed());
    }

    #[tokio::test]
    async fn a_failure_skips_the_rest_but_not_the_finalising_steps() {
        let (summary, lines, sink) = run(
            vec![Step::noop("one", ""), failing("two"), Step::noop("three", "")],
            vec![Step::noop("post", "").continue_on_failure()],
        )
        .await;
        assert_eq!(lines, "[PASS] one\n[FAIL] two\n[SKIPPED] three\n[PASS] post\n");
        assert_eq!(summary.failed_step, Some(2));
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(sink.steps().len(), 4);
        let skipped = sink.step("three").expect("saved");
        assert_eq!(skipped.step_id, 3);
    }

    #[tokio::test]
    async fn continue_on_failure_keeps_dispatching() {
        let (summary, lines, _sink) = run(
            vec![failing("flaky").continue_on_failure(), Step::noop("next", "")],
            Vec::new(),
        )
        .await;
        assert_eq!(lines, "[FAIL] flaky\n[PASS] next\n");
        assert_eq!(summary.failed_step, Some(1));
        assert!(!summary.passed());
    }

    #[tokio::test]
    async fn warnings_do_not_fail_the_run() {
        let (summary, lines, _sink) = run(vec![failing("soft").never_fail()], Vec::new()).await;
        assert_eq!(lines, "[WARNING] soft\n");
        assert!(summary.passed());
    }

    #[tokio::test]
    async fn usage_errors_abort_even_with_continue_on_failure() {
        let bad = Step::new("bad", |_ctx| async { Err(StepError::usage("node 9 missing")) })
            .continue_on_failure();
        let (summary, lines, _sink) = run(vec![bad, Step::noop("after", "")], Vec::new()).await;
        assert_eq!(lines, "[FAIL] bad\n[SKIPPED] after\n");
        assert_eq!(summary.aborted_by, Some(StepErrorKind::TestUsage));
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_concurrent_step_halts_after_its_group() {
        let (summary, lines, _sink) = run(
            vec![
                failing("x").concurrent(),
                Step::sleep("y", Duration::from_secs(1)).concurrent(),
                Step::noop("z", ""),
            ],
            Vec::new(),
        )
        .await;
        assert_eq!(lines, "[FAIL] x\n[PASS] y\n[SKIPPED] z\n");
        assert_eq!(summary.failed_step, Some(1));
    }

    #[tokio::test]
    async fn pre_step_lines_are_attached_to_the_first_step() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = bare_context(RunSettings::default(), Arc::clone(&sink) as _);
        ctx.log("setup reserved");
        let mut runner = TestRunner::new(SharedBuffer::new());
        runner
            .run(
                &ctx,
                StepPlan {
                    steps: vec![Step::noop("first", "hi"), Step::noop("second", "")],
                    finalising: Vec::new(),
                },
            )
            .await;
        let first = sink.step("first").expect("first");
        assert!(first.log.starts_with("[pre step 1] ["));
        assert!(first.log.contains("setup reserved"));
        assert!(!sink.step("second").expect("second").log.contains("pre step"));
    }
}
