//! Concurrent step groups.

use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinError;
use tracing::error;

use crate::context::RunContext;
use crate::error::StepError;
use crate::executor::{StepReport, execute_step, record_result};
use crate::step::{Outcome, Step, StepResult};

/// Runs `group` in parallel, each step after its own delay, and returns
/// the reports in completion order once every step has finished.
pub(crate) async fn run_group(ctx: &RunContext, group: Vec<(usize, Step)>) -> Vec<StepReport> {
    let mut tasks: FuturesUnordered<_> = group
        .into_iter()
        .map(|(step_id, step)| {
            let worker = ctx.clone();
            let task_step = step.clone();
            let handle = tokio::spawn(async move {
                execute_step(&worker, &task_step, step_id, task_step.delay).await
            });
            async move { (step_id, step, handle.await) }
        })
        .collect();

    let mut reports = Vec::new();
    while let Some((step_id, step, joined)) = tasks.next().await {
        let report = match joined {
            Ok(report) => report,
            Err(err) => crashed(ctx, step_id, &step, &err).await,
        };
        reports.push(report);
    }
    reports
}

async fn crashed(ctx: &RunContext, step_id: usize, step: &Step, err: &JoinError) -> StepReport {
    error!(step = step_id, name = %step.name, error = %err, "concurrent step task crashed");
    let failure = StepError::Unexpected(err.to_string());
    let now = Utc::now();
    let instant = tokio::time::Instant::now();
    let result = StepResult {
        step_id,
        name: step.name.clone(),
        outcome: Outcome::Fail,
        started_at: now,
        finished_at: now,
        elapsed: Duration::ZERO,
        started: instant,
        finished: instant,
        log: format!("Failed to run step [{}]: {failure}", step.name),
        structured_data: None,
        tags: step.tags.clone(),
        error: Some(failure.kind()),
    };
    let action_id = record_result(ctx, &result).await;
    StepReport {
        result,
        halts: !step.continue_on_failure,
        aborts: false,
        error: Some(failure),
        action_id,
    }
}
