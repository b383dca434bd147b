//! One test run end to end.
//!
//! The session reserves the setup, loads its devices, creates the run on
//! the result server, executes the wrapped step list and closes the run.
//! Teardown is always attempted once anything has been acquired; when it
//! fails during preparation the note is appended to the reported error.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

use super::{RunSummary, StepPlan, TestRunner};
use crate::catalog::TestDefinition;
use crate::compose::push_node_configs;
use crate::context::{RunContext, RunContextParts, RunIdentity, RunSettings};
use crate::device::{ConnectionFactory, DeviceType, NodeId, PortPool};
use crate::error::StepErrorKind;
use crate::nodes_data::NodesData;
use crate::registry::DeviceRegistry;
use crate::reservation::{ReservationError, ReservationManager};
use crate::sink::{
    ActionId, NewRun, ResultSink, RunId, RunOutcome, SetupApi, SetupId, SinkError, TeamId,
};
use crate::step::{Outcome, Step, validate_nesting};
use crate::teardown::Teardown;
use crate::test_args::{TestArgs, TestArgsError};
use crate::transfer::collect_logfiles;

const TEST_INFO: &str = "[ Test info ]";
const PRE_RUN: &str = "[ Pre-run ]";
const POST_RUN: &str = "[ Post-run ]";
const COLLECT_LOGS: &str = "[ Collect logs ]";

/// Errors that stop a run before its steps start.
#[derive(Debug, Error)]
pub enum RunError {
    /// The test arguments were rejected.
    #[error(transparent)]
    Arguments(#[from] TestArgsError),
    /// The setup could not be reserved.
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    /// The device list could not be fetched or turned into connections.
    #[error("failed to load test setup devices: {message}")]
    Devices {
        /// What went wrong, plus any teardown note.
        message: String,
    },
    /// The composed nodes data lacks fields the test requires.
    #[error("invalid nodes data: {message}")]
    NodesData {
        /// What went wrong, plus any teardown note.
        message: String,
    },
    /// The result server did not create the run.
    #[error("failed to create test run: {message}")]
    CreateRun {
        /// What went wrong, plus any teardown note.
        message: String,
    },
    /// The test produced an invalid step list.
    #[error("invalid step list: {message}")]
    Plan {
        /// What went wrong, plus any teardown note.
        message: String,
    },
}

impl RunError {
    /// Process exit code: 2 for usage errors, 3 for setup errors.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Arguments(_) | Self::NodesData { .. } | Self::Plan { .. } => 2,
            Self::Reservation(_) | Self::Devices { .. } | Self::CreateRun { .. } => 3,
        }
    }

    /// Classification in the step error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> StepErrorKind {
        match self {
            Self::Reservation(ReservationError::Cancelled { .. }) => StepErrorKind::Cancelled,
            Self::Reservation(ReservationError::Server(_)) | Self::CreateRun { .. } => {
                StepErrorKind::Unexpected
            }
            Self::Devices { .. } => StepErrorKind::DeviceConfig,
            Self::Arguments(_)
            | Self::Reservation(_)
            | Self::NodesData { .. }
            | Self::Plan { .. } => StepErrorKind::TestUsage,
        }
    }
}

/// Services a session talks to.
#[derive(Clone, Debug)]
pub struct Collaborators {
    /// Run and step results.
    pub sink: Arc<dyn ResultSink>,
    /// Reservation and inventory endpoints.
    pub setup_api: Arc<dyn SetupApi>,
    /// Builds device connections from descriptors.
    pub factory: Arc<dyn ConnectionFactory>,
    /// Jump-host ports shared by every run of the process.
    pub port_pool: Arc<PortPool>,
}

/// Wrapper phases the operator asked to skip.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SkipPhases {
    /// Skip the config push and the test's own pre-run steps.
    pub pre_run: bool,
    /// Skip the test's own post-run steps.
    pub post_run: bool,
}

/// Settings inherited from an outer worker driving this process.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkerLink {
    /// The worker owns the reservation.
    pub manages_reservation: bool,
    /// Run created by the worker; no run is created when set.
    pub test_exe_id: Option<RunId>,
    /// Parent action of every saved step.
    pub parent_action: Option<ActionId>,
    /// Replay index within the worker.
    pub run_index: u32,
}

/// Everything needed to start one run.
#[derive(Clone, Debug, Default)]
pub struct RunRequest {
    /// Owning team.
    pub team_id: TeamId,
    /// Setup to reserve.
    pub setup_id: SetupId,
    /// `KEY=VAL` test arguments.
    pub test_args: Vec<String>,
    /// JSON object of test arguments.
    pub json_args: Option<String>,
    /// Operator-supplied nodes data.
    pub nodes_data: NodesData,
    /// Skipped wrapper phases.
    pub skip: SkipPhases,
    /// Timing and sizing knobs.
    pub settings: RunSettings,
    /// Outer worker settings.
    pub worker: WorkerLink,
    /// Command line logged by the test info step.
    pub command_line: String,
}

/// What a finished run reports.
#[derive(Clone, Debug)]
pub struct SessionReport {
    /// Run id on the result server.
    pub run_id: RunId,
    /// Operator-facing link to the run.
    pub url: String,
    /// Step outcomes.
    pub summary: RunSummary,
    /// Teardown failure, if any.
    pub teardown_error: Option<String>,
}

impl SessionReport {
    /// Whether the run passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.summary.passed()
    }

    /// 0 when the run passed, 1 otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

struct Prepared {
    args: TestArgs,
    registry: Arc<DeviceRegistry>,
    nodes_data: NodesData,
    run_id: RunId,
}

/// Runs one test definition.
#[derive(Debug)]
pub struct Session<'a> {
    test: &'a TestDefinition,
    deps: &'a Collaborators,
    teardown: &'a Teardown,
}

impl<'a> Session<'a> {
    /// Session for `test`, tearing down through `teardown`.
    #[must_use]
    pub const fn new(test: &'a TestDefinition, deps: &'a Collaborators, teardown: &'a Teardown) -> Self {
        Self {
            test,
            deps,
            teardown,
        }
    }

    /// Runs the test and writes the result lines to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when the run cannot start. Step failures are
    /// reported in the [`SessionReport`], not as errors.
    pub async fn execute<W: Write + Send>(
        &self,
        request: RunRequest,
        out: &mut W,
    ) -> Result<SessionReport, RunError> {
        let prepared = self.prepare(&request).await?;
        let plan = self.plan(&prepared.args, &prepared.nodes_data, &request);
        if let Err(err) = validate_nesting(&plan.steps).and_then(|()| validate_nesting(&plan.finalising)) {
            return Err(RunError::Plan {
                message: self.abandon(err.to_string()).await,
            });
        }

        let run_id = prepared.run_id;
        let ctx = RunContext::new(RunContextParts {
            identity: RunIdentity {
                run_id,
                team_id: request.team_id,
                setup_id: request.setup_id,
                run_index: request.worker.run_index,
                parent_action: request.worker.parent_action,
            },
            settings: request.settings,
            registry: prepared.registry,
            sink: Arc::clone(&self.deps.sink),
            test_args: prepared.args,
            nodes_data: prepared.nodes_data,
            cancel: self.teardown.cancel_token().clone(),
        });
        ctx.log(&format!(
            "Running test '{}' on test setup {} as run {run_id}",
            self.test.name, request.setup_id
        ));
        info!(run_id, test = %self.test.name, "test run started");

        let summary = TestRunner::new(&mut *out).run(&ctx, plan).await;
        let url = self.finish(&ctx, &summary, out).await;
        let teardown_error = match self.teardown.run().await {
            Ok(()) => None,
            Err(err) => {
                error!(run_id, error = %err, "teardown failed");
                Some(err.to_string())
            }
        };
        Ok(SessionReport {
            run_id,
            url,
            summary,
            teardown_error,
        })
    }

    async fn prepare(&self, request: &RunRequest) -> Result<Prepared, RunError> {
        let args = self
            .test
            .parse_args(&request.test_args, request.json_args.as_deref())?;

        let reservation = Arc::new(
            ReservationManager::new(
                Arc::clone(&self.deps.setup_api),
                request.team_id,
                request.setup_id,
            )
            .externally_managed(request.worker.manages_reservation),
        );
        reservation.acquire().await?;
        self.teardown.attach_reservation(reservation);

        let registry = match self.load_devices(request).await {
            Ok(registry) => Arc::new(registry),
            Err(message) => {
                return Err(RunError::Devices {
                    message: self.abandon(message).await,
                });
            }
        };
        self.teardown.attach_registry(Arc::clone(&registry));

        let radio_nodes: Vec<NodeId> = registry
            .of_type(DeviceType::RadioNode)
            .iter()
            .map(|device| device.node_id)
            .collect();
        let nodes_data = request
            .nodes_data
            .clone()
            .merged(self.test.nodes_data_amend(&args))
            .with_test_arg_amendments(&args, &radio_nodes);
        let required: Vec<&str> = self
            .test
            .required_node_fields
            .iter()
            .map(String::as_str)
            .collect();
        if let Err(err) = nodes_data.require(&required) {
            return Err(RunError::NodesData {
                message: self.abandon(err.to_string()).await,
            });
        }

        let run_id = match self.create_run(request).await {
            Ok(run_id) => run_id,
            Err(err) => {
                return Err(RunError::CreateRun {
                    message: self.abandon(err.to_string()).await,
                });
            }
        };

        Ok(Prepared {
            args,
            registry,
            nodes_data,
            run_id,
        })
    }

    async fn load_devices(&self, request: &RunRequest) -> Result<DeviceRegistry, String> {
        let data = self
            .deps
            .setup_api
            .device_details(request.team_id, request.setup_id)
            .await
            .map_err(|err| err.to_string())?;
        DeviceRegistry::from_server_reply(
            &data,
            self.deps.factory.as_ref(),
            Arc::clone(&self.deps.port_pool),
        )
        .map_err(|err| err.to_string())
    }

    async fn create_run(&self, request: &RunRequest) -> Result<RunId, SinkError> {
        if let Some(run_id) = request.worker.test_exe_id {
            info!(run_id, "reusing run created by the worker");
            return Ok(run_id);
        }
        let run = NewRun {
            name: self.test.name.clone(),
            identifier: self.test.name.clone(),
            description: self.test.description.clone(),
            team_id: request.team_id,
            setup_id: request.setup_id,
        };
        self.deps.sink.create_run(&run).await
    }

    async fn abandon(&self, message: String) -> String {
        let teardown = self.teardown.run().await;
        append_teardown_note(message, teardown.err().as_ref())
    }

    fn plan(&self, args: &TestArgs, nodes_data: &NodesData, request: &RunRequest) -> StepPlan {
        let mut steps = vec![test_info_step(request.command_line.clone())];
        if request.skip.pre_run {
            steps.push(Step::noop(PRE_RUN, "Pre-run was skipped"));
        } else {
            steps.push(pre_run_step(self.test.base_node_config.clone()));
            steps.extend(self.test.pre_run_steps(args, nodes_data));
        }
        steps.extend(self.test.steps(args, nodes_data));

        let mut finalising = Vec::new();
        if request.skip.post_run {
            finalising.push(Step::noop(POST_RUN, "Post-run was skipped").continue_on_failure());
        } else {
            finalising.push(Step::noop(POST_RUN, "Running post-run steps").continue_on_failure());
            finalising.extend(
                self.test
                    .post_run_steps(args, nodes_data)
                    .into_iter()
                    .map(Step::continue_on_failure),
            );
        }
        finalising.push(collect_logs_step(
            self.test.logfiles.clone(),
            request.settings.log_collect_timeout,
        ));
        StepPlan { steps, finalising }
    }

    async fn finish<W: Write>(&self, ctx: &RunContext, summary: &RunSummary, out: &mut W) -> String {
        let run_id = ctx.run_id();
        let verdict = verdict(summary);
        info!(run_id, verdict = %verdict, "test run finished");
        write_line(out, &verdict);

        let url = self.deps.sink.run_url(run_id);
        if let Err(err) = self.deps.sink.finish_run(run_id, &run_outcome(&url, summary)).await {
            warn!(run_id, error = %err, "failed to save run outcome");
        }
        write_line(out, &format!("Test ID {run_id} finished: {url}"));
        url
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    match teardown_error {
        Some(teardown) => format!("{message} (teardown also failed: {teardown})"),
        None => message,
    }
}

fn write_line<W: Write>(out: &mut W, line: &str) {
    if let Err(err) = writeln!(out, "{line}") {
        warn!(error = %err, "failed to write result line");
    }
}

fn verdict(summary: &RunSummary) -> String {
    match (summary.failed_step, summary.aborted_by) {
        (Some(step_id), _) => format!("Test FAILED at step {step_id}"),
        (None, Some(kind)) => format!("Test FAILED: {}", kind.as_str()),
        (None, None) => String::from("Test PASSED"),
    }
}

fn run_outcome(url: &str, summary: &RunSummary) -> RunOutcome {
    let count = |outcome: Outcome| {
        summary
            .results
            .iter()
            .filter(|result| result.outcome == outcome)
            .count()
    };
    RunOutcome {
        dashboard_details: vec![json!({"label": "Test run", "link": url})],
        summary: vec![json!({
            "passed": summary.passed(),
            "failed_step": summary.failed_step,
            "steps": summary.results.len(),
            "pass": count(Outcome::Pass),
            "fail": count(Outcome::Fail),
            "warning": count(Outcome::Warning),
            "skipped": count(Outcome::Skipped),
        })],
    }
}

fn test_info_step(command_line: String) -> Step {
    let shared: Arc<str> = Arc::from(command_line);
    Step::new(TEST_INFO, move |ctx| {
        let line = Arc::clone(&shared);
        async move {
            ctx.log(&format!("Command line: {line}"));
            for device in ctx.registry().list() {
                ctx.log(&format!(
                    "Node {}: {} ({}, {})",
                    device.node_id,
                    device.name,
                    device.device_type,
                    device.address()
                ));
            }
            Ok(())
        }
    })
}

fn pre_run_step(base_config: Option<Value>) -> Step {
    let shared = Arc::new(base_config);
    Step::new(PRE_RUN, move |ctx| {
        let base = Arc::clone(&shared);
        async move {
            let pushed = push_node_configs(&ctx, base.as_ref().as_ref()).await?;
            if pushed.is_empty() {
                ctx.log("No node configs to push");
            }
            Ok(())
        }
    })
}

fn collect_logs_step(logfiles: BTreeMap<DeviceType, Vec<String>>, budget: Duration) -> Step {
    if logfiles.is_empty() {
        return Step::noop(COLLECT_LOGS, "No log files to collect")
            .continue_on_failure()
            .never_fail();
    }
    let shared = Arc::new(logfiles);
    Step::new(COLLECT_LOGS, move |ctx| {
        let wanted = Arc::clone(&shared);
        async move {
            let uploads = collect_logfiles(&ctx, &wanted).await?;
            ctx.log(&format!("Uploaded {} log files", uploads.len()));
            Ok(())
        }
    })
    .timeout(budget)
    .continue_on_failure()
    .never_fail()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::{fixture, rstest};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::StepError;
    use crate::fanout::CommandSpec;
    use crate::test_support::{
        FakeSetupApi, RecordingSink, ScriptedFactory, SharedBuffer, radio_nodes_reply,
    };

    struct Harness {
        sink: Arc<RecordingSink>,
        api: Arc<FakeSetupApi>,
        factory: Arc<ScriptedFactory>,
        deps: Collaborators,
    }

    #[fixture]
    fn harness() -> Harness {
        let sink = Arc::new(RecordingSink::new(77));
        let api = Arc::new(FakeSetupApi::new());
        api.set_devices(radio_nodes_reply(&[1, 2]));
        let factory = Arc::new(ScriptedFactory::new());
        let deps = Collaborators {
            sink: Arc::clone(&sink) as _,
            setup_api: Arc::clone(&api) as _,
            factory: Arc::clone(&factory) as _,
            port_pool: Arc::new(PortPool::new()),
        };
        Harness {
            sink,
            api,
            factory,
            deps,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            team_id: 1,
            setup_id: 5,
            command_line: String::from("ctf run uname"),
            ..RunRequest::default()
        }
    }

    fn uname_test() -> TestDefinition {
        TestDefinition::new("uname", "uname on node 1", |_, _| {
            vec![Step::fanout("uname", CommandSpec::from("uname"), Some(vec![1])).success_message("ok")]
        })
    }

    async fn execute(
        harness: &Harness,
        test: &TestDefinition,
        request: RunRequest,
    ) -> (Result<SessionReport, RunError>, String) {
        let teardown = Teardown::new(CancellationToken::new());
        let mut out = SharedBuffer::new();
        let result = Session::new(test, &harness.deps, &teardown)
            .execute(request, &mut out)
            .await;
        (result, out.contents())
    }

    #[rstest]
    #[tokio::test]
    async fn wraps_the_test_steps(harness: Harness) {
        let (result, lines) = execute(&harness, &uname_test(), request()).await;
        let report = result.expect("run");
        assert!(report.passed());
        assert_eq!(report.run_id, 77);
        assert_eq!(
            lines,
            concat!(
                "[PASS] [ Test info ]\n",
                "[PASS] [ Pre-run ]\n",
                "[PASS] uname\n",
                "[PASS] [ Post-run ]\n",
                "[PASS] [ Collect logs ]\n",
                "Test PASSED\n",
                "Test ID 77 finished: https://ctf.test/test_run_result/77\n",
            )
        );
        let info = harness.sink.step(TEST_INFO).expect("info step");
        assert!(info.log.contains("[pre step 1]"));
        assert!(info.log.contains("Command line: ctf run uname"));
        assert!(info.log.contains("Node 2: node-2"));
        assert_eq!(harness.api.free_calls(), 1);
        assert_eq!(harness.factory.connection(1).close_count(), 1);
        assert_eq!(harness.sink.finished().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn skipped_phases_become_noops(harness: Harness) {
        let mut skipping = request();
        skipping.skip = SkipPhases {
            pre_run: true,
            post_run: true,
        };
        let (result, _lines) = execute(&harness, &uname_test(), skipping).await;
        result.expect("run");
        let pre = harness.sink.step(PRE_RUN).expect("pre-run");
        assert!(pre.log.contains("Pre-run was skipped"));
        let post = harness.sink.step(POST_RUN).expect("post-run");
        assert!(post.log.contains("Post-run was skipped"));
    }

    #[rstest]
    #[tokio::test]
    async fn busy_setups_stop_before_the_run_is_created(harness: Harness) {
        harness.api.set_free_status(false);
        let (result, lines) = execute(&harness, &uname_test(), request()).await;
        let err = result.expect_err("busy");
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.kind(), StepErrorKind::TestUsage);
        assert!(harness.sink.runs().is_empty());
        assert_eq!(harness.api.free_calls(), 0);
        assert!(lines.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn worker_runs_reuse_the_given_run_id(harness: Harness) {
        let mut nested = request();
        nested.worker = WorkerLink {
            manages_reservation: true,
            test_exe_id: Some(4242),
            parent_action: Some(9),
            run_index: 2,
        };
        let (result, lines) = execute(&harness, &uname_test(), nested).await;
        assert_eq!(result.expect("run").run_id, 4242);
        assert!(harness.sink.runs().is_empty());
        assert_eq!(harness.api.busy_calls(), 0);
        assert_eq!(harness.api.free_calls(), 0);
        assert!(lines.contains("Test ID 4242 finished"));
    }

    #[rstest]
    #[tokio::test]
    async fn missing_node_fields_release_the_setup(harness: Harness) {
        let test = uname_test().require_node_fields(&["node_config.envParams"]);
        let (result, _lines) = execute(&harness, &test, request()).await;
        let err = result.expect_err("missing fields");
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("node_config.envParams"));
        assert_eq!(harness.api.free_calls(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn bad_arguments_never_reserve(harness: Harness) {
        let mut bad = request();
        bad.test_args = vec![String::from("warp=9")];
        let (result, _lines) = execute(&harness, &uname_test(), bad).await;
        let err = result.expect_err("unknown argument");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(harness.api.busy_calls(), 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn failures_report_the_failed_step(harness: Harness) {
        let test = TestDefinition::new("flaky", "fails", |_, _| {
            vec![
                Step::new("boom", |_ctx| async { Err(StepError::test_failed("0 received")) }),
                Step::sleep("never", Duration::from_secs(1)),
            ]
        });
        let (result, lines) = execute(&harness, &test, request()).await;
        let report = result.expect("run");
        assert_eq!(report.exit_code(), 1);
        assert!(lines.contains("[FAIL] boom\n[SKIPPED] never\n[PASS] [ Post-run ]\n"));
        assert!(lines.contains("Test FAILED at step 3\n"));
        let (_, outcome) = harness.sink.finished().pop().expect("finished");
        let row = outcome.summary.first().expect("summary row");
        assert_eq!(row.get("skipped"), Some(&json!(1)));
    }

    #[test]
    fn teardown_notes_are_appended() {
        let note = append_teardown_note(String::from("device details missing"), Some(&"timeout"));
        assert_eq!(note, "device details missing (teardown also failed: timeout)");
        assert_eq!(
            append_teardown_note::<String>(String::from("plain"), None),
            "plain"
        );
    }
}
