//! Test support utilities shared across unit and integration tests.
//!
//! Every fake here is `Send + Sync` so it can sit behind the same `Arc<dyn _>`
//! seams the runtime uses.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::context::{RunContext, RunContextParts, RunIdentity, RunSettings};
use crate::device::{
    CommandReply, ConnectionDescriptor, ConnectionError, ConnectionFactory, ConnectionFuture,
    Device, DeviceConnection, DeviceType, NodeId, ReplyFuture,
};
use crate::process::{CommandOutput, CommandRunner, ProcessError, ProcessFuture};
use crate::sink::{
    ActionId, LogUpload, NewRun, ResultSink, RunId, RunOutcome, SetupApi, SetupId, SetupSummary,
    SinkError, SinkFuture, StepSubmission, TeamId, require_ctf_data,
};
use crate::nodes_data::NodesData;
use crate::registry::DeviceRegistry;
use crate::step::StepResult;
use crate::test_args::TestArgs;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fake device connection with scripted replies and a command log.
///
/// Unscripted commands succeed with empty output.
#[derive(Debug)]
pub struct ScriptedConnection {
    label: String,
    replies: Mutex<HashMap<String, CommandReply>>,
    delays: Mutex<HashMap<String, Duration>>,
    files: Mutex<HashMap<String, String>>,
    commands: Mutex<Vec<String>>,
    pushed: Mutex<Vec<(String, String)>>,
    busy: AsyncMutex<()>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ScriptedConnection {
    /// Creates a connection described as `label`.
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            replies: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            busy: AsyncMutex::new(()),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Answers `cmd` with `reply` every time it is sent.
    pub fn reply_to(&self, cmd: &str, reply: CommandReply) {
        lock(&self.replies).insert(cmd.to_owned(), reply);
    }

    /// Makes `cmd` take `delay` before replying.
    pub fn delay_for(&self, cmd: &str, delay: Duration) {
        lock(&self.delays).insert(cmd.to_owned(), delay);
    }

    /// Serves `contents` when `remote` is pulled.
    pub fn serve_file(&self, remote: &str, contents: &str) {
        lock(&self.files).insert(remote.to_owned(), contents.to_owned());
    }

    /// Commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// `(local, remote)` pairs pushed so far.
    #[must_use]
    pub fn pushed(&self) -> Vec<(String, String)> {
        lock(&self.pushed).clone()
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `open` calls.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn pull_into(&self, remote: &str, local_dir: &Utf8Path) -> io::Result<bool> {
        let files = lock(&self.files).clone();
        let trimmed = remote.trim_end_matches('/');
        let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let mut found = false;
        for (path, contents) in &files {
            let target = if path == trimmed {
                local_dir.join(base)
            } else if let Some(rest) = path.strip_prefix(&format!("{trimmed}/")) {
                local_dir.join(base).join(rest)
            } else {
                continue;
            };
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, contents)?;
            found = true;
        }
        Ok(found)
    }
}

impl DeviceConnection for ScriptedConnection {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn open(&self) -> ConnectionFuture<'_, ()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn send_command<'a>(
        &'a self,
        cmd: &'a str,
        _timeout: Duration,
        _expected: Option<&'a str>,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            let _serial = self.busy.lock().await;
            lock(&self.commands).push(cmd.to_owned());
            let delay = lock(&self.delays).get(cmd).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            lock(&self.replies)
                .get(cmd)
                .cloned()
                .unwrap_or_else(|| CommandReply::success(String::new(), String::new()))
        })
    }

    fn push_file<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
        _recursive: bool,
        _timeout: Duration,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.pushed).push((local.to_string(), remote.to_owned()));
            Ok(())
        })
    }

    fn pull_file<'a>(
        &'a self,
        remote: &'a str,
        local_dir: &'a Utf8Path,
        _recursive: bool,
        _timeout: Duration,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            let transport = |message: String| ConnectionError::Transport {
                target: self.label.clone(),
                message,
            };
            match self.pull_into(remote, local_dir) {
                Ok(true) => Ok(()),
                Ok(false) => Err(transport(format!("{remote}: No such file or directory"))),
                Err(err) => Err(transport(err.to_string())),
            }
        })
    }

    fn close(&self) -> ConnectionFuture<'_, ()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Wraps a scripted connection into a registry device.
#[must_use]
pub fn scripted_device(
    node_id: NodeId,
    device_type: DeviceType,
    connection: Arc<ScriptedConnection>,
) -> Device {
    Device {
        node_id,
        name: format!("node-{node_id}"),
        device_type,
        device_sub_type: String::new(),
        descriptors: Vec::new(),
        metadata: Map::new(),
        connection,
    }
}

/// Connection factory handing out one scripted connection per node id.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    connections: Mutex<HashMap<NodeId, Arc<ScriptedConnection>>>,
}

impl ScriptedFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection of `node_id`, created on first use.
    #[must_use]
    pub fn connection(&self, node_id: NodeId) -> Arc<ScriptedConnection> {
        Arc::clone(
            lock(&self.connections)
                .entry(node_id)
                .or_insert_with(|| Arc::new(ScriptedConnection::new(&format!("node {node_id}")))),
        )
    }
}

impl ConnectionFactory for ScriptedFactory {
    fn build(
        &self,
        node_id: NodeId,
        _descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        Ok(self.connection(node_id))
    }
}

/// Device-details reply listing one SSH radio node per id.
#[must_use]
pub fn radio_nodes_reply(node_ids: &[NodeId]) -> Value {
    Value::Array(
        node_ids
            .iter()
            .map(|node_id| {
                serde_json::json!({
                    "node_number": node_id,
                    "name": format!("node-{node_id}"),
                    "device_type_data": {"device_type_name": "terragraph"},
                    "connections": [{
                        "connection_type": 100,
                        "ip_address": format!("10.0.0.{node_id}"),
                        "username": "root",
                    }],
                })
            })
            .collect(),
    )
}

/// Run context over `registry` with a fixed identity (run 1, team 1,
/// setup 1) and default test arguments.
#[must_use]
pub fn context_for(
    settings: RunSettings,
    sink: Arc<dyn ResultSink>,
    registry: Arc<DeviceRegistry>,
    nodes_data: NodesData,
) -> RunContext {
    RunContext::new(RunContextParts {
        identity: RunIdentity {
            run_id: 1,
            team_id: 1,
            setup_id: 1,
            run_index: 0,
            parent_action: None,
        },
        settings,
        registry,
        sink,
        test_args: TestArgs::default(),
        nodes_data,
        cancel: CancellationToken::new(),
    })
}

/// Run context without devices.
#[must_use]
pub fn bare_context(settings: RunSettings, sink: Arc<dyn ResultSink>) -> RunContext {
    context_for(
        settings,
        sink,
        Arc::new(DeviceRegistry::empty()),
        NodesData::default(),
    )
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    invocations: Mutex<Vec<CommandInvocation>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Timeout granted to the invocation.
    pub timeout: Duration,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        crate::process::render_command_line(&self.program, &self.args)
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Duration,
    ) -> ProcessFuture<'a> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            timeout,
        });
        let next = lock(&self.responses).pop_front();
        Box::pin(async move {
            next.ok_or_else(|| ProcessError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
        })
    }
}

/// In-memory result sink that records every call.
#[derive(Debug)]
pub struct RecordingSink {
    run_id: RunId,
    next_action: AtomicU64,
    fail_saves: AtomicBool,
    runs: Mutex<Vec<NewRun>>,
    steps: Mutex<Vec<StepResult>>,
    json: Mutex<Vec<(ActionId, Value)>>,
    uploads: Mutex<Vec<(RunId, LogUpload)>>,
    finished: Mutex<Vec<(RunId, RunOutcome)>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new(1)
    }
}

impl RecordingSink {
    /// Sink that hands out `run_id` from `create_run`.
    #[must_use]
    pub const fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            next_action: AtomicU64::new(100),
            fail_saves: AtomicBool::new(false),
            runs: Mutex::new(Vec::new()),
            steps: Mutex::new(Vec::new()),
            json: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Makes every `save_step` fail after recording the step.
    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    /// Runs created so far.
    #[must_use]
    pub fn runs(&self) -> Vec<NewRun> {
        lock(&self.runs).clone()
    }

    /// Steps saved so far, in save order.
    #[must_use]
    pub fn steps(&self) -> Vec<StepResult> {
        lock(&self.steps).clone()
    }

    /// Looks a saved step up by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<StepResult> {
        lock(&self.steps).iter().find(|step| step.name == name).cloned()
    }

    /// Structured data saved so far.
    #[must_use]
    pub fn json(&self) -> Vec<(ActionId, Value)> {
        lock(&self.json).clone()
    }

    /// Uploads made so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<(RunId, LogUpload)> {
        lock(&self.uploads).clone()
    }

    /// Runs finished so far.
    #[must_use]
    pub fn finished(&self) -> Vec<(RunId, RunOutcome)> {
        lock(&self.finished).clone()
    }
}

impl ResultSink for RecordingSink {
    fn create_run<'a>(&'a self, run: &'a NewRun) -> SinkFuture<'a, RunId> {
        lock(&self.runs).push(run.clone());
        let run_id = self.run_id;
        Box::pin(async move { Ok(run_id) })
    }

    fn save_step<'a>(&'a self, submission: StepSubmission<'a>) -> SinkFuture<'a, ActionId> {
        lock(&self.steps).push(submission.result.clone());
        let action_id = self.next_action.fetch_add(1, Ordering::SeqCst);
        let failing = self.fail_saves.load(Ordering::SeqCst);
        if !failing {
            if let Some(data) = &submission.result.structured_data {
                lock(&self.json).push((action_id, data.clone()));
            }
        }
        Box::pin(async move {
            if failing {
                return Err(SinkError::Http {
                    endpoint: String::from("save_step"),
                    message: String::from("connection refused"),
                });
            }
            Ok(action_id)
        })
    }

    fn save_step_json<'a>(&'a self, action_id: ActionId, data: &'a Value) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            require_ctf_data(data)?;
            lock(&self.json).push((action_id, data.clone()));
            Ok(())
        })
    }

    fn upload_log<'a>(&'a self, run_id: RunId, upload: &'a LogUpload) -> SinkFuture<'a, ()> {
        lock(&self.uploads).push((run_id, upload.clone()));
        Box::pin(async { Ok(()) })
    }

    fn finish_run<'a>(&'a self, run_id: RunId, outcome: &'a RunOutcome) -> SinkFuture<'a, ()> {
        lock(&self.finished).push((run_id, outcome.clone()));
        Box::pin(async { Ok(()) })
    }

    fn run_url(&self, run_id: RunId) -> String {
        format!("https://ctf.test/test_run_result/{run_id}")
    }
}

/// Scripted reservation endpoints that count their calls.
#[derive(Debug)]
pub struct FakeSetupApi {
    free: AtomicBool,
    busy_accepted: AtomicBool,
    free_failures: AtomicUsize,
    check_calls: AtomicUsize,
    busy_calls: AtomicUsize,
    free_calls: AtomicUsize,
    devices: Mutex<Value>,
    setups: Mutex<Vec<SetupSummary>>,
}

impl Default for FakeSetupApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSetupApi {
    /// A free setup that accepts reservation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: AtomicBool::new(true),
            busy_accepted: AtomicBool::new(true),
            free_failures: AtomicUsize::new(0),
            check_calls: AtomicUsize::new(0),
            busy_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
            devices: Mutex::new(Value::Array(Vec::new())),
            setups: Mutex::new(Vec::new()),
        }
    }

    /// Sets what `check_free` reports.
    pub fn set_free_status(&self, free: bool) {
        self.free.store(free, Ordering::SeqCst);
    }

    /// Makes `set_busy` report a refusal.
    pub fn refuse_busy(&self) {
        self.busy_accepted.store(false, Ordering::SeqCst);
    }

    /// Makes the next `count` calls to `set_free` fail.
    pub fn fail_free_times(&self, count: usize) {
        self.free_failures.store(count, Ordering::SeqCst);
    }

    /// Sets the `device_details` reply.
    pub fn set_devices(&self, devices: Value) {
        *lock(&self.devices) = devices;
    }

    /// Sets the `list_setups` reply.
    pub fn set_setups(&self, setups: Vec<SetupSummary>) {
        *lock(&self.setups) = setups;
    }

    /// Number of `check_free` calls.
    #[must_use]
    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    /// Number of `set_busy` calls.
    #[must_use]
    pub fn busy_calls(&self) -> usize {
        self.busy_calls.load(Ordering::SeqCst)
    }

    /// Number of `set_free` calls, failed ones included.
    #[must_use]
    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::SeqCst)
    }
}

impl SetupApi for FakeSetupApi {
    fn check_free(&self, _team_id: TeamId, _setup_id: SetupId) -> SinkFuture<'_, bool> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let free = self.free.load(Ordering::SeqCst);
        Box::pin(async move { Ok(free) })
    }

    fn set_busy(&self, _team_id: TeamId, _setup_id: SetupId) -> SinkFuture<'_, bool> {
        self.busy_calls.fetch_add(1, Ordering::SeqCst);
        let accepted = self.busy_accepted.load(Ordering::SeqCst);
        if accepted {
            self.free.store(false, Ordering::SeqCst);
        }
        Box::pin(async move { Ok(accepted) })
    }

    fn set_free(&self, _team_id: TeamId, _setup_id: SetupId) -> SinkFuture<'_, bool> {
        self.free_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .free_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !failing {
            self.free.store(true, Ordering::SeqCst);
        }
        Box::pin(async move {
            if failing {
                return Err(SinkError::Http {
                    endpoint: String::from("set_free"),
                    message: String::from("connection reset"),
                });
            }
            Ok(true)
        })
    }

    fn device_details(&self, _team_id: TeamId, _setup_id: SetupId) -> SinkFuture<'_, Value> {
        let devices = lock(&self.devices).clone();
        Box::pin(async move { Ok(devices) })
    }

    fn list_setups(&self, _team_id: TeamId) -> SinkFuture<'_, Vec<SetupSummary>> {
        let setups = lock(&self.setups).clone();
        Box::pin(async move { Ok(setups) })
    }
}

/// Clonable in-memory writer for capturing result lines.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, decoded lossily.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Removes variables while holding the global mutex.
    pub async fn remove_vars(keys: &[&str]) -> Self {
        Self::apply(&[], keys).await
    }

    async fn apply(pairs: &[(&str, &str)], removals: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(removals.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + removals.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
        }
        for key in removals {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in self.previous.iter().rev() {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
