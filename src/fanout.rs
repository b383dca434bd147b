//! Concurrent command execution across devices.
//!
//! A fanout sends one command (or one command per node) to many devices at
//! once, bounded by the run's worker pool, and yields per-node results as
//! they complete.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::context::RunContext;
use crate::device::{
    CommandCallbacks, CommandReply, Device, DeviceType, FailureClass, NodeId, ParallelOptions,
    TextCallback,
};
use crate::error::StepError;

/// What to run where.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandSpec {
    /// The same command on every target.
    Broadcast(String),
    /// A command per node; the map's keys are the default targets.
    PerNode(BTreeMap<NodeId, String>),
}

impl CommandSpec {
    /// Command for `node_id`, if any.
    #[must_use]
    pub fn command_for(&self, node_id: NodeId) -> Option<&str> {
        match self {
            Self::Broadcast(cmd) => Some(cmd),
            Self::PerNode(map) => map.get(&node_id).map(String::as_str),
        }
    }
}

impl From<&str> for CommandSpec {
    fn from(value: &str) -> Self {
        Self::Broadcast(value.to_owned())
    }
}

/// Outcome of a command on one node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FanoutResult {
    /// Node the command ran on.
    pub node_id: NodeId,
    /// Whether the command succeeded.
    pub success: bool,
    /// Output, or the failure text for transport errors.
    pub stdout: String,
    /// Standard error, when the transport separates it.
    pub stderr: String,
    /// Wall time spent, including the wait for a pool slot.
    pub duration_ms: u64,
    /// Failure classification.
    #[serde(skip)]
    pub failure: Option<FailureClass>,
    /// Remote exit status or a negative transport code.
    pub return_code: i32,
}

/// Per-node results in completion order.
pub type FanoutStream = Pin<Box<dyn Stream<Item = FanoutResult> + Send>>;

/// Command fanout bound to a run.
#[derive(Clone, Debug)]
pub struct Fanout {
    ctx: RunContext,
}

impl Fanout {
    pub(crate) const fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Runs `spec` on `nodes`, or on the run's default device type when
    /// `nodes` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::TestUsage`] when a node is not part of the
    /// setup or has no command.
    pub fn run(
        &self,
        spec: &CommandSpec,
        nodes: Option<&[NodeId]>,
        timeout: Option<Duration>,
    ) -> Result<FanoutStream, StepError> {
        self.run_cmd(spec, nodes, self.ctx.fanout_type(), timeout)
    }

    /// Like [`Fanout::run`], with the device type used for broadcasts
    /// without explicit nodes.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::TestUsage`] when a node is not part of the
    /// setup or has no command.
    pub fn run_cmd(
        &self,
        spec: &CommandSpec,
        nodes: Option<&[NodeId]>,
        device_type: DeviceType,
        timeout: Option<Duration>,
    ) -> Result<FanoutStream, StepError> {
        let targets = self.targets(spec, nodes, device_type)?;
        let limit = self.ctx.command_timeout(timeout);
        let tasks: FuturesUnordered<_> = targets
            .into_iter()
            .map(|(device, command)| run_on(self.ctx.clone(), device, command, limit))
            .collect();
        Ok(Box::pin(tasks))
    }

    fn targets(
        &self,
        spec: &CommandSpec,
        nodes: Option<&[NodeId]>,
        device_type: DeviceType,
    ) -> Result<Vec<(Arc<Device>, String)>, StepError> {
        let registry = self.ctx.registry();
        let devices = match (nodes, spec) {
            (Some(ids), _) => ids
                .iter()
                .map(|node_id| registry.require(*node_id))
                .collect::<Result<Vec<_>, _>>()?,
            (None, CommandSpec::PerNode(map)) => map
                .keys()
                .map(|node_id| registry.require(*node_id))
                .collect::<Result<Vec<_>, _>>()?,
            (None, CommandSpec::Broadcast(_)) => registry.of_type(device_type),
        };
        devices
            .into_iter()
            .map(|device| {
                let command = spec.command_for(device.node_id).ok_or_else(|| {
                    StepError::usage(format!("No command given for node {}", device.node_id))
                })?;
                Ok((device, command.to_owned()))
            })
            .collect()
    }
}

async fn run_on(ctx: RunContext, device: Arc<Device>, command: String, limit: Duration) -> FanoutResult {
    let started = Instant::now();
    let node_id = device.node_id;
    let reply = match ctx.pool().acquire(ctx.cancel_token()).await {
        Ok(permit) => {
            let options = ParallelOptions {
                callbacks: CommandCallbacks {
                    on_stdin: Some(node_logger(&ctx, node_id, "$ ")),
                    on_stdout: Some(node_logger(&ctx, node_id, "")),
                    on_stderr: Some(node_logger(&ctx, node_id, "stderr: ")),
                    ..CommandCallbacks::default()
                },
                cancel: Some(ctx.cancel_token().clone()),
                split_on_semicolon: false,
            };
            let reply = device
                .connection
                .send_command_parallel(&command, limit, &options)
                .await;
            drop(permit);
            reply
        }
        Err(_) => CommandReply::cancelled(),
    };
    FanoutResult {
        node_id,
        success: reply.is_success(),
        stdout: reply.message,
        stderr: reply.stderr,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        failure: reply.failure,
        return_code: reply.return_code,
    }
}

/// Copies each line of a node's command text or output into the step log
/// as it arrives.
fn node_logger(ctx: &RunContext, node_id: NodeId, prefix: &'static str) -> TextCallback {
    let logger = ctx.clone();
    Arc::new(move |text: &str| {
        for line in text.lines() {
            logger.log(&format!("Node {node_id}: {prefix}{line}"));
        }
    })
}

/// Drains `results`, ordered by node id.
///
/// # Errors
///
/// Returns [`StepError::Cancelled`] when any command was cancelled, and
/// [`StepError::DeviceCmd`] when a node could not be reached.
pub async fn wait_for_cmds(results: FanoutStream) -> Result<Vec<FanoutResult>, StepError> {
    let mut collected: Vec<FanoutResult> = results.collect().await;
    collected.sort_by_key(|result| result.node_id);
    if collected
        .iter()
        .any(|result| result.failure == Some(FailureClass::Cancelled))
    {
        return Err(StepError::Cancelled);
    }
    let unreachable: Vec<String> = collected
        .iter()
        .filter(|result| result.failure == Some(FailureClass::Transport))
        .map(|result| format!("Node {}: Connection failure: {}", result.node_id, result.stdout))
        .collect();
    if !unreachable.is_empty() {
        return Err(StepError::device_cmd(unreachable.join("; ")));
    }
    Ok(collected)
}

/// Fails unless every result succeeded, naming the failed nodes in order.
///
/// # Errors
///
/// Returns [`StepError::DeviceCmd`] listing each failure.
pub fn require_all_success(results: &[FanoutResult]) -> Result<(), StepError> {
    let mut failed: Vec<&FanoutResult> = results.iter().filter(|result| !result.success).collect();
    if failed.is_empty() {
        return Ok(());
    }
    failed.sort_by_key(|result| result.node_id);
    let details: Vec<String> = failed
        .iter()
        .map(|result| {
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim()
            } else {
                result.stderr.trim()
            };
            format!("Node {} (rc {}): {detail}", result.node_id, result.return_code)
        })
        .collect();
    Err(StepError::device_cmd(format!(
        "Command failed on {} node(s): {}",
        failed.len(),
        details.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::context::RunSettings;
    use crate::device::PortPool;
    use crate::error::StepErrorKind;
    use crate::executor::execute_step;
    use crate::nodes_data::NodesData;
    use crate::registry::DeviceRegistry;
    use crate::step::{Outcome, Step};
    use crate::test_support::{RecordingSink, ScriptedConnection, context_for, scripted_device};

    fn setup(
        count: u32,
        settings: RunSettings,
    ) -> (RunContext, Vec<Arc<ScriptedConnection>>) {
        let connections: Vec<Arc<ScriptedConnection>> = (1..=count)
            .map(|id| Arc::new(ScriptedConnection::new(&format!("node-{id}"))))
            .collect();
        let devices = connections.iter().zip(1..=count).map(|(conn, id)| {
            scripted_device(id, DeviceType::RadioNode, Arc::clone(conn))
        });
        let registry = DeviceRegistry::new(devices, Arc::new(PortPool::new())).expect("registry");
        let ctx = context_for(
            settings,
            Arc::new(RecordingSink::default()),
            Arc::new(registry),
            NodesData::default(),
        );
        (ctx, connections)
    }

    #[tokio::test(start_paused = true)]
    async fn broadcasts_reach_every_radio_node_concurrently() {
        let (ctx, connections) = setup(3, RunSettings::default());
        for conn in &connections {
            conn.delay_for("uptime", Duration::from_secs(5));
            conn.reply_to("uptime", CommandReply::success("up 3 days", ""));
        }
        let started = Instant::now();
        let stream = ctx.fanout().run(&"uptime".into(), None, None).expect("stream");
        let results = wait_for_cmds(stream).await.expect("results");
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(
            results.iter().map(|r| r.node_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(results.iter().all(|r| r.success && r.stdout == "up 3 days"));
        assert!(require_all_success(&results).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn the_worker_pool_bounds_parallelism() {
        let settings = RunSettings {
            max_workers: 2,
            ..RunSettings::default()
        };
        let (ctx, connections) = setup(4, settings);
        for conn in &connections {
            conn.delay_for("sleep 1", Duration::from_secs(1));
        }
        let started = Instant::now();
        let stream = ctx.fanout().run(&"sleep 1".into(), None, None).expect("stream");
        let results = wait_for_cmds(stream).await.expect("results");
        assert_eq!(results.len(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn per_node_commands_target_their_keys() {
        let (ctx, connections) = setup(3, RunSettings::default());
        let spec = CommandSpec::PerNode(BTreeMap::from([
            (1, String::from("ip link")),
            (3, String::from("ip addr")),
        ]));
        let stream = ctx.fanout().run(&spec, None, None).expect("stream");
        let results = wait_for_cmds(stream).await.expect("results");
        assert_eq!(results.len(), 2);
        let first = connections.first().expect("node 1");
        let second = connections.get(1).expect("node 2");
        let third = connections.get(2).expect("node 3");
        assert_eq!(first.commands(), vec![String::from("ip link")]);
        assert!(second.commands().is_empty());
        assert_eq!(third.commands(), vec![String::from("ip addr")]);
    }

    #[tokio::test]
    async fn unknown_nodes_are_usage_errors() {
        let (ctx, _connections) = setup(1, RunSettings::default());
        let err = ctx
            .fanout()
            .run(&"date".into(), Some(&[1, 9]), None)
            .err()
            .expect("unknown node");
        assert_eq!(err.kind(), StepErrorKind::TestUsage);
        assert!(err.to_string().contains("Node 9 is not part of the test setup"));
    }

    #[tokio::test]
    async fn failures_are_listed_in_node_order() {
        let (ctx, connections) = setup(3, RunSettings::default());
        for (conn, id) in connections.iter().zip([1, 2, 3]) {
            if id != 2 {
                conn.reply_to("ping -c1 peer", CommandReply::exited(1, "", "100% packet loss"));
            }
        }
        let stream = ctx.fanout().run(&"ping -c1 peer".into(), None, None).expect("stream");
        let results = wait_for_cmds(stream).await.expect("results");
        let err = require_all_success(&results).expect_err("failures");
        assert_eq!(
            err.to_string(),
            "device command failed: Command failed on 2 node(s): \
             Node 1 (rc 1): 100% packet loss; Node 3 (rc 1): 100% packet loss"
        );
    }

    #[tokio::test]
    async fn unreachable_nodes_fail_the_wait() {
        let (ctx, connections) = setup(2, RunSettings::default());
        let second = connections.get(1).expect("node 2");
        second.reply_to(
            "date",
            CommandReply::failure(FailureClass::Transport, "no route to host"),
        );
        let stream = ctx.fanout().run(&"date".into(), None, None).expect("stream");
        let err = wait_for_cmds(stream).await.expect_err("unreachable");
        assert_eq!(
            err,
            StepError::device_cmd("Node 2: Connection failure: no route to host")
        );
    }

    #[tokio::test]
    async fn output_reaches_the_step_log_when_another_node_fails() {
        let (ctx, connections) = setup(2, RunSettings::default());
        let first = connections.first().expect("node 1");
        first.reply_to("dmesg", CommandReply::success("kernel panic trace\n", ""));
        let second = connections.get(1).expect("node 2");
        second.reply_to("dmesg", CommandReply::failure(FailureClass::Transport, "no route"));
        let step = Step::fanout("dump", CommandSpec::from("dmesg"), None);

        let report = execute_step(&ctx, &step, 1, Duration::ZERO).await;

        assert_eq!(report.result.outcome, Outcome::Fail);
        let log = report.result.log;
        assert!(log.contains("Node 1: $ dmesg"), "{log}");
        assert!(log.contains("Node 1: kernel panic trace"), "{log}");
        assert_eq!(log.matches("kernel panic trace").count(), 1, "{log}");
        assert!(log.contains("Node 2: Connection failure: no route"), "{log}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_surfaces_as_cancelled() {
        let (ctx, connections) = setup(2, RunSettings::default());
        for conn in &connections {
            conn.delay_for("soak", Duration::from_secs(600));
        }
        let token = ctx.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let stream = ctx.fanout().run(&"soak".into(), None, None).expect("stream");
        assert_eq!(wait_for_cmds(stream).await, Err(StepError::Cancelled));
    }
}
