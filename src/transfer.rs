//! File transfer to and from devices, and post-run log collection.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::device::{Device, DeviceType, NodeId};
use crate::error::StepError;
use crate::sink::LogUpload;

/// Direction and paths of one copy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CopyDirection {
    /// Local file to the device.
    Push {
        /// Local source.
        local: Utf8PathBuf,
        /// Remote destination.
        remote: String,
    },
    /// Remote file into a local directory.
    Pull {
        /// Remote source.
        remote: String,
        /// Local destination directory.
        local_dir: Utf8PathBuf,
    },
}

/// One copy in a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileCopy {
    /// Device involved.
    pub node_id: NodeId,
    /// What to copy where.
    pub direction: CopyDirection,
    /// Copy directories recursively.
    pub recursive: bool,
}

fn transfer_error(node_id: NodeId, err: &impl std::fmt::Display) -> StepError {
    StepError::device_cmd(format!("Node {node_id}: {err}"))
}

/// Copies a local file to a device.
///
/// # Errors
///
/// Returns [`StepError::TestUsage`] for unknown nodes and
/// [`StepError::DeviceCmd`] when the copy fails.
pub async fn push_file(
    ctx: &RunContext,
    node_id: NodeId,
    local: &Utf8Path,
    remote: &str,
    recursive: bool,
) -> Result<(), StepError> {
    let device = ctx.registry().require(node_id)?;
    let limit = ctx.command_timeout(Some(ctx.settings().scp_timeout));
    debug!(node_id, %local, remote, "pushing file");
    device
        .connection
        .push_file(local, remote, recursive, limit)
        .await
        .map_err(|err| transfer_error(node_id, &err))
}

/// Copies a remote file into `local_dir`.
///
/// # Errors
///
/// Returns [`StepError::TestUsage`] for unknown nodes and
/// [`StepError::DeviceCmd`] when the copy fails.
pub async fn pull_file(
    ctx: &RunContext,
    node_id: NodeId,
    remote: &str,
    local_dir: &Utf8Path,
    recursive: bool,
) -> Result<(), StepError> {
    let device = ctx.registry().require(node_id)?;
    let limit = ctx.command_timeout(Some(ctx.settings().scp_timeout));
    debug!(node_id, remote, %local_dir, "pulling file");
    device
        .connection
        .pull_file(remote, local_dir, recursive, limit)
        .await
        .map_err(|err| transfer_error(node_id, &err))
}

/// Writes `document` as pretty JSON with sorted keys and pushes it to
/// `remote`.
///
/// # Errors
///
/// Returns [`StepError::Unexpected`] when the temporary file cannot be
/// written, and the errors of [`push_file`].
pub async fn push_json(
    ctx: &RunContext,
    node_id: NodeId,
    document: &Value,
    remote: &str,
) -> Result<(), StepError> {
    let text = serde_json::to_string_pretty(document)?;
    let file = tempfile::Builder::new()
        .prefix("ctf-")
        .suffix(".json")
        .tempfile()?;
    let path = utf8_path(file.path())?;
    tokio::fs::write(&path, text).await?;
    let pushed = push_file(ctx, node_id, &path, remote, false).await;
    drop(file);
    pushed
}

/// Runs a batch of copies in parallel, bounded by the worker pool and the
/// batch budget.
///
/// # Errors
///
/// Returns [`StepError::DeviceCmd`] naming every failed copy, or
/// [`StepError::Cancelled`].
pub async fn copy_files_parallel(ctx: &RunContext, copies: Vec<FileCopy>) -> Result<(), StepError> {
    let budget = ctx.command_timeout(Some(ctx.settings().scp_timeout));
    let mut tasks: FuturesUnordered<_> = copies
        .into_iter()
        .map(|copy| {
            let worker = ctx.clone();
            async move {
                let _slot = worker.pool().acquire(worker.cancel_token()).await?;
                match &copy.direction {
                    CopyDirection::Push { local, remote } => {
                        push_file(&worker, copy.node_id, local, remote, copy.recursive).await
                    }
                    CopyDirection::Pull { remote, local_dir } => {
                        pull_file(&worker, copy.node_id, remote, local_dir, copy.recursive).await
                    }
                }
            }
        })
        .collect();

    let drain = async {
        let mut failures = Vec::new();
        while let Some(outcome) = tasks.next().await {
            match outcome {
                Ok(()) => {}
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(err) => failures.push(err.to_string()),
            }
        }
        Ok(failures)
    };
    let failures = tokio::time::timeout(budget, drain).await.map_err(|_| {
        StepError::device_cmd(format!("File copies did not finish within {}s", budget.as_secs()))
    })??;
    if failures.is_empty() {
        Ok(())
    } else {
        Err(StepError::device_cmd(failures.join("; ")))
    }
}

/// Pulls `logfiles` (remote paths by device type) from every matching
/// device and uploads them to the run's log store.
///
/// Files land under `<store>/node_<id>/`; directories are uploaded file by
/// file. The constructive path of each upload is the node id followed by
/// the file's remote parent directory.
///
/// # Errors
///
/// Returns [`StepError::DeviceCmd`] naming the nodes whose logs could not
/// be collected, in ascending order.
pub async fn collect_logfiles(
    ctx: &RunContext,
    logfiles: &BTreeMap<DeviceType, Vec<String>>,
) -> Result<Vec<LogUpload>, StepError> {
    let (store, _scratch) = log_store(ctx)?;

    let mut tasks: FuturesUnordered<_> = logfiles
        .iter()
        .flat_map(|(device_type, paths)| {
            ctx.registry()
                .of_type(*device_type)
                .into_iter()
                .map(move |device| (device, paths.clone()))
        })
        .map(|(device, paths)| {
            let worker = ctx.clone();
            let node_dir = store.join(format!("node_{}", device.node_id));
            async move {
                let node_id = device.node_id;
                let result = collect_from(&worker, device, &paths, &node_dir).await;
                (node_id, result)
            }
        })
        .collect();

    let budget = ctx.command_timeout(Some(ctx.settings().log_collect_timeout));
    let mut uploads = Vec::new();
    let mut failed = Vec::new();
    let drain = async {
        while let Some((node_id, result)) = tasks.next().await {
            match result {
                Ok(mut done) => uploads.append(&mut done),
                Err(err) => {
                    ctx.log(&format!("Node {node_id}: failed to collect logs: {err}"));
                    failed.push(node_id);
                }
            }
        }
    };
    if tokio::time::timeout(budget, drain).await.is_err() {
        return Err(StepError::device_cmd(format!(
            "Log collection did not finish within {}s",
            budget.as_secs()
        )));
    }
    if ctx.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    if !failed.is_empty() {
        failed.sort_unstable();
        return Err(StepError::device_cmd(format!(
            "Failed to collect logs from nodes {failed:?}"
        )));
    }
    Ok(uploads)
}

fn utf8_path(path: &std::path::Path) -> Result<Utf8PathBuf, StepError> {
    Utf8Path::from_path(path)
        .map(Utf8Path::to_owned)
        .ok_or_else(|| StepError::Unexpected(format!("{} is not UTF-8", path.display())))
}

fn log_store(ctx: &RunContext) -> Result<(Utf8PathBuf, Option<tempfile::TempDir>), StepError> {
    if let Some(dir) = &ctx.settings().store_logs_locally {
        return Ok((dir.clone(), None));
    }
    let scratch = tempfile::tempdir()?;
    Ok((utf8_path(scratch.path())?, Some(scratch)))
}

async fn collect_from(
    ctx: &RunContext,
    device: Arc<Device>,
    paths: &[String],
    node_dir: &Utf8Path,
) -> Result<Vec<LogUpload>, StepError> {
    let _slot = ctx.pool().acquire(ctx.cancel_token()).await?;
    let mut uploads = Vec::new();
    let mut errors = Vec::new();
    for remote in paths {
        let trimmed = remote.trim_end_matches('/');
        let (parent, base) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        let local_dir = node_dir.join(parent.trim_start_matches('/'));
        tokio::fs::create_dir_all(&local_dir).await?;
        let pulled = device
            .connection
            .pull_file(remote, &local_dir, true, ctx.settings().scp_timeout)
            .await;
        if let Err(err) = pulled {
            errors.push(err.to_string());
            continue;
        }
        let constructive = format!("{}{parent}", device.node_id);
        for (file, sub_dir) in list_files(&local_dir.join(base)).await? {
            let constructive_path = match sub_dir.as_deref() {
                None => constructive.clone(),
                Some("") => format!("{constructive}/{base}"),
                Some(nested) => format!("{constructive}/{base}/{nested}"),
            };
            let upload = LogUpload {
                path: file,
                constructive_path,
                log_type: None,
                action_id: None,
            };
            match ctx.sink().upload_log(ctx.run_id(), &upload).await {
                Ok(()) => uploads.push(upload),
                Err(err) => {
                    warn!(node_id = device.node_id, error = %err, "log upload failed");
                    errors.push(err.to_string());
                }
            }
        }
    }
    if errors.is_empty() {
        Ok(uploads)
    } else {
        Err(StepError::device_cmd(errors.join("; ")))
    }
}

/// Lists the files under `root` with their directory relative to it.
/// A plain file yields itself with no relative directory.
async fn list_files(root: &Utf8Path) -> Result<Vec<(Utf8PathBuf, Option<String>)>, StepError> {
    let metadata = tokio::fs::metadata(root).await?;
    if !metadata.is_dir() {
        return Ok(vec![(root.to_owned(), None)]);
    }
    let mut files = Vec::new();
    let mut pending = vec![(root.to_owned(), String::new())];
    while let Some((dir, relative)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let path = dir.join(&name);
            if entry.file_type().await?.is_dir() {
                let nested = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };
                pending.push((path, nested));
            } else {
                files.push((path, Some(relative.clone())));
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunSettings;
    use crate::device::PortPool;
    use crate::error::StepErrorKind;
    use crate::nodes_data::NodesData;
    use crate::registry::DeviceRegistry;
    use crate::test_support::{RecordingSink, ScriptedConnection, context_for, scripted_device};

    struct Lab {
        ctx: RunContext,
        sink: Arc<RecordingSink>,
        radio: Arc<ScriptedConnection>,
        switch: Arc<ScriptedConnection>,
        store: tempfile::TempDir,
    }

    fn lab() -> Lab {
        let store = tempfile::tempdir().expect("store");
        let radio = Arc::new(ScriptedConnection::new("radio"));
        let switch = Arc::new(ScriptedConnection::new("switch"));
        let registry = DeviceRegistry::new(
            [
                scripted_device(1, DeviceType::RadioNode, Arc::clone(&radio)),
                scripted_device(2, DeviceType::Switch, Arc::clone(&switch)),
            ],
            Arc::new(PortPool::new()),
        )
        .expect("registry");
        let sink = Arc::new(RecordingSink::default());
        let settings = RunSettings {
            store_logs_locally: Some(
                Utf8PathBuf::from_path_buf(store.path().to_path_buf()).expect("utf8"),
            ),
            ..RunSettings::default()
        };
        let ctx = context_for(
            settings,
            Arc::clone(&sink) as _,
            Arc::new(registry),
            NodesData::default(),
        );
        Lab {
            ctx,
            sink,
            radio,
            switch,
            store,
        }
    }

    #[tokio::test]
    async fn logs_are_pulled_and_uploaded_per_file() {
        let lab = lab();
        lab.radio.serve_file("/var/log/messages", "boot ok");
        lab.radio.serve_file("/tmp/fw/a.log", "a");
        lab.radio.serve_file("/tmp/fw/sub/b.log", "b");
        let logfiles = BTreeMap::from([(
            DeviceType::RadioNode,
            vec![String::from("/var/log/messages"), String::from("/tmp/fw/")],
        )]);

        let uploads = collect_logfiles(&lab.ctx, &logfiles).await.expect("collected");
        let paths: Vec<String> = lab
            .sink
            .uploads()
            .into_iter()
            .map(|(_, upload)| upload.constructive_path)
            .collect();
        assert_eq!(paths, vec!["1/var/log", "1/tmp/fw", "1/tmp/fw/sub"]);
        assert_eq!(uploads.len(), 3);
        let kept = lab.store.path().join("node_1/var/log/messages");
        assert_eq!(std::fs::read_to_string(kept).expect("kept log"), "boot ok");
        assert!(lab.switch.commands().is_empty());
    }

    #[tokio::test]
    async fn missing_logs_name_the_failed_nodes() {
        let lab = lab();
        let logfiles = BTreeMap::from([
            (DeviceType::RadioNode, vec![String::from("/var/log/none")]),
            (DeviceType::Switch, vec![String::from("/var/log/none")]),
        ]);
        let err = collect_logfiles(&lab.ctx, &logfiles).await.expect_err("missing");
        assert_eq!(err.kind(), StepErrorKind::DeviceCmd);
        assert!(err.to_string().contains("[1, 2]"));
    }

    #[tokio::test]
    async fn json_documents_are_pushed_to_the_node() {
        let lab = lab();
        push_json(&lab.ctx, 1, &serde_json::json!({"b": 1, "a": 2}), "/data/cfg/x.json")
            .await
            .expect("pushed");
        let pushed = lab.radio.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(
            pushed.first().map(|(_, remote)| remote.as_str()),
            Some("/data/cfg/x.json")
        );
    }

    #[tokio::test]
    async fn batches_report_every_failed_copy() {
        let lab = lab();
        let dir = Utf8PathBuf::from_path_buf(lab.store.path().to_path_buf()).expect("utf8");
        lab.radio.serve_file("/etc/os-release", "ID=tg");
        let copies = vec![
            FileCopy {
                node_id: 1,
                direction: CopyDirection::Pull {
                    remote: String::from("/etc/os-release"),
                    local_dir: dir.clone(),
                },
                recursive: false,
            },
            FileCopy {
                node_id: 2,
                direction: CopyDirection::Pull {
                    remote: String::from("/etc/missing"),
                    local_dir: dir,
                },
                recursive: false,
            },
        ];
        let err = copy_files_parallel(&lab.ctx, copies).await.expect_err("one failed");
        assert!(err.to_string().contains("Node 2"));
        assert!(lab.store.path().join("os-release").exists());
    }
}
