//! Commands executed on the controller host, optionally inside a chroot.

use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::connection::{
    CommandReply, ConnectionError, ConnectionFuture, DeviceConnection, FailureClass, OutputEvent,
    ReplyFuture,
};
use super::stream::decode_lossy_ascii;
use crate::process::{CommandRunner, ProcessError};

const SHELL: &str = "/bin/sh";

/// Connection that runs commands through the local shell.
#[derive(Debug)]
pub struct LocalConnection {
    label: String,
    root: Option<Utf8PathBuf>,
    chroot_bin: String,
    runner: Arc<dyn CommandRunner>,
    busy: Mutex<()>,
}

impl LocalConnection {
    /// Builds a connection; commands run under `chroot root` when `root` is
    /// given.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        root: Option<Utf8PathBuf>,
        chroot_bin: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            label: label.into(),
            root,
            chroot_bin: chroot_bin.into(),
            runner,
            busy: Mutex::new(()),
        }
    }

    fn invocation(&self, cmd: &str) -> (String, Vec<OsString>) {
        let shell = [OsString::from("-c"), OsString::from(cmd)];
        match &self.root {
            Some(root) => {
                let mut args = vec![OsString::from(root.as_str()), OsString::from(SHELL)];
                args.extend(shell);
                (self.chroot_bin.clone(), args)
            }
            None => (String::from(SHELL), shell.to_vec()),
        }
    }

    /// Maps a path inside the device onto the host filesystem.
    fn host_path(&self, device_path: &str) -> Utf8PathBuf {
        self.root.as_ref().map_or_else(
            || Utf8PathBuf::from(device_path),
            |root| root.join(device_path.trim_start_matches('/')),
        )
    }

    async fn copy(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
        recursive: bool,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        let mut args = Vec::new();
        if recursive {
            args.push(OsString::from("-r"));
        }
        args.push(OsString::from(source.as_str()));
        args.push(OsString::from(destination.as_str()));

        match self.runner.run("cp", &args, timeout).await {
            Ok(output) if output.is_success() => Ok(()),
            Ok(output) => Err(ConnectionError::Transport {
                target: self.label.clone(),
                message: format!("cp exited with {}: {}", output.status_text(), output.stderr.trim()),
            }),
            Err(ProcessError::Timeout { .. }) => Err(ConnectionError::Timeout {
                target: self.label.clone(),
                message: format!("copying {source}"),
            }),
            Err(err) => Err(ConnectionError::Transport {
                target: self.label.clone(),
                message: err.to_string(),
            }),
        }
    }
}

impl DeviceConnection for LocalConnection {
    fn describe(&self) -> String {
        self.root
            .as_ref()
            .map_or_else(|| String::from("local"), |root| format!("chroot {root}"))
    }

    fn open(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn send_command<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        _expected: Option<&'a str>,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            let _serial = self.busy.lock().await;
            let (program, args) = self.invocation(cmd);
            match self.runner.run(&program, &args, timeout).await {
                Ok(output) => CommandReply::exited(
                    output.code.unwrap_or(super::RC_EXCEPTION),
                    output.stdout,
                    output.stderr,
                ),
                Err(ProcessError::Timeout { .. }) => CommandReply::failure(
                    FailureClass::Timeout,
                    format!("{cmd}: no reply within {}s", timeout.as_secs()),
                ),
                Err(err) => CommandReply::failure(FailureClass::Transport, err.to_string()),
            }
        })
    }

    fn send_command_streaming<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        events: mpsc::UnboundedSender<OutputEvent>,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            let _serial = self.busy.lock().await;
            events.send(OutputEvent::Stdin(cmd.to_owned())).ok();
            let (program, args) = self.invocation(cmd);
            let spawned = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            let mut child = match spawned {
                Ok(child) => child,
                Err(err) => {
                    return CommandReply::failure(
                        FailureClass::Transport,
                        format!("failed to spawn {program}: {err}"),
                    );
                }
            };
            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                return CommandReply::failure(FailureClass::Transport, "child pipes unavailable");
            };

            let pump = async {
                let mut out_reader = BufReader::new(stdout);
                let mut err_reader = BufReader::new(stderr);
                let mut out = Pipe::new();
                let mut err = Pipe::new();
                while out.open || err.open {
                    tokio::select! {
                        read = out_reader.read_until(b'\n', &mut out.pending), if out.open => {
                            if let Some(chunk) = out.take_chunk(&read) {
                                events.send(OutputEvent::Stdout(chunk)).ok();
                            }
                        }
                        read = err_reader.read_until(b'\n', &mut err.pending), if err.open => {
                            if let Some(chunk) = err.take_chunk(&read) {
                                events.send(OutputEvent::Stderr(chunk)).ok();
                            }
                        }
                    }
                }
                let status = child.wait().await;
                (status, out.collected, err.collected)
            };

            match tokio::time::timeout(timeout, pump).await {
                Ok((Ok(status), out, err)) => {
                    CommandReply::exited(status.code().unwrap_or(super::RC_EXCEPTION), out, err)
                }
                Ok((Err(err), _, _)) => CommandReply::failure(FailureClass::Transport, err.to_string()),
                Err(_) => {
                    debug!(target_device = %self.label, cmd, "local command timed out");
                    CommandReply::failure(
                        FailureClass::Timeout,
                        format!("{cmd}: no reply within {}s", timeout.as_secs()),
                    )
                }
            }
        })
    }

    fn push_file<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
        recursive: bool,
        timeout: Duration,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            let destination = self.host_path(remote);
            self.copy(local, &destination, recursive, timeout).await
        })
    }

    fn pull_file<'a>(
        &'a self,
        remote: &'a str,
        local_dir: &'a Utf8Path,
        recursive: bool,
        timeout: Duration,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            let source = self.host_path(remote);
            self.copy(&source, local_dir, recursive, timeout).await
        })
    }

    fn close(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// One child output pipe read line by line as raw bytes.
struct Pipe {
    pending: Vec<u8>,
    collected: String,
    open: bool,
}

impl Pipe {
    const fn new() -> Self {
        Self {
            pending: Vec::new(),
            collected: String::new(),
            open: true,
        }
    }

    /// Decodes the bytes gathered by the last read; EOF or a read error
    /// closes the pipe after flushing what was gathered.
    fn take_chunk(&mut self, read: &io::Result<usize>) -> Option<String> {
        if !matches!(read, Ok(count) if *count > 0) {
            self.open = false;
        }
        if self.pending.is_empty() {
            return None;
        }
        let chunk = decode_lossy_ascii(&self.pending);
        self.pending.clear();
        self.collected.push_str(&chunk);
        Some(chunk)
    }
}
