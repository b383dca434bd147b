//! External process execution.
//!
//! Transports shell out to the system `ssh`, `scp`, `stty` and `chroot`
//! binaries. The [`CommandRunner`] trait keeps that boundary small so tests
//! can substitute scripted outputs without spawning anything.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Future returned by [`CommandRunner::run`].
pub type ProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ProcessError>> + Send + 'a>>;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while launching or waiting on a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the process outlives its deadline; it is killed.
    #[error("{program} did not finish within {}s", timeout.as_secs())]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// The process is killed when `timeout` elapses or when the returned
    /// future is dropped.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Duration,
    ) -> ProcessFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Duration,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            let child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| ProcessError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| ProcessError::Timeout {
                    program: program.to_owned(),
                    timeout,
                })?
                .map_err(|err| ProcessError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Joins a program and its arguments into a readable command line.
#[must_use]
pub fn render_command_line(program: &str, args: &[OsString]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_owned());
    parts.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_runner_captures_output_and_exit_code() {
        let runner = ProcessCommandRunner;
        let args = vec![OsString::from("-c"), OsString::from("echo out; echo err >&2; exit 3")];
        let output = runner
            .run("sh", &args, Duration::from_secs(5))
            .await
            .expect("sh should run");

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.is_success());
    }

    #[tokio::test]
    async fn process_runner_kills_on_timeout() {
        let runner = ProcessCommandRunner;
        let args = vec![OsString::from("-c"), OsString::from("sleep 5")];
        let err = runner
            .run("sh", &args, Duration::from_millis(100))
            .await
            .expect_err("sleep should time out");

        assert!(matches!(err, ProcessError::Timeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn process_runner_reports_spawn_failure() {
        let runner = ProcessCommandRunner;
        let err = runner
            .run("/nonexistent/ctf-binary", &[], Duration::from_secs(1))
            .await
            .expect_err("missing binary should fail");

        assert!(matches!(err, ProcessError::Spawn { .. }), "got {err:?}");
    }

    #[test]
    fn render_command_line_joins_arguments() {
        let args = vec![OsString::from("-p"), OsString::from("22")];
        assert_eq!(render_command_line("ssh", &args), "ssh -p 22");
    }
}
