//! Uniform command channel contract shared by every transport.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Return code reported when a command was cancelled.
pub const RC_CANCEL: i32 = -1;
/// Return code reported when a command timed out.
pub const RC_TIMEOUT: i32 = -2;
/// Return code reported when the transport failed.
pub const RC_EXCEPTION: i32 = -3;

/// Future returned by connection lifecycle operations.
pub type ConnectionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ConnectionError>> + Send + 'a>>;

/// Future returned by command operations. Commands never fail at the type
/// level; failures are folded into the [`CommandReply`].
pub type ReplyFuture<'a> = Pin<Box<dyn Future<Output = CommandReply> + Send + 'a>>;

/// Why a command or connection attempt did not succeed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureClass {
    /// The transport failed to open or died mid-read.
    Transport,
    /// The expected output never arrived.
    Timeout,
    /// Unexpected EOF or undecodable output.
    Protocol,
    /// The command ran but reported a non-zero status.
    Command,
    /// The run was cancelled while the command was in flight.
    Cancelled,
}

impl FailureClass {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Command => "command",
            Self::Cancelled => "cancelled",
        }
    }

    const fn return_code(self) -> i32 {
        match self {
            Self::Timeout => RC_TIMEOUT,
            Self::Cancelled => RC_CANCEL,
            Self::Transport | Self::Protocol | Self::Command => RC_EXCEPTION,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while opening, closing or transferring over a connection.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectionError {
    /// The transport could not be established or failed.
    #[error("{target}: transport failure: {message}")]
    Transport {
        /// Connection the failure relates to.
        target: String,
        /// Description of the failure.
        message: String,
    },
    /// The operation did not complete in time.
    #[error("{target}: timed out: {message}")]
    Timeout {
        /// Connection the failure relates to.
        target: String,
        /// Description of the failure.
        message: String,
    },
    /// The remote side spoke something unexpected.
    #[error("{target}: protocol error: {message}")]
    Protocol {
        /// Connection the failure relates to.
        target: String,
        /// Description of the failure.
        message: String,
    },
    /// Every forwarding port of the jump host is taken.
    #[error("{target}: all jump host ports are busy")]
    Busy {
        /// Connection the failure relates to.
        target: String,
    },
    /// The transport cannot perform the requested operation.
    #[error("{target}: {operation} is not supported by this transport")]
    Unsupported {
        /// Connection the failure relates to.
        target: String,
        /// Operation that was attempted.
        operation: &'static str,
    },
}

impl ConnectionError {
    /// Classifies the error for command replies.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Timeout { .. } => FailureClass::Timeout,
            Self::Protocol { .. } => FailureClass::Protocol,
            Self::Transport { .. } | Self::Busy { .. } | Self::Unsupported { .. } => {
                FailureClass::Transport
            }
        }
    }
}

/// Whether a command succeeded, encoded as the wire value `0` or `1`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CommandOutcome {
    /// Expected output observed or zero exit status.
    Success,
    /// Anything else.
    Failure,
}

impl CommandOutcome {
    /// Numeric outcome: `0` for success, `1` for failure.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }
}

/// Result of one command sent over a [`DeviceConnection`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandReply {
    /// Success or failure.
    pub outcome: CommandOutcome,
    /// Output read from the device, or the error string on failure.
    pub message: String,
    /// Standard error, for transports that separate it.
    pub stderr: String,
    /// Remote exit status or one of the `RC_*` codes.
    pub return_code: i32,
    /// Failure classification; `None` on success.
    pub failure: Option<FailureClass>,
}

impl CommandReply {
    /// Successful reply carrying `message` as output.
    pub fn success(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::Success,
            message: message.into(),
            stderr: stderr.into(),
            return_code: 0,
            failure: None,
        }
    }

    /// Failed reply with the return code implied by `class`.
    pub fn failure(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            outcome: CommandOutcome::Failure,
            message: message.into(),
            stderr: String::new(),
            return_code: class.return_code(),
            failure: Some(class),
        }
    }

    /// Reply for a command that ran and exited with `code`.
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        if code == 0 {
            return Self::success(stdout, stderr);
        }
        Self {
            outcome: CommandOutcome::Failure,
            message: stdout.into(),
            stderr: stderr.into(),
            return_code: code,
            failure: Some(FailureClass::Command),
        }
    }

    /// Reply for a cancelled command.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::failure(FailureClass::Cancelled, "cancelled")
    }

    /// Returns `true` when the outcome is success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Success)
    }
}

impl From<ConnectionError> for CommandReply {
    fn from(value: ConnectionError) -> Self {
        Self::failure(value.class(), value.to_string())
    }
}

/// Output observed while a command runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputEvent {
    /// Command text written to the device.
    Stdin(String),
    /// A chunk of standard output.
    Stdout(String),
    /// A chunk of standard error.
    Stderr(String),
}

/// Receives command text or an output chunk.
pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional observers for [`DeviceConnection::send_command_parallel`].
#[derive(Clone, Default)]
pub struct CommandCallbacks {
    /// Invoked before the first sub-command starts.
    pub on_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Invoked once with the final reply.
    pub on_stop: Option<Arc<dyn Fn(&CommandReply) + Send + Sync>>,
    /// Invoked with every command written.
    pub on_stdin: Option<TextCallback>,
    /// Invoked with every stdout chunk.
    pub on_stdout: Option<TextCallback>,
    /// Invoked with every stderr chunk.
    pub on_stderr: Option<TextCallback>,
}

impl fmt::Debug for CommandCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandCallbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("on_stdin", &self.on_stdin.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

impl CommandCallbacks {
    fn dispatch(&self, event: &OutputEvent) {
        let (callback, text) = match event {
            OutputEvent::Stdin(text) => (&self.on_stdin, text),
            OutputEvent::Stdout(text) => (&self.on_stdout, text),
            OutputEvent::Stderr(text) => (&self.on_stderr, text),
        };
        if let Some(callback) = callback {
            callback(text);
        }
    }
}

/// Options for [`DeviceConnection::send_command_parallel`].
#[derive(Clone, Debug, Default)]
pub struct ParallelOptions {
    /// Observers notified as the command progresses.
    pub callbacks: CommandCallbacks,
    /// Checked before every sub-command and while waiting for output.
    pub cancel: Option<CancellationToken>,
    /// Run each `;`-separated part as its own command.
    pub split_on_semicolon: bool,
}

/// Command channel to one device.
///
/// Implementations serialise commands internally; callers may share a
/// connection between tasks, but a single connection never pipelines.
pub trait DeviceConnection: Send + Sync + fmt::Debug {
    /// Short description such as `ssh root@10.0.0.2:22`.
    fn describe(&self) -> String;

    /// Establishes the transport. Calling it on an open connection is a
    /// no-op.
    fn open(&self) -> ConnectionFuture<'_, ()>;

    /// Writes `cmd` and waits for `expected` output (the configured prompt
    /// when `None`), the `timeout`, or EOF.
    fn send_command<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        expected: Option<&'a str>,
    ) -> ReplyFuture<'a>;

    /// Runs `cmd` and reports output through `events` as it arrives.
    ///
    /// The default forwards the complete output once the command returns.
    fn send_command_streaming<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        events: mpsc::UnboundedSender<OutputEvent>,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            events.send(OutputEvent::Stdin(cmd.to_owned())).ok();
            let reply = self.send_command(cmd, timeout, None).await;
            if !reply.message.is_empty() {
                events.send(OutputEvent::Stdout(reply.message.clone())).ok();
            }
            if !reply.stderr.is_empty() {
                events.send(OutputEvent::Stderr(reply.stderr.clone())).ok();
            }
            reply
        })
    }

    /// Copies a local file (or directory when `recursive`) to the device.
    fn push_file<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
        recursive: bool,
        timeout: Duration,
    ) -> ConnectionFuture<'a, ()>;

    /// Copies a remote file (or directory when `recursive`) into the local
    /// directory `local_dir`.
    fn pull_file<'a>(
        &'a self,
        remote: &'a str,
        local_dir: &'a Utf8Path,
        recursive: bool,
        timeout: Duration,
    ) -> ConnectionFuture<'a, ()>;

    /// Releases the transport and any jump-host tunnel.
    fn close(&self) -> ConnectionFuture<'_, ()>;

    /// Richer command entry point used by the fanout layer.
    ///
    /// Callbacks run on the calling task while the transport works, never
    /// inside the connection's critical section.
    fn send_command_parallel<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        options: &'a ParallelOptions,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            if let Some(on_start) = &options.callbacks.on_start {
                on_start();
            }

            let parts: Vec<&str> = if options.split_on_semicolon {
                cmd.split(';')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .collect()
            } else {
                vec![cmd]
            };

            let mut combined = CommandReply::success(String::new(), String::new());
            for part in parts {
                if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    combined = merge_replies(combined, CommandReply::cancelled());
                    break;
                }
                let reply = run_observed(self, part, timeout, options).await;
                combined = merge_replies(combined, reply);
                if !combined.is_success() {
                    break;
                }
            }

            if let Some(on_stop) = &options.callbacks.on_stop {
                on_stop(&combined);
            }
            combined
        })
    }
}

async fn run_observed<C: DeviceConnection + ?Sized>(
    connection: &C,
    cmd: &str,
    timeout: Duration,
    options: &ParallelOptions,
) -> CommandReply {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let work = async {
        let command = connection.send_command_streaming(cmd, timeout, tx);
        match &options.cancel {
            Some(token) => tokio::select! {
                reply = command => reply,
                () = token.cancelled() => CommandReply::cancelled(),
            },
            None => command.await,
        }
    };
    let drain = async {
        while let Some(event) = rx.recv().await {
            options.callbacks.dispatch(&event);
        }
    };
    let (reply, ()) = tokio::join!(work, drain);
    reply
}

fn merge_replies(previous: CommandReply, next: CommandReply) -> CommandReply {
    CommandReply {
        message: format!("{}{}", previous.message, next.message),
        stderr: format!("{}{}", previous.stderr, next.stderr),
        ..next
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::ScriptedConnection;

    #[test]
    fn connection_errors_map_to_failure_classes() {
        let err = ConnectionError::Timeout {
            target: String::from("t"),
            message: String::from("slow"),
        };
        let reply = CommandReply::from(err);
        assert_eq!(reply.failure, Some(FailureClass::Timeout));
        assert_eq!(reply.return_code, RC_TIMEOUT);
        assert_eq!(reply.outcome.code(), 1);
    }

    #[test]
    fn exited_zero_is_success() {
        assert!(CommandReply::exited(0, "ok", "").is_success());
        let failed = CommandReply::exited(2, "", "boom");
        assert_eq!(failed.failure, Some(FailureClass::Command));
        assert_eq!(failed.return_code, 2);
    }

    #[tokio::test]
    async fn split_commands_stop_at_first_failure_and_concatenate_output() {
        let conn = ScriptedConnection::new("dut");
        conn.reply_to("echo a", CommandReply::success("a\n", ""));
        conn.reply_to("false", CommandReply::exited(1, "f\n", ""));
        conn.reply_to("echo c", CommandReply::success("c\n", ""));

        let options = ParallelOptions {
            split_on_semicolon: true,
            ..ParallelOptions::default()
        };
        let reply = conn
            .send_command_parallel("echo a; false ; echo c", Duration::from_secs(1), &options)
            .await;

        assert!(!reply.is_success());
        assert_eq!(reply.message, "a\nf\n");
        assert_eq!(conn.commands(), vec!["echo a", "false"]);
    }

    #[tokio::test]
    async fn callbacks_observe_stdin_stdout_and_stop() {
        let conn = ScriptedConnection::new("dut");
        conn.reply_to("uname", CommandReply::success("Linux\n", ""));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stdin_seen = Arc::clone(&seen);
        let stdout_seen = Arc::clone(&seen);
        let stop_seen = Arc::clone(&seen);

        let options = ParallelOptions {
            callbacks: CommandCallbacks {
                on_stdin: Some(Arc::new(move |text| {
                    stdin_seen.lock().expect("lock").push(format!("in:{text}"));
                })),
                on_stdout: Some(Arc::new(move |text| {
                    stdout_seen.lock().expect("lock").push(format!("out:{text}"));
                })),
                on_stop: Some(Arc::new(move |reply| {
                    stop_seen
                        .lock()
                        .expect("lock")
                        .push(format!("stop:{}", reply.outcome.code()));
                })),
                ..CommandCallbacks::default()
            },
            ..ParallelOptions::default()
        };
        conn.send_command_parallel("uname", Duration::from_secs(1), &options)
            .await;

        let events = seen.lock().expect("lock").clone();
        assert_eq!(events, vec!["in:uname", "out:Linux\n", "stop:0"]);
    }

    #[tokio::test]
    async fn cancelled_token_skips_remaining_parts() {
        let conn = ScriptedConnection::new("dut");
        let token = CancellationToken::new();
        token.cancel();
        let options = ParallelOptions {
            cancel: Some(token),
            split_on_semicolon: true,
            ..ParallelOptions::default()
        };

        let reply = conn
            .send_command_parallel("a; b", Duration::from_secs(1), &options)
            .await;

        assert_eq!(reply.failure, Some(FailureClass::Cancelled));
        assert!(conn.commands().is_empty());
    }
}
