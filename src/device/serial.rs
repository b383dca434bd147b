//! Serial console transport.
//!
//! The line is configured with `stty` and then driven as a plain file, so
//! any tty the host exposes (USB adapters, console servers mapped to
//! `/dev/tty*`) works without a dedicated serial crate.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::connection::{
    CommandReply, ConnectionError, ConnectionFuture, DeviceConnection, FailureClass, ReplyFuture,
};
use super::descriptor::{ConnectionDescriptor, Parity, SerialSettings};
use super::stream::{PRE_READ_DELAY, PromptStream, ReadFailure, clean_output};
use crate::process::CommandRunner;

const ANY_OUTPUT: &str = "*";
const STTY_TIMEOUT: Duration = Duration::from_secs(10);

/// `stty` arguments that put the line into raw mode with `settings`.
pub(crate) fn stty_args(settings: &SerialSettings) -> Vec<OsString> {
    let toggle = |enabled: bool, flag: &str| {
        if enabled {
            flag.to_owned()
        } else {
            format!("-{flag}")
        }
    };
    let mut args = vec![
        String::from("-F"),
        settings.port_name.to_string(),
        settings.baud_rate.to_string(),
        format!("cs{}", settings.data_bits),
    ];
    args.push(toggle(settings.parity != Parity::None, "parenb"));
    args.push(toggle(settings.parity == Parity::Odd, "parodd"));
    args.push(toggle(settings.stop_bits >= 2, "cstopb"));
    args.push(toggle(settings.rts_cts, "crtscts"));
    args.push(toggle(settings.xon_xoff, "ixon"));
    args.extend(["raw", "-echo", "min", "1", "time", "0"].map(String::from));
    args.into_iter().map(OsString::from).collect()
}

/// Connection to a device over a local serial line.
#[derive(Debug)]
pub struct SerialConnection {
    label: String,
    descriptor: ConnectionDescriptor,
    stty_bin: String,
    runner: Arc<dyn CommandRunner>,
    state: Mutex<Option<PromptStream<File>>>,
}

impl SerialConnection {
    /// Builds an unopened connection.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        descriptor: ConnectionDescriptor,
        stty_bin: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            label: label.into(),
            descriptor,
            stty_bin: stty_bin.into(),
            runner,
            state: Mutex::new(None),
        }
    }

    fn transport(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::Transport {
            target: self.label.clone(),
            message: message.into(),
        }
    }

    fn settings(&self) -> Result<&SerialSettings, ConnectionError> {
        self.descriptor
            .serial
            .as_ref()
            .ok_or_else(|| self.transport("descriptor has no serial settings"))
    }

    fn termination(&self) -> &str {
        self.descriptor
            .serial
            .as_ref()
            .map_or("\r\n", |settings| settings.termination.as_str())
    }

    fn prompt(&self) -> &str {
        self.descriptor.prompt.as_deref().unwrap_or(ANY_OUTPUT)
    }

    async fn establish(&self) -> Result<PromptStream<File>, ConnectionError> {
        let settings = self.settings()?;
        let args = stty_args(settings);
        let output = self
            .runner
            .run(&self.stty_bin, &args, STTY_TIMEOUT)
            .await
            .map_err(|err| self.transport(err.to_string()))?;
        if !output.is_success() {
            return Err(self.transport(format!(
                "stty exited with {}: {}",
                output.status_text(),
                output.stderr.trim()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(settings.port_name.as_std_path())
            .await
            .map_err(|err| self.transport(format!("open {}: {err}", settings.port_name)))?;
        info!(target_device = %self.label, port = %settings.port_name, "serial line open");
        Ok(PromptStream::new(file))
    }
}

impl DeviceConnection for SerialConnection {
    fn describe(&self) -> String {
        self.descriptor.serial.as_ref().map_or_else(
            || String::from("serial"),
            |settings| format!("serial {}@{}", settings.port_name, settings.baud_rate),
        )
    }

    fn open(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.state.lock().await;
            if guard.is_none() {
                *guard = Some(self.establish().await?);
            }
            Ok(())
        })
    }

    fn send_command<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        expected: Option<&'a str>,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            let mut guard = self.state.lock().await;
            if guard.is_none() {
                match self.establish().await {
                    Ok(stream) => *guard = Some(stream),
                    Err(err) => return CommandReply::from(err),
                }
            }
            let Some(stream) = guard.as_mut() else {
                return CommandReply::failure(FailureClass::Transport, "serial line missing");
            };

            if let Err(err) = stream.write_line(cmd, self.termination()).await {
                *guard = None;
                return CommandReply::from(self.transport(err.to_string()));
            }
            tokio::time::sleep(PRE_READ_DELAY).await;

            let marker = expected.unwrap_or_else(|| self.prompt());
            match stream.read_until(marker, Instant::now() + timeout).await {
                Ok(raw) => CommandReply::success(clean_output(&raw, cmd, self.prompt()), ""),
                Err(ReadFailure::Timeout(partial)) => {
                    debug!(target_device = %self.label, cmd, "serial read timed out");
                    CommandReply::failure(FailureClass::Timeout, partial)
                }
                Err(ReadFailure::Eof(partial)) => {
                    *guard = None;
                    CommandReply::failure(FailureClass::Protocol, partial)
                }
                Err(ReadFailure::Io(err)) => {
                    *guard = None;
                    CommandReply::failure(FailureClass::Transport, err.to_string())
                }
            }
        })
    }

    fn push_file<'a>(
        &'a self,
        _local: &'a Utf8Path,
        _remote: &'a str,
        _recursive: bool,
        _timeout: Duration,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            Err(ConnectionError::Unsupported {
                target: self.label.clone(),
                operation: "push_file",
            })
        })
    }

    fn pull_file<'a>(
        &'a self,
        _remote: &'a str,
        _local_dir: &'a Utf8Path,
        _recursive: bool,
        _timeout: Duration,
    ) -> ConnectionFuture<'a, ()> {
        Box::pin(async move {
            Err(ConnectionError::Unsupported {
                target: self.label.clone(),
                operation: "pull_file",
            })
        })
    }

    fn close(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.take();
            Ok(())
        })
    }
}
