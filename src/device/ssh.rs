//! SSH transport built on the system `ssh` and `scp` clients.
//!
//! Opening a connection starts a control master (`ssh -M -N`) on a private
//! socket; every command and copy then multiplexes over that socket, so
//! authentication happens once per device.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::{
    CommandReply, ConnectionError, ConnectionFuture, DeviceConnection, FailureClass, ReplyFuture,
};
use super::descriptor::ConnectionDescriptor;
use super::factory::SshSettings;
use super::jump::{JumpTunnel, PortPool, TunnelRequest, bracket_ipv6, open_tunnel};
use super::secret::SshAuth;
use crate::process::{CommandOutput, CommandRunner, ProcessError};

const SSH_TRANSPORT_FAILURE: i32 = 255;
const MASTER_POLL: Duration = Duration::from_millis(200);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Options shared by every `ssh` and `scp` invocation.
pub(crate) fn common_options() -> Vec<OsString> {
    [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
        "-o",
        "ServerAliveInterval=15",
    ]
    .into_iter()
    .map(OsString::from)
    .collect()
}

#[derive(Debug)]
struct SshSession {
    control_path: PathBuf,
    host: String,
    port: u16,
    master: Child,
    tunnel: Option<JumpTunnel>,
    _auth: SshAuth,
}

impl SshSession {
    fn control_args(&self) -> Vec<OsString> {
        let mut args = common_options();
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ControlPath={}",
            self.control_path.display()
        )));
        args.push(OsString::from("-o"));
        args.push(OsString::from("ControlMaster=no"));
        args
    }
}

/// Connection to a device over SSH.
#[derive(Debug)]
pub struct SshConnection {
    label: String,
    descriptor: ConnectionDescriptor,
    settings: SshSettings,
    runner: Arc<dyn CommandRunner>,
    pool: Arc<PortPool>,
    state: Mutex<Option<SshSession>>,
}

impl SshConnection {
    /// Builds an unopened connection.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        descriptor: ConnectionDescriptor,
        settings: SshSettings,
        runner: Arc<dyn CommandRunner>,
        pool: Arc<PortPool>,
    ) -> Self {
        Self {
            label: label.into(),
            descriptor,
            settings,
            runner,
            pool,
            state: Mutex::new(None),
        }
    }

    fn user(&self) -> &str {
        self.descriptor.user.as_deref().unwrap_or("root")
    }

    fn login(&self, session: &SshSession) -> String {
        format!("{}@{}", self.user(), session.host)
    }

    async fn session(&self) -> Result<MappedMutexGuard<'_, SshSession>, ConnectionError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.establish().await?);
        }
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| self.transport("session vanished"))
    }

    fn transport(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::Transport {
            target: self.label.clone(),
            message: message.into(),
        }
    }

    async fn establish(&self) -> Result<SshSession, ConnectionError> {
        let auth = SshAuth::prepare(
            self.descriptor.password.as_deref(),
            self.descriptor.private_key.as_deref(),
        )
        .map_err(|err| self.transport(format!("cannot stage credentials: {err}")))?;

        let tunnel = match &self.descriptor.jump_host {
            Some(jump) => {
                let request = TunnelRequest {
                    ssh_bin: &self.settings.ssh_bin,
                    sshpass_bin: &self.settings.sshpass_bin,
                    jump,
                    target_host: &self.descriptor.host,
                    target_port: self.descriptor.port,
                    timeout: self.settings.connect_timeout,
                    label: &self.label,
                };
                Some(open_tunnel(&self.pool, &request).await?)
            }
            None => None,
        };
        let (host, port) = tunnel.as_ref().map_or_else(
            || (self.descriptor.host.clone(), self.descriptor.port),
            |t| (String::from("127.0.0.1"), t.local_port()),
        );

        let control_path =
            std::env::temp_dir().join(format!("ctf-{}.sock", Uuid::new_v4().simple()));
        let mut args = vec![OsString::from("-M"), OsString::from("-N")];
        args.extend(common_options());
        if !auth.has_password() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }
        args.extend(auth.identity_args());
        args.extend([
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", control_path.display())),
            OsString::from("-p"),
            OsString::from(port.to_string()),
            OsString::from(format!("{}@{host}", self.user())),
        ]);
        let (program, full_args) = auth.wrap(&self.settings.sshpass_bin, &self.settings.ssh_bin, args);

        let mut command = Command::new(&program);
        if let Some((key, value)) = auth.env() {
            command.env(key, value);
        }
        let master = command
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.transport(format!("failed to spawn {program}: {err}")))?;

        let mut session = SshSession {
            control_path,
            host,
            port,
            master,
            tunnel,
            _auth: auth,
        };
        self.wait_for_master(&mut session).await?;
        info!(target_device = %self.label, host = %session.host, "ssh session established");
        Ok(session)
    }

    async fn wait_for_master(&self, session: &mut SshSession) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            if let Some(status) = session
                .master
                .try_wait()
                .map_err(|err| self.transport(format!("ssh master wait failed: {err}")))?
            {
                let mut stderr = String::new();
                if let Some(mut pipe) = session.master.stderr.take() {
                    pipe.read_to_string(&mut stderr).await.ok();
                }
                return Err(self.transport(format!(
                    "ssh exited with {status}: {}",
                    stderr.trim()
                )));
            }

            let mut args = session.control_args();
            args.extend([
                OsString::from("-O"),
                OsString::from("check"),
                OsString::from(self.login(session)),
            ]);
            let check = self
                .runner
                .run(&self.settings.ssh_bin, &args, CONTROL_TIMEOUT)
                .await;
            if check.as_ref().is_ok_and(CommandOutput::is_success) {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ConnectionError::Timeout {
                    target: self.label.clone(),
                    message: format!("ssh to {} did not authenticate", session.host),
                });
            }
            tokio::time::sleep(MASTER_POLL).await;
        }
    }

    fn remote_spec(&self, session: &SshSession, path: &str) -> String {
        format!("{}@{}:{path}", self.user(), bracket_ipv6(&session.host))
    }

    async fn copy(&self, mut args: Vec<OsString>, timeout: Duration) -> Result<(), ConnectionError> {
        let session = self.session().await?;
        let mut full = session.control_args();
        full.extend([OsString::from("-P"), OsString::from(session.port.to_string())]);
        full.append(&mut args);
        drop(session);

        let result = self.runner.run(&self.settings.scp_bin, &full, timeout).await;
        match result {
            Ok(output) if output.is_success() => Ok(()),
            Ok(output) => Err(self.transport(format!(
                "scp exited with {}: {}",
                output.status_text(),
                output.stderr.trim()
            ))),
            Err(ProcessError::Timeout { .. }) => Err(ConnectionError::Timeout {
                target: self.label.clone(),
                message: String::from("scp did not finish"),
            }),
            Err(err) => Err(self.transport(err.to_string())),
        }
    }
}

/// Maps an `ssh` exit into a command reply, treating exit 255 as a
/// transport failure and checking for `expected` output when given.
pub(crate) fn reply_from_output(
    output: CommandOutput,
    expected: Option<&str>,
) -> CommandReply {
    let code = output.code.unwrap_or(SSH_TRANSPORT_FAILURE);
    if code == SSH_TRANSPORT_FAILURE {
        return CommandReply::failure(
            FailureClass::Transport,
            format!("ssh transport failure: {}", output.stderr.trim()),
        );
    }
    if let Some(marker) = expected.filter(|m| *m != "*" && *m != " ")
        && code == 0
        && !output.stdout.contains(marker)
    {
        return CommandReply::failure(
            FailureClass::Protocol,
            format!("expected output {marker:?} not found in: {}", output.stdout),
        );
    }
    CommandReply::exited(code, output.stdout, output.stderr)
}

impl DeviceConnection for SshConnection {
    fn describe(&self) -> String {
        format!(
            "ssh {}@{}:{}",
            self.user(),
            self.descriptor.host,
            self.descriptor.port
        )
    }

    fn open(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async move { self.session().await.map(drop) })
    }

    fn send_command<'a>(
        &'a self,
        cmd: &'a str,
        timeout: Duration,
        expected: Option<&'a str>,
    ) -> ReplyFuture<'a> {
        Box::pin(async move {
            let session = match self.session().await {
                Ok(session) => session,
                Err(err) => return CommandReply::from(err),
            };
            let mut args = session.control_args();
            args.extend([
                OsString::from("-p"),
                OsString::from(session.port.to_string()),
                OsString::from(self.login(&session)),
                OsString::from("--"),
                OsString::from(cmd),
            ]);
            debug!(target_device = %self.label, cmd, "ssh command");

            let result = self.runner.run(&self.settings.ssh_bin, &args, timeout).await;
            drop(session);
            match result {
                Ok(output) => reply_from_output(output, expected),
                Err(ProcessError::Timeout { .. }) => CommandReply::failure(
                    FailureClass::Timeout,
                    format!("{cmd}: no reply within {}s", timeout.as_secs()),
                ),
                Err(err) => CommandReply::failure(FailureClass::Transport, err.to_string()),
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
            let target = {
                let session = self.session().await?;
                self.remote_spec(&session, remote)
            };
            let mut args = Vec::new();
            if recursive {
                args.push(OsString::from("-r"));
            }
            args.push(OsString::from(local.as_str()));
            args.push(OsString::from(target));
            self.copy(args, timeout).await
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
            let source = {
                let session = self.session().await?;
                self.remote_spec(&session, remote)
            };
            let mut args = Vec::new();
            if recursive {
                args.push(OsString::from("-r"));
            }
            args.push(OsString::from(source));
            args.push(OsString::from(local_dir.as_str()));
            self.copy(args, timeout).await
        })
    }

    fn close(&self) -> ConnectionFuture<'_, ()> {
        Box::pin(async move {
            let Some(mut session) = self.state.lock().await.take() else {
                return Ok(());
            };
            let mut args = session.control_args();
            args.extend([
                OsString::from("-O"),
                OsString::from("exit"),
                OsString::from(self.login(&session)),
            ]);
            if let Err(err) = self.runner.run(&self.settings.ssh_bin, &args, CONTROL_TIMEOUT).await {
                debug!(target_device = %self.label, error = %err, "ssh control exit failed");
            }
            session.master.kill().await.ok();
            if let Some(tunnel) = session.tunnel.take() {
                tunnel.close().await;
            }
            Ok(())
        })
    }
}
