//! Jump-host forwarding.
//!
//! Devices behind a jump host are reached through a local port forward
//! (`ssh -N -L`). The local ports a jump host offers are a shared resource,
//! so every connection leases them from one [`PortPool`].

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::ConnectionError;
use super::descriptor::JumpHost;
use super::secret::SshAuth;

const PORT_IN_USE_MARKER: &str = "Address already in use";
const READY_POLL: Duration = Duration::from_millis(100);

/// Local forwarding ports currently leased by open tunnels.
#[derive(Debug, Default)]
pub struct PortPool {
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases the first candidate that is neither in use nor in `skip`.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, candidates: &[u16], skip: &BTreeSet<u16>) -> Option<PortLease> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let port = candidates
            .iter()
            .copied()
            .find(|port| !in_use.contains(port) && !skip.contains(port))?;
        in_use.insert(port);
        Some(PortLease {
            pool: Arc::clone(self),
            port,
        })
    }

    /// Ports currently leased, in ascending order.
    #[must_use]
    pub fn leased(&self) -> Vec<u16> {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    fn release(&self, port: u16) {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }
}

/// A leased forwarding port, returned to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    /// The leased port number.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

/// A running `ssh -N -L` forward and the port it holds.
#[derive(Debug)]
pub(crate) struct JumpTunnel {
    child: Child,
    lease: PortLease,
    _auth: SshAuth,
}

impl JumpTunnel {
    /// Local port that reaches the target.
    pub(crate) const fn local_port(&self) -> u16 {
        self.lease.port()
    }

    /// Stops the forward and returns its port to the pool.
    pub(crate) async fn close(mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(port = self.lease.port(), error = %err, "jump tunnel already stopped");
        }
    }
}

/// Parameters for [`open_tunnel`].
#[derive(Debug)]
pub(crate) struct TunnelRequest<'a> {
    pub(crate) ssh_bin: &'a str,
    pub(crate) sshpass_bin: &'a str,
    pub(crate) jump: &'a JumpHost,
    pub(crate) target_host: &'a str,
    pub(crate) target_port: u16,
    pub(crate) timeout: Duration,
    pub(crate) label: &'a str,
}

/// Starts a forward to `target_host:target_port` through the jump host.
///
/// Ports already leased, or reported busy by `ssh`, are skipped in favour
/// of the next candidate.
pub(crate) async fn open_tunnel(
    pool: &Arc<PortPool>,
    request: &TunnelRequest<'_>,
) -> Result<JumpTunnel, ConnectionError> {
    let mut tried = BTreeSet::new();
    loop {
        let Some(lease) = pool.acquire(&request.jump.available_ports, &tried) else {
            return Err(ConnectionError::Busy {
                target: request.label.to_owned(),
            });
        };
        let port = lease.port();
        tried.insert(port);

        match start_forward(lease, request).await {
            Ok(tunnel) => return Ok(tunnel),
            Err(StartFailure::PortInUse) => {
                warn!(port, jump = %request.jump.host, "forwarding port in use; trying next");
            }
            Err(StartFailure::Fatal(err)) => return Err(err),
        }
    }
}

enum StartFailure {
    PortInUse,
    Fatal(ConnectionError),
}

async fn start_forward(
    lease: PortLease,
    request: &TunnelRequest<'_>,
) -> Result<JumpTunnel, StartFailure> {
    let transport = |message: String| {
        StartFailure::Fatal(ConnectionError::Transport {
            target: request.label.to_owned(),
            message,
        })
    };
    let jump = request.jump;
    let auth = SshAuth::prepare(jump.password.as_deref(), jump.private_key.as_deref())
        .map_err(|err| transport(format!("cannot stage jump host credentials: {err}")))?;

    let forward = format!(
        "{}:{}:{}",
        lease.port(),
        bracket_ipv6(request.target_host),
        request.target_port
    );
    let mut args: Vec<OsString> = ["-N", "-o", "ExitOnForwardFailure=yes"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.extend(super::ssh::common_options());
    args.extend(auth.identity_args());
    args.push(OsString::from("-L"));
    args.push(OsString::from(forward));
    args.push(OsString::from(format!("{}@{}", jump.user, jump.host)));
    let (program, full_args) = auth.wrap(request.sshpass_bin, request.ssh_bin, args);

    let mut command = Command::new(&program);
    if let Some((key, value)) = auth.env() {
        command.env(key, value);
    }
    let mut child = command
        .args(&full_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| transport(format!("failed to spawn {program}: {err}")))?;

    let deadline = Instant::now() + request.timeout;
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|err| transport(format!("jump tunnel wait failed: {err}")))?
        {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                pipe.read_to_string(&mut stderr).await.ok();
            }
            if stderr.contains(PORT_IN_USE_MARKER) {
                return Err(StartFailure::PortInUse);
            }
            return Err(transport(format!(
                "jump tunnel exited with {status}: {}",
                stderr.trim()
            )));
        }

        if TcpStream::connect(("127.0.0.1", lease.port())).await.is_ok() {
            debug!(port = lease.port(), jump = %jump.host, "jump tunnel ready");
            return Ok(JumpTunnel {
                child,
                lease,
                _auth: auth,
            });
        }

        if Instant::now() >= deadline {
            return Err(StartFailure::Fatal(ConnectionError::Timeout {
                target: request.label.to_owned(),
                message: format!("jump tunnel via {} did not come up", jump.host),
            }));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// Wraps IPv6 literals in brackets for `host:port` notation.
pub(crate) fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}
