//! Builds connections from descriptors.

use std::sync::Arc;
use std::time::Duration;

use super::connection::{ConnectionError, DeviceConnection};
use super::descriptor::{ConnectionDescriptor, TransportKind};
use super::jump::PortPool;
use super::local::LocalConnection;
use super::serial::SerialConnection;
use super::ssh::SshConnection;
use super::telnet::TelnetConnection;
use super::NodeId;
use crate::process::CommandRunner;

/// Client binaries and timeouts used by the SSH-based transports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// `ssh` client binary.
    pub ssh_bin: String,
    /// `scp` client binary.
    pub scp_bin: String,
    /// `sshpass` binary used for password logins.
    pub sshpass_bin: String,
    /// How long to wait for a session or tunnel to come up.
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            sshpass_bin: String::from("sshpass"),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Turns a descriptor into a connection.
pub trait ConnectionFactory: Send + Sync + std::fmt::Debug {
    /// Builds an unopened connection for `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the descriptor cannot be served.
    fn build(
        &self,
        node_id: NodeId,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError>;
}

/// Factory backed by the real transports.
#[derive(Clone, Debug)]
pub struct TransportFactory {
    ssh: SshSettings,
    stty_bin: String,
    chroot_bin: String,
    runner: Arc<dyn CommandRunner>,
    pool: Arc<PortPool>,
}

impl TransportFactory {
    /// Builds a factory sharing `pool` between every jump-host tunnel.
    #[must_use]
    pub fn new(ssh: SshSettings, runner: Arc<dyn CommandRunner>, pool: Arc<PortPool>) -> Self {
        Self {
            ssh,
            stty_bin: String::from("stty"),
            chroot_bin: String::from("chroot"),
            runner,
            pool,
        }
    }

    /// Overrides the `stty` binary.
    #[must_use]
    pub fn with_stty_bin(mut self, stty_bin: impl Into<String>) -> Self {
        self.stty_bin = stty_bin.into();
        self
    }

    /// Pool shared by the tunnels of this factory.
    #[must_use]
    pub const fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }
}

impl ConnectionFactory for TransportFactory {
    fn build(
        &self,
        node_id: NodeId,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<dyn DeviceConnection>, ConnectionError> {
        let label = format!("node {node_id}");
        let connection: Arc<dyn DeviceConnection> = match descriptor.kind {
            TransportKind::Ssh => Arc::new(SshConnection::new(
                label,
                descriptor.clone(),
                self.ssh.clone(),
                Arc::clone(&self.runner),
                Arc::clone(&self.pool),
            )),
            TransportKind::Telnet => Arc::new(TelnetConnection::new(
                label,
                descriptor.clone(),
                self.ssh.clone(),
                Arc::clone(&self.pool),
            )),
            TransportKind::Serial => {
                if descriptor.serial.is_none() {
                    return Err(ConnectionError::Transport {
                        target: label,
                        message: String::from("serial descriptor without line settings"),
                    });
                }
                Arc::new(SerialConnection::new(
                    label,
                    descriptor.clone(),
                    self.stty_bin.clone(),
                    Arc::clone(&self.runner),
                ))
            }
            TransportKind::LocalChroot => Arc::new(LocalConnection::new(
                label,
                descriptor.chroot.clone(),
                self.chroot_bin.clone(),
                Arc::clone(&self.runner),
            )),
        };
        Ok(connection)
    }
}
