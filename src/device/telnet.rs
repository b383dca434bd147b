//! Telnet transport.
//!
//! Option negotiation is refused outright (`DO` gets `WONT`, `WILL` gets
//! `DONT`), which leaves the remote side in plain NVT mode.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{
    CommandReply, ConnectionError, ConnectionFuture, DeviceConnection, FailureClass, ReplyFuture,
};
use super::descriptor::ConnectionDescriptor;
use super::factory::SshSettings;
use super::jump::{JumpTunnel, PortPool, TunnelRequest, open_tunnel};
use super::stream::{PRE_READ_DELAY, PromptStream, ReadFailure, clean_output};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const LOGIN_MARKER: &str = "login:";
const PASSWORD_MARKER: &str = "assword:";
const DEFAULT_PROMPT: &str = "# ";
const LINE_END: &str = "\r\n";

/// Strips Telnet commands from `chunk`, queueing refusals into `replies`.
///
/// Sequences split across chunk boundaries are not reassembled.
pub(crate) fn strip_telnet_commands(chunk: &[u8], replies: &mut Vec<u8>) -> Vec<u8> {
    let mut data = Vec::with_capacity(chunk.len());
    let mut bytes = chunk.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != IAC {
            data.push(byte);
            continue;
        }
        match bytes.next() {
            Some(DO) => {
                if let Some(option) = bytes.next() {
                    replies.extend([IAC, WONT, option]);
                }
            }
            Some(WILL) => {
                if let Some(option) = bytes.next() {
                    replies.extend([IAC, DONT, option]);
                }
            }
            Some(DONT | WONT) => {
                bytes.next();
            }
            Some(SB) => {
                let mut previous = 0_u8;
                for inner in bytes.by_ref() {
                    if previous == IAC && inner == SE {
                        break;
                    }
                    previous = inner;
                }
            }
            Some(IAC) => data.push(IAC),
            Some(_) | None => {}
        }
    }
    data
}

#[derive(Debug)]
struct TelnetSession {
    stream: PromptStream<TcpStream>,
    tunnel: Option<JumpTunnel>,
}

/// Connection to a device over Telnet.
#[derive(Debug)]
pub struct TelnetConnection {
    label: String,
    descriptor: ConnectionDescriptor,
    settings: SshSettings,
    pool: Arc<PortPool>,
    state: Mutex<Option<TelnetSession>>,
}

impl TelnetConnection {
    /// Builds an unopened connection. `settings` is used for the jump-host
    /// tunnel, if any.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        descriptor: ConnectionDescriptor,
        settings: SshSettings,
        pool: Arc<PortPool>,
    ) -> Self {
        Self {
            label: label.into(),
            descriptor,
            settings,
            pool,
            state: Mutex::new(None),
        }
    }

    fn prompt(&self) -> &str {
        self.descriptor.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }

    fn read_error(&self, stage: &str, failure: ReadFailure) -> ConnectionError {
        match failure {
            ReadFailure::Timeout(partial) => ConnectionError::Timeout {
                target: self.label.clone(),
                message: format!("waiting for {stage}; got {partial:?}"),
            },
            ReadFailure::Eof(partial) => ConnectionError::Protocol {
                target: self.label.clone(),
                message: format!("connection closed while waiting for {stage}; got {partial:?}"),
            },
            ReadFailure::Io(err) => ConnectionError::Transport {
                target: self.label.clone(),
                message: err.to_string(),
            },
        }
    }

    fn io_error(&self, err: &std::io::Error) -> ConnectionError {
        ConnectionError::Transport {
            target: self.label.clone(),
            message: err.to_string(),
        }
    }

    async fn establish(&self) -> Result<TelnetSession, ConnectionError> {
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

        let socket = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout {
            target: self.label.clone(),
            message: format!("connect to {host}:{port}"),
        })?
        .map_err(|err| self.io_error(&err))?;

        let mut stream = PromptStream::with_filter(socket, strip_telnet_commands);
        let deadline = Instant::now() + self.descriptor.read_timeout;
        if let Some(user) = &self.descriptor.user {
            stream
                .read_until(LOGIN_MARKER, deadline)
                .await
                .map_err(|failure| self.read_error("login prompt", failure))?;
            stream
                .write_line(user, LINE_END)
                .await
                .map_err(|err| self.io_error(&err))?;
            if let Some(password) = &self.descriptor.password {
                stream
                    .read_until(PASSWORD_MARKER, deadline)
                    .await
                    .map_err(|failure| self.read_error("password prompt", failure))?;
                stream
                    .write_line(password, LINE_END)
                    .await
                    .map_err(|err| self.io_error(&err))?;
            }
        }
        stream
            .read_until(self.prompt(), deadline)
            .await
            .map_err(|failure| self.read_error("shell prompt", failure))?;

        info!(target_device = %self.label, %host, port, "telnet session established");
        Ok(TelnetSession { stream, tunnel })
    }
}

impl DeviceConnection for TelnetConnection {
    fn describe(&self) -> String {
        format!("telnet {}:{}", self.descriptor.host, self.descriptor.port)
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
                    Ok(session) => *guard = Some(session),
                    Err(err) => return CommandReply::from(err),
                }
            }
            let Some(session) = guard.as_mut() else {
                return CommandReply::failure(FailureClass::Transport, "telnet session missing");
            };

            if let Err(err) = session.stream.write_line(cmd, LINE_END).await {
                *guard = None;
                return CommandReply::from(self.io_error(&err));
            }
            tokio::time::sleep(PRE_READ_DELAY).await;

            let marker = expected.unwrap_or_else(|| self.prompt());
            let outcome = session
                .stream
                .read_until(marker, Instant::now() + timeout)
                .await;
            match outcome {
                Ok(raw) => CommandReply::success(clean_output(&raw, cmd, self.prompt()), ""),
                Err(ReadFailure::Timeout(partial)) => {
                    debug!(target_device = %self.label, cmd, "telnet read timed out");
                    CommandReply::failure(FailureClass::Timeout, partial)
                }
                Err(failure) => {
                    warn!(target_device = %self.label, cmd, "telnet session lost");
                    *guard = None;
                    CommandReply::from(self.read_error("command output", failure))
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
            let Some(mut session) = self.state.lock().await.take() else {
                return Ok(());
            };
            if let Err(err) = session.stream.shutdown().await {
                debug!(target_device = %self.label, error = %err, "telnet shutdown failed");
            }
            if let Some(tunnel) = session.tunnel.take() {
                tunnel.close().await;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> String {
        let mut buf = Vec::new();
        reader.read_until(b'\n', &mut buf).await.expect("read");
        String::from_utf8_lossy(&buf)
            .chars()
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect::<String>()
            .trim()
            .to_owned()
    }

    #[test]
    fn negotiation_is_refused_and_stripped() {
        let mut replies = Vec::new();
        let chunk = [b'a', IAC, DO, 1, b'b', IAC, WILL, 3, IAC, SB, 24, 1, IAC, SE, b'c'];
        let data = strip_telnet_commands(&chunk, &mut replies);

        assert_eq!(data, b"abc");
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[tokio::test]
    async fn logs_in_and_runs_a_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            write.write_all(&[IAC, DO, 1]).await.expect("write");
            write.write_all(b"dut login: ").await.expect("write");
            let user = read_line(&mut reader).await;
            write.write_all(b"Password: ").await.expect("write");
            let password = read_line(&mut reader).await;
            write.write_all(b"\r\ndut# ").await.expect("write");
            let cmd = read_line(&mut reader).await;
            write
                .write_all(format!("{cmd}\r\nhello\r\ndut# ").as_bytes())
                .await
                .expect("write");
            (user, password, cmd)
        });

        let descriptor = ConnectionDescriptor {
            kind: super::super::TransportKind::Telnet,
            port,
            password: Some(String::from("pw")),
            read_timeout: Duration::from_secs(5),
            ..ConnectionDescriptor::ssh("127.0.0.1", "admin")
        };
        let conn = TelnetConnection::new(
            "node 4",
            descriptor,
            SshSettings::default(),
            Arc::new(PortPool::new()),
        );

        let reply = conn
            .send_command("echo hello", Duration::from_secs(5), None)
            .await;
        assert!(reply.is_success(), "{reply:?}");
        assert_eq!(reply.message, "hello");

        let (user, password, cmd) = server.await.expect("server");
        assert_eq!(user, "admin");
        assert_eq!(password, "pw");
        assert_eq!(cmd, "echo hello");
        conn.close().await.expect("close");
    }

    #[tokio::test]
    async fn file_transfer_is_unsupported() {
        let conn = TelnetConnection::new(
            "node 4",
            ConnectionDescriptor::ssh("127.0.0.1", "admin"),
            SshSettings::default(),
            Arc::new(PortPool::new()),
        );
        let err = conn
            .push_file(Utf8Path::new("/tmp/x"), "/tmp/x", false, Duration::from_secs(1))
            .await
            .expect_err("unsupported");
        assert!(matches!(err, ConnectionError::Unsupported { .. }));
    }
}
