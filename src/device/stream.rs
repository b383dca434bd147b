//! Prompt-delimited reads over a byte stream.
//!
//! Telnet and serial transports write a command and then read until an
//! expected marker shows up. [`PromptStream`] owns that loop for any
//! `AsyncRead + AsyncWrite` so both transports, and the tests, share it.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Pause between writing a command and the first read.
pub const PRE_READ_DELAY: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 4096;

/// Why a prompt read returned early.
#[derive(Debug)]
pub enum ReadFailure {
    /// The deadline elapsed; carries whatever arrived.
    Timeout(String),
    /// The peer closed the stream; carries whatever arrived.
    Eof(String),
    /// The stream failed.
    Io(io::Error),
}

/// Hook applied to every chunk before it is appended to the buffer.
pub type ChunkFilter = fn(&[u8], &mut Vec<u8>) -> Vec<u8>;

/// Byte stream with prompt-oriented helpers.
#[derive(Debug)]
pub struct PromptStream<S> {
    inner: S,
    filter: Option<ChunkFilter>,
    replies: Vec<u8>,
}

impl<S> PromptStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps `inner` without any chunk filtering.
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            filter: None,
            replies: Vec::new(),
        }
    }

    /// Wraps `inner`, passing every received chunk through `filter`.
    ///
    /// The filter may queue bytes to send back to the peer (for example
    /// option negotiation replies); they are flushed before the next read.
    pub const fn with_filter(inner: S, filter: ChunkFilter) -> Self {
        Self {
            inner,
            filter: Some(filter),
            replies: Vec::new(),
        }
    }

    /// Writes `line` followed by `terminator` and flushes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn write_line(&mut self, line: &str, terminator: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(terminator.as_bytes()).await?;
        self.inner.flush().await
    }

    /// Reads until `expected` appears in the accumulated output.
    ///
    /// An `expected` of `"*"` or `" "` accepts the first non-empty output.
    /// Returns the decoded output including the marker.
    ///
    /// # Errors
    ///
    /// Returns [`ReadFailure`] on timeout, EOF or I/O failure. Timeout and
    /// EOF carry the partial output.
    pub async fn read_until(&mut self, expected: &str, deadline: Instant) -> Result<String, ReadFailure> {
        let any_output = expected == "*" || expected == " ";
        let mut collected = Vec::new();
        let mut chunk = vec![0_u8; READ_CHUNK];

        loop {
            self.flush_replies().await.map_err(ReadFailure::Io)?;
            let text = decode_lossy_ascii(&collected);
            if (any_output && !text.trim().is_empty()) || (!any_output && text.contains(expected)) {
                return Ok(text);
            }

            let read = tokio::time::timeout_at(deadline, self.inner.read(&mut chunk)).await;
            let count = match read {
                Err(_) => return Err(ReadFailure::Timeout(text)),
                Ok(Err(err)) => return Err(ReadFailure::Io(err)),
                Ok(Ok(0)) => return Err(ReadFailure::Eof(text)),
                Ok(Ok(count)) => count,
            };
            let received = chunk.get(..count).unwrap_or_default();
            let filtered = self.filter.map_or_else(
                || received.to_vec(),
                |filter| filter(received, &mut self.replies),
            );
            collected.extend(filtered);
        }
    }

    /// Drains whatever is readable within `window` and discards it.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn discard_pending(&mut self, window: Duration) -> io::Result<()> {
        let deadline = Instant::now() + window;
        let mut chunk = vec![0_u8; READ_CHUNK];
        loop {
            self.flush_replies().await?;
            match tokio::time::timeout_at(deadline, self.inner.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => return Ok(()),
                Ok(Err(err)) => return Err(err),
                Ok(Ok(count)) => {
                    if let (Some(filter), Some(received)) = (self.filter, chunk.get(..count)) {
                        filter(received, &mut self.replies);
                    }
                }
            }
        }
    }

    /// Shuts the write half down.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    async fn flush_replies(&mut self) -> io::Result<()> {
        if self.replies.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.replies);
        self.inner.write_all(&pending).await?;
        self.inner.flush().await
    }
}

/// Decodes device output as ASCII, replacing anything else and dropping
/// NUL bytes.
#[must_use]
pub fn decode_lossy_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|byte| **byte != 0)
        .map(|byte| {
            if byte.is_ascii() {
                char::from(*byte)
            } else {
                char::REPLACEMENT_CHARACTER
            }
        })
        .collect()
}

/// Removes the echoed command and the trailing prompt from raw output.
pub(crate) fn clean_output(raw: &str, cmd: &str, prompt: &str) -> String {
    let body = raw
        .trim_start()
        .strip_prefix(cmd)
        .map_or(raw, |rest| rest.trim_start_matches(['\r', '\n']));
    let trimmed = body.trim_end();
    let marker = prompt.trim();
    let has_marker = |line: &str| !marker.is_empty() && marker != "*" && line.contains(marker);
    let without_prompt = match trimmed.rsplit_once('\n') {
        Some((head, last)) if has_marker(last) => head,
        None if has_marker(trimmed) => "",
        _ => trimmed,
    };
    without_prompt.trim_end().replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_until_prompt_across_chunks() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PromptStream::new(client);

        let writer = tokio::spawn(async move {
            server.write_all(b"uptime\r\n 10:00 up").await.expect("write");
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.write_all(b" 3 days\r\nroot@dut:~# ").await.expect("write");
            server
        });

        let output = stream
            .read_until("# ", Instant::now() + Duration::from_secs(2))
            .await
            .expect("prompt arrives");
        assert!(output.contains("3 days"));
        assert!(output.ends_with("# "));
        drop(writer.await.expect("writer"));
    }

    #[tokio::test]
    async fn timeout_returns_partial_output() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PromptStream::new(client);
        server.write_all(b"partial").await.expect("write");

        let err = stream
            .read_until("$ ", Instant::now() + Duration::from_millis(50))
            .await
            .expect_err("no prompt");
        assert!(matches!(err, ReadFailure::Timeout(ref text) if text == "partial"));
        drop(server);
    }

    #[tokio::test]
    async fn eof_is_reported_with_partial_output() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PromptStream::new(client);
        server.write_all(b"bye").await.expect("write");
        drop(server);

        let err = stream
            .read_until("$ ", Instant::now() + Duration::from_secs(1))
            .await
            .expect_err("eof");
        assert!(matches!(err, ReadFailure::Eof(ref text) if text == "bye"));
    }

    #[tokio::test]
    async fn wildcard_accepts_any_output() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = PromptStream::new(client);
        server.write_all(b"ok").await.expect("write");

        let output = stream
            .read_until("*", Instant::now() + Duration::from_secs(1))
            .await
            .expect("any output");
        assert_eq!(output, "ok");
        drop(server);
    }

    #[test]
    fn output_cleaning_drops_echo_and_prompt() {
        let raw = "uname\r\nLinux\r\ndut# ";
        assert_eq!(clean_output(raw, "uname", "# "), "Linux");
    }

    #[test]
    fn decoding_drops_nul_and_replaces_non_ascii() {
        assert_eq!(decode_lossy_ascii(b"a\0b\xffc"), "ab\u{fffd}c");
    }
}
