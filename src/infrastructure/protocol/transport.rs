use super::error::TransportError;
use crate::config::ServerConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One newline-delimited JSON message per `send`/`recv`. The protocol layer
/// never sees how the bytes move.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, line: &str) -> Result<(), TransportError>;

    /// Next inbound line, or `None` once the peer is gone.
    async fn recv(&self) -> Option<String>;

    async fn shutdown(&self);
}

/// Produces a fresh transport for each (re)connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

pub struct StdioTransport {
    child: Mutex<Child>,
    writer: Mutex<BufWriter<ChildStdin>>,
    reader: Mutex<Lines<BufReader<ChildStdout>>>,
}

impl StdioTransport {
    pub fn spawn(config: &ServerConfig) -> Result<Self, TransportError> {
        let mut command = Command::new(&config.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &config.workdir {
            command.current_dir(dir);
        }
        if !config.args.is_empty() {
            command.args(&config.args);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;

        Ok(Self {
            child: Mutex::new(child),
            writer: Mutex::new(BufWriter::new(stdin)),
            reader: Mutex::new(BufReader::new(stdout).lines()),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<String> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    // Some servers leak ANSI-coloured log lines onto stdout.
                    if trimmed.starts_with('\u{1b}') {
                        debug!(line = trimmed, "skipping non-JSON line from server");
                        continue;
                    }
                    return Some(line);
                }
                Ok(None) => return None,
                Err(err) => {
                    debug!(%err, "transport read failed");
                    return None;
                }
            }
        }
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            debug!(%err, "failed to kill server process (may have already exited)");
        }
        let _ = child.wait().await;
    }
}

/// Spawns the configured server process anew on every connect, which is what
/// makes bounded reconnection possible for stdio peers.
pub struct StdioConnector {
    config: ServerConfig,
}

impl StdioConnector {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(StdioTransport::spawn(&self.config)?))
    }
}

/// In-process transport: two halves joined by channels. Used to embed a
/// server in the same process and throughout the tests. Shutting down
/// either half tears down both directions.
pub struct PairTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
}

impl PairTransport {
    pub fn pair() -> (Arc<PairTransport>, Arc<PairTransport>) {
        let closed = CancellationToken::new();
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();
        let left = Arc::new(PairTransport {
            outbound: right_tx,
            inbound: Mutex::new(left_rx),
            closed: closed.clone(),
        });
        let right = Arc::new(PairTransport {
            outbound: left_tx,
            inbound: Mutex::new(right_rx),
            closed,
        });
        (left, right)
    }
}

#[async_trait]
impl Transport for PairTransport {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(line.to_string())
            .map_err(|_| TransportError::Closed)
    }

    // The closure signal must win without touching the inbound lock, so a
    // parked reader never blocks `shutdown`.
    async fn recv(&self) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            line = async { self.inbound.lock().await.recv().await } => line,
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pair_round_trips_lines() {
        let (left, right) = PairTransport::pair();
        left.send("hello").await.expect("send");
        assert_eq!(right.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn pair_shutdown_unblocks_a_parked_reader() {
        let (left, right) = PairTransport::pair();
        let reader = tokio::spawn({
            let left = Arc::clone(&left);
            async move { left.recv().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        left.shutdown().await;

        assert_eq!(reader.await.expect("join"), None);
        // Both directions are gone once either half closes.
        assert!(right.send("too late").await.is_err());
        assert_eq!(right.recv().await, None);
    }
}
