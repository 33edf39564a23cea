use crate::config::env_u64;
use async_trait::async_trait;
use std::{path::Path, process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_COMMAND: &str = "python3 run_all.py";

/// A stage that ends the run with `Error`.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error("collector could not start: {0}")]
    Spawn(String),
    #[error("collector failed with {0}")]
    Exit(String),
    #[error("collector timed out after {} s", .0.as_secs())]
    Timeout(Duration),
    #[error("{stage} failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },
}

impl StageFailure {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorExit {
    Completed,
    Cancelled,
}

/// Runs the external collectors for the SKUs written to the work directory.
/// Output lines go to `lines` as they are produced.
#[async_trait]
pub trait CollectorRunner: Send + Sync {
    async fn run(
        &self,
        work_dir: &Path,
        lines: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<CollectorExit, StageFailure>;
}

#[derive(Debug, Clone)]
pub struct SubprocessCollector {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    grace: Duration,
    /// Delivers SIGTERM by pid; tokio's `Child` only exposes SIGKILL.
    signal_command: String,
}

impl SubprocessCollector {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(900),
            grace: Duration::from_secs(10),
            signal_command: "kill".to_string(),
        }
    }

    pub fn with_limits(mut self, timeout: Duration, grace: Duration) -> Self {
        self.timeout = timeout;
        self.grace = grace;
        self
    }

    pub fn from_env() -> Self {
        let raw = std::env::var("COLLECTOR_COMMAND")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COMMAND.to_string());
        let mut parts = raw.split_whitespace().map(String::from);
        let program = parts.next().unwrap_or_else(|| "python3".to_string());
        Self::new(program, parts).with_limits(
            Duration::from_secs(env_u64("COLLECTOR_TIMEOUT_SECS", 900)),
            Duration::from_secs(env_u64("COLLECTOR_GRACE_SECS", 10)),
        )
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// SIGTERM, then a forced kill once the grace period runs out. When the
    /// signal cannot be delivered the kill is immediate.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id()
            && self.send_sigterm(pid).await
        {
            if timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(
                target = "catalog.pipeline",
                pid,
                grace_secs = self.grace.as_secs(),
                "collector ignored SIGTERM; killing"
            );
        }
        if let Err(err) = child.kill().await {
            warn!(target = "catalog.pipeline", error = %err, "collector kill failed");
        }
    }

    #[cfg(unix)]
    async fn send_sigterm(&self, pid: u32) -> bool {
        let signalled = Command::new(&self.signal_command)
            .arg("-TERM")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match signalled {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(target = "catalog.pipeline", pid, %status, "SIGTERM not delivered");
                false
            }
            Err(err) => {
                warn!(target = "catalog.pipeline", pid, error = %err, "SIGTERM delivery failed");
                false
            }
        }
    }

    async fn drain(&self, readers: Vec<JoinHandle<()>>) {
        for reader in readers {
            // A grandchild can keep the pipe open after the collector exits.
            if timeout(self.grace, reader).await.is_err() {
                debug!(target = "catalog.pipeline", "collector output reader abandoned");
            }
        }
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CollectorRunner for SubprocessCollector {
    async fn run(
        &self,
        work_dir: &Path,
        lines: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<CollectorExit, StageFailure> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(work_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUTF8", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| StageFailure::Spawn(format!("{}: {err}", self.command_line())))?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, lines.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, lines)));
        }

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = sleep(self.timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(Ok(status)) => {
                self.drain(readers).await;
                if status.success() {
                    Ok(CollectorExit::Completed)
                } else {
                    Err(StageFailure::Exit(status.to_string()))
                }
            }
            Waited::Exited(Err(err)) => {
                self.drain(readers).await;
                Err(StageFailure::Spawn(err.to_string()))
            }
            Waited::TimedOut => {
                self.terminate(&mut child).await;
                self.drain(readers).await;
                Err(StageFailure::Timeout(self.timeout))
            }
            Waited::Cancelled => {
                self.terminate(&mut child).await;
                self.drain(readers).await;
                Ok(CollectorExit::Cancelled)
            }
        }
    }
}

async fn forward_lines<R>(stream: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if lines.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(target = "catalog.pipeline", error = %err, "collector stream closed");
                break;
            }
        }
    }
}
