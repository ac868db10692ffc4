//! The container runtime capability surface.
//!
//! Every operation the job state machine needs from a container daemon, as a
//! trait so tests can drive the state machine against a scripted runtime.
//! Long-running operations are raced against the job's cancellation token by
//! the caller; the exec output channel is the main suspension point.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

use rapidflow_core::{Error, PortMapping, Result};

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    /// `KEY=VALUE` strings.
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub tty: bool,
    /// `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
    /// Exposed ports and their host bindings.
    pub ports: Vec<PortMapping>,
    /// Container name; the daemon chooses when unset.
    pub name: Option<String>,
}

/// A container as reported by the daemon, trimmed to what name-collision
/// resolution needs.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
}

/// Result of a fully drained exec.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A running exec: a line-by-line view of the combined stdout+stderr stream
/// plus the exit code once the stream is drained.
pub struct ExecSession {
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Result<i64>>,
}

/// Producer half of an [`ExecSession`]; held by the runtime implementation
/// (or a test double) pumping the daemon's stream.
pub struct ExecSessionSink {
    pub lines: mpsc::Sender<String>,
    pub exit: oneshot::Sender<Result<i64>>,
}

impl ExecSession {
    /// Create a connected sink/session pair.
    pub fn channel(capacity: usize) -> (ExecSessionSink, ExecSession) {
        let (lines_tx, lines_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = oneshot::channel();
        (
            ExecSessionSink {
                lines: lines_tx,
                exit: exit_tx,
            },
            ExecSession {
                lines: lines_rx,
                exit: exit_rx,
            },
        )
    }

    /// Next line of combined output, or `None` once the stream is drained.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for the exit code. Pending output is discarded, which also
    /// unblocks a producer waiting on a full channel.
    pub async fn finish(self) -> Result<i64> {
        drop(self.lines);
        self.exit
            .await
            .map_err(|_| Error::Internal("exec ended without reporting an exit code".to_string()))?
    }

    /// Drain the whole stream into one buffer and wait for the exit code.
    pub async fn collect(mut self) -> Result<ExecOutcome> {
        let mut output = String::new();
        while let Some(line) = self.next_line().await {
            output.push_str(&line);
            output.push('\n');
        }
        let exit_code = self.finish().await?;
        Ok(ExecOutcome { exit_code, output })
    }
}

/// Capability abstraction over a container daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image; the progress stream is discarded.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Run a command inside a container, streaming combined stdout+stderr
    /// line-by-line.
    async fn exec(&self, id: &str, cmd: Vec<String>, working_dir: Option<&str>)
    -> Result<ExecSession>;

    /// Commit a container's filesystem to an image and return the image id.
    async fn commit(&self, id: &str, reference: &str) -> Result<String>;

    /// Extract a path from a container into a host directory.
    async fn copy_from(&self, id: &str, src_path: &str, dst: &Path) -> Result<()>;

    /// Write an image tarball to a host path.
    async fn save_image(&self, reference: &str, dst: &Path) -> Result<()>;

    /// Force-remove a container by id.
    async fn remove(&self, id: &str) -> Result<()>;

    /// All containers known to the daemon, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    /// Force-remove any container carrying the given name. Absence is not an
    /// error.
    async fn remove_by_name(&self, name: &str) -> Result<()> {
        for container in self.list_containers().await? {
            if container
                .names
                .iter()
                .any(|n| n.trim_start_matches('/') == name)
            {
                self.remove(&container.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_streams_lines_then_exit() {
        let (sink, mut session) = ExecSession::channel(8);
        tokio::spawn(async move {
            sink.lines.send("one".to_string()).await.unwrap();
            sink.lines.send("two".to_string()).await.unwrap();
            drop(sink.lines);
            sink.exit.send(Ok(0)).unwrap();
        });

        assert_eq!(session.next_line().await.as_deref(), Some("one"));
        assert_eq!(session.next_line().await.as_deref(), Some("two"));
        assert_eq!(session.next_line().await, None);
        assert_eq!(session.finish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn collect_gathers_output() {
        let (sink, session) = ExecSession::channel(8);
        tokio::spawn(async move {
            sink.lines.send("hello".to_string()).await.unwrap();
            drop(sink.lines);
            sink.exit.send(Ok(7)).unwrap();
        });

        let outcome = session.collect().await.unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert!(!outcome.success());
        assert_eq!(outcome.output, "hello\n");
    }

    #[tokio::test]
    async fn finish_unblocks_full_channel() {
        let (sink, session) = ExecSession::channel(1);
        tokio::spawn(async move {
            // Second send parks until the receiver goes away.
            sink.lines.send("a".to_string()).await.unwrap();
            let _ = sink.lines.send("b".to_string()).await;
            sink.exit.send(Ok(0)).unwrap();
        });

        assert_eq!(session.finish().await.unwrap(), 0);
    }
}
