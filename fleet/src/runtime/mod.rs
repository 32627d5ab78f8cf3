//! Process runtime seam
//!
//! Replicas never start processes themselves. They go through a [`Runtime`],
//! which creates, starts, kills and inspects named workers, delivers lines to
//! their console and hands out their log output as an async byte stream. [`DockerCli`] drives a
//! local Docker daemon; the in-memory [`mock::MockRuntime`] backs the tests.

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use docker::DockerCli;

use async_trait::async_trait;
use std::io;
use std::process::ExitStatus;
use tokio::io::AsyncBufRead;

/// Follow-mode log output of a worker
pub type WorkerOutput = Box<dyn AsyncBufRead + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("console write to {name} failed: {source}")]
    Console { name: String, source: io::Error },
    #[error("worker {0} does not exist")]
    NotFound(String),
    #[error("worker {0} is not running")]
    NotRunning(String),
    #[error("{0}")]
    Other(String),
}

/// Everything needed to create one worker instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub image: String,
    pub user: String,
    /// Memory limit in the runtime's syntax, e.g. `4g`
    pub memory: Option<String>,
    /// CPU limit, e.g. `2.5`
    pub cpus: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerInfo {
    pub address: String,
}

#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    /// Creates a stopped worker and returns its handle
    async fn create(&self, spec: &WorkerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, handle: &str) -> Result<(), RuntimeError>;

    async fn kill(&self, name: &str, signal: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, name: &str) -> Result<WorkerInfo, RuntimeError>;

    /// Writes `line` plus a newline to the worker's console. Only returns
    /// once the runtime has accepted or refused the input.
    async fn send_input(&self, name: &str, line: &str) -> Result<(), RuntimeError>;

    async fn stream_logs(&self, name: &str) -> Result<WorkerOutput, RuntimeError>;

    /// Resolves once the worker is gone. Returns immediately (with either
    /// result) when the worker does not exist.
    async fn wait_removed(&self, name: &str) -> Result<(), RuntimeError>;
}
