use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::ChildStdin;
use tokio::sync::oneshot;

use super::error::HostError;
use super::OutputSink;

/// Resource ceilings passed to the sandbox executable for one run.
///
/// Replaced wholesale by `SessionHost::set_limits`; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimit {
    /// Wall time (ms)
    pub real_time: u32,
    pub process_count: u32,
    /// Largest file the job may write (KB)
    pub file_write: u32,
    /// Memory (KB)
    pub memory: u32,
    /// Seccomp profile name understood by the sandbox executable
    pub seccomp: String,
    /// Byte cap for stdout and for stderr (each); 0 means unlimited
    #[serde(default)]
    pub stream: u32,
}

impl Default for ExecutionLimit {
    fn default() -> Self {
        Self {
            real_time: 1000,
            process_count: 1,
            file_write: 0,
            memory: 128 * 1024,
            seccomp: "basic".to_string(),
            stream: 0,
        }
    }
}

/// Command and arguments of the sandboxed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionArgs {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ExecutionArgs {
    fn default() -> Self {
        Self {
            command: "echo".to_string(),
            args: vec!["Arguments not set".to_string()],
        }
    }
}

/// How the job's standard streams are wired for a single run.
///
/// `None` sinks discard the stream. When `stdin` is `None` the child sees an
/// immediate end of input; otherwise the pipe handle is sent through the
/// channel as soon as the process is spawned.
#[derive(Default)]
pub struct ExecutionPolicy {
    pub stdout: Option<Arc<dyn OutputSink>>,
    pub stderr: Option<Arc<dyn OutputSink>>,
    pub stdin: Option<oneshot::Sender<ChildStdin>>,
}

/// Outcome of one run: the raw result file bytes, or the reason there are none.
#[derive(Debug)]
pub enum ExecutionResult {
    Success(Vec<u8>),
    Failure(HostError),
}

impl ExecutionResult {
    pub fn internal(location: &'static str, source: std::io::Error) -> Self {
        Self::Failure(HostError::Internal { location, source })
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Lifecycle phase of a `SessionHost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Loading,
    Ready,
    Running,
    Closed,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Loading => "loading",
            HostStatus::Ready => "ready",
            HostStatus::Running => "running",
            HostStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
