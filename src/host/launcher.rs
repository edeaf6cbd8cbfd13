use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::HostError;
use super::types::{ExecutionArgs, ExecutionLimit, ExecutionPolicy, ExecutionResult};
use crate::config::SandboxConfig;

/// Read size used when pumping the child's stdout/stderr into a sink.
const PUMP_CHUNK: usize = 8 * 1024;

/// Destination for one of the job's output streams.
///
/// Writes never fail from the producer's point of view: a sink that can no
/// longer deliver (closed, over its cap, peer gone) drops the bytes silently
/// so the copy loop keeps draining the pipe and the child never stalls.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, data: &[u8]);
}

/// Runs one job through the sandbox executable and maps its exit into an
/// `ExecutionResult`.
///
/// The sandbox executable owns all resource enforcement; this side only builds
/// its command line, wires the standard streams, forwards cancellation as a
/// SIGTERM to the whole process group, and reads back the result file.
pub struct Launcher {
    executable: PathBuf,
    result_file: String,
    log_file: String,
}

impl Launcher {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            executable: config.executable(),
            result_file: config.result_file.clone(),
            log_file: config.log_file.clone(),
        }
    }

    pub async fn run(
        &self,
        mut policy: ExecutionPolicy,
        limits: &ExecutionLimit,
        work_dir: &Path,
        input_file: &Path,
        cancel: mpsc::Receiver<()>,
        args: &ExecutionArgs,
    ) -> ExecutionResult {
        let mut cmd = Command::new(&self.executable);
        cmd.args(sandbox_args(limits, input_file, args))
            .current_dir(work_dir)
            .stdin(piped_if(policy.stdin.is_some()))
            .stdout(piped_if(policy.stdout.is_some()))
            .stderr(piped_if(policy.stderr.is_some()))
            .kill_on_drop(true);
        // New process group so one signal reaches the job and everything it forked
        cmd.as_std_mut().process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {e}", self.executable.display());
                return ExecutionResult::internal("spawn", e);
            }
        };
        let pid = child.id();
        debug!("Sandbox started (pid {pid:?}) in {}", work_dir.display());

        if let Some(ready) = policy.stdin.take() {
            if let Some(stdin) = child.stdin.take() {
                debug!("Connecting stdin pipe");
                let _ = ready.send(stdin);
            }
        }
        let stdout_pump = spawn_pump(child.stdout.take(), policy.stdout.take());
        let stderr_pump = spawn_pump(child.stderr.take(), policy.stderr.take());

        let (done_tx, done_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_cancellation(cancel, done_rx, pid));

        let waited = child.wait().await;
        // Anything left in the group still holds the output pipes; it stays
        // killable until both have drained
        for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
            let _ = pump.await;
        }
        let _ = done_tx.send(());
        let _ = watcher.await;

        let status = match waited {
            Ok(status) => status,
            Err(e) => return ExecutionResult::internal("wait", e),
        };
        if let Some(signal) = status.signal() {
            info!("Sandbox terminated by signal {signal}");
            return ExecutionResult::Failure(HostError::Terminated);
        }
        if !status.success() {
            return ExecutionResult::internal(
                "wait",
                io::Error::other(format!("sandbox exited with {status}")),
            );
        }

        match tokio::fs::read_to_string(work_dir.join(&self.log_file)).await {
            Ok(log) => info!("Sandbox log:\n{log}"),
            Err(e) => debug!("No sandbox log: {e}"),
        }

        match tokio::fs::read(work_dir.join(&self.result_file)).await {
            Ok(bytes) => ExecutionResult::Success(bytes),
            Err(e) => ExecutionResult::internal("read-result", e),
        }
    }
}

/// Command line for the sandbox executable, in the order it expects:
/// limits, input redirect, seccomp profile, `--`, then the job itself.
pub fn sandbox_args(limits: &ExecutionLimit, input_file: &Path, args: &ExecutionArgs) -> Vec<String> {
    let mut argv = vec![
        "-c".to_string(),
        limits.real_time.to_string(),
        "-r".to_string(),
        limits.real_time.to_string(),
        "-p".to_string(),
        limits.process_count.to_string(),
        "-s".to_string(),
        limits.memory.to_string(),
        "-m".to_string(),
        limits.memory.to_string(),
        "-w".to_string(),
        limits.file_write.to_string(),
        "-I".to_string(),
        input_file.to_string_lossy().into_owned(),
        "--seccomp".to_string(),
        limits.seccomp.clone(),
        "--".to_string(),
        args.command.clone(),
    ];
    argv.extend(args.args.iter().cloned());
    argv
}

fn piped_if(wanted: bool) -> Stdio {
    if wanted {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

fn spawn_pump<R>(reader: Option<R>, sink: Option<Arc<dyn OutputSink>>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    match (reader, sink) {
        (Some(reader), Some(sink)) => Some(tokio::spawn(pump(reader, sink))),
        _ => None,
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<dyn OutputSink>) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(&buf[..n]).await,
            Err(e) => {
                debug!("Output pipe read error: {e}");
                break;
            }
        }
    }
}

/// Forwards every cancellation signal to the sandbox's process group until
/// the run reports that the sandbox has exited and its output has drained.
async fn watch_cancellation(
    mut cancel: mpsc::Receiver<()>,
    mut done: oneshot::Receiver<()>,
    pid: Option<u32>,
) {
    loop {
        tokio::select! {
            _ = &mut done => break,
            signal = cancel.recv() => match signal {
                Some(()) => {
                    if let Some(pid) = pid {
                        terminate_group(pid);
                    }
                }
                // No sender left; only completion can follow
                None => {
                    let _ = done.await;
                    break;
                }
            },
        }
    }
}

fn terminate_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    info!("Sending SIGTERM to process group {pgid}");
    // SAFETY: kill(2) has no memory-safety preconditions; the negative pid
    // targets the group created for this child at spawn.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == -1 {
        warn!(
            "Failed to signal process group {pgid}: {}",
            io::Error::last_os_error()
        );
    }
}
