//! One execution session: its working directory, configured limits and
//! arguments, and the Ready ⇄ Running lifecycle of the job it runs.
//!
//! Every field that changes is guarded by a single mutex, getters included.
//! At most one run is in flight because `start` only proceeds from `Ready`.
//!
//!   Loading → Ready ⇄ Running
//!   any     → Closed (terminal)

pub mod error;
pub mod launcher;
pub mod types;

use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;

pub use error::{HostError, Result};
pub use launcher::{Launcher, OutputSink};
pub use types::{ExecutionArgs, ExecutionLimit, ExecutionPolicy, ExecutionResult, HostStatus};

/// Cancellation signals that can queue up before the watcher drains them.
const CANCEL_QUEUE: usize = 100;

const WORK_DIR_MODE: u32 = 0o770;
const UPLOAD_MODE: u32 = 0o640;

struct HostState {
    status: HostStatus,
    limits: ExecutionLimit,
    args: ExecutionArgs,
    /// Present only while `Running`; recreated for every run.
    cancel: Option<mpsc::Sender<()>>,
    /// Reason passed to the last `kill` of the current run.
    kill_reason: Option<i32>,
}

pub struct SessionHost {
    key: String,
    work_dir: PathBuf,
    input_file: PathBuf,
    launcher: Launcher,
    state: Mutex<HostState>,
}

impl SessionHost {
    /// Allocates a fresh working directory under `<root>/tmp` and returns a
    /// `Ready` host with default limits and arguments.
    pub fn init(config: &SandboxConfig) -> Result<Self> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        let work_dir = config.root.join("tmp").join(&key);
        info!("Init session: key {key}, work dir {}", work_dir.display());

        let host = Self {
            input_file: work_dir.join(&config.input_file),
            launcher: Launcher::new(config),
            state: Mutex::new(HostState {
                status: HostStatus::Loading,
                limits: ExecutionLimit::default(),
                args: ExecutionArgs::default(),
                cancel: None,
                kill_reason: None,
            }),
            key,
            work_dir,
        };

        DirBuilder::new()
            .recursive(true)
            .mode(WORK_DIR_MODE)
            .create(&host.work_dir)?;
        // The umask may have stripped group bits at creation
        fs::set_permissions(&host.work_dir, Permissions::from_mode(WORK_DIR_MODE))?;

        host.lock().status = HostStatus::Ready;
        Ok(host)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn status(&self) -> HostStatus {
        self.lock().status
    }

    pub fn args(&self) -> ExecutionArgs {
        self.lock().args.clone()
    }

    pub fn limits(&self) -> ExecutionLimit {
        self.lock().limits.clone()
    }

    pub fn set_args(&self, args: ExecutionArgs) -> Result<()> {
        let mut state = self.lock();
        if state.status != HostStatus::Ready {
            return Err(HostError::StateInvalid);
        }
        state.args = args;
        Ok(())
    }

    pub fn set_limits(&self, limits: ExecutionLimit) -> Result<()> {
        let mut state = self.lock();
        if state.status != HostStatus::Ready {
            return Err(HostError::StateInvalid);
        }
        state.limits = limits;
        Ok(())
    }

    /// Writes `data` to `name` directly inside the working directory.
    ///
    /// Allowed while `Ready` or `Running`. Names with separators, `~`, or
    /// parent references are rejected, as is anything whose joined path
    /// leaves the working directory. Symlinks planted by a job are not followed.
    /// The write itself happens outside the state lock.
    pub async fn set_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = {
            let state = self.lock();
            if state.status == HostStatus::Closed {
                return Err(HostError::StateInvalid);
            }
            self.upload_path(name)?
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(UPLOAD_MODE)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        info!("SetFile {}, {} bytes", path.display(), data.len());
        Ok(())
    }

    fn upload_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', '~', '\0']) {
            return Err(HostError::FilenameInvalid);
        }
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(HostError::FilenameInvalid);
        }

        let path = self.work_dir.join(name);
        if !path.starts_with(&self.work_dir) || path.parent() != Some(self.work_dir.as_path()) {
            return Err(HostError::FilenameInvalid);
        }
        Ok(path)
    }

    /// Runs the configured job once and sends its outcome on `report`.
    ///
    /// Resolves only when the job has finished, so callers spawn it. Every
    /// outcome, including a refusal to start, goes through `report` exactly
    /// once. The host is back in `Ready` before the outcome is sent.
    pub async fn start(&self, policy: ExecutionPolicy, report: oneshot::Sender<ExecutionResult>) {
        let (cancel, limits, args) = {
            let mut state = self.lock();
            if state.status != HostStatus::Ready {
                let _ = report.send(ExecutionResult::Failure(HostError::StateInvalid));
                return;
            }
            if state.args.command.is_empty() {
                let _ = report.send(ExecutionResult::Failure(HostError::CommandEmpty));
                return;
            }
            let (tx, rx) = mpsc::channel(CANCEL_QUEUE);
            state.status = HostStatus::Running;
            state.cancel = Some(tx);
            state.kill_reason = None;
            (rx, state.limits.clone(), state.args.clone())
        };

        info!("Run started: {} {:?}", args.command, args.args);
        let mut result = self
            .launcher
            .run(policy, &limits, &self.work_dir, &self.input_file, cancel, &args)
            .await;

        {
            let mut state = self.lock();
            let reason = state.kill_reason.take();
            if matches!(result, ExecutionResult::Failure(HostError::Terminated)) {
                if let Some(reason) = reason {
                    result = ExecutionResult::Failure(HostError::Intended(reason));
                }
            }
            state.cancel = None;
            if state.status == HostStatus::Running {
                state.status = HostStatus::Ready;
            }
        }

        match &result {
            ExecutionResult::Success(bytes) => info!("Run finished: {} result bytes", bytes.len()),
            ExecutionResult::Failure(e) => info!("Run finished: {e}"),
        }
        let _ = report.send(result);
    }

    /// Asks the running job to stop. `reason` 0 is an administrative stop;
    /// any other code is reported back verbatim in the run's outcome.
    pub fn kill(&self, reason: i32) -> Result<()> {
        info!("Kill requested: reason {reason}");
        let mut state = self.lock();
        if state.status != HostStatus::Running {
            return Err(HostError::StateInvalid);
        }
        Self::signal(&mut state, reason);
        Ok(())
    }

    /// Stops any running job, removes the working directory and closes the
    /// host for good.
    pub fn clean(&self) -> Result<()> {
        let mut state = self.lock();
        if state.status == HostStatus::Running {
            info!("Kill requested: reason 0");
            Self::signal(&mut state, 0);
        }

        info!("Clean work dir {}", self.work_dir.display());
        let removed = match fs::remove_dir_all(&self.work_dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        state.status = HostStatus::Closed;
        if let Err(e) = &removed {
            warn!("Failed to remove {}: {e}", self.work_dir.display());
        }
        removed.map_err(HostError::from)
    }

    fn signal(state: &mut HostState, reason: i32) {
        state.kill_reason = Some(reason);
        if let Some(cancel) = &state.cancel {
            match cancel.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => debug!("Cancellation already queued"),
                Err(TrySendError::Closed(())) => debug!("Run already finished"),
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::OutputSink;
    use crate::config::SandboxConfig;

    /// Writes a stand-in for the sandbox executable into `dir`.
    ///
    /// It skips every flag up to `--`, leaves a log file, optionally writes
    /// `result.json`, then execs the job in place so signals reach it directly.
    pub fn fake_sandbox(dir: &Path, writes_result: bool) -> PathBuf {
        let result = if writes_result {
            "printf '{\"verdict\":\"ok\"}' > result.json\n"
        } else {
            ""
        };
        let script = format!(
            "#!/bin/sh\n\
             while [ \"$#\" -gt 0 ]; do\n\
             \x20 if [ \"$1\" = \"--\" ]; then shift; break; fi\n\
             \x20 shift\n\
             done\n\
             echo 'fake sandbox' > runner.log\n\
             {result}\
             exec \"$@\"\n"
        );
        let path = dir.join("fake-sandbox");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Sandbox settings rooted in a temp dir, using the fake executable.
    pub fn sandbox_config(root: &Path) -> SandboxConfig {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        SandboxConfig {
            root: root.to_path_buf(),
            executable: Some(fake_sandbox(&bin, true)),
            ..SandboxConfig::default()
        }
    }

    #[derive(Default)]
    pub struct CollectingSink {
        data: Mutex<Vec<u8>>,
    }

    impl CollectingSink {
        pub async fn contents(&self) -> Vec<u8> {
            self.data.lock().await.clone()
        }
    }

    #[async_trait]
    impl OutputSink for CollectingSink {
        async fn write(&self, data: &[u8]) {
            self.data.lock().await.extend_from_slice(data);
        }
    }
}
