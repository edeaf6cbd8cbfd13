use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Config, SandboxConfig};
use crate::host::{
    ExecutionArgs, ExecutionLimit, ExecutionPolicy, ExecutionResult, HostError, SessionHost,
};
use crate::protocol::{OutputKind, RunOutput, SettingChange};
use crate::relay::{BufferedPipe, RateLimitedSink};

/// Kill reason used when a run's output crosses its byte cap.
pub const STREAM_LIMIT_REASON: i32 = -5;

/// Stream-limit triggers that can queue before the watcher drains them.
const LIMIT_QUEUE: usize = 100;

/// Capacity of the per-run "execution finished" broadcast.
const DONE_CAPACITY: usize = 4;

type StdinSlot = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Handles `stop` needs to quiesce the run in flight.
#[derive(Clone)]
struct ActiveRun {
    stdout: Arc<BufferedPipe>,
    stderr: Arc<BufferedPipe>,
    stdin: StdinSlot,
}

/// The RPC-facing side of one session.
///
/// Owns exactly one live `SessionHost` at a time (swapped on `reset`) and
/// wires each interactive run: two output relays, the stdin relay, the
/// stream-limit watcher and a periodic flusher, all torn down when the run's
/// result arrives.
pub struct SessionService {
    sandbox: SandboxConfig,
    default_flush_ms: u32,
    stall: Duration,
    host: Mutex<Arc<SessionHost>>,
    output_throttle: AtomicU32,
    active: Mutex<Option<ActiveRun>>,
}

impl SessionService {
    pub fn create(config: &Config) -> Result<Self, HostError> {
        let host = SessionHost::init(&config.sandbox)?;
        Ok(Self {
            sandbox: config.sandbox.clone(),
            default_flush_ms: config.relay.flush_interval_ms,
            stall: Duration::from_millis(config.relay.stall_timeout_ms),
            host: Mutex::new(Arc::new(host)),
            output_throttle: AtomicU32::new(0),
            active: Mutex::new(None),
        })
    }

    fn host(&self) -> Arc<SessionHost> {
        lock(&self.host).clone()
    }

    pub fn configure(
        &self,
        limits: ExecutionLimit,
        args: ExecutionArgs,
        output_throttle: u32,
    ) -> SettingChange {
        info!("req: Configure");
        let host = self.host();
        if let Err(e) = host.set_limits(limits) {
            warn!("Configure refused while {}", host.status());
            return SettingChange::failed(e.to_string());
        }
        if let Err(e) = host.set_args(args) {
            return SettingChange::failed(e.to_string());
        }
        self.output_throttle.store(output_throttle, Ordering::SeqCst);
        SettingChange::ok()
    }

    pub async fn upload_file(&self, name: &str, data: &[u8]) -> SettingChange {
        info!("req: UploadFile {name}");
        self.host().set_file(name, data).await.into()
    }

    /// Cleans the current session and swaps in a fresh one.
    pub fn reset(&self) -> SettingChange {
        info!("req: Reset");
        let mut host = lock(&self.host);
        if let Err(e) = host.clean() {
            return SettingChange::failed(e.to_string());
        }
        match SessionHost::init(&self.sandbox) {
            Ok(fresh) => {
                info!(
                    "Session {} replaced by {} ({})",
                    host.key(),
                    fresh.key(),
                    fresh.work_dir().display()
                );
                *host = Arc::new(fresh);
                SettingChange::ok()
            }
            Err(e) => SettingChange::failed(e.to_string()),
        }
    }

    pub async fn stop(&self) -> SettingChange {
        info!("req: Stop");
        self.send_stop(0).await.into()
    }

    /// Kills the running job, then quiets its relays and closes its stdin.
    async fn send_stop(&self, reason: i32) -> Result<(), HostError> {
        info!("Requested stop (intent {reason})");
        self.host().kill(reason)?;
        let active = lock(&self.active).clone();
        if let Some(run) = active {
            run.stdout.close();
            run.stderr.close();
            run.stdin.lock().await.take();
        }
        Ok(())
    }

    /// Runs the configured job once, streaming its output to `outbound` and
    /// feeding `inbound` to its stdin. Sends exactly one `EXIT` frame, after
    /// every output frame of the run.
    pub async fn run_interactive(
        &self,
        inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<RunOutput>,
    ) {
        info!("req: Start RunInteractive");
        let host = self.host();
        let stream_cap = u64::from(host.limits().stream);
        debug!("Session {} runs {:?} ({})", host.key(), host.args(), host.status());
        let interval = self.flush_interval();

        let (limit_tx, limit_rx) = mpsc::channel(LIMIT_QUEUE);
        let stdout = Arc::new(BufferedPipe::new(
            RateLimitedSink::new(
                OutputKind::Stdout,
                outbound.clone(),
                stream_cap,
                limit_tx.clone(),
                self.stall,
            ),
            interval,
        ));
        let stderr = Arc::new(BufferedPipe::new(
            RateLimitedSink::new(
                OutputKind::Stderr,
                outbound.clone(),
                stream_cap,
                limit_tx,
                self.stall,
            ),
            interval,
        ));
        let stdin: StdinSlot = Arc::default();
        let registered = self.register(ActiveRun {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            stdin: stdin.clone(),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let policy = ExecutionPolicy {
            stdout: Some(stdout.clone()),
            stderr: Some(stderr.clone()),
            stdin: Some(ready_tx),
        };
        let (report_tx, report_rx) = oneshot::channel();
        let (done_tx, _) = broadcast::channel::<()>(DONE_CAPACITY);

        let runner = host.clone();
        let execution = tokio::spawn(async move { runner.start(policy, report_tx).await });
        let stdin_relay = tokio::spawn(relay_stdin(inbound, ready_rx, stdin, done_tx.subscribe()));
        let limit_watcher = tokio::spawn(watch_stream_limit(
            host.clone(),
            limit_rx,
            done_tx.subscribe(),
        ));
        let flusher = tokio::spawn(flush_periodically(
            stdout.clone(),
            stderr.clone(),
            interval,
            done_tx.subscribe(),
        ));

        let result = report_rx.await.unwrap_or_else(|_| {
            ExecutionResult::internal("start", io::Error::other("run ended without a result"))
        });
        // The host is Ready again; a later run must be able to register
        if registered {
            lock(&self.active).take();
        }
        let _ = done_tx.send(());
        let _ = tokio::join!(execution, stdin_relay, limit_watcher, flusher);

        stdout.flush().await;
        stderr.flush().await;

        info!("{result:?}");
        match tokio::time::timeout(self.stall, outbound.send(RunOutput::exit(&result))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("Client left before the EXIT message"),
            Err(_) => warn!("Client stalled for {:?}, EXIT message dropped", self.stall),
        }
    }

    /// Closes the live session; used on shutdown.
    pub fn shutdown(&self) {
        if let Err(e) = self.host().clean() {
            warn!("Failed to clean session on shutdown: {e}");
        }
    }

    fn flush_interval(&self) -> Duration {
        let ms = match self.output_throttle.load(Ordering::SeqCst) {
            0 => self.default_flush_ms,
            ms => ms,
        };
        Duration::from_millis(u64::from(ms.max(1)))
    }

    /// Records the run's handles unless another run already owns the slot.
    fn register(&self, run: ActiveRun) -> bool {
        let mut active = lock(&self.active);
        if active.is_some() {
            debug!("Another run is active; its handles stay in place");
            return false;
        }
        *active = Some(run);
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Waits for the child's stdin, then copies every inbound message into it.
/// Inbound end-of-stream closes the pipe so the job sees EOF.
async fn relay_stdin(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    ready: oneshot::Receiver<ChildStdin>,
    slot: StdinSlot,
    mut done: broadcast::Receiver<()>,
) {
    let pipe = tokio::select! {
        _ = done.recv() => return,
        pipe = ready => match pipe {
            Ok(pipe) => pipe,
            // The run ended before a process existed
            Err(_) => return,
        },
    };
    *slot.lock().await = Some(pipe);

    loop {
        tokio::select! {
            _ = done.recv() => break,
            input = inbound.recv() => match input {
                Some(bytes) => {
                    let mut pipe = slot.lock().await;
                    let Some(stdin) = pipe.as_mut() else {
                        continue;
                    };
                    if let Err(e) = stdin.write_all(&bytes).await {
                        debug!("stdin write failed: {e}");
                        pipe.take();
                    }
                }
                None => {
                    debug!("Input stream ended, closing stdin");
                    slot.lock().await.take();
                    break;
                }
            },
        }
    }
}

async fn watch_stream_limit(
    host: Arc<SessionHost>,
    mut limit: mpsc::Receiver<()>,
    mut done: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = done.recv() => break,
            signal = limit.recv() => match signal {
                Some(()) => {
                    if let Err(e) = host.kill(STREAM_LIMIT_REASON) {
                        debug!("Stream-limit kill ignored: {e}");
                    }
                }
                None => break,
            },
        }
    }
}

async fn flush_periodically(
    stdout: Arc<BufferedPipe>,
    stderr: Arc<BufferedPipe>,
    interval: Duration,
    mut done: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done.recv() => break,
            _ = ticker.tick() => {
                stdout.flush().await;
                stderr.flush().await;
            }
        }
    }
}
