//! Output path from the job's stdout/stderr to the client's run stream.
//!
//! Each stream gets a `BufferedPipe` in front of a `RateLimitedSink`:
//! - the pipe batches small writes and forwards them once the flush interval
//!   has elapsed, when its buffer fills, or on an explicit `flush`;
//! - the sink forwards batches as `RunOutput` frames, counts bytes, and once
//!   the byte cap is crossed fires a one-shot trigger and goes quiet.
//!
//! Neither stage ever reports an error to the producing copy loop, and neither
//! blocks it for long: a frame the client does not take within the stall
//! timeout closes the sink, and `close` aborts a send already waiting.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::host::OutputSink;
use crate::protocol::{OutputKind, RunOutput};

/// Buffer size of a pipe; writes at least this large skip the buffer.
const PIPE_CAPACITY: usize = 4096;

struct SinkState {
    written: u64,
    closed: bool,
}

pub struct RateLimitedSink {
    kind: OutputKind,
    stream: mpsc::Sender<RunOutput>,
    /// `None` means unlimited
    limit: Option<u64>,
    trigger: mpsc::Sender<()>,
    /// Longest wait for the stream to accept one frame
    stall: Duration,
    closing: watch::Sender<bool>,
    state: Mutex<SinkState>,
}

impl RateLimitedSink {
    /// `limit` is a byte cap for this stream; 0 disables it.
    pub fn new(
        kind: OutputKind,
        stream: mpsc::Sender<RunOutput>,
        limit: u64,
        trigger: mpsc::Sender<()>,
        stall: Duration,
    ) -> Self {
        Self {
            kind,
            stream,
            limit: (limit > 0).then_some(limit),
            trigger,
            stall,
            closing: watch::Sender::new(false),
            state: Mutex::new(SinkState {
                written: 0,
                closed: false,
            }),
        }
    }

    /// Drops every later frame and wakes a send waiting on a full stream.
    /// Does not wait for the sink's lock.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    /// Forwards `data`, truncated at the cap boundary.
    pub async fn send(&self, data: &[u8]) {
        let mut closing = self.closing.subscribe();
        let mut state = self.state.lock().await;
        if *closing.borrow_and_update() {
            state.closed = true;
        }
        if state.closed || data.is_empty() {
            return;
        }

        let allowed = match self.limit {
            Some(limit) => {
                let left = limit.saturating_sub(state.written);
                data.len().min(usize::try_from(left).unwrap_or(usize::MAX))
            }
            None => data.len(),
        };
        if allowed > 0 {
            let frame = RunOutput {
                kind: self.kind,
                data: data[..allowed].to_vec(),
            };
            tokio::select! {
                sent = tokio::time::timeout(self.stall, self.stream.send(frame)) => match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        debug!("{:?} stream receiver gone, dropping output", self.kind);
                        state.closed = true;
                        return;
                    }
                    Err(_) => {
                        warn!(
                            "{:?} stream stalled for {:?}, dropping further output",
                            self.kind, self.stall
                        );
                        state.closed = true;
                        return;
                    }
                },
                _ = closing.changed() => {
                    debug!("{:?} sink closed during a send", self.kind);
                    state.closed = true;
                    return;
                }
            }
        }

        state.written += data.len() as u64;
        if let Some(limit) = self.limit {
            if state.written > limit {
                warn!(
                    "{:?} write limit exceeded! Limit {limit}, current {}",
                    self.kind, state.written
                );
                let _ = self.trigger.try_send(());
                state.closed = true;
            }
        }
    }

    /// Bytes produced so far, including any dropped past the cap.
    #[cfg(test)]
    pub async fn written(&self) -> u64 {
        self.state.lock().await.written
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

struct PipeState {
    buf: Vec<u8>,
    last_flush: Instant,
}

pub struct BufferedPipe {
    sink: RateLimitedSink,
    interval: Duration,
    closed: AtomicBool,
    state: Mutex<PipeState>,
}

impl BufferedPipe {
    pub fn new(sink: RateLimitedSink, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            closed: AtomicBool::new(false),
            state: Mutex::new(PipeState {
                buf: Vec::with_capacity(PIPE_CAPACITY),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Hands whatever is buffered to the sink.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        self.drain(&mut state).await;
    }

    /// Drops every later write, including one stuck on a slow client.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sink.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn sink(&self) -> &RateLimitedSink {
        &self.sink
    }

    async fn drain(&self, state: &mut PipeState) {
        state.last_flush = Instant::now();
        if state.buf.is_empty() {
            return;
        }
        let data = std::mem::take(&mut state.buf);
        self.sink.send(&data).await;
    }
}

#[async_trait]
impl OutputSink for BufferedPipe {
    async fn write(&self, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.buf.len() + data.len() > PIPE_CAPACITY {
            self.drain(&mut state).await;
        }
        if data.len() >= PIPE_CAPACITY {
            self.sink.send(data).await;
        } else {
            state.buf.extend_from_slice(data);
        }
        if state.last_flush.elapsed() > self.interval {
            self.drain(&mut state).await;
        }
    }
}
