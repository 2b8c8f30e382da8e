//! State and exchange machinery shared by the process and thread workers.
//!
//! A worker handles at most one in-flight server request. `send_and_wait`
//! registers the expected response id with a oneshot future, writes the
//! frame, and awaits the future; the observer's receive loop resolves it by
//! message id, or by the `expected_response_id` of a structured error frame.
//! When a worker leaves the running state, every outstanding future is
//! failed.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use qpy_protocol::Frame;
use qpy_protocol::MessageId;
use qpy_protocol::MessageToServer;
use qpy_protocol::WorkerErrorMessage;
use qpy_protocol::WorkerRequest;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use super::connection::BoxedWriter;
use super::connection::ConnectionReader;
use super::connection::ReceiveOutcome;
use super::connection::send_message;
use super::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotRunning,
    Idle,
    ServerAwaitsResponse,
}

type PendingSender = oneshot::Sender<Result<Frame, WorkerError>>;

/// State shared between the caller-facing handle and the observer task.
pub(crate) struct Shared {
    state: StdMutex<WorkerState>,
    pending: StdMutex<Vec<(u32, PendingSender)>>,
    /// Why the worker stopped, when it stopped abnormally. Read when failing
    /// outstanding futures and when callers observe a dead worker.
    failure: StdMutex<Option<WorkerError>>,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(WorkerState::NotRunning),
            pending: StdMutex::new(Vec::new()),
            failure: StdMutex::new(None),
        })
    }

    pub fn state(&self) -> WorkerState {
        self.state.lock().map(|s| *s).unwrap_or(WorkerState::NotRunning)
    }

    pub fn set_state(&self, state: WorkerState) {
        if let Ok(mut current) = self.state.lock() {
            if *current != state {
                debug!(?state, "worker state transition");
                *current = state;
            }
        }
    }

    pub fn record_failure(&self, error: WorkerError) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(error);
        }
    }

    pub fn failure(&self) -> Option<WorkerError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    fn push_pending(&self, expected_id: u32, sender: PendingSender) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((expected_id, sender));
        }
    }

    /// Resolves every future waiting for `id` with the given result.
    fn resolve(&self, id: u32, result: Result<Frame, WorkerError>) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        let mut index = 0;
        while index < pending.len() {
            if pending[index].0 == id {
                let (_, sender) = pending.swap_remove(index);
                let _ = sender.send(result.clone());
            } else {
                index += 1;
            }
        }
    }

    /// Fails every outstanding future. Called on the way to `NotRunning`.
    pub fn fail_pending(&self) {
        let error = self.failure().unwrap_or(WorkerError::NotRunning);
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        for (_, sender) in pending.drain(..) {
            let _ = sender.send(Err(error.clone()));
        }
    }
}

/// Reads frames until EOF or a poisoned stream, routing each to the pending
/// futures. Runs as one branch of the observer.
pub(crate) async fn receive_loop(
    mut reader: ConnectionReader,
    shared: Arc<Shared>,
) -> Result<(), WorkerError> {
    loop {
        match reader.receive().await {
            Ok(ReceiveOutcome::Frame(frame)) => {
                if frame.message_id == MessageId::Error.as_u32() {
                    match serde_json::from_slice::<WorkerErrorMessage>(&frame.payload) {
                        Ok(report) => {
                            let error = WorkerError::from_wire(&report);
                            shared.resolve(report.expected_response_id, Err(error));
                        }
                        Err(err) => {
                            warn!(%err, "undecodable error frame from worker");
                            return Err(WorkerError::Decode(err.to_string()));
                        }
                    }
                } else {
                    shared.resolve(frame.message_id, Ok(frame));
                }
            }
            Ok(ReceiveOutcome::Eof) => return Ok(()),
            Err(error) => return Err(error),
        }
    }
}

/// An active per-call time budget. `epoch` distinguishes windows so a stale
/// check never misfires against a newer call.
#[derive(Debug, Clone)]
pub(crate) struct LimitWindow {
    pub epoch: u64,
    pub cpu_start: f64,
    pub real_start: Instant,
    pub cpu_limit_seconds: f64,
}

/// Caller side of the time-limit enforcer.
pub(crate) struct TimeLimiter {
    tx: watch::Sender<Option<LimitWindow>>,
    epoch: StdMutex<u64>,
}

impl TimeLimiter {
    pub fn new() -> (Self, watch::Receiver<Option<LimitWindow>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                tx,
                epoch: StdMutex::new(0),
            },
            rx,
        )
    }

    pub fn begin(&self, cpu_now: f64, cpu_limit_seconds: f64) {
        let epoch = match self.epoch.lock() {
            Ok(mut epoch) => {
                *epoch += 1;
                *epoch
            }
            Err(_) => 0,
        };
        let _ = self.tx.send(Some(LimitWindow {
            epoch,
            cpu_start: cpu_now,
            real_start: Instant::now(),
            cpu_limit_seconds,
        }));
    }

    pub fn reset(&self) {
        let _ = self.tx.send(None);
    }
}

const MIN_POLL_SECONDS: f64 = 0.05;

/// Watches the active limit window and resolves to the violation when one
/// occurs. CPU time is sampled through `cpu_time`; wall clock allows three
/// times the CPU budget. Runs as one branch of the observer and never
/// returns while the worker behaves.
pub(crate) async fn enforce_time_limits(
    mut rx: watch::Receiver<Option<LimitWindow>>,
    cpu_time: impl Fn() -> f64,
) -> WorkerError {
    loop {
        // Wait for a call to begin.
        let window = loop {
            if let Some(window) = rx.borrow().clone() {
                break window;
            }
            if rx.changed().await.is_err() {
                // Handle dropped: worker is shutting down. Park forever and
                // let a sibling branch win the select.
                std::future::pending::<()>().await;
            }
        };

        // CPU time is at most real time for a single-threaded worker, so
        // nothing can be exceeded before one full budget of wall clock.
        tokio::time::sleep(std::time::Duration::from_secs_f64(window.cpu_limit_seconds)).await;

        loop {
            let current = rx.borrow().clone();
            match current {
                Some(active) if active.epoch == window.epoch => {}
                // The call finished (or a new one began); go back to waiting.
                _ => break,
            }

            let remaining_cpu = window.cpu_start + window.cpu_limit_seconds - cpu_time();
            if remaining_cpu <= 0.0 {
                return WorkerError::CpuTimeLimitExceeded {
                    limit_seconds: window.cpu_limit_seconds,
                };
            }

            let real_limit =
                window.cpu_limit_seconds * qpy_protocol::WorkerResourceLimits::REAL_TIME_FACTOR;
            let remaining_real = real_limit - window.real_start.elapsed().as_secs_f64();
            if remaining_real <= 0.0 {
                return WorkerError::RealTimeLimitExceeded {
                    limit_seconds: real_limit,
                };
            }

            let next = remaining_cpu.min(remaining_real).max(MIN_POLL_SECONDS);
            tokio::time::sleep(std::time::Duration::from_secs_f64(next)).await;
        }
    }
}

/// Sends one request and awaits its typed response.
///
/// The exchange mutex serializes concurrent callers on the same worker, so
/// at most one request is ever outstanding.
pub(crate) async fn send_and_wait<R: WorkerRequest>(
    shared: &Arc<Shared>,
    writer: &Mutex<Option<BoxedWriter>>,
    exchange: &Mutex<()>,
    limiter: Option<(&TimeLimiter, f64)>,
    message: &R,
    cpu_limit_seconds: f64,
) -> Result<R::Response, WorkerError> {
    let _exchange = exchange.lock().await;

    if shared.state() == WorkerState::NotRunning {
        return Err(shared.failure().unwrap_or(WorkerError::NotRunning));
    }

    let (tx, rx) = oneshot::channel();
    // Register before sending so an immediate response cannot be lost.
    shared.push_pending(R::Response::ID.as_u32(), tx);

    {
        let mut writer = writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(shared.failure().unwrap_or(WorkerError::NotRunning));
        };
        send_message(writer, message).await?;
    }

    shared.set_state(WorkerState::ServerAwaitsResponse);
    if let Some((limiter, cpu_now)) = limiter {
        limiter.begin(cpu_now, cpu_limit_seconds);
    }

    let outcome = rx.await;

    if let Some((limiter, _)) = limiter {
        limiter.reset();
    }
    if shared.state() != WorkerState::NotRunning {
        shared.set_state(WorkerState::Idle);
    }

    let frame = match outcome {
        Ok(Ok(frame)) => frame,
        Ok(Err(error)) => return Err(error),
        // Observer dropped the sender while failing outstanding futures.
        Err(_) => return Err(shared.failure().unwrap_or(WorkerError::NotRunning)),
    };

    let payload: &[u8] = if frame.payload.is_empty() {
        b"{}"
    } else {
        &frame.payload
    };
    serde_json::from_slice(payload).map_err(|err| WorkerError::Decode(err.to_string()))
}
