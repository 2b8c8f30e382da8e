//! A worker running the runtime on a thread of the server process.
//!
//! Debugging aid: packages execute without isolation and without time or
//! memory enforcement. The framed channel runs over an in-process duplex
//! stream; the synchronous runtime sits on the blocking pool behind a sync
//! bridge.

use std::sync::Arc;
use std::time::Duration;

use qpy_protocol::Exit;
use qpy_protocol::InitWorker;
use qpy_protocol::LoadPackage;
use qpy_protocol::PackageLocation;
use qpy_protocol::WorkerRequest;
use qpy_protocol::WorkerResourceLimits;
use qpy_worker::WorkerRuntime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tracing::debug;
use tracing::warn;

use super::connection::BoxedWriter;
use super::connection::ConnectionReader;
use super::connection::send_message;
use super::error::WorkerError;
use super::host;
use super::host::Shared;
use super::host::WorkerState;

const INIT_TIMEOUT: Duration = Duration::from_secs(2);
const LOAD_TIMEOUT: Duration = Duration::from_secs(4);
const PIPE_BUFFER_SIZE: usize = 256 * 1024;

pub struct ThreadWorker {
    location: PackageLocation,
    limits: WorkerResourceLimits,
    shared: Arc<Shared>,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    exchange: Mutex<()>,
    observer: Option<JoinHandle<()>>,
}

impl ThreadWorker {
    pub fn new(location: PackageLocation, limits: WorkerResourceLimits) -> Self {
        Self {
            location,
            limits,
            shared: Shared::new(),
            writer: Arc::new(Mutex::new(None)),
            exchange: Mutex::new(()),
            observer: None,
        }
    }

    pub fn location(&self) -> &PackageLocation {
        &self.location
    }

    pub fn limits(&self) -> WorkerResourceLimits {
        self.limits
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub async fn start(&mut self) -> Result<(), WorkerError> {
        let (server_side, worker_side) = tokio::io::duplex(PIPE_BUFFER_SIZE);

        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let runtime = tokio::task::spawn_blocking(move || {
            WorkerRuntime::new(
                SyncIoBridge::new(worker_read),
                SyncIoBridge::new(worker_write),
            )
            .run()
        });

        let (server_read, server_write) = tokio::io::split(server_side);
        *self.writer.lock().await = Some(Box::new(server_write));
        let reader = ConnectionReader::new(Box::new(server_read));

        self.shared.set_state(WorkerState::Idle);
        let shared = self.shared.clone();
        let writer = self.writer.clone();
        self.observer = Some(tokio::spawn(async move {
            let failure = tokio::select! {
                result = host::receive_loop(reader, shared.clone()) => result.err(),
                outcome = runtime => match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => Some(WorkerError::Io(error.to_string())),
                    Err(join_error) => Some(WorkerError::Io(join_error.to_string())),
                },
            };

            shared.set_state(WorkerState::NotRunning);
            if let Some(error) = failure {
                warn!(%error, "thread worker observer shutting the worker down");
                shared.record_failure(error);
            }
            // Closing our write half gives the runtime an EOF if it is still
            // in its dispatch loop.
            writer.lock().await.take();
            shared.fail_pending();
        }));

        let init = InitWorker {
            limits: self.limits,
            worker_type: qpy_worker::WORKER_TYPE_THREAD.to_string(),
        };
        self.handshake(&init, INIT_TIMEOUT).await?;

        let load = LoadPackage {
            location: self.location.clone(),
            main: true,
        };
        self.handshake(&load, LOAD_TIMEOUT).await?;

        debug!("thread worker is idle");
        Ok(())
    }

    async fn handshake<R: WorkerRequest>(
        &self,
        message: &R,
        deadline: Duration,
    ) -> Result<R::Response, WorkerError> {
        let exchange = tokio::time::timeout(deadline, self.send_and_wait::<R>(message)).await;
        let result = match exchange {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Start {
                reason: "worker did not answer during initialization".to_string(),
                temporary: true,
            }),
        };

        match result {
            Ok(response) => Ok(response),
            Err(error) => {
                // Closing the channel lets the runtime thread wind down.
                self.kill().await;
                Err(match error {
                    start @ WorkerError::Start { .. } => start,
                    other => WorkerError::Start {
                        reason: other.to_string(),
                        temporary: other.temporary(),
                    },
                })
            }
        }
    }

    /// Thread workers enforce no time limits; the call waits as long as the
    /// package takes.
    pub async fn send_and_wait<R: WorkerRequest>(
        &self,
        message: &R,
    ) -> Result<R::Response, WorkerError> {
        host::send_and_wait(
            &self.shared,
            &self.writer,
            &self.exchange,
            None,
            message,
            self.limits.max_cpu_time_seconds_per_call,
        )
        .await
    }

    pub async fn stop(&mut self, grace: Duration) {
        {
            let mut writer = self.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                let _ = send_message(writer, &Exit {}).await;
            }
        }

        if let Some(observer) = self.observer.take() {
            if tokio::time::timeout(grace, observer).await.is_err() {
                debug!("thread worker did not stop gracefully");
                self.kill().await;
            }
        }
    }

    /// Threads cannot be killed; dropping the channel makes the runtime see
    /// EOF and exit on its next read.
    pub async fn kill(&self) {
        self.shared.set_state(WorkerState::NotRunning);
        self.writer.lock().await.take();
    }
}
