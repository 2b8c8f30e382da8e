//! Bounded pool of per-call workers.
//!
//! Acquisition passes two gates: a semaphore bounding worker count and a
//! memory gate bounding the sum of per-worker reservations. Workers have no
//! affinity between calls; every lease starts a fresh worker and stops it on
//! release. Dropping a lease without releasing it (an HTTP cancellation)
//! kills the worker and returns both gates asynchronously.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use qpy_protocol::PackageLocation;
use qpy_protocol::WorkerResourceLimits;
use tokio::sync::Notify;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tracing::warn;

use super::ProcessWorker;
use super::ThreadWorker;
use super::Worker;
use super::WorkerError;
use crate::settings::WorkerKind;

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Builds one worker per call. The executable only matters for process
/// workers.
#[derive(Debug, Clone)]
pub struct WorkerFactory {
    pub kind: WorkerKind,
    pub executable: PathBuf,
    pub limits: WorkerResourceLimits,
}

impl WorkerFactory {
    fn create(&self, location: PackageLocation) -> Worker {
        match self.kind {
            WorkerKind::Process => Worker::Process(ProcessWorker::new(
                location,
                self.limits,
                self.executable.clone(),
            )),
            WorkerKind::Thread => Worker::Thread(ThreadWorker::new(location, self.limits)),
        }
    }
}

struct MemoryGate {
    max: u64,
    used: StdMutex<u64>,
    freed: Notify,
}

impl MemoryGate {
    fn try_reserve(&self, amount: u64) -> bool {
        let Ok(mut used) = self.used.lock() else {
            return false;
        };
        if *used + amount <= self.max {
            *used += amount;
            true
        } else {
            false
        }
    }

    fn free(&self, amount: u64) {
        if let Ok(mut used) = self.used.lock() {
            *used = used.saturating_sub(amount);
        }
        self.freed.notify_waiters();
    }

    fn used(&self) -> u64 {
        self.used.lock().map(|used| *used).unwrap_or(0)
    }
}

pub struct WorkerPool {
    factory: WorkerFactory,
    semaphore: Arc<Semaphore>,
    memory: Arc<MemoryGate>,
    in_process: Arc<AtomicUsize>,
    in_queue: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, max_memory: u64, factory: WorkerFactory) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            memory: Arc::new(MemoryGate {
                max: max_memory,
                used: StdMutex::new(0),
                freed: Notify::new(),
            }),
            in_process: Arc::new(AtomicUsize::new(0)),
            in_queue: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests currently holding a started worker.
    pub fn requests_in_process(&self) -> usize {
        self.in_process.load(Ordering::SeqCst)
    }

    /// Requests waiting for a worker slot or for memory.
    pub fn requests_in_queue(&self) -> usize {
        self.in_queue.load(Ordering::SeqCst)
    }

    pub fn worker_limits(&self) -> WorkerResourceLimits {
        self.factory.limits
    }

    /// Current sum of memory reservations. For tests and diagnostics.
    pub fn reserved_memory(&self) -> u64 {
        self.memory.used()
    }

    /// Starts a fresh worker for `location`, gated on worker count and
    /// memory. The returned lease must be [`WorkerLease::release`]d for a
    /// graceful stop; dropping it kills the worker instead.
    pub async fn acquire(&self, location: PackageLocation) -> Result<WorkerLease, WorkerError> {
        let queued = QueueGuard::new(self.in_queue.clone());

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Start {
                reason: "worker pool is shut down".to_string(),
                temporary: true,
            })?;

        let reserve = self.factory.limits.max_memory;
        if reserve > self.memory.max {
            return Err(WorkerError::Start {
                reason: "the worker needs more memory than the pool has in total".to_string(),
                temporary: false,
            });
        }

        loop {
            let freed = self.memory.freed.notified();
            if self.memory.try_reserve(reserve) {
                break;
            }
            freed.await;
        }
        // Both gates passed; the request is no longer queued.
        drop(queued);

        // From here on the reservation is owned by the lease, so every exit
        // path (including cancellation) gives it back.
        let mut lease = WorkerLease {
            worker: None,
            reserve,
            permit: Some(permit),
            memory: self.memory.clone(),
            in_process: self.in_process.clone(),
        };

        let mut worker = self.factory.create(location);
        worker.start().await?;
        lease.worker = Some(worker);
        self.in_process.fetch_add(1, Ordering::SeqCst);
        Ok(lease)
    }
}

struct QueueGuard(Arc<AtomicUsize>);

impl QueueGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A started worker checked out of the pool, together with its memory
/// reservation and semaphore slot.
pub struct WorkerLease {
    worker: Option<Worker>,
    reserve: u64,
    permit: Option<OwnedSemaphorePermit>,
    memory: Arc<MemoryGate>,
    in_process: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease").finish_non_exhaustive()
    }
}

impl WorkerLease {
    pub fn worker(&self) -> &Worker {
        match &self.worker {
            Some(worker) => worker,
            None => unreachable!("a lease holds its worker until released"),
        }
    }

    /// Stops the worker gracefully, then returns memory and slot.
    pub async fn release(mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop(STOP_GRACE).await;
            self.in_process.fetch_sub(1, Ordering::SeqCst);
        }
        self.memory.free(self.reserve);
        self.permit.take();
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let worker = self.worker.take();
        let permit = self.permit.take();
        if permit.is_none() {
            // `release` already returned everything.
            return;
        }

        let Some(worker) = worker else {
            // Acquisition failed after the reservation was taken.
            self.memory.free(self.reserve);
            return;
        };

        // Mid-exchange state cannot be resumed; kill rather than drain. The
        // gates are given back only once the worker is gone.
        self.in_process.fetch_sub(1, Ordering::SeqCst);
        let memory = self.memory.clone();
        let reserve = self.reserve;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    worker.kill().await;
                    memory.free(reserve);
                    drop(permit);
                });
            }
            Err(_) => {
                warn!("worker lease dropped outside a runtime; leaking the worker");
                memory.free(reserve);
            }
        }
    }
}
