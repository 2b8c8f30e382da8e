use serde::Deserialize;
use serde::Serialize;

/// Resource ceilings applied to a single worker.
///
/// `max_memory` becomes the worker's address-space rlimit and is also the
/// amount the pool reserves for it. The CPU budget applies per call; the
/// matching wall-clock budget is three times the CPU budget (see the
/// server-side time enforcer).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerResourceLimits {
    pub max_memory: u64,
    pub max_cpu_time_seconds_per_call: f64,
}

impl WorkerResourceLimits {
    /// Factor between the per-call CPU budget and the wall-clock budget.
    pub const REAL_TIME_FACTOR: f64 = 3.0;

    pub fn max_real_time_seconds_per_call(&self) -> f64 {
        self.max_cpu_time_seconds_per_call * Self::REAL_TIME_FACTOR
    }
}
