use serde::{Deserialize, Serialize};

/// One persisted telemetry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfSample {
    /// Monotonic per database; orders samples by insertion.
    pub id: i64,
    pub worker_id: String,
    pub ts_ms: i64,
    /// Resident memory of the worker's process, 0 when unreadable.
    pub memory_bytes: u64,
    /// Process CPU load in `0..=1`, or -1 when unavailable.
    pub cpu_load: f64,
    /// Set only on the sample taken when a job finishes.
    pub last_job_duration_ms: Option<u64>,
}

/// Read-only view of one worker's in-memory telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub current_job_id: Option<String>,
    pub current_job_start_ms: Option<i64>,
    /// Time the current job has been running, 0 when idle.
    pub current_job_elapsed_ms: i64,
    pub last_finished_ms: Option<i64>,
    /// Oldest first, at most 30 entries each.
    pub memory_history: Vec<u64>,
    pub cpu_history: Vec<f64>,
    pub job_duration_history: Vec<u64>,
}
