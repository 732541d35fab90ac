use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// A failed attempt is never persisted as its own state: it either goes
/// back to `Pending` with a backoff delay or ends in `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for `available_at` and a free worker.
    Pending,
    /// Claimed by exactly one worker (`locked_by`).
    Processing,
    /// Finished with exit code 0. Terminal.
    Completed,
    /// Retry budget exhausted. Terminal until an operator retries it.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Completed => "COMPLETED",
            JobState::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobState::Pending),
            "PROCESSING" => Ok(JobState::Processing),
            "COMPLETED" => Ok(JobState::Completed),
            "DEAD" => Ok(JobState::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied or a generated UUID v4. Primary key.
    pub id: String,
    /// Shell command line, run via `sh -c`.
    pub command: String,
    pub state: JobState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_retries: u32,
    /// Higher claims first.
    pub priority: i64,
    /// Epoch seconds; the job cannot be claimed before this instant.
    pub available_at: i64,
    /// Epoch seconds the job was originally scheduled for, if any.
    pub run_at: Option<i64>,
    /// 0 means unbounded.
    pub timeout_secs: u64,
    pub last_error: Option<String>,
    pub output: Option<String>,
    /// Worker currently owning the job. Set only while `Processing`.
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// When a newly enqueued job becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunAt {
    /// Absolute epoch seconds.
    At { epoch: i64 },
    /// Seconds from enqueue time.
    In { secs: u64 },
}

impl RunAt {
    pub fn resolve(&self, now: i64) -> i64 {
        match *self {
            RunAt::At { epoch } => epoch,
            RunAt::In { secs } => now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)),
        }
    }
}

/// Enqueue request. Unset fields take the `[queue]` defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub id: Option<String>,
    pub command: String,
    pub max_retries: Option<u32>,
    pub priority: Option<i64>,
    pub timeout_secs: Option<u64>,
    pub run_at: Option<RunAt>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_run_at(mut self, run_at: RunAt) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Job count per state. Every state is present, zero when empty.
pub type StateCounts = BTreeMap<JobState, u64>;

/// Liveness status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(WorkerStatus::Idle),
            "BUSY" => Ok(WorkerStatus::Busy),
            "STOPPED" => Ok(WorkerStatus::Stopped),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// One row of the worker roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub status: WorkerStatus,
    /// Epoch seconds of the last status update.
    pub last_heartbeat: i64,
    pub started_at: i64,
    pub current_job_id: Option<String>,
    pub current_job_start_ms: Option<i64>,
    pub last_finished_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub idle: u64,
    pub busy: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parses_case_insensitively() {
        assert_eq!("dead".parse::<JobState>(), Ok(JobState::Dead));
        assert_eq!("PROCESSING".parse::<JobState>(), Ok(JobState::Processing));
        assert!("FAILED".parse::<JobState>().is_err());
    }

    #[test]
    fn job_state_display_matches_stored_form() {
        for state in JobState::ALL {
            assert_eq!(state.to_string().parse::<JobState>(), Ok(state));
        }
    }

    #[test]
    fn run_at_in_is_relative_to_now() {
        assert_eq!(RunAt::In { secs: 30 }.resolve(1_000), 1_030);
        assert_eq!(RunAt::At { epoch: 42 }.resolve(1_000), 42);
    }

    #[test]
    fn run_at_serialises_with_kind_tag() {
        let json = serde_json::to_string(&RunAt::In { secs: 5 }).expect("serialize");
        assert_eq!(json, r#"{"kind":"in","secs":5}"#);
    }
}
