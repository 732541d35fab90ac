//! `queuectl-store`: the durable half of queuectl.
//!
//! Everything here lives in one SQLite file shared by all workers, whether
//! they are tasks in one process or separate processes:
//!
//! | Table     | Owner                          | Purpose                               |
//! |-----------|--------------------------------|---------------------------------------|
//! | `jobs`    | [`jobs::JobStore`]             | job state machine + atomic claim      |
//! | `workers` | [`workers::WorkerRegistry`]    | liveness, status, current job         |
//!
//! Coordination between workers happens only through [`jobs::JobStore::claim_pending_job`];
//! there is no in-process queue.

pub mod db;
pub mod error;
pub mod jobs;
pub mod types;
pub mod workers;

pub use db::Db;
pub use error::{Result, StoreError};
pub use jobs::JobStore;
pub use types::{Job, JobState, NewJob, RunAt, StateCounts, WorkerCounts, WorkerInfo, WorkerStatus};
pub use workers::WorkerRegistry;
