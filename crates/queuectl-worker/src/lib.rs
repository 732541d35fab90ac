//! `queuectl-worker`: runs claimed jobs.
//!
//! A [`pool::WorkerPool`] owns N [`worker::Worker`] tasks. Each worker has
//! its own database connection and coordinates with every other worker,
//! in this process or another, only through the job store's atomic claim.
//!
//! Two cancellation paths stay independent: the pool's `CancellationToken`
//! stops workers between jobs, while a job's timeout kills only that job's
//! process group.

pub mod error;
pub mod executor;
pub mod joblog;
pub mod output;
pub mod pool;
pub mod stop;
pub mod worker;

pub use error::{Result, WorkerError};
pub use executor::{execute, ExecOptions, ExecOutcome, ExecResult};
pub use joblog::{CompletionRecord, CompletionSink, JsonLinesSink, TracingSink};
pub use pool::WorkerPool;
pub use worker::{Worker, WorkerSettings};
