//! `queuectl-telemetry`: per-worker resource and job-duration history.
//!
//! Each worker keeps a capped ring of recent samples in memory, mirrored to
//! the `worker_perf` table and pruned to the same size after every insert,
//! so history survives the process for `perf` to read.

pub mod db;
pub mod error;
pub mod probe;
pub mod ring;
pub mod sampler;
pub mod types;

pub use error::{Result, TelemetryError};
pub use probe::{ProcessProbe, ResourceProbe};
pub use ring::BoundedRing;
pub use sampler::{TelemetrySampler, MAX_SAMPLES};
pub use types::{PerfSample, WorkerSnapshot};
