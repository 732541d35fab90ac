//! `queuectl-core`: configuration, time source and shared error type used by
//! every other queuectl crate.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueuectlConfig;
pub use error::{CoreError, Result};
