//! Per-attempt completion records and where they go.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{Result, WorkerError};
use crate::executor::ExecOutcome;

/// One finished attempt of one job.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub ts_ms: i64,
    pub worker_id: String,
    pub job_id: String,
    pub command: String,
    pub outcome: ExecOutcome,
    /// 1-based attempt number this record describes.
    pub attempt: u32,
    pub duration_ms: u64,
    pub output: String,
}

/// Destination for completion records. Write failures are reported to the
/// caller, which logs them; they never change a job's outcome.
pub trait CompletionSink: Send + Sync {
    fn record(&self, record: &CompletionRecord) -> Result<()>;
}

/// Appends one JSON object per line to `<dir>/<worker_id>.log`.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    dir: PathBuf,
}

impl JsonLinesSink {
    /// Creates `dir` if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}.log"))
    }
}

impl CompletionSink for JsonLinesSink {
    fn record(&self, record: &CompletionRecord) -> Result<()> {
        let mut line =
            serde_json::to_string(record).map_err(|e| WorkerError::Log(e.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&record.worker_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl CompletionSink for TracingSink {
    fn record(&self, record: &CompletionRecord) -> Result<()> {
        info!(
            worker_id = %record.worker_id,
            job_id = %record.job_id,
            outcome = record.outcome.label(),
            attempt = record.attempt,
            duration_ms = record.duration_ms,
            output_chars = record.output.chars().count(),
            "job attempt finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(worker_id: &str, job_id: &str) -> CompletionRecord {
        CompletionRecord {
            ts_ms: 1_700_000_000_000,
            worker_id: worker_id.to_string(),
            job_id: job_id.to_string(),
            command: "echo hi".to_string(),
            outcome: ExecOutcome::Failed { exit_code: 2 },
            attempt: 1,
            duration_ms: 12,
            output: "hi\n".to_string(),
        }
    }

    #[test]
    fn json_lines_append_per_worker() {
        let dir = std::env::temp_dir().join(format!("queuectl-logs-{}", uuid::Uuid::new_v4()));
        let sink = JsonLinesSink::new(&dir).expect("sink");
        sink.record(&record("w1", "a")).expect("write");
        sink.record(&record("w1", "b")).expect("write");
        sink.record(&record("w2", "c")).expect("write");

        let w1 = fs::read_to_string(sink.path_for("w1")).expect("read");
        let lines: Vec<serde_json::Value> = w1
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["job_id"], "a");
        assert_eq!(lines[1]["job_id"], "b");
        assert_eq!(lines[0]["outcome"]["kind"], "failed");
        assert_eq!(lines[0]["outcome"]["exit_code"], 2);

        assert_eq!(fs::read_to_string(sink.path_for("w2")).expect("read").lines().count(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn tracing_sink_never_fails() {
        assert!(TracingSink.record(&record("w", "j")).is_ok());
    }
}
