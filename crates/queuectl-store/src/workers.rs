use std::sync::Arc;

use queuectl_core::Clock;
use rusqlite::{params, types::Type, Row};
use tracing::{debug, info};

use crate::{
    db::{init_db, Db},
    error::Result,
    types::{WorkerCounts, WorkerInfo, WorkerStatus},
};

/// Durable roster of workers and what they are doing.
///
/// Rows are never deleted: a worker that exits is left as `STOPPED` so its
/// history stays visible to `workers` and the stale-lease sweep.
pub struct WorkerRegistry {
    db: Db,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&*db.lock()?)?;
        Ok(Self { db, clock })
    }

    /// Upsert `worker_id` as IDLE with fresh start and heartbeat times.
    /// Re-registering a known id resets it and clears any current job.
    pub fn register(&self, worker_id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let now = self.clock.epoch_secs();
        conn.execute(
            "INSERT INTO workers (worker_id, status, last_heartbeat, started_at)
             VALUES (?1, 'IDLE', ?2, ?2)
             ON CONFLICT(worker_id) DO UPDATE SET
                 status = 'IDLE',
                 last_heartbeat = excluded.last_heartbeat,
                 started_at = excluded.started_at,
                 current_job_id = NULL,
                 current_job_start_ms = NULL",
            params![worker_id, now],
        )?;
        info!(%worker_id, "worker registered");
        Ok(())
    }

    /// Record `status` and bump `last_heartbeat` to now.
    pub fn heartbeat(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE workers SET status = ?1, last_heartbeat = ?2 WHERE worker_id = ?3",
            params![status.as_str(), self.clock.epoch_secs(), worker_id],
        )?;
        Ok(())
    }

    pub fn mark_stopped(&self, worker_id: &str) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE workers SET status = 'STOPPED', last_heartbeat = ?1,
                    current_job_id = NULL, current_job_start_ms = NULL
              WHERE worker_id = ?2",
            params![self.clock.epoch_secs(), worker_id],
        )?;
        info!(%worker_id, "worker stopped");
        Ok(())
    }

    /// Workers currently IDLE and BUSY. STOPPED workers are not counted.
    pub fn counts(&self) -> Result<WorkerCounts> {
        let conn = self.db.lock()?;
        let counts = conn.query_row(
            "SELECT COALESCE(SUM(status = 'IDLE'), 0), COALESCE(SUM(status = 'BUSY'), 0)
               FROM workers",
            [],
            |row| {
                Ok(WorkerCounts {
                    idle: row.get(0)?,
                    busy: row.get(1)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Every known worker, oldest start first.
    pub fn list(&self) -> Result<Vec<WorkerInfo>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT worker_id, status, last_heartbeat, started_at,
                    current_job_id, current_job_start_ms, last_finished_ms
               FROM workers
              ORDER BY started_at ASC, worker_id ASC",
        )?;
        let rows = stmt.query_map([], row_to_worker)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(&self, worker_id: &str) -> Result<Option<WorkerInfo>> {
        use rusqlite::OptionalExtension;

        let conn = self.db.lock()?;
        let info = conn
            .query_row(
                "SELECT worker_id, status, last_heartbeat, started_at,
                        current_job_id, current_job_start_ms, last_finished_ms
                   FROM workers WHERE worker_id = ?1",
                [worker_id],
                row_to_worker,
            )
            .optional()?;
        Ok(info)
    }

    /// Note that `worker_id` started `job_id` at `start_ms` (epoch millis).
    pub fn set_current_job(&self, worker_id: &str, job_id: &str, start_ms: i64) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE workers SET current_job_id = ?1, current_job_start_ms = ?2
              WHERE worker_id = ?3",
            params![job_id, start_ms, worker_id],
        )?;
        debug!(%worker_id, %job_id, "current job set");
        Ok(())
    }

    /// Clear the current job and stamp `last_finished_ms`.
    pub fn clear_current_job(&self, worker_id: &str, finished_ms: i64) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE workers SET current_job_id = NULL, current_job_start_ms = NULL,
                    last_finished_ms = ?1
              WHERE worker_id = ?2",
            params![finished_ms, worker_id],
        )?;
        Ok(())
    }
}

fn row_to_worker(row: &Row<'_>) -> rusqlite::Result<WorkerInfo> {
    let status: String = row.get(1)?;
    let status: WorkerStatus = status
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;
    Ok(WorkerInfo {
        worker_id: row.get(0)?,
        status,
        last_heartbeat: row.get(2)?,
        started_at: row.get(3)?,
        current_job_id: row.get(4)?,
        current_job_start_ms: row.get(5)?,
        last_finished_ms: row.get(6)?,
    })
}
