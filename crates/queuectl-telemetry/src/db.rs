use rusqlite::Connection;

use crate::error::Result;

/// Initialise the `worker_perf` table in `conn`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS worker_perf (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_id            TEXT    NOT NULL,
            ts_ms                INTEGER NOT NULL,
            memory_bytes         INTEGER NOT NULL,
            cpu_load             REAL    NOT NULL,   -- 0..1, -1 when unavailable
            last_job_duration_ms INTEGER
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_worker_perf_worker
            ON worker_perf (worker_id, id DESC);
        ",
    )?;
    Ok(())
}
