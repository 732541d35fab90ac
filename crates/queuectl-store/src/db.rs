use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Explicitly constructed handle to the queue database.
///
/// Cloning shares the same connection. Use [`Db::reopen`] to get an
/// independent connection to the same file, which is what each worker does
/// so that in-process workers contend for rows exactly like separate
/// processes would.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    busy_timeout: Duration,
}

impl Db {
    /// Open (or create) the database file at `path`.
    ///
    /// Sets WAL journaling and a busy timeout so concurrent writers wait for
    /// the lock instead of failing with `SQLITE_BUSY`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        configure(&conn, busy_timeout)?;
        debug!(path = %path.display(), "opened queue database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
            busy_timeout,
        })
    }

    /// Private in-memory database. Only clones of this handle can see it.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let busy_timeout = Duration::from_millis(queuectl_core::config::DEFAULT_BUSY_TIMEOUT_MS);
        configure(&conn, busy_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            busy_timeout,
        })
    }

    /// A handle with its own connection to the same file. In-memory
    /// databases cannot be reopened, so they share this handle's connection.
    pub fn reopen(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path, self.busy_timeout),
            None => Ok(self.clone()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exclusive access to the connection for the duration of one operation.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Initialise the `jobs` and `workers` tables in `conn`.
///
/// Idempotent: every statement uses `IF NOT EXISTS`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            command         TEXT    NOT NULL,
            state           TEXT    NOT NULL,   -- PENDING | PROCESSING | COMPLETED | DEAD
            attempts        INTEGER NOT NULL DEFAULT 0,
            max_retries     INTEGER NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 0,
            available_at    INTEGER NOT NULL,   -- epoch seconds; the claim gate
            run_at          INTEGER,            -- original schedule, informational
            timeout_seconds INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT,
            output          TEXT,
            locked_by       TEXT,
            locked_at       INTEGER,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        ) STRICT;

        -- Claim query: WHERE state = 'PENDING' AND available_at <= ?
        --              ORDER BY priority DESC, available_at, created_at
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs (state, priority DESC, available_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_created
            ON jobs (created_at DESC);

        CREATE TABLE IF NOT EXISTS workers (
            worker_id            TEXT    NOT NULL PRIMARY KEY,
            status               TEXT    NOT NULL,   -- IDLE | BUSY | STOPPED
            last_heartbeat       INTEGER NOT NULL,   -- epoch seconds
            started_at           INTEGER NOT NULL,
            current_job_id       TEXT,
            current_job_start_ms INTEGER,
            last_finished_ms     INTEGER
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("queuectl-db-{}-{}.db", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn init_db_is_idempotent() {
        let db = Db::open_in_memory().expect("open");
        let conn = db.lock().expect("lock");
        init_db(&conn).expect("first init");
        init_db(&conn).expect("second init");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'workers')",
                [],
                |r| r.get(0),
            )
            .expect("count tables");
        assert_eq!(tables, 2);
    }

    #[test]
    fn reopen_sees_the_same_file() {
        let path = temp_db_path("reopen");
        let first = Db::open(&path, Duration::from_secs(1)).expect("open");
        init_db(&first.lock().expect("lock")).expect("init");
        first
            .lock()
            .expect("lock")
            .execute(
                "INSERT INTO workers (worker_id, status, last_heartbeat, started_at)
                 VALUES ('w1', 'IDLE', 0, 0)",
                [],
            )
            .expect("insert");

        let second = first.reopen().expect("reopen");
        assert!(!Arc::ptr_eq(&first.conn, &second.conn));
        let n: i64 = second
            .lock()
            .expect("lock")
            .query_row("SELECT COUNT(*) FROM workers", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 1);

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn in_memory_reopen_shares_connection() {
        let db = Db::open_in_memory().expect("open");
        let again = db.reopen().expect("reopen");
        assert!(Arc::ptr_eq(&db.conn, &again.conn));
        assert!(again.path().is_none());
    }
}
