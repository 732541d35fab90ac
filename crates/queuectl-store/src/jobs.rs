use std::sync::Arc;

use queuectl_core::{config::QueueConfig, Clock};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::{init_db, Db},
    error::{Result, StoreError},
    types::{Job, JobState, NewJob, StateCounts},
};

macro_rules! job_columns {
    () => {
        "id, command, state, attempts, max_retries, priority, available_at, run_at,
         timeout_seconds, last_error, output, locked_by, locked_at, created_at, updated_at"
    };
}

/// Flip the best eligible PENDING row to PROCESSING in one statement.
/// The outer `state = 'PENDING'` re-check keeps it a no-op if the row
/// changed after the subquery ran.
const CLAIM_SQL: &str = concat!(
    "UPDATE jobs
        SET state = 'PROCESSING', locked_by = ?1, locked_at = ?2, updated_at = ?2
      WHERE id = (SELECT id FROM jobs
                   WHERE state = 'PENDING' AND available_at <= ?2
                   ORDER BY priority DESC, available_at ASC, created_at ASC, rowid ASC
                   LIMIT 1)
        AND state = 'PENDING'
  RETURNING ",
    job_columns!()
);

/// The job table and its state machine.
///
/// ```text
/// create ─► PENDING ──claim──► PROCESSING ──ok──► COMPLETED
///              ▲                   │
///              └──fail (retry)─────┤
///                                  └──fail (budget spent)──► DEAD ──operator retry──► PENDING
/// ```
pub struct JobStore {
    db: Db,
    clock: Arc<dyn Clock>,
    backoff_base: u32,
    defaults: QueueConfig,
}

impl JobStore {
    /// Build a store over `db`, creating the schema if needed. The backoff
    /// base and enqueue defaults are read from `queue` once, here.
    pub fn new(db: Db, queue: &QueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&*db.lock()?)?;
        Ok(Self {
            db,
            clock,
            backoff_base: queue.effective_backoff_base(),
            defaults: queue.clone(),
        })
    }

    pub fn backoff_base(&self) -> u32 {
        self.backoff_base
    }

    /// Seconds a job waits after its `attempts`-th failure: `base^attempts`.
    pub fn backoff_delay_secs(&self, attempts: u32) -> i64 {
        backoff_delay(self.backoff_base, attempts)
    }

    /// Insert `job` as PENDING. Lock fields are left empty and both
    /// timestamps are set to now; everything else is stored as given.
    ///
    /// Returns [`StoreError::DuplicateJob`] if the id is taken.
    pub fn create_job(&self, job: &Job) -> Result<()> {
        let conn = self.db.lock()?;
        let now = self.clock.epoch_secs();
        let inserted = conn.execute(
            "INSERT INTO jobs
             (id, command, state, attempts, max_retries, priority, available_at, run_at,
              timeout_seconds, created_at, updated_at)
             VALUES (?1, ?2, 'PENDING', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                job.id,
                job.command,
                job.attempts,
                job.max_retries,
                job.priority,
                job.available_at,
                job.run_at,
                job.timeout_secs,
                now,
            ],
        );
        match inserted {
            Ok(_) => {
                info!(job_id = %job.id, priority = job.priority, available_at = job.available_at, "job created");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(StoreError::DuplicateJob { id: job.id.clone() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build a job from `new`, filling unset fields from the `[queue]`
    /// defaults, and insert it. Returns the stored record.
    pub fn enqueue(&self, new: NewJob) -> Result<Job> {
        let now = self.clock.epoch_secs();
        let run_at = new.run_at.map(|r| r.resolve(now));
        let job = Job {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            command: new.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: new.max_retries.unwrap_or(self.defaults.default_max_retries),
            priority: new.priority.unwrap_or(self.defaults.default_priority),
            available_at: run_at.unwrap_or(now),
            run_at,
            timeout_secs: new.timeout_secs.unwrap_or(self.defaults.default_timeout_secs),
            last_error: None,
            output: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };
        self.create_job(&job)?;
        Ok(job)
    }

    /// Atomically take the next eligible job for `worker_id`.
    ///
    /// Eligible means `PENDING` with `available_at <= now`; the winner is the
    /// highest priority, then earliest available, then earliest created.
    /// Concurrent callers on any connection never receive the same job.
    /// `Ok(None)` means nothing is eligible right now.
    pub fn claim_pending_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut conn = self.db.lock()?;
        let now = self.clock.epoch_secs();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = tx
            .query_row(CLAIM_SQL, params![worker_id, now], row_to_job)
            .optional()?;
        tx.commit()?;

        if let Some(ref job) = job {
            debug!(job_id = %job.id, %worker_id, attempts = job.attempts, "job claimed");
        }
        Ok(job)
    }

    /// Mark `job_id` COMPLETED with `output` and release its lock.
    ///
    /// Not guarded on current state or owner: the last report wins.
    pub fn mark_job_completed(&self, job_id: &str, output: &str) -> Result<()> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "UPDATE jobs SET state = 'COMPLETED', output = ?1, updated_at = ?2,
                    locked_by = NULL, locked_at = NULL
              WHERE id = ?3",
            params![output, self.clock.epoch_secs(), job_id],
        )?;
        if n == 0 {
            warn!(%job_id, "completion reported for unknown job");
        }
        Ok(())
    }

    /// Apply the retry policy to a failed attempt of `job`.
    ///
    /// The attempt that takes `attempts` past `max_retries` dead-letters
    /// the job; any earlier one puts it back to PENDING, eligible again
    /// after `backoff_base^attempts` seconds. Returns the resulting state.
    pub fn handle_failed_attempt(&self, job: &Job, error: &str) -> Result<JobState> {
        let conn = self.db.lock()?;
        let now = self.clock.epoch_secs();
        apply_failure(&conn, job, error, now, self.backoff_base)
    }

    /// Reset a DEAD job to PENDING with a fresh retry budget.
    ///
    /// The caller is expected to have checked that the job is DEAD. Returns
    /// `false` if no job has this id.
    pub fn retry_dead_job(&self, job_id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let now = self.clock.epoch_secs();
        let n = conn.execute(
            "UPDATE jobs SET state = 'PENDING', attempts = 0, available_at = ?1,
                    updated_at = ?1, last_error = NULL
              WHERE id = ?2",
            params![now, job_id],
        )?;
        if n > 0 {
            info!(%job_id, "job retried from dead-letter queue");
        }
        Ok(n > 0)
    }

    /// All jobs, or those in `state`, newest first.
    pub fn list_jobs_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let conn = self.db.lock()?;
        let jobs = match state {
            None => {
                let mut stmt = conn.prepare_cached(concat!(
                    "SELECT ",
                    job_columns!(),
                    " FROM jobs ORDER BY created_at DESC, rowid DESC"
                ))?;
                let rows = stmt.query_map([], row_to_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(state) => {
                let mut stmt = conn.prepare_cached(concat!(
                    "SELECT ",
                    job_columns!(),
                    " FROM jobs WHERE state = ?1 ORDER BY created_at DESC, rowid DESC"
                ))?;
                let rows = stmt.query_map([state.as_str()], row_to_job)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(jobs)
    }

    pub fn get_job_by_id(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.db.lock()?;
        let job = conn
            .query_row(
                concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = ?1"),
                [job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Number of jobs in each state; states with no jobs report 0.
    pub fn state_counts(&self) -> Result<StateCounts> {
        let conn = self.db.lock()?;
        let mut counts: StateCounts = JobState::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stmt = conn.prepare_cached("SELECT state, COUNT(1) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (state, n) = row?;
            let state: JobState = state.parse().map_err(StoreError::InvalidState)?;
            counts.insert(state, n);
        }
        Ok(counts)
    }

    /// Distinct workers currently holding a PROCESSING job.
    pub fn active_worker_count(&self) -> Result<u64> {
        let conn = self.db.lock()?;
        let n = conn.query_row(
            "SELECT COUNT(DISTINCT locked_by) FROM jobs
              WHERE state = 'PROCESSING' AND locked_by IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Hand back PROCESSING jobs whose owner has gone away.
    ///
    /// A job is reclaimed when it was claimed more than `stale_after_secs`
    /// ago and its `locked_by` worker is unknown or STOPPED, has not
    /// heartbeated within `stale_after_secs`, or is alive but no longer
    /// working on it (its report was lost). Each reclaim counts as a failed
    /// attempt, so a job that keeps killing its worker ends up DEAD.
    /// Returns the ids of reclaimed jobs.
    pub fn reclaim_stale(&self, stale_after_secs: u64) -> Result<Vec<String>> {
        let mut conn = self.db.lock()?;
        let now = self.clock.epoch_secs();
        let cutoff = now.saturating_sub(i64::try_from(stale_after_secs).unwrap_or(i64::MAX));
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale: Vec<Job> = {
            let mut stmt = tx.prepare_cached(
                "SELECT j.id, j.command, j.state, j.attempts, j.max_retries, j.priority,
                        j.available_at, j.run_at, j.timeout_seconds, j.last_error, j.output,
                        j.locked_by, j.locked_at, j.created_at, j.updated_at
                   FROM jobs j
                   LEFT JOIN workers w ON w.worker_id = j.locked_by
                  WHERE j.state = 'PROCESSING'
                    AND COALESCE(j.locked_at, 0) < ?1
                    AND (w.worker_id IS NULL
                         OR w.status = 'STOPPED'
                         OR w.last_heartbeat < ?1
                         OR w.current_job_id IS NULL
                         OR w.current_job_id <> j.id)",
            )?;
            let rows = stmt.query_map([cutoff], row_to_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut reclaimed = Vec::with_capacity(stale.len());
        for job in stale {
            let owner = job.locked_by.as_deref().unwrap_or("<none>");
            let error = format!("worker {owner} abandoned the job without reporting");
            let next = apply_failure(&tx, &job, &error, now, self.backoff_base)?;
            warn!(job_id = %job.id, worker_id = %owner, next_state = %next, "reclaimed job from stale worker");
            reclaimed.push(job.id);
        }
        tx.commit()?;
        Ok(reclaimed)
    }
}

/// Shared retry policy for worker-reported failures and stale reclaims.
fn apply_failure(
    conn: &Connection,
    job: &Job,
    error: &str,
    now: i64,
    backoff_base: u32,
) -> Result<JobState> {
    let attempts = job.attempts.saturating_add(1);
    if attempts > job.max_retries {
        conn.execute(
            "UPDATE jobs SET state = 'DEAD', attempts = ?1, last_error = ?2, updated_at = ?3,
                    locked_by = NULL, locked_at = NULL
              WHERE id = ?4",
            params![attempts, error, now, job.id],
        )?;
        warn!(job_id = %job.id, attempts, max_retries = job.max_retries, "job moved to dead-letter queue");
        return Ok(JobState::Dead);
    }

    let delay = backoff_delay(backoff_base, attempts);
    let available_at = now.saturating_add(delay);
    conn.execute(
        "UPDATE jobs SET state = 'PENDING', attempts = ?1, last_error = ?2, available_at = ?3,
                updated_at = ?4, locked_by = NULL, locked_at = NULL
          WHERE id = ?5",
        params![attempts, error, available_at, now, job.id],
    )?;
    info!(job_id = %job.id, attempts, retry_in_secs = delay, "job scheduled for retry");
    Ok(JobState::Pending)
}

/// `base^attempts` seconds, saturating.
fn backoff_delay(base: u32, attempts: u32) -> i64 {
    i64::from(base).checked_pow(attempts).unwrap_or(i64::MAX)
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state: String = row.get(2)?;
    let state: JobState = state
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        priority: row.get(5)?,
        available_at: row.get(6)?,
        run_at: row.get(7)?,
        timeout_secs: row.get(8)?,
        last_error: row.get(9)?,
        output: row.get(10)?,
        locked_by: row.get(11)?,
        locked_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
