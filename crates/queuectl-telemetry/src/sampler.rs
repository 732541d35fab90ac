use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use queuectl_core::Clock;
use queuectl_store::Db;
use rusqlite::params;
use tracing::debug;

use crate::{
    db::init_db,
    error::Result,
    probe::{cpu_load, ProcessProbe, ResourceProbe},
    ring::BoundedRing,
    types::{PerfSample, WorkerSnapshot},
};

/// History length per worker, in memory and in `worker_perf`.
pub const MAX_SAMPLES: usize = 30;

/// Reported when CPU load cannot be computed (first sample, no rusage).
const CPU_UNAVAILABLE: f64 = -1.0;

struct WorkerMetrics {
    current_job_id: Option<String>,
    current_job_start_ms: Option<i64>,
    last_finished_ms: Option<i64>,
    memory: BoundedRing<u64>,
    cpu: BoundedRing<f64>,
    job_durations: BoundedRing<u64>,
    /// CPU time and wall instant at this worker's previous sample.
    last_cpu: Option<(Instant, Duration)>,
}

impl WorkerMetrics {
    fn new() -> Self {
        Self {
            current_job_id: None,
            current_job_start_ms: None,
            last_finished_ms: None,
            memory: BoundedRing::new(MAX_SAMPLES),
            cpu: BoundedRing::new(MAX_SAMPLES),
            job_durations: BoundedRing::new(MAX_SAMPLES),
            last_cpu: None,
        }
    }

    fn snapshot(&self, worker_id: &str, now_ms: i64) -> WorkerSnapshot {
        let elapsed = match (&self.current_job_id, self.current_job_start_ms) {
            (Some(_), Some(start)) => now_ms.saturating_sub(start).max(0),
            _ => 0,
        };
        WorkerSnapshot {
            worker_id: worker_id.to_string(),
            current_job_id: self.current_job_id.clone(),
            current_job_start_ms: self.current_job_start_ms,
            current_job_elapsed_ms: elapsed,
            last_finished_ms: self.last_finished_ms,
            memory_history: self.memory.to_vec(),
            cpu_history: self.cpu.to_vec(),
            job_duration_history: self.job_durations.to_vec(),
        }
    }
}

/// Per-worker telemetry, owned by the pool and shared with its workers.
///
/// Sampling never fails the caller's job: callers log a returned error and
/// carry on.
pub struct TelemetrySampler {
    db: Db,
    clock: Arc<dyn Clock>,
    probe: Box<dyn ResourceProbe>,
    metrics: DashMap<String, WorkerMetrics>,
}

impl TelemetrySampler {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_probe(db, clock, Box::new(ProcessProbe))
    }

    pub fn with_probe(db: Db, clock: Arc<dyn Clock>, probe: Box<dyn ResourceProbe>) -> Result<Self> {
        init_db(&*db.lock()?)?;
        Ok(Self {
            db,
            clock,
            probe,
            metrics: DashMap::new(),
        })
    }

    /// Record current memory and CPU load for `worker_id`.
    pub fn sample(&self, worker_id: &str) -> Result<PerfSample> {
        self.record(worker_id, None)
    }

    /// Point `worker_id` at `job_id`, started at `start_ms` (epoch millis).
    pub fn set_current_job(&self, worker_id: &str, job_id: &str, start_ms: i64) {
        let mut m = self
            .metrics
            .entry(worker_id.to_string())
            .or_insert_with(WorkerMetrics::new);
        m.current_job_id = Some(job_id.to_string());
        m.current_job_start_ms = Some(start_ms);
    }

    /// Close out the current job: append `duration_ms` to the duration
    /// history and take a sample that carries it.
    pub fn finish_job(&self, worker_id: &str, duration_ms: u64) -> Result<PerfSample> {
        {
            let mut m = self
                .metrics
                .entry(worker_id.to_string())
                .or_insert_with(WorkerMetrics::new);
            m.current_job_id = None;
            m.current_job_start_ms = None;
            m.last_finished_ms = Some(self.clock.epoch_millis());
            m.job_durations.push(duration_ms);
        }
        self.record(worker_id, Some(duration_ms))
    }

    /// Every worker this sampler has seen, ordered by id.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let now_ms = self.clock.epoch_millis();
        let mut out: Vec<WorkerSnapshot> = self
            .metrics
            .iter()
            .map(|e| e.value().snapshot(e.key(), now_ms))
            .collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    pub fn snapshot(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        let now_ms = self.clock.epoch_millis();
        self.metrics
            .get(worker_id)
            .map(|m| m.snapshot(worker_id, now_ms))
    }

    /// Persisted samples for `worker_id`, oldest first.
    pub fn persisted_samples(&self, worker_id: &str) -> Result<Vec<PerfSample>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, worker_id, ts_ms, memory_bytes, cpu_load, last_job_duration_ms
               FROM worker_perf WHERE worker_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([worker_id], |row| {
            Ok(PerfSample {
                id: row.get(0)?,
                worker_id: row.get(1)?,
                ts_ms: row.get(2)?,
                memory_bytes: row.get(3)?,
                cpu_load: row.get(4)?,
                last_job_duration_ms: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Worker ids with at least one persisted sample.
    pub fn persisted_workers(&self) -> Result<Vec<String>> {
        let conn = self.db.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT worker_id FROM worker_perf ORDER BY worker_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn record(&self, worker_id: &str, job_duration_ms: Option<u64>) -> Result<PerfSample> {
        let ts_ms = self.clock.epoch_millis();
        let memory_bytes = self.probe.memory_bytes().unwrap_or(0);
        let cpu_now = self.probe.cpu_time().map(|t| (Instant::now(), t));

        // Shard lock is released before touching the database.
        let cpu = {
            let mut m = self
                .metrics
                .entry(worker_id.to_string())
                .or_insert_with(WorkerMetrics::new);
            let cpu = match (m.last_cpu, cpu_now) {
                (Some((prev_at, prev_cpu)), Some((at, cpu))) => cpu_load(
                    cpu.saturating_sub(prev_cpu),
                    at.saturating_duration_since(prev_at),
                    self.probe.cpu_count(),
                )
                .unwrap_or(CPU_UNAVAILABLE),
                _ => CPU_UNAVAILABLE,
            };
            if cpu_now.is_some() {
                m.last_cpu = cpu_now;
            }
            m.memory.push(memory_bytes);
            m.cpu.push(cpu);
            cpu
        };

        let id = self.persist(worker_id, ts_ms, memory_bytes, cpu, job_duration_ms)?;
        debug!(%worker_id, memory_bytes, cpu_load = cpu, "telemetry sample");
        Ok(PerfSample {
            id,
            worker_id: worker_id.to_string(),
            ts_ms,
            memory_bytes,
            cpu_load: cpu,
            last_job_duration_ms: job_duration_ms,
        })
    }

    /// Insert one row and prune this worker back to `MAX_SAMPLES`, atomically.
    fn persist(
        &self,
        worker_id: &str,
        ts_ms: i64,
        memory_bytes: u64,
        cpu_load: f64,
        job_duration_ms: Option<u64>,
    ) -> Result<i64> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO worker_perf (worker_id, ts_ms, memory_bytes, cpu_load, last_job_duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![worker_id, ts_ms, memory_bytes, cpu_load, job_duration_ms],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "DELETE FROM worker_perf
              WHERE worker_id = ?1
                AND id NOT IN (SELECT id FROM worker_perf WHERE worker_id = ?1
                               ORDER BY id DESC LIMIT ?2)",
            params![worker_id, MAX_SAMPLES as i64],
        )?;
        tx.commit()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use queuectl_core::ManualClock;

    /// Memory grows by one byte per reading; CPU time is unavailable.
    struct CountingProbe {
        next: AtomicU64,
    }

    impl ResourceProbe for CountingProbe {
        fn memory_bytes(&self) -> Option<u64> {
            Some(self.next.fetch_add(1, Ordering::SeqCst))
        }
        fn cpu_time(&self) -> Option<Duration> {
            None
        }
        fn cpu_count(&self) -> usize {
            1
        }
    }

    fn sampler() -> (TelemetrySampler, Arc<ManualClock>) {
        let db = Db::open_in_memory().expect("open db");
        let clock = Arc::new(ManualClock::at_epoch(1_700_000_000));
        let probe = Box::new(CountingProbe {
            next: AtomicU64::new(1),
        });
        let sampler = TelemetrySampler::with_probe(db, clock.clone(), probe).expect("sampler");
        (sampler, clock)
    }

    #[test]
    fn history_is_capped_at_thirty_most_recent() {
        let (sampler, clock) = sampler();
        for _ in 0..35 {
            sampler.sample("w1").expect("sample");
            clock.advance_secs(1);
        }

        let snap = sampler.snapshot("w1").expect("snapshot");
        assert_eq!(snap.memory_history.len(), MAX_SAMPLES);
        assert_eq!(snap.cpu_history.len(), MAX_SAMPLES);
        assert_eq!(snap.memory_history.first(), Some(&6));
        assert_eq!(snap.memory_history.last(), Some(&35));

        let rows = sampler.persisted_samples("w1").expect("rows");
        assert_eq!(rows.len(), MAX_SAMPLES);
        let memory: Vec<u64> = rows.iter().map(|r| r.memory_bytes).collect();
        assert_eq!(memory, snap.memory_history);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn pruning_is_per_worker() {
        let (sampler, _) = sampler();
        for _ in 0..40 {
            sampler.sample("busy").expect("sample");
        }
        sampler.sample("quiet").expect("sample");

        assert_eq!(sampler.persisted_samples("busy").expect("rows").len(), MAX_SAMPLES);
        assert_eq!(sampler.persisted_samples("quiet").expect("rows").len(), 1);
        assert_eq!(sampler.persisted_workers().expect("workers"), ["busy", "quiet"]);
    }

    #[test]
    fn unavailable_cpu_is_reported_as_negative() {
        let (sampler, _) = sampler();
        let sample = sampler.sample("w1").expect("sample");
        assert_eq!(sample.cpu_load, CPU_UNAVAILABLE);
        assert!(sample.last_job_duration_ms.is_none());
    }

    #[test]
    fn real_probe_reports_load_after_first_sample() {
        let db = Db::open_in_memory().expect("open db");
        let clock = Arc::new(ManualClock::at_epoch(0));
        let sampler = TelemetrySampler::new(db, clock).expect("sampler");
        let first = sampler.sample("w").expect("sample");
        assert_eq!(first.cpu_load, CPU_UNAVAILABLE);
        std::thread::sleep(Duration::from_millis(20));
        let second = sampler.sample("w").expect("sample");
        assert!((0.0..=1.0).contains(&second.cpu_load));
    }

    #[test]
    fn current_job_elapsed_and_finish() {
        let (sampler, clock) = sampler();
        let start = clock.epoch_millis();
        sampler.set_current_job("w1", "job-1", start);
        clock.advance_secs(3);

        let snap = sampler.snapshot("w1").expect("snapshot");
        assert_eq!(snap.current_job_id.as_deref(), Some("job-1"));
        assert_eq!(snap.current_job_elapsed_ms, 3_000);

        let sample = sampler.finish_job("w1", 3_000).expect("finish");
        assert_eq!(sample.last_job_duration_ms, Some(3_000));

        let snap = sampler.snapshot("w1").expect("snapshot");
        assert!(snap.current_job_id.is_none());
        assert_eq!(snap.current_job_elapsed_ms, 0);
        assert_eq!(snap.job_duration_history, vec![3_000]);
        assert_eq!(snap.last_finished_ms, Some(start + 3_000));

        let rows = sampler.persisted_samples("w1").expect("rows");
        assert_eq!(rows.last().and_then(|r| r.last_job_duration_ms), Some(3_000));
    }

    #[test]
    fn snapshots_cover_every_worker_in_order() {
        let (sampler, _) = sampler();
        sampler.sample("w2").expect("sample");
        sampler.set_current_job("w1", "j", 0);
        let ids: Vec<String> = sampler.snapshots().into_iter().map(|s| s.worker_id).collect();
        assert_eq!(ids, ["w1", "w2"]);
    }

    #[test]
    fn snapshot_serialises_for_perf_output() {
        let (sampler, _) = sampler();
        sampler.sample("w1").expect("sample");
        let json = serde_json::to_value(sampler.snapshots()).expect("json");
        assert_eq!(json[0]["worker_id"], "w1");
        assert_eq!(json[0]["memory_history"].as_array().map(Vec::len), Some(1));
    }
}
