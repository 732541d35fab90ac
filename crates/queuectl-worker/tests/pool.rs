//! Pool-level behaviour on a file-backed database shared by several
//! connections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use queuectl_core::{Clock, ManualClock, QueuectlConfig, SystemClock};
use queuectl_store::{Db, JobState, JobStore, NewJob, WorkerRegistry, WorkerStatus};
use queuectl_worker::{stop, TracingSink, WorkerPool};

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("queuectl-pool-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        Self(dir)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn config(dir: &TempDir) -> QueuectlConfig {
    let mut config = QueuectlConfig::default();
    config.database.path = dir.0.join("queue.db").display().to_string();
    config.worker.poll_interval_ms = 25;
    config.worker.sample_interval_ms = 100;
    config.worker.logs_dir = dir.0.join("logs").display().to_string();
    config.worker.stop_marker = dir.0.join("stop.flag").display().to_string();
    config
}

fn open(config: &QueuectlConfig) -> Db {
    Db::open(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .expect("open db")
}

async fn wait_for_completed(store: &JobStore, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let counts = store.state_counts().expect("counts");
        if counts[&JobState::Completed] == expected {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {counts:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_runs_every_job_exactly_once() {
    let dir = TempDir::new();
    let config = config(&dir);
    let db = open(&config);
    let store = JobStore::new(db.clone(), &config.queue, Arc::new(SystemClock)).expect("store");
    for i in 0..12 {
        store
            .enqueue(NewJob::new(format!("echo {i}")).with_id(format!("job-{i:02}")))
            .expect("enqueue");
    }

    let mut pool = WorkerPool::new(db.clone(), config.clone(), Arc::new(SystemClock), Arc::new(TracingSink))
        .expect("pool");
    let ids = pool.start(3).expect("start");
    assert_eq!(ids.len(), 3);

    wait_for_completed(&store, 12).await;
    assert_eq!(store.active_worker_count().expect("active"), 0);

    let telemetry = pool.telemetry();
    let abandoned = pool.shutdown(Duration::from_secs(5)).await;
    assert!(abandoned.is_empty());

    let registry = WorkerRegistry::new(db.clone(), Arc::new(SystemClock)).expect("registry");
    let workers = registry.list().expect("list");
    assert_eq!(workers.len(), 3);
    assert!(workers.iter().all(|w| w.status == WorkerStatus::Stopped));

    let finished: usize = telemetry
        .snapshots()
        .iter()
        .map(|s| s.job_duration_history.len())
        .sum();
    assert_eq!(finished, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_marker_drains_the_pool() {
    let dir = TempDir::new();
    let config = config(&dir);
    let db = open(&config);

    let mut pool = WorkerPool::new(db, config.clone(), Arc::new(SystemClock), Arc::new(TracingSink))
        .expect("pool");
    pool.start(2).expect("start");
    let token = pool.token();
    assert!(!token.is_cancelled());

    stop::request_stop(std::path::Path::new(&config.worker.stop_marker)).expect("request stop");
    tokio::time::timeout(Duration::from_secs(5), pool.stopped())
        .await
        .expect("pool noticed the stop marker");

    assert!(pool.shutdown(Duration::from_secs(5)).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_sweep_reclaims_jobs_of_vanished_workers() {
    let dir = TempDir::new();
    let config = config(&dir);
    let db = open(&config);

    // A worker that claimed a job an hour ago and was never heard from again.
    let an_hour_ago = Arc::new(ManualClock::at_epoch(SystemClock.epoch_secs() - 3_600));
    let past = JobStore::new(db.clone(), &config.queue, an_hour_ago.clone()).expect("store");
    past.enqueue(NewJob::new("echo recovered").with_id("orphan"))
        .expect("enqueue");
    let claimed = past.claim_pending_job("ghost").expect("claim").expect("job");
    assert_eq!(claimed.state, JobState::Processing);

    let store = JobStore::new(db.clone(), &config.queue, Arc::new(SystemClock)).expect("store");
    let mut pool = WorkerPool::new(db, config, Arc::new(SystemClock), Arc::new(TracingSink))
        .expect("pool");
    pool.start(1).expect("start");

    // Reclaim counts as one failed attempt, so the job waits out a 2s backoff.
    wait_for_completed(&store, 1).await;
    let job = store.get_job_by_id("orphan").expect("get").expect("job");
    assert_eq!(job.attempts, 1);
    assert_eq!(job.output.as_deref(), Some("recovered\n"));

    assert!(pool.shutdown(Duration::from_secs(5)).await.is_empty());
}
