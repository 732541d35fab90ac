use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use queuectl_core::{Clock, QueuectlConfig};
use queuectl_store::{Db, JobStore};
use queuectl_telemetry::TelemetrySampler;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    joblog::CompletionSink,
    stop::watch_stop_marker,
    worker::Worker,
};

/// Owns a set of worker tasks plus the pool's background duties: the
/// stale-lease sweep and the stop-marker watcher.
///
/// Every worker gets its own database connection. The pool shares one
/// [`TelemetrySampler`] among its workers.
pub struct WorkerPool {
    db: Db,
    config: QueuectlConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<TelemetrySampler>,
    sink: Arc<dyn CompletionSink>,
    token: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
    background: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        db: Db,
        config: QueuectlConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self> {
        let telemetry = Arc::new(TelemetrySampler::new(db.reopen()?, Arc::clone(&clock))?);
        Ok(Self {
            db,
            config,
            clock,
            telemetry,
            sink,
            token: CancellationToken::new(),
            workers: Vec::new(),
            background: Vec::new(),
        })
    }

    /// Token that stops every worker between jobs when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn telemetry(&self) -> Arc<TelemetrySampler> {
        Arc::clone(&self.telemetry)
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Spawn `count` more workers. The first call also starts the sweep and
    /// the stop-marker watcher. Returns the new worker ids.
    pub fn start(&mut self, count: usize) -> Result<Vec<String>> {
        if self.background.is_empty() {
            self.spawn_background()?;
        }

        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            let id = new_worker_id();
            let worker = Worker::new(
                id.clone(),
                self.db.reopen()?,
                &self.config,
                Arc::clone(&self.telemetry),
                Arc::clone(&self.sink),
                Arc::clone(&self.clock),
            )?;
            let token = self.token.clone();
            let worker_id = id.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = worker.run(token).await {
                    error!(%worker_id, "worker failed: {e}");
                }
            });
            self.workers.push((id.clone(), handle));
            started.push(id);
        }
        info!(count, total = self.workers.len(), "workers started");
        Ok(started)
    }

    /// Ask every worker to finish its current job and exit.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Resolves once the pool has been told to stop, by [`stop`](Self::stop),
    /// the stop marker, or anyone holding the token.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// Stop and wait up to `grace` for workers to exit. Workers still running
    /// at the deadline are aborted; their ids are returned and their jobs are
    /// left for the stale-lease sweep.
    pub async fn shutdown(self, grace: Duration) -> Vec<String> {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + grace;

        let mut abandoned = Vec::new();
        for (id, mut handle) in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(worker_id = %id, "worker task panicked: {e}"),
                Err(_) => {
                    warn!(worker_id = %id, grace_secs = grace.as_secs(), "worker did not stop in time, aborting");
                    handle.abort();
                    abandoned.push(id);
                }
            }
        }
        for handle in self.background {
            handle.abort();
        }
        info!(abandoned = abandoned.len(), "worker pool shut down");
        abandoned
    }

    fn spawn_background(&mut self) -> Result<()> {
        let marker = PathBuf::from(&self.config.worker.stop_marker);
        let poll = Duration::from_millis(self.config.worker.poll_interval_ms.max(1));
        self.background
            .push(tokio::spawn(watch_stop_marker(marker, poll, self.token.clone())));

        let reclaim_after = self.config.worker.reclaim_after_secs;
        if reclaim_after > 0 {
            let store = JobStore::new(self.db.reopen()?, &self.config.queue, Arc::clone(&self.clock))?;
            self.background.push(tokio::spawn(sweep_stale_leases(
                store,
                reclaim_after,
                self.token.clone(),
            )));
        }
        Ok(())
    }
}

/// Longest pause between sweeps, whatever the stale threshold.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

fn sweep_period(stale_after_secs: u64) -> Duration {
    Duration::from_secs(stale_after_secs).min(MAX_SWEEP_PERIOD)
}

/// Reclaim jobs of silent workers now and then every `stale_after_secs`
/// (at most once a day apart).
async fn sweep_stale_leases(store: JobStore, stale_after_secs: u64, token: CancellationToken) {
    let mut ticker = tokio::time::interval(sweep_period(stale_after_secs));
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => match store.reclaim_stale(stale_after_secs) {
                Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "reclaimed stale jobs"),
                Ok(_) => {}
                Err(e) => error!("stale lease sweep failed: {e}"),
            },
        }
    }
}

fn new_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_period_follows_threshold_up_to_a_day() {
        assert_eq!(sweep_period(60), Duration::from_secs(60));
        assert_eq!(sweep_period(u64::MAX), MAX_SWEEP_PERIOD);
    }

    #[tokio::test]
    async fn sweeper_with_huge_threshold_runs_and_cancels() {
        let db = Db::open_in_memory().expect("open db");
        let store = JobStore::new(
            db,
            &QueuectlConfig::default().queue,
            Arc::new(queuectl_core::SystemClock),
        )
        .expect("store");
        let token = CancellationToken::new();
        let task = tokio::spawn(sweep_stale_leases(store, u64::MAX, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper exits on cancel")
            .expect("sweeper did not panic");
    }

    #[test]
    fn worker_ids_are_prefixed() {
        let id = new_worker_id();
        assert!(id.starts_with("worker-"));
        assert_eq!(id.len(), "worker-".len() + 8);
    }
}
