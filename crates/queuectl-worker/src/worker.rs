use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use queuectl_core::{Clock, QueuectlConfig};
use queuectl_store::{Db, Job, JobStore, WorkerRegistry, WorkerStatus};
use queuectl_telemetry::TelemetrySampler;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::Result,
    executor::{execute, ExecOptions, ExecOutcome},
    joblog::{CompletionRecord, CompletionSink},
};

/// Loop timings and output policy for one worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Sleep between claim attempts when nothing is eligible.
    pub poll_interval: Duration,
    /// Telemetry and heartbeat cadence while a job runs.
    pub sample_interval: Duration,
    pub max_output_chars: usize,
}

impl WorkerSettings {
    pub fn from_config(config: &QueuectlConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms.max(1)),
            sample_interval: Duration::from_millis(config.worker.sample_interval_ms.max(1)),
            max_output_chars: config.queue.max_output_chars,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&QueuectlConfig::default())
    }
}

/// One execution unit: claims a job, runs it, reports the outcome, repeats.
///
/// ```text
/// IDLE ──claim──► BUSY ──attempt ends──► IDLE ── … ──cancel──► STOPPED
/// ```
///
/// Cancellation is only observed between jobs; a claimed job always runs to
/// its own end (exit or timeout) and is reported before the worker exits.
pub struct Worker {
    id: String,
    jobs: JobStore,
    registry: WorkerRegistry,
    telemetry: Arc<TelemetrySampler>,
    sink: Arc<dyn CompletionSink>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl Worker {
    /// `db` should be a connection of this worker's own (see `Db::reopen`).
    pub fn new(
        id: impl Into<String>,
        db: Db,
        config: &QueuectlConfig,
        telemetry: Arc<TelemetrySampler>,
        sink: Arc<dyn CompletionSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let jobs = JobStore::new(db.clone(), &config.queue, Arc::clone(&clock))?;
        let registry = WorkerRegistry::new(db, Arc::clone(&clock))?;
        Ok(Self {
            id: id.into(),
            jobs,
            registry,
            telemetry,
            sink,
            clock,
            settings: WorkerSettings::from_config(config),
        })
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn register(&self) -> Result<()> {
        self.registry.register(&self.id)?;
        Ok(())
    }

    /// Run until `cancel` fires, then record STOPPED.
    ///
    /// Persistence errors inside the loop are logged and retried after one
    /// poll interval; only failing to register or deregister is returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.register()?;
        info!(worker_id = %self.id, "worker started");

        while !cancel.is_cancelled() {
            log_failure(&self.id, "idle heartbeat", self.registry.heartbeat(&self.id, WorkerStatus::Idle));
            match self.run_once().await {
                // finish_job already took the post-job sample.
                Ok(true) => continue,
                Ok(false) => self.sample(),
                Err(e) => error!(worker_id = %self.id, "worker iteration failed: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.registry.mark_stopped(&self.id)?;
        info!(worker_id = %self.id, "worker exiting");
        Ok(())
    }

    /// Claim and fully process at most one job. `Ok(false)` means nothing
    /// was eligible.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.jobs.claim_pending_job(&self.id)? else {
            return Ok(false);
        };
        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, job: Job) -> Result<()> {
        let start_ms = self.clock.epoch_millis();
        let attempt = job.attempts.saturating_add(1);
        info!(worker_id = %self.id, job_id = %job.id, attempt, command = %job.command, "job picked");

        log_failure(&self.id, "busy heartbeat", self.registry.heartbeat(&self.id, WorkerStatus::Busy));
        log_failure(
            &self.id,
            "current job",
            self.registry.set_current_job(&self.id, &job.id, start_ms),
        );
        self.telemetry.set_current_job(&self.id, &job.id, start_ms);
        self.sample();

        let opts = ExecOptions {
            timeout: (job.timeout_secs > 0).then(|| Duration::from_secs(job.timeout_secs)),
            max_output_chars: self.settings.max_output_chars,
            tick: self.settings.sample_interval,
        };
        let started = Instant::now();
        let (outcome, output, error_text) = match execute(&job.command, &opts, || self.tick()).await {
            Ok(result) => {
                let error_text = result.error_text();
                (result.outcome, result.output, error_text)
            }
            // The shell never ran; count it against the job like any failure.
            Err(e) => (ExecOutcome::Failed { exit_code: -1 }, String::new(), e.to_string()),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = CompletionRecord {
            ts_ms: self.clock.epoch_millis(),
            worker_id: self.id.clone(),
            job_id: job.id.clone(),
            command: job.command.clone(),
            outcome,
            attempt,
            duration_ms,
            output: output.clone(),
        };
        log_failure(&self.id, "completion log", self.sink.record(&record));
        log_failure(&self.id, "telemetry", self.telemetry.finish_job(&self.id, duration_ms));

        let reported = self.report(&job, outcome, &output, &error_text, attempt, duration_ms);
        // Cleared even when reporting failed, so the stale sweep can take the job back.
        log_failure(
            &self.id,
            "current job",
            self.registry.clear_current_job(&self.id, self.clock.epoch_millis()),
        );
        reported
    }

    fn report(
        &self,
        job: &Job,
        outcome: ExecOutcome,
        output: &str,
        error_text: &str,
        attempt: u32,
        duration_ms: u64,
    ) -> Result<()> {
        if outcome.is_success() {
            self.jobs.mark_job_completed(&job.id, output)?;
            info!(worker_id = %self.id, job_id = %job.id, attempt, duration_ms, "job completed");
        } else {
            let next = self.jobs.handle_failed_attempt(job, error_text)?;
            warn!(
                worker_id = %self.id,
                job_id = %job.id,
                attempt,
                duration_ms,
                outcome = outcome.label(),
                next_state = %next,
                "job attempt failed"
            );
        }
        Ok(())
    }

    /// Called every sample interval while a job runs.
    fn tick(&self) {
        self.sample();
        log_failure(&self.id, "busy heartbeat", self.registry.heartbeat(&self.id, WorkerStatus::Busy));
    }

    fn sample(&self) {
        log_failure(&self.id, "telemetry", self.telemetry.sample(&self.id));
    }
}

fn log_failure<T, E: Display>(worker_id: &str, what: &str, result: std::result::Result<T, E>) {
    if let Err(e) = result {
        warn!(%worker_id, "{what} update failed: {e}");
    }
}
