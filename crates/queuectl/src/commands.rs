use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use queuectl_core::{Clock, QueuectlConfig, SystemClock};
use queuectl_store::{Db, Job, JobState, JobStore, NewJob, RunAt, WorkerRegistry};
use queuectl_telemetry::TelemetrySampler;
use queuectl_worker::{stop, CompletionSink, JsonLinesSink, TracingSink, WorkerPool};
use tracing::{info, warn};

use crate::cli::{Command, DlqCommand, EnqueueArgs, WorkerCommand};

pub async fn run(command: Command, config: QueuectlConfig) -> Result<()> {
    match command {
        Command::Enqueue(args) => enqueue(&config, args),
        Command::Worker {
            command: WorkerCommand::Start { count },
        } => worker_start(config, count).await,
        Command::Worker {
            command: WorkerCommand::Stop,
        } => {
            stop::request_stop(Path::new(&config.worker.stop_marker))?;
            println!("Stop requested; workers exit after their current job.");
            Ok(())
        }
        Command::Status => status(&config),
        Command::List { state } => list(&config, state.as_deref()),
        Command::Dlq {
            command: DlqCommand::List,
        } => dlq_list(&config),
        Command::Dlq {
            command: DlqCommand::Retry { job_id },
        } => dlq_retry(&config, &job_id),
        Command::Workers => workers(&config),
        Command::Perf { worker } => perf(&config, worker.as_deref()),
    }
}

fn open_db(config: &QueuectlConfig) -> Result<Db> {
    let path = &config.database.path;
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    info!(%path, "opening queue database");
    let db = Db::open(path, Duration::from_millis(config.database.busy_timeout_ms))
        .with_context(|| format!("opening {path}"))?;
    Ok(db)
}

fn clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn job_store(config: &QueuectlConfig) -> Result<JobStore> {
    Ok(JobStore::new(open_db(config)?, &config.queue, clock())?)
}

fn enqueue(config: &QueuectlConfig, args: EnqueueArgs) -> Result<()> {
    let store = job_store(config)?;
    let mut new = NewJob::new(args.command);
    new.id = args.id;
    new.max_retries = args.max_retries;
    new.priority = args.priority;
    new.timeout_secs = args.timeout;
    new.run_at = match (args.run_at, args.delay) {
        (Some(at), _) => Some(RunAt::At {
            epoch: parse_time(&at)?,
        }),
        (None, Some(secs)) => Some(RunAt::In { secs }),
        (None, None) => None,
    };

    let job = store.enqueue(new)?;
    println!(
        "Enqueued {} (priority={}, max_retries={}, available_at={})",
        job.id,
        job.priority,
        job.max_retries,
        format_epoch(job.available_at)
    );
    Ok(())
}

/// Epoch seconds or an RFC 3339 timestamp.
fn parse_time(s: &str) -> Result<i64> {
    if let Ok(epoch) = s.parse::<i64>() {
        return Ok(epoch);
    }
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid time `{s}`: expected epoch seconds or RFC 3339"))?;
    Ok(parsed.timestamp())
}

fn format_epoch(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

async fn worker_start(config: QueuectlConfig, count: Option<usize>) -> Result<()> {
    let marker = Path::new(&config.worker.stop_marker).to_path_buf();
    stop::clear_stop(&marker)?;

    let sink: Arc<dyn CompletionSink> = match JsonLinesSink::new(&config.worker.logs_dir) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!("job log directory unavailable ({e}), logging completions via tracing only");
            Arc::new(TracingSink)
        }
    };

    let count = count.unwrap_or(config.worker.count).max(1);
    let grace = Duration::from_secs(config.worker.shutdown_grace_secs);
    let db = open_db(&config)?;
    let mut pool = WorkerPool::new(db, config, clock(), sink)?;
    let ids = pool.start(count)?;
    println!("Started {} worker(s): {}", ids.len(), ids.join(", "));

    tokio::select! {
        _ = shutdown_signal() => info!("signal received, draining workers"),
        _ = pool.stopped() => {}
    }

    let abandoned = pool.shutdown(grace).await;
    if !abandoned.is_empty() {
        warn!(workers = ?abandoned, "workers abandoned after grace period");
    }
    println!("Workers stopped.");
    Ok(())
}

/// SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn status(config: &QueuectlConfig) -> Result<()> {
    let db = open_db(config)?;
    let store = JobStore::new(db.clone(), &config.queue, clock())?;
    let registry = WorkerRegistry::new(db, clock())?;

    let counts = store.state_counts()?;
    println!("Jobs:");
    for state in JobState::ALL {
        println!("  {:<11}: {}", state.as_str(), counts.get(&state).copied().unwrap_or(0));
    }

    let workers = registry.counts()?;
    println!("Workers:");
    println!("  IDLE : {}", workers.idle);
    println!("  BUSY : {}", workers.busy);
    println!("  holding jobs: {}", store.active_worker_count()?);
    Ok(())
}

fn list(config: &QueuectlConfig, state: Option<&str>) -> Result<()> {
    let state = state
        .map(|s| s.parse::<JobState>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let jobs = job_store(config)?.list_jobs_by_state(state)?;
    if jobs.is_empty() {
        match state {
            Some(s) => println!("No jobs found for state {s}"),
            None => println!("No jobs found"),
        }
        return Ok(());
    }
    for job in &jobs {
        print_job(job);
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!(
        "{}\t{}\tatt={}/{}\tprio={}\tcmd='{}'",
        job.id, job.state, job.attempts, job.max_retries, job.priority, job.command
    );
}

fn dlq_list(config: &QueuectlConfig) -> Result<()> {
    let jobs = job_store(config)?.list_jobs_by_state(Some(JobState::Dead))?;
    if jobs.is_empty() {
        println!("DLQ is empty");
        return Ok(());
    }
    for job in &jobs {
        println!(
            "{}\tatt={}/{}\tlast_error={}",
            job.id,
            job.attempts,
            job.max_retries,
            job.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn dlq_retry(config: &QueuectlConfig, job_id: &str) -> Result<()> {
    let store = job_store(config)?;
    match store.get_job_by_id(job_id)? {
        Some(job) if job.state == JobState::Dead => {
            store.retry_dead_job(job_id)?;
            println!("Retried job from DLQ: {job_id}");
            Ok(())
        }
        Some(job) => bail!("job {job_id} is {}, not DEAD", job.state),
        None => bail!("no such job: {job_id}"),
    }
}

fn workers(config: &QueuectlConfig) -> Result<()> {
    let registry = WorkerRegistry::new(open_db(config)?, clock())?;
    let workers = registry.list()?;
    if workers.is_empty() {
        println!("No workers have run yet");
        return Ok(());
    }
    for w in &workers {
        println!(
            "{}\t{}\tstarted={}\theartbeat={}\tjob={}",
            w.worker_id,
            w.status,
            format_epoch(w.started_at),
            format_epoch(w.last_heartbeat),
            w.current_job_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn perf(config: &QueuectlConfig, worker: Option<&str>) -> Result<()> {
    let sampler = TelemetrySampler::new(open_db(config)?, clock())?;
    let ids = match worker {
        Some(id) => vec![id.to_string()],
        None => sampler.persisted_workers()?,
    };
    let mut out = BTreeMap::new();
    for id in ids {
        let samples = sampler.persisted_samples(&id)?;
        out.insert(id, samples);
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_epoch_and_rfc3339() {
        assert_eq!(parse_time("1700000000").expect("epoch"), 1_700_000_000);
        assert_eq!(parse_time("1970-01-01T00:01:40Z").expect("rfc3339"), 100);
        assert!(parse_time("tomorrow").is_err());
    }

    #[test]
    fn format_epoch_is_rfc3339() {
        assert_eq!(format_epoch(0), "1970-01-01T00:00:00+00:00");
    }
}
