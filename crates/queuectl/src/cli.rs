use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "A persistent background job queue with retries and a dead-letter queue")]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to queuectl.toml (defaults to ~/.queuectl/queuectl.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a job to the queue
    Enqueue(EnqueueArgs),

    /// Start or stop workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Job counts per state and worker counts
    Status,

    /// List jobs, newest first
    List {
        /// Only jobs in this state (PENDING, PROCESSING, COMPLETED, DEAD)
        #[arg(long)]
        state: Option<String>,
    },

    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Every known worker and what it is doing
    Workers,

    /// Recent telemetry samples as JSON
    Perf {
        /// Only this worker
        #[arg(long)]
        worker: Option<String>,
    },
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Shell command to run
    #[arg(long)]
    pub command: String,

    /// Job id (a UUID is generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Failed attempts allowed before the job is dead-lettered
    #[arg(long, alias = "max_retries")]
    pub max_retries: Option<u32>,

    /// Higher runs first
    #[arg(long)]
    pub priority: Option<i64>,

    /// Kill the command after this many seconds (0 = no limit)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Do not run before this time (epoch seconds or RFC 3339)
    #[arg(long, conflicts_with = "delay")]
    pub run_at: Option<String>,

    /// Do not run for this many seconds
    #[arg(long)]
    pub delay: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Run workers in the foreground until stopped
    Start {
        /// Number of workers (defaults to [worker].count)
        #[arg(long)]
        count: Option<usize>,
    },

    /// Ask running workers to finish their current job and exit
    Stop,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// Jobs in the dead-letter queue
    List,

    /// Move a dead job back to PENDING with a fresh retry budget
    Retry {
        /// Job id
        job_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn enqueue_parses_scheduling_flags() {
        let args = Args::parse_from([
            "queuectl", "enqueue", "--command", "echo hi", "--id", "j1", "--max-retries", "5",
            "--priority", "9", "--delay", "30",
        ]);
        let Command::Enqueue(e) = args.command else {
            panic!("expected enqueue");
        };
        assert_eq!(e.id.as_deref(), Some("j1"));
        assert_eq!(e.max_retries, Some(5));
        assert_eq!(e.priority, Some(9));
        assert_eq!(e.delay, Some(30));
        assert!(e.run_at.is_none());
    }

    #[test]
    fn run_at_and_delay_conflict() {
        let res = Args::try_parse_from([
            "queuectl", "enqueue", "--command", "true", "--run-at", "100", "--delay", "5",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn worker_start_count() {
        let args = Args::parse_from(["queuectl", "worker", "start", "--count", "4"]);
        assert!(matches!(
            args.command,
            Command::Worker { command: WorkerCommand::Start { count: Some(4) } }
        ));
    }
}
