use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};
use crate::output;

/// How long to keep reading pipes after the shell exits. A backgrounded
/// grandchild can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// `None` runs until the command exits.
    pub timeout: Option<Duration>,
    /// Cap on stored output, in characters. 0 disables the cap.
    pub max_output_chars: usize,
    /// Period of the `on_tick` callback while the command runs.
    pub tick: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_output_chars: queuectl_core::config::DEFAULT_MAX_OUTPUT_CHARS,
            tick: Duration::from_secs(1),
        }
    }
}

/// How an attempt ended. Failures are outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecOutcome {
    Success,
    Failed { exit_code: i32 },
    TimedOut { after_secs: u64 },
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecOutcome::Success => "success",
            ExecOutcome::Failed { .. } => "failed",
            ExecOutcome::TimedOut { .. } => "timeout",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecOutcome::Success => Some(0),
            ExecOutcome::Failed { exit_code } => Some(*exit_code),
            ExecOutcome::TimedOut { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub outcome: ExecOutcome,
    /// Combined stdout and stderr, cleaned and capped.
    pub output: String,
    pub duration: Duration,
}

impl ExecResult {
    /// Text stored as the job's `last_error` for a failed attempt.
    pub fn error_text(&self) -> String {
        match self.outcome {
            ExecOutcome::Success => String::new(),
            ExecOutcome::Failed { exit_code } => {
                format!("exit={exit_code}; output={}", self.output)
            }
            ExecOutcome::TimedOut { after_secs } => {
                format!("timeout after {after_secs}s; output={}", self.output)
            }
        }
    }
}

/// Run `command` under `sh -c`, capturing stdout and stderr into one buffer.
///
/// The shell gets its own process group; when `opts.timeout` passes, the
/// whole group is sent SIGKILL and the result is [`ExecOutcome::TimedOut`]
/// with a timeout marker appended to the output. `on_tick` runs every
/// `opts.tick` until the command ends.
///
/// Only a failure to start the shell is an error.
pub async fn execute(
    command: &str,
    opts: &ExecOptions,
    mut on_tick: impl FnMut() + Send,
) -> Result<ExecResult> {
    let started = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
        command: command.to_string(),
        source,
    })?;
    let pid = child.id();

    let buf = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Arc::clone(&buf)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Arc::clone(&buf)));
    }

    // A timeout too large to represent as an instant means no deadline.
    let deadline = opts.timeout.and_then(|t| started.checked_add(t));
    let timeout_sleep = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_sleep);

    let mut ticker = tokio::time::interval_at(started + opts.tick, opts.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                break match status.code() {
                    Some(0) => ExecOutcome::Success,
                    code => ExecOutcome::Failed { exit_code: code.unwrap_or(-1) },
                };
            }
            _ = &mut timeout_sleep => {
                let after_secs = opts.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(?pid, after_secs, "command timed out, killing process group");
                kill_group(pid);
                // Reap; also covers the case where the group kill was refused.
                let _ = child.start_kill();
                let _ = child.wait().await;
                break ExecOutcome::TimedOut { after_secs };
            }
            _ = ticker.tick() => on_tick(),
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
            debug!(?pid, "output pipe still open after exit, abandoning reader");
            reader.abort();
        }
    }

    let raw = match buf.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let mut text = output::clean(&raw, opts.max_output_chars);
    if let ExecOutcome::TimedOut { after_secs } = outcome {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[timeout after {after_secs}s]"));
    }

    Ok(ExecResult {
        outcome,
        output: text,
        duration: started.elapsed(),
    })
}

fn spawn_reader<R>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => match buf.lock() {
                    Ok(mut b) => b.extend_from_slice(&chunk[..n]),
                    Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                },
            }
        }
    })
}

fn kill_group(pid: Option<u32>) {
    let Some(raw_pid) = pid else { return };
    #[cfg(unix)]
    {
        // SAFETY: raw_pid leads the process group created at spawn.
        let rc = unsafe { libc::killpg(raw_pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid = raw_pid, "killpg failed: {}", std::io::Error::last_os_error());
        }
    }
    #[cfg(not(unix))]
    let _ = raw_pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ExecOptions {
        ExecOptions {
            timeout: None,
            max_output_chars: 10_000,
            tick: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn success_captures_stdout_and_stderr() {
        let result = execute("echo out; echo err 1>&2", &opts(), || {})
            .await
            .expect("execute");
        assert_eq!(result.outcome, ExecOutcome::Success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
        assert!(result.error_text().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_outcome() {
        let result = execute("echo nope; exit 3", &opts(), || {}).await.expect("execute");
        assert_eq!(result.outcome, ExecOutcome::Failed { exit_code: 3 });
        assert_eq!(result.outcome.exit_code(), Some(3));
        assert!(result.error_text().starts_with("exit=3; output=nope"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let mut o = opts();
        o.timeout = Some(Duration::from_secs(1));
        let started = std::time::Instant::now();
        let result = execute("echo begin; sleep 10", &o, || {}).await.expect("execute");

        assert_eq!(result.outcome, ExecOutcome::TimedOut { after_secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.output.starts_with("begin"));
        assert!(result.output.ends_with("[timeout after 1s]"));
        assert!(result.error_text().starts_with("timeout after 1s"));
    }

    #[tokio::test]
    async fn timeout_reaches_grandchildren() {
        let mut o = opts();
        o.timeout = Some(Duration::from_secs(1));
        let started = std::time::Instant::now();
        let result = execute("sh -c 'sleep 10' & wait", &o, || {})
            .await
            .expect("execute");
        assert_eq!(result.outcome.label(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unrepresentable_timeout_runs_without_deadline() {
        let mut o = opts();
        o.timeout = Some(Duration::from_secs(i64::MAX as u64));
        let result = execute("true", &o, || {}).await.expect("execute");
        assert_eq!(result.outcome, ExecOutcome::Success);

        o.timeout = Some(Duration::MAX);
        let result = execute("exit 4", &o, || {}).await.expect("execute");
        assert_eq!(result.outcome, ExecOutcome::Failed { exit_code: 4 });
    }

    #[tokio::test]
    async fn ticks_while_running() {
        let mut ticks = 0;
        let result = execute("sleep 0.3", &opts(), || ticks += 1).await.expect("execute");
        assert!(result.outcome.is_success());
        assert!(ticks >= 2, "expected several ticks, got {ticks}");
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mut o = opts();
        o.max_output_chars = 100;
        let result = execute("yes abcdefgh | head -c 5000", &o, || {})
            .await
            .expect("execute");
        assert!(result.output.contains("chars omitted"));
        assert!(result.output.chars().count() < 200);
    }
}
