//! Test command execution.
//!
//! The [`TestRunner`] spawns the configured test command through the
//! platform shell, captures stdout and stderr into one buffer in arrival
//! order, and turns the outcome into a [`TestRunResult`].
//!
//! # Termination
//!
//! A run ends in one of three ways:
//!
//! - the process exits: exit code 0 is a pass, anything else a failure;
//! - the timeout elapses: the process is terminated and the result is a
//!   failure with exit code [`TIMEOUT_EXIT_CODE`] and one `timeout` entry;
//! - the cancellation token fires (watch loop stopping): the process is
//!   terminated and the result carries a single `cancelled` entry and exit
//!   code [`NO_EXIT_STATUS_CODE`].
//!
//! Termination sends SIGTERM to the command's process group, waits for the
//! kill grace period and then sends SIGKILL. On non-Unix platforms the child
//! is killed directly.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::ResultClassifier;
use crate::config::{Config, DEFAULT_KILL_GRACE_MS};
use crate::types::{
    FailureEntry, TestRunResult, TestStatus, NO_EXIT_STATUS_CODE, SPAWN_FAILURE_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};

/// How long to keep draining output after the process has gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a run ended.
#[derive(Debug)]
enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs the test command and classifies its result.
#[derive(Debug, Clone)]
pub struct TestRunner {
    timeout: Duration,
    kill_grace: Duration,
    classifier: ResultClassifier,
}

impl TestRunner {
    /// Creates a runner with the given timeout and the default kill grace.
    #[must_use]
    pub fn new(timeout: Duration, classifier: ResultClassifier) -> Self {
        Self {
            timeout,
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            classifier,
        }
    }

    /// Creates a runner from the timeout, grace and output format in `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.test_timeout(),
            ResultClassifier::new(config.output_format),
        )
        .with_kill_grace(config.kill_grace())
    }

    /// Sets the grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `command` in `cwd` until it exits or times out.
    pub async fn run(&self, command: &str, cwd: &Path) -> TestRunResult {
        self.run_cancellable(command, cwd, &CancellationToken::new())
            .await
    }

    /// Runs `command` in `cwd` until it exits, times out or `cancel` fires.
    pub async fn run_cancellable(
        &self,
        command: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> TestRunResult {
        let started_at = Utc::now();
        info!(command = %command, cwd = %cwd.display(), "Running tests");

        let mut child = match shell_command(command, cwd).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to spawn test command");
                return self.synthesize(
                    SPAWN_FAILURE_EXIT_CODE,
                    String::new(),
                    started_at,
                    FailureEntry::new("spawn-error", format!("failed to start `{command}`: {e}")),
                );
            }
        };
        let pid = child.id();

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = sleep(self.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            terminate(&mut child, pid, self.kill_grace).await;
        }

        let raw_output = drain_output(&mut line_rx).await;
        for reader in readers {
            reader.abort();
        }

        let result = match outcome {
            Outcome::Exited(Ok(status)) => {
                let exit_code = exit_code(status);
                let failures = self.classifier.classify(&raw_output, exit_code);
                let status = if exit_code == 0 {
                    TestStatus::Pass
                } else {
                    TestStatus::Fail
                };
                TestRunResult {
                    exit_code,
                    raw_output,
                    started_at,
                    finished_at: Utc::now(),
                    status,
                    failures,
                }
            }
            Outcome::Exited(Err(e)) => {
                warn!(error = %e, "Failed to wait for test command");
                self.synthesize(
                    NO_EXIT_STATUS_CODE,
                    raw_output,
                    started_at,
                    FailureEntry::new("wait-error", format!("failed to wait for `{command}`: {e}")),
                )
            }
            Outcome::TimedOut => {
                warn!(timeout_ms = self.timeout.as_millis(), "Test run timed out");
                self.synthesize(
                    TIMEOUT_EXIT_CODE,
                    raw_output,
                    started_at,
                    FailureEntry::new(
                        "timeout",
                        format!(
                            "test run exceeded the {} ms timeout and was terminated",
                            self.timeout.as_millis()
                        ),
                    ),
                )
            }
            Outcome::Cancelled => {
                info!("Test run cancelled");
                self.synthesize(
                    NO_EXIT_STATUS_CODE,
                    raw_output,
                    started_at,
                    FailureEntry::new("cancelled", "test run was cancelled before completion"),
                )
            }
        };

        info!(
            status = ?result.status,
            exit_code = result.exit_code,
            failures = result.failures.len(),
            duration_ms = result.duration().num_milliseconds(),
            "Test run finished"
        );
        result
    }

    fn synthesize(
        &self,
        exit_code: i32,
        raw_output: String,
        started_at: DateTime<Utc>,
        failure: FailureEntry,
    ) -> TestRunResult {
        TestRunResult {
            exit_code,
            raw_output,
            started_at,
            finished_at: Utc::now(),
            status: TestStatus::Fail,
            failures: vec![failure],
        }
    }
}

/// Builds the shell invocation for `command`.
fn shell_command(command: &str, cwd: &Path) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        // Own process group so termination reaches the whole tree.
        cmd.process_group(0);
        cmd
    };

    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Forwards lines from one output stream; invalid UTF-8 is replaced.
fn spawn_reader<R>(stream: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Error reading test output");
                    break;
                }
            }
        }
    })
}

/// Collects the captured lines into one buffer.
async fn drain_output(line_rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    let mut output = String::new();
    loop {
        match timeout_at(deadline, line_rx.recv()).await {
            Ok(Some(line)) => {
                output.push_str(&line);
                output.push('\n');
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Output streams still open after process exit, truncating capture");
                break;
            }
        }
    }
    output
}

/// Terminates the child, escalating from SIGTERM to SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGTERM);
        }
        match timeout(grace, child.wait()).await {
            Ok(_) => debug!("Test command exited after SIGTERM"),
            Err(_) => warn!(grace_ms = grace.as_millis(), "Test command ignored SIGTERM, killing"),
        }
        // Stragglers in the group are killed either way.
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after termination failed");
    }
    let _ = timeout(grace.max(Duration::from_millis(100)), child.wait()).await;
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only sends a signal to the process
    // group created for this child; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(pgid, signal, "Signal delivery to process group failed");
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::classifier::OutputFormat;

    fn runner(timeout_ms: u64) -> TestRunner {
        TestRunner::new(
            Duration::from_millis(timeout_ms),
            ResultClassifier::new(OutputFormat::Auto),
        )
        .with_kill_grace(Duration::from_millis(200))
    }

    fn cwd() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn test_exit_zero_is_pass() {
        let result = runner(5_000).run("echo hello", &cwd()).await;

        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.exit_code, 0);
        assert!(result.failures.is_empty());
        assert!(result.raw_output.contains("hello"));
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_exit_zero_ignores_failure_text() {
        let result = runner(5_000)
            .run("echo 'test a::b ... FAILED'", &cwd())
            .await;
        assert_eq!(result.status, TestStatus::Pass);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_fail_with_parsed_failures() {
        let result = runner(5_000)
            .run(
                "echo 'test a::one ... FAILED'; echo 'test b::two ... FAILED'; exit 101",
                &cwd(),
            )
            .await;

        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.exit_code, 101);
        let ids: Vec<&str> = result
            .failures
            .iter()
            .map(|f| f.test_identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["a::one", "b::two"]);
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_are_combined() {
        let result = runner(5_000)
            .run("echo to-stdout; echo to-stderr 1>&2; exit 3", &cwd())
            .await;

        assert_eq!(result.exit_code, 3);
        assert!(result.raw_output.contains("to-stdout"));
        assert!(result.raw_output.contains("to-stderr"));
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let start = std::time::Instant::now();
        let result = runner(200).run("echo started; sleep 30", &cwd()).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].test_identifier, "timeout");
        assert!(result.raw_output.contains("started"));
    }

    #[tokio::test]
    async fn test_timeout_escalates_when_sigterm_ignored() {
        let start = std::time::Instant::now();
        let result = runner(200).run("trap '' TERM; sleep 30", &cwd()).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(result.is_timeout());
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let result = runner(60_000)
            .run_cancellable("sleep 30", &cwd(), &cancel)
            .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.exit_code, NO_EXIT_STATUS_CODE);
        assert!(!result.is_timeout());
        assert_eq!(result.failures[0].test_identifier, "cancelled");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_as_failure() {
        let missing = cwd().join("testwatch-no-such-dir-7f3a");
        let result = runner(5_000).run("true", &missing).await;

        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].test_identifier, "spawn-error");
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::new("true", "/tmp");
        config.test_timeout_ms = 1234;
        let runner = TestRunner::from_config(&config);
        assert_eq!(runner.timeout(), Duration::from_millis(1234));
    }
}
