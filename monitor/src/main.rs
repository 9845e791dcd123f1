//! testwatch - reruns a project's tests on change and reports new failures.
//!
//! # Commands
//!
//! - `testwatch watch -- <command>`: watch the project and run tests on change
//! - `testwatch test -- <command>`: run the tests once and print a summary
//! - `testwatch status`: list remembered failure notifications
//! - `testwatch ack <signature>`: acknowledge a failure notification
//! - `testwatch clear`: forget all failure notifications
//!
//! # Environment Variables
//!
//! See `testwatch_monitor::config` for available configuration options.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use testwatch_monitor::classifier::OutputFormat;
use testwatch_monitor::config::{state_dir_from_env, Config, NotificationChannel};
use testwatch_monitor::notifier::{Notifier, NullSink};
use testwatch_monitor::orchestrator::Orchestrator;
use testwatch_monitor::state::{find_by_prefix, JsonFileStore, MemoryStore, RecordStore};
use testwatch_monitor::types::TestRunResult;

/// File holding notification history inside the state directory.
const STATE_FILE: &str = "notifications.json";

/// testwatch - continuous test runner with failure notifications.
///
/// Watches a project tree, reruns the test command after changes settle and
/// notifies once per distinct set of failing tests.
#[derive(Parser, Debug)]
#[command(name = "testwatch")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TESTWATCH_TEST_COMMAND          Test command (if not given after --)
    TESTWATCH_PROJECT_DIR           Working directory (default: current dir)
    TESTWATCH_WATCH_PATHS           Comma-separated paths to watch
    TESTWATCH_EXCLUDE_PATHS         Comma-separated globs or directory names
    TESTWATCH_DEBOUNCE_MS           Quiet period before a run (default: 300)
    TESTWATCH_TEST_TIMEOUT_MS       Test timeout (default: 600000)
    TESTWATCH_NOTIFICATION_CHANNEL  desktop, webhook or none (default: desktop)
    TESTWATCH_WEBHOOK_URL           Webhook target for the webhook channel
    TESTWATCH_STATE_DIR             Notification history (default: ~/.testwatch)
    TESTWATCH_LOG_FORMAT            text or json (default: text)

EXAMPLES:
    # Watch the current crate
    testwatch watch -- cargo test

    # Watch only src/, quieter
    testwatch watch --path src --debounce-ms 1000 -- pytest -q

    # One-shot run, exit status follows the tests
    testwatch test -- cargo test

    # A single argument is a full shell command line
    testwatch watch -- \"cargo build && cargo test\"
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the project and rerun tests when files change.
    Watch(WatchArgs),

    /// Run the tests once and print a summary.
    ///
    /// Exits with status 0 when the tests pass and 1 otherwise.
    Test {
        /// Test command; overrides TESTWATCH_TEST_COMMAND.
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List remembered failure notifications.
    Status,

    /// Acknowledge a failure notification.
    Ack {
        /// Signature or unique signature prefix, as printed by `status`.
        signature: String,
    },

    /// Forget all failure notifications.
    Clear,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Path to watch (repeatable); defaults to the project directory.
    #[arg(short, long = "path")]
    paths: Vec<PathBuf>,

    /// Exclusion glob or directory name (repeatable); replaces the defaults.
    #[arg(short, long = "exclude")]
    excludes: Vec<String>,

    /// Quiet period in milliseconds before tests run.
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Test timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Notification channel: desktop, webhook or none.
    #[arg(long)]
    channel: Option<NotificationChannel>,

    /// Webhook URL for the webhook channel.
    #[arg(long)]
    webhook_url: Option<String>,

    /// Test output format: auto, cargo, pytest, phpunit or tap.
    #[arg(long)]
    format: Option<OutputFormat>,

    /// Do not run the tests when watching starts.
    #[arg(long)]
    no_initial_run: bool,

    /// Test command; overrides TESTWATCH_TEST_COMMAND.
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Status => run_status().map(|()| ExitCode::SUCCESS),
        Command::Ack { signature } => run_ack(&signature).map(|()| ExitCode::SUCCESS),
        Command::Clear => run_clear().map(|()| ExitCode::SUCCESS),
        Command::Watch(args) => {
            let runtime = build_runtime()?;
            runtime.block_on(run_watch(args)).map(|()| ExitCode::SUCCESS)
        }
        Command::Test { command } => {
            let runtime = build_runtime()?;
            runtime.block_on(run_test(command))
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

/// Turns trailing arguments into one shell command line.
///
/// A single argument is taken as a complete command line, so
/// `-- "cargo test && cargo clippy"` keeps its shell syntax. Several
/// arguments are quoted one by one, so `-- pytest -k "a or b"` passes
/// `a or b` as one word.
fn command_line(parts: Vec<String>) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(
            parts
                .iter()
                .map(|part| shell_quote(part))
                .collect::<Vec<_>>()
                .join(" "),
        ),
    }
}

/// Quotes one argument for the platform shell, leaving plain words as is.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        return word.to_string();
    }

    if cfg!(windows) {
        format!("\"{}\"", word.replace('"', "\"\""))
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Runs the watch loop until SIGINT or SIGTERM.
async fn run_watch(args: WatchArgs) -> Result<()> {
    let mut config = Config::from_env_with_command(command_line(args.command))
        .context("Failed to load configuration")?;

    if !args.paths.is_empty() {
        config.watched_paths = args
            .paths
            .into_iter()
            .map(|p| if p.is_absolute() { p } else { config.project_dir.join(p) })
            .collect();
    }
    if !args.excludes.is_empty() {
        config.exclude_paths = args.excludes;
    }
    if let Some(ms) = args.debounce_ms {
        config.debounce_ms = ms;
    }
    if let Some(ms) = args.timeout_ms {
        config.test_timeout_ms = ms;
    }
    if let Some(channel) = args.channel {
        config.notification_channel = channel;
    }
    if let Some(url) = args.webhook_url {
        config.webhook_url = Some(url);
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if args.no_initial_run {
        config.run_on_start = false;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        command = %config.test_command,
        project_dir = %config.project_dir.display(),
        state_file = %config.state_file().display(),
        "Configuration loaded"
    );

    let notifier = Notifier::from_config(&config).context("Failed to set up notifications")?;
    let handle = Orchestrator::builder(config)
        .notifier(notifier)
        .build()
        .start()
        .await
        .context("Failed to start watching")?;

    let stop = handle.cancellation_token();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received");
        stop.cancel();
    });

    handle.join().await;
    info!("testwatch stopped");
    Ok(())
}

/// Runs the tests once and reports the result through the exit status.
async fn run_test(command: Vec<String>) -> Result<ExitCode> {
    let config = Config::from_env_with_command(command_line(command))
        .context("Failed to load configuration")?;

    let orchestrator = Orchestrator::builder(config)
        .notifier(Notifier::new(NullSink))
        .record_store(Box::new(MemoryStore::new()))
        .build();

    let result = orchestrator.test_once().await;
    print_summary(&result);

    Ok(if result.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(result: &TestRunResult) {
    let seconds = result.duration().num_milliseconds() as f64 / 1000.0;
    if result.passed() {
        println!("PASS in {seconds:.2}s");
        return;
    }

    println!(
        "FAIL (exit {}) in {seconds:.2}s: {} failing",
        result.exit_code,
        result.failures.len()
    );
    for failure in &result.failures {
        println!("  {}", failure.test_identifier);
        if let Some(line) = failure.message.lines().next().filter(|l| !l.is_empty()) {
            println!("      {line}");
        }
    }
    println!("signature: {}", result.signature());
}

fn history_store() -> Result<JsonFileStore> {
    let state_dir = state_dir_from_env().context("Failed to locate state directory")?;
    Ok(JsonFileStore::new(state_dir.join(STATE_FILE)))
}

fn run_status() -> Result<()> {
    let store = history_store()?;
    let records = store
        .load()
        .with_context(|| format!("Failed to read {}", store.path().display()))?;

    if records.is_empty() {
        println!("No failure notifications recorded.");
        return Ok(());
    }

    println!("{:<14} {:<26} ACKNOWLEDGED", "SIGNATURE", "NOTIFIED AT");
    for record in &records {
        println!(
            "{:<14} {:<26} {}",
            record.signature.short(),
            record.notified_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if record.acknowledged { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn run_ack(signature: &str) -> Result<()> {
    let store = history_store()?;
    let mut records = store
        .load()
        .with_context(|| format!("Failed to read {}", store.path().display()))?;

    let Some(target) = find_by_prefix(&records, signature).map(|r| r.signature.clone()) else {
        bail!("No unique notification matches '{signature}'. Run 'testwatch status' to list them.");
    };
    for record in records.iter_mut().filter(|r| r.signature == target) {
        record.acknowledged = true;
    }
    store.save(&records).context("Failed to save notification history")?;

    println!("Acknowledged {}", target.short());
    Ok(())
}

fn run_clear() -> Result<()> {
    let store = history_store()?;
    let count = match store.load() {
        Ok(records) => records.len(),
        Err(e) => {
            warn!(error = %e, "Existing history unreadable, overwriting");
            0
        }
    };
    store.save(&[]).context("Failed to clear notification history")?;

    println!("Cleared {count} notification record(s).");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` sets the filter (default `info`); `TESTWATCH_LOG_FORMAT=json`
/// switches to JSON lines. Logs go to stderr so command output stays clean.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TESTWATCH_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
