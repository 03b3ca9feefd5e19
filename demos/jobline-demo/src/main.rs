//! Jobline demo - push a small workload through a SQLite-backed queue
//!
//! # Usage
//!
//! ```bash
//! # In-memory database, 12 jobs, at most 2 running and 5 starts per second
//! jobline-demo --jobs 12 --max-concurrent 2 --rate 5
//!
//! # Keep jobs in a file; a second run serves repeated inputs from cache
//! jobline-demo --database sqlite:demo.db -v
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use jobline_persist::{SqliteConfig, SqliteQueueBackend};
use jobline_queue::{
    CompletionEvent, CompositeLimiter, ConcurrencyLimiter, JobId, JobQueue, JobStatus,
    QueueConfig, RateLimiter, Submission, TaskRegistry,
};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "jobline-demo",
    version,
    about = "Run a small workload through a Jobline queue"
)]
struct Cli {
    /// Database URL; defaults to JOBLINE_DATABASE_URL, then an in-memory database
    #[arg(long, env = "JOBLINE_DATABASE_URL")]
    database: Option<String>,

    /// Queue name
    #[arg(long, default_value = "demo")]
    queue: String,

    /// Number of jobs to submit
    #[arg(long, default_value_t = 12)]
    jobs: u32,

    /// Jobs allowed to run at once
    #[arg(long, default_value_t = 2)]
    max_concurrent: usize,

    /// Job starts allowed per second
    #[arg(long, default_value_t = 5)]
    rate: usize,

    /// Retry budget per job (overrides JOBLINE_MAX_RETRIES)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Give up waiting for completions after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let db_config = match &cli.database {
        Some(url) => SqliteConfig {
            url: url.clone(),
            ..SqliteConfig::from_env()
        },
        None => SqliteConfig::memory(),
    };

    let mut queue_config = QueueConfig::from_env();
    if let Some(max_retries) = cli.max_retries {
        queue_config.default_max_retries = max_retries;
    }

    let backend = SqliteQueueBackend::connect(&db_config, cli.queue.as_str())
        .await
        .context("Failed to open job database")?;

    let limiter = CompositeLimiter::default()
        .with(ConcurrencyLimiter::new(
            cli.max_concurrent.max(1),
            Duration::from_millis(10),
        ))
        .with(RateLimiter::new(cli.rate.max(1), Duration::from_secs(1)));

    let queue = Arc::new(JobQueue::new(backend, Arc::new(limiter), queue_config));
    let registry = Arc::new(build_registry());

    let mut events = queue.subscribe();
    let handle = queue.start(registry)?;

    let mut queued = Vec::new();
    let mut cached = 0;
    for n in 0..cli.jobs {
        // every fourth input repeats an earlier one
        let input = json!({ "n": if n % 4 == 3 { n - 3 } else { n } });
        let task_type = if n % 5 == 4 { "flaky" } else { "square" };

        match queue.submit(task_type, input).await? {
            Submission::Queued(id) => queued.push(id),
            Submission::Cached(output) => {
                cached += 1;
                info!(task_type, %output, "Served from cache");
            }
        }
    }

    print_info(&format!(
        "Submitted {} jobs to '{}' ({} queued, {} cached)",
        cli.jobs,
        queue.queue_name(),
        queued.len(),
        cached
    ));

    let finished = collect_events(
        &mut events,
        &queued,
        Duration::from_secs(cli.timeout_secs),
    )
    .await;

    queue.stop();
    handle.await.context("Poll loop panicked")?;

    print_results(&finished);

    let pending = queue.size(JobStatus::Pending).await?;
    let processing = queue.size(JobStatus::Processing).await?;
    if finished.len() < queued.len() {
        print_warning(&format!(
            "{} jobs unfinished ({} pending, {} processing)",
            queued.len() - finished.len(),
            pending,
            processing
        ));
    } else {
        print_success("All queued jobs reached a terminal state");
    }

    Ok(())
}

/// Toy handlers: `square` always works, `flaky` fails on odd inputs
fn build_registry() -> TaskRegistry {
    let registry = TaskRegistry::new();
    registry
        .register("square", |input| async move {
            let n = input["n"].as_i64().context("input.n must be an integer")?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>(json!({ "square": n * n }))
        })
        .register("flaky", |input| async move {
            let n = input["n"].as_i64().context("input.n must be an integer")?;
            if n % 2 == 1 {
                anyhow::bail!("refusing odd input {}", n);
            }
            Ok::<_, anyhow::Error>(json!({ "half": n / 2 }))
        });
    registry
}

/// Wait for a terminal event for each queued job, or until `timeout` passes
async fn collect_events(
    events: &mut broadcast::Receiver<CompletionEvent>,
    queued: &[JobId],
    timeout: Duration,
) -> BTreeMap<JobId, CompletionEvent> {
    let mut finished = BTreeMap::new();
    let deadline = tokio::time::Instant::now() + timeout;

    while finished.len() < queued.len() {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => {
                if queued.contains(&event.id) {
                    finished.insert(event.id, event);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(skipped, "Completion events dropped");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => {
                warn!(
                    remaining = queued.len() - finished.len(),
                    "Timed out waiting for jobs"
                );
                break;
            }
        }
    }

    finished
}

fn print_results(finished: &BTreeMap<JobId, CompletionEvent>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Job").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Output / Error").fg(Color::Cyan),
        ]);

    for event in finished.values() {
        let (status, detail) = match event.status {
            JobStatus::Completed => (
                Cell::new(event.status).fg(Color::Green),
                event
                    .output
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
            _ => (
                Cell::new(event.status).fg(Color::Red),
                event.error.clone().unwrap_or_default(),
            ),
        };
        table.add_row(vec![Cell::new(event.id), status, Cell::new(detail)]);
    }

    println!("{table}");
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
