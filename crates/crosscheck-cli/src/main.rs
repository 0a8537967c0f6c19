mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crosscheck_core::broker::{BrokerKind, DockerCli};
use crosscheck_core::catalog::{TaskCatalog, TaskId};
use crosscheck_core::error::HarnessError;
use crosscheck_core::orchestrator::{Orchestrator, RunReport};
use crosscheck_core::supervisor::StdoutSink;

/// Env var holding the harness's own log filter.
const LOG_ENV: &str = "CROSSCHECK_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "crosscheck",
    version,
    about = "Cross-implementation conformance harness for Celery-style task queues"
)]
struct Cli {
    /// Run the Rust worker
    #[arg(long)]
    rust_worker: bool,

    /// Run the Python worker
    #[arg(long)]
    python_worker: bool,

    /// Drive tasks with the Rust client
    #[arg(long)]
    rust_client: bool,

    /// Drive tasks with the Python client
    #[arg(long)]
    python_client: bool,

    /// Tasks to run, in catalog order (default: add expected_failure
    /// task_with_timeout unexpected_failure)
    #[arg(long, num_args = 1.., value_name = "TASK")]
    tasks: Option<Vec<TaskId>>,

    /// Broker backend: redis or amqp [default: redis]
    #[arg(long)]
    broker: Option<BrokerKind>,

    /// Verbose logging for the harness and its children
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ./crosscheck.toml if present)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Upper bound on each client invocation, in seconds
    #[arg(long, value_name = "SECS")]
    client_timeout: Option<u64>,

    /// How long a worker must stay up before clients run, in milliseconds
    #[arg(long, value_name = "MS")]
    grace_period_ms: Option<u64>,

    /// Print the task catalog as JSON and exit
    #[arg(long)]
    list_tasks: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before anything reads the environment, including the log filter.
    let dotenv = dotenv_file(dotenvy::dotenv())?;
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" })),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = &dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    if cli.list_tasks {
        let catalog = serde_json::to_string_pretty(&TaskCatalog::full())
            .context("failed to serialize task catalog")?;
        println!("{catalog}");
        return Ok(());
    }

    let file = config::find_config(cli.config.as_deref())?;
    let cfg = config::resolve(&cli, file, |key| std::env::var(key).ok())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cleaning up");
                cancel.cancel();
            }
        }
    });

    let orchestrator = Orchestrator::new(
        cfg,
        Arc::new(DockerCli::new()),
        Arc::new(StdoutSink),
        cancel,
    );

    match orchestrator.run().await {
        Ok(report) => {
            print_summary(&report);
            Ok(())
        }
        Err(e) => {
            eprintln!("crosscheck: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

/// A missing `.env` is not an error; an unreadable or malformed one is.
fn dotenv_file(
    loaded: std::result::Result<PathBuf, dotenvy::Error>,
) -> anyhow::Result<Option<PathBuf>> {
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e).context("failed to load .env"),
    }
}

/// 1 when an implementation misbehaved, 2 when the harness itself could not
/// run (broker, spawn, bad config), 130 on interrupt.
fn exit_code(e: &HarnessError) -> i32 {
    match e {
        HarnessError::Interrupted => 130,
        e if e.is_conformance_failure() => 1,
        _ => 2,
    }
}

fn print_summary(report: &RunReport) {
    if report.passes.is_empty() {
        println!("broker {} ok; no worker/client pairs selected", report.broker);
        return;
    }
    for pass in &report.passes {
        println!(
            "{} worker / {} client on {}: {} tasks passed ({:.1?})",
            pass.worker,
            pass.client,
            report.broker,
            pass.runs.len(),
            pass.elapsed()
        );
    }
    println!("all {} client runs passed", report.task_count());
}
