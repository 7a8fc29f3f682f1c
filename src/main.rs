use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use shardrunner::config::WorkerConfig;
use shardrunner::healing::{confidence, DomSnapshot, SelectorHealer};
use shardrunner::job::{JsonLinesJobSource, TestRunJob};

#[derive(Parser)]
#[command(
    name = "shardrunner",
    about = "Sharded browser-test execution worker with selector healing",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "SHARDRUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a single shard job and exit
    RunJob {
        /// JSON file holding one TestRunJob
        #[arg(long)]
        job: PathBuf,
    },

    /// Process newline-delimited jobs one at a time until the input ends
    Consume {
        /// Job file, or `-` for stdin
        #[arg(long, default_value = "-")]
        jobs: String,
    },

    /// Heal a selector against a recorded DOM snapshot
    Heal {
        /// DOM snapshot JSON file
        #[arg(long)]
        snapshot: PathBuf,

        /// The broken selector
        #[arg(long)]
        selector: String,
    },

    /// Print the heuristic confidence score of a selector
    Confidence {
        selector: String,
    },
}

fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGINT or SIGTERM and return the exit code to report.
async fn shutdown_signal() -> std::io::Result<u8> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| 130),
            _ = terminate.recv() => Ok(143),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|()| 130)
    }
}

/// Cancel `token` on the first shutdown signal. Resolves to that signal's exit code.
fn watch_signals(token: CancellationToken) -> JoinHandle<Option<u8>> {
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(code) => {
                tracing::warn!(exit_code = code, "shutdown requested, stopping the current job");
                token.cancel();
                Some(code)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install signal handlers");
                None
            }
        }
    })
}

/// Exit with the signal's code once queued collector updates are delivered.
async fn exit_if_signalled(token: &CancellationToken, signals: JoinHandle<Option<u8>>) {
    if !token.is_cancelled() {
        signals.abort();
        return;
    }
    let code = signals.await.ok().flatten().unwrap_or(130);
    // A pending stdin read would hold the runtime open past return.
    std::process::exit(i32::from(code));
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = WorkerConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging.level, cli.log_json || config.logging.json);

    match cli.command {
        Commands::RunJob { job } => {
            let raw = std::fs::read_to_string(&job)
                .with_context(|| format!("failed to read job file: {}", job.display()))?;
            let job = TestRunJob::from_json(&raw)
                .with_context(|| format!("invalid job file: {}", job.display()))?;

            let shutdown = CancellationToken::new();
            let signals = watch_signals(shutdown.clone());
            let (worker, dispatcher) = shardrunner::build_worker(&config)?;
            let worker = worker.with_shutdown(shutdown.clone());
            let result = worker.process_job(&job).await;
            let delivered = dispatcher.drain().await;
            tracing::debug!(delivered = delivered.delivered, failed = delivered.failed, "collector queue drained");
            exit_if_signalled(&shutdown, signals).await;

            let report = result?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Consume { jobs } => {
            let shutdown = CancellationToken::new();
            let signals = watch_signals(shutdown.clone());
            let (worker, dispatcher) = shardrunner::build_worker(&config)?;
            let worker = worker.with_shutdown(shutdown.clone());
            let consumed = if jobs == "-" {
                let mut source = JsonLinesJobSource::new(tokio::io::stdin());
                worker.consume(&mut source).await
            } else {
                let mut source = JsonLinesJobSource::open(std::path::Path::new(&jobs)).await?;
                worker.consume(&mut source).await
            };
            dispatcher.drain().await;

            let stats = consumed?;
            println!("{}", serde_json::to_string(&stats)?);
            exit_if_signalled(&shutdown, signals).await;
            if stats.failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Heal { snapshot, selector } => {
            let page = DomSnapshot::load(&snapshot)?;
            let healer = SelectorHealer::new(&config.healing);
            let healed = healer.heal(&page, &selector).await;
            let output = serde_json::json!({
                "originalSelector": selector,
                "healed": healed,
                "stats": healer.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            if healed.is_none() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Confidence { selector } => {
            println!("{:.2}", confidence::selector_confidence(&selector));
        }
    }

    Ok(ExitCode::SUCCESS)
}
