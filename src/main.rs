use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

use turnstile::admission::{AdmissionController, Job, JobSource};
use turnstile::config::{LogConfig, LogFormat, TurnstileConfig};
use turnstile::intake::{
    bounded, drain_jobs, ConfigCache, DecisionWriter, Intake, LogSink, Origin,
};
use turnstile::policy::{load_policy, parse_policy, PolicyHandle};
use turnstile::reload::{apply_config_change, PolicyWatcher};
use turnstile::store::{MemoryStore, StateStore};

#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Admission control for multi-tenant job intake")]
struct Cli {
    /// Service configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a policy file
    Validate {
        #[arg(long)]
        policy: PathBuf,
    },
    /// Run a set of jobs through a fresh in-memory store and print decisions
    Simulate {
        #[arg(long)]
        policy: PathBuf,
        /// JSON array of jobs, or one job per line
        #[arg(long)]
        jobs: PathBuf,
        /// Check every job as one atomic batch with this name
        #[arg(long)]
        atomic_batch: Option<String>,
    },
    /// Serve submissions read as JSON lines from stdin
    Run,
}

/// One line of input to `run`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    ConfigChange {
        config_change: ConfigChange,
    },
    Batch {
        #[serde(default)]
        owner_id: Option<String>,
        #[serde(default)]
        source: Option<JobSource>,
        batch_name: String,
        jobs: Vec<Job>,
        #[serde(default)]
        atomic: bool,
    },
    Single {
        #[serde(default)]
        owner_id: Option<String>,
        #[serde(default)]
        source: Option<JobSource>,
        job: Job,
    },
}

#[derive(Debug, Deserialize)]
struct ConfigChange {
    owner_id: String,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    config_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.log);

    match cli.command {
        Command::Validate { policy } => validate(&policy),
        Command::Simulate {
            policy,
            jobs,
            atomic_batch,
        } => simulate(&config, &policy, &jobs, atomic_batch).await,
        Command::Run => run(config).await,
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    match log.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let policy = load_policy(path).with_context(|| format!("invalid policy {}", path.display()))?;
    let global = &policy.global_execution_limit;
    println!("policy version {} is valid", policy.version);
    println!(
        "  global: max_jobs={} window_ms={} per_tenant={} min_priority={}",
        global.max_jobs, global.window_ms, global.max_concurrent_per_tenant, global.min_priority
    );
    let mut names: Vec<&String> = policy.dependencies.keys().collect();
    names.sort();
    for name in names {
        let dep = &policy.dependencies[name];
        match dep.rate_limit {
            Some(limit) => println!(
                "  dependency {name}: {} requests per {} ms",
                limit.max_requests, limit.window_ms
            ),
            None => println!("  dependency {name}: no rate limit"),
        }
    }
    Ok(())
}

async fn simulate(
    config: &TurnstileConfig,
    policy_path: &Path,
    jobs_path: &Path,
    atomic_batch: Option<String>,
) -> anyhow::Result<()> {
    let policy = load_policy(policy_path)?;
    let raw = tokio::fs::read_to_string(jobs_path)
        .await
        .with_context(|| format!("failed to read {}", jobs_path.display()))?;
    let mut jobs = parse_jobs(&raw)?;

    let store = Arc::new(MemoryStore::new());
    store.flush().await?;
    let controller = AdmissionController::new(Arc::new(PolicyHandle::new(policy)), store)
        .with_store_timeout(config.admission.store_timeout());

    let decisions = match atomic_batch {
        Some(name) => {
            for job in &mut jobs {
                job.meta.batch_name = Some(name.clone());
            }
            controller.check_batch_atomic(jobs).await
        }
        None => controller.check_batch(jobs).await,
    };
    for decision in &decisions {
        println!("{}", serde_json::to_string(decision)?);
    }

    let stats = controller.stats();
    info!(
        total = stats.total_requests,
        admitted = stats.admitted_requests,
        rejected = stats.rejected_requests,
        "Simulation complete"
    );
    Ok(())
}

/// Accept either a JSON array of jobs or one job per line.
fn parse_jobs(raw: &str) -> anyhow::Result<Vec<Job>> {
    if raw.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(raw)?);
    }
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("invalid job on line {}", i + 1))
        })
        .collect()
}

async fn run(config: TurnstileConfig) -> anyhow::Result<()> {
    info!("Starting Turnstile Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let contents = tokio::fs::read_to_string(&config.policy.path)
        .await
        .with_context(|| format!("failed to read policy {}", config.policy.path.display()))?;
    let policy = parse_policy(&contents)?;
    info!(path = %config.policy.path.display(), version = policy.version, "Policy loaded");

    let store = Arc::new(MemoryStore::new());
    store.ping().await.context("state store unreachable")?;

    let handle = Arc::new(PolicyHandle::new(policy));
    let controller = Arc::new(
        AdmissionController::new(Arc::clone(&handle), Arc::clone(&store))
            .with_store_timeout(config.admission.store_timeout()),
    );
    let configs = Arc::new(ConfigCache::new());

    let (jobs, jobs_rx) = bounded(config.queues.job_capacity);
    let (decisions, decisions_rx) = bounded(config.queues.decision_capacity);
    let writer = DecisionWriter::spawn(
        config.queues.writer_workers,
        decisions_rx,
        Arc::new(LogSink),
    );
    let drain = tokio::spawn(drain_jobs(jobs_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = config
        .admission
        .sweep_interval()
        .map(|interval| Arc::clone(&store).spawn_sweeper(interval, shutdown_rx.clone()));
    let watcher = config.policy.reload_interval().map(|interval| {
        PolicyWatcher::new(&config.policy.path, Arc::clone(&handle), Arc::clone(&store))
            .with_baseline(contents)
            .spawn(interval, shutdown_rx)
    });

    let intake = Intake::new(controller, Arc::clone(&configs), jobs, decisions)
        .with_max_batch_size(config.admission.max_batch_size);
    info!("Reading submissions from stdin");

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let interrupted = loop {
        match next_input(&mut lines, &mut shutdown).await {
            Input::Line(line) if line.trim().is_empty() => continue,
            Input::Line(line) => handle_line(&intake, &configs, store.as_ref(), &line).await,
            Input::Interrupted => break true,
            Input::Failed(e) => {
                error!(error = %e, "Failed to read stdin");
                break false;
            }
            Input::Closed => {
                info!("Input closed, initiating graceful shutdown");
                break false;
            }
        }
    };

    let _ = shutdown_tx.send(true);
    drop(intake);
    writer.join().await;
    let released = drain.await?;
    if let Some(watcher) = watcher {
        watcher.await?;
    }
    if let Some(sweeper) = sweeper {
        sweeper.await?;
    }

    info!(released, "Turnstile Admission Service stopped");
    if interrupted {
        // Tokio's stdin reader sits in a blocking thread that runtime
        // shutdown would wait on until the next line arrives.
        std::process::exit(0);
    }
    Ok(())
}

/// One step of the stdin submission loop.
#[derive(Debug)]
enum Input {
    Line(String),
    Closed,
    Interrupted,
    Failed(std::io::Error),
}

/// Wait for the next input line or for `shutdown`, whichever comes first.
async fn next_input<R, F>(lines: &mut LinesStream<R>, shutdown: &mut F) -> Input
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()> + Unpin,
{
    tokio::select! {
        _ = shutdown => Input::Interrupted,
        next = lines.next() => match next {
            Some(Ok(line)) => Input::Line(line),
            Some(Err(e)) => Input::Failed(e),
            None => Input::Closed,
        },
    }
}

async fn handle_line<S: StateStore + 'static>(
    intake: &Intake<S>,
    configs: &ConfigCache,
    store: &S,
    line: &str,
) {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed submission");
            emit(&serde_json::json!({ "error": format!("invalid submission: {e}") }));
            return;
        }
    };

    let origin = |owner_id: Option<String>, source: Option<JobSource>| Origin {
        source: source.unwrap_or(JobSource::System),
        owner_id,
    };

    let result = match envelope {
        Envelope::ConfigChange { config_change } => {
            let active = config_change.config.zip(config_change.config_id);
            apply_config_change(&config_change.owner_id, active, configs, store)
                .await
                .map(|()| serde_json::json!({ "config_change": config_change.owner_id }))
                .map_err(|e| e.to_string())
        }
        Envelope::Single {
            owner_id,
            source,
            job,
        } => intake
            .submit(&origin(owner_id, source), job)
            .await
            .map_err(|e| e.to_string())
            .and_then(|decision| to_json(&decision)),
        Envelope::Batch {
            owner_id,
            source,
            batch_name,
            jobs,
            atomic,
        } => {
            let origin = origin(owner_id, source);
            let summary = if atomic {
                intake.submit_batch_atomic(&origin, &batch_name, jobs).await
            } else {
                intake.submit_batch(&origin, &batch_name, jobs).await
            };
            summary
                .map_err(|e| e.to_string())
                .and_then(|summary| to_json(&summary))
        }
    };

    match result {
        Ok(value) => emit(&value),
        Err(e) => {
            warn!(error = %e, "Submission refused");
            emit(&serde_json::json!({ "error": e }));
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn emit(value: &Value) {
    println!("{value}");
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
