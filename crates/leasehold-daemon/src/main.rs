//! leasehold-daemon - scripted agreement synchronization run
//!
//! Deploys the agreements of a scenario file on an in-process simulated
//! ledger, wires a [`SyncEngine`] to the configured backend (HTTP when
//! `backend.base_url` is set, in-memory otherwise), observes every
//! agreement and runs the scenario's actions through the orchestrator.
//!
//! Output on stdout is JSON lines: notifications as they happen, one line
//! per step, then the final view of every agreement and a portfolio
//! summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use leasehold_core::config::EngineConfig;
use leasehold_daemon::SyncEngine;
use leasehold_daemon::backend::BackendStore;
use leasehold_daemon::backend::http::{HttpBackendStore, SessionToken};
use leasehold_daemon::backend::memory::InMemoryBackendStore;
use leasehold_daemon::ledger::simulated::SimulatedLedger;
use leasehold_daemon::scenario::{self, Scenario};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// leasehold daemon - agreement-state synchronization
#[derive(Parser, Debug)]
#[command(name = "leasehold-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to scenario file
    #[arg(short, long, default_value = "demos/scenario.toml")]
    scenario: PathBuf,

    /// Backend base URL (overrides `backend.base_url`)
    #[arg(long, env = "LEASEHOLD_BACKEND_URL")]
    backend_url: Option<String>,

    /// Path to cursor database (overrides `storage.cursor_db`)
    #[arg(long)]
    cursor_db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    dump_metrics: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        // stdout carries the JSON report
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(url) = args.backend_url {
        config.backend.base_url = Some(url);
    }
    if let Some(path) = args.cursor_db {
        config.storage.cursor_db = Some(path);
    }

    let scenario = Scenario::from_file(&args.scenario)
        .with_context(|| format!("failed to load scenario from {}", args.scenario.display()))?;
    let ledger = Arc::new(SimulatedLedger::new());
    let deployment = scenario
        .deploy(&ledger)
        .context("failed to deploy scenario agreements")?;

    let backend: Arc<dyn BackendStore> = match &config.backend.base_url {
        Some(url) => {
            let token = config
                .backend
                .token_env
                .as_deref()
                .and_then(SessionToken::from_env);
            if config.backend.token_env.is_some() && token.is_none() {
                warn!("backend token variable is unset, sending unauthenticated requests");
            }
            info!(base_url = %url, "mirroring to HTTP backend");
            Arc::new(HttpBackendStore::new(url.clone(), token))
        },
        None => {
            info!("mirroring to in-memory backend");
            Arc::new(InMemoryBackendStore::new())
        },
    };

    let engine = SyncEngine::start(config, ledger.clone(), backend)
        .context("failed to start sync engine")?;

    let mut notifications = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => print_line(&json!({ "notification": notification })),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "notification output lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = scenario::run(&scenario, &deployment, &ledger, &engine).await;
    // Let the printer drain notifications from the last steps.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            engine.shutdown().await;
            return Err(e).context("scenario run failed");
        },
    };

    for step in &report.steps {
        print_line(&json!({ "step": step }));
    }
    for (name, view) in &report.views {
        print_line(&json!({ "agreement": name, "view": view }));
    }
    print_line(&json!({
        "summary": report.summary,
        "capital_efficiency": report.summary.capital_efficiency(),
        "default_rate": report.summary.default_rate(),
    }));

    if args.dump_metrics {
        let text = engine
            .metrics()
            .encode_text()
            .context("failed to encode metrics")?;
        print!("{text}");
    }

    engine.shutdown().await;
    let failed = report.steps.iter().filter(|s| !s.ok).count();
    info!(steps = report.steps.len(), failed, "scenario finished");
    Ok(())
}

fn print_line(value: &serde_json::Value) {
    println!("{value}");
}
