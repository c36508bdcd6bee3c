//! tally-engine - Main entry point
//!
//! Runs a reconciliation + aggregation pass once, or on a timer until
//! Ctrl+C / SIGTERM. A pass in flight is always allowed to finish.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tally_common::config::{self, ConfigPathResolver, TomlConfig};
use tally_engine::store::http::NotionStore;
use tally_engine::{Engine, PassOptions};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for tally-engine
#[derive(Parser, Debug)]
#[command(name = "tally-engine")]
#[command(about = "Contribution reconciliation and aggregation engine")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single pass and exit
    #[arg(long, conflicts_with = "interval")]
    once: bool,

    /// Seconds between passes (timer mode)
    #[arg(long, env = "TALLY_INTERVAL_SECS")]
    interval: Option<u64>,

    /// Skip the ledger write half of the pass
    #[arg(long)]
    skip_reconcile: bool,

    /// Skip the totals half of the pass
    #[arg(long)]
    skip_aggregate: bool,

    /// Write a config file with default values to PATH and exit
    #[arg(long, value_name = "PATH")]
    write_default_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.write_default_config {
        config::write_toml_config(&TomlConfig::default(), path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let config_path = ConfigPathResolver::new("tally-engine").resolve(args.config.as_deref());
    let toml_config = config::load_toml_config(config_path.as_deref()).context("Failed to load config")?;

    // Initialize tracing
    let default_filter = format!(
        "tally_engine={level},tally_common={level}",
        level = toml_config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tally-engine v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Config file: {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let api_key = config::resolve_api_key(&toml_config).context("Store API key")?;
    let store = NotionStore::new(api_key, &toml_config.store).context("Failed to build store client")?;
    let engine = Engine::new(Arc::new(store), &toml_config);

    let options = PassOptions {
        reconcile: !args.skip_reconcile,
        aggregate: !args.skip_aggregate,
    };

    let interval = if args.once {
        None
    } else {
        args.interval.or(toml_config.engine.interval_secs)
    };

    match interval {
        None => {
            let summary = engine.run_pass(options).await.context("Pass aborted")?;
            if !summary.unmarked_record_ids.is_empty() {
                warn!(
                    count = summary.unmarked_record_ids.len(),
                    "Some records need manual reconciliation"
                );
            }
        }
        Some(secs) => run_on_timer(&engine, options, Duration::from_secs(secs.max(1))).await,
    }

    info!("tally-engine shutdown complete");
    Ok(())
}

async fn run_on_timer(engine: &Engine, options: PassOptions, period: Duration) {
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "Timer mode");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = engine.run_pass(options).await {
            error!(error = %e, "Pass aborted; retrying on next tick");
        }

        if shutdown.is_cancelled() {
            break;
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current pass");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current pass");
        },
    }
}
