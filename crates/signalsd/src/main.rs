//! signalsd — the protected signals daemon.
//!
//! # Usage
//!
//! ```text
//! signalsd --config /etc/signals.toml run
//! signalsd ingest --buyer buyer.example --package com.app --file update.json
//! signalsd encode [--buyer buyer.example]
//! signalsd show --buyer buyer.example
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use signals_core::{Clock, DevContext, SignalsConfig};
use signals_encoding::{EncodeOutcome, RunSource};
use signalsd::Signals;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,signalsd=debug,signals=debug";

#[derive(Parser)]
#[command(name = "signalsd", about = "Protected signals daemon")]
struct Cli {
    /// Path to signals.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic encoding job until Ctrl-C.
    Run,

    /// Apply an update document to a buyer's signals.
    Ingest {
        #[arg(long)]
        buyer: String,

        /// Package name stamped on new signals.
        #[arg(long)]
        package: String,

        /// JSON update document.
        #[arg(long)]
        file: PathBuf,

        /// Enable developer options (e.g. loopback encoder endpoints).
        #[arg(long)]
        dev: bool,
    },

    /// Run one encoding pass now, or encode a single buyer.
    Encode {
        #[arg(long)]
        buyer: Option<String>,
    },

    /// Print a buyer's stored signals, encoder and payload.
    Show {
        #[arg(long)]
        buyer: String,
    },

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = match &cli.config {
        Some(path) => SignalsConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SignalsConfig::default(),
    };

    match cli.command {
        Command::Run => run(config).await,
        Command::Ingest {
            buyer,
            package,
            file,
            dev,
        } => ingest(config, &buyer, &package, &file, dev).await,
        Command::Encode { buyer } => encode(config, buyer.as_deref()).await,
        Command::Show { buyer } => show(config, &buyer),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: SignalsConfig) -> anyhow::Result<()> {
    info!("signals daemon starting");
    let signals = Signals::open(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let job = if signals.config.encoding.enabled {
        let worker = signals.worker.clone();
        let period = signals.config.encoding.job_period();
        Some(tokio::spawn(async move {
            worker.run_periodically(period, shutdown_rx).await;
        }))
    } else {
        warn!("periodic encoding disabled by configuration");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(job) = job {
        let _ = job.await;
    }

    info!("signals daemon stopped");
    Ok(())
}

async fn ingest(
    config: SignalsConfig,
    buyer: &str,
    package: &str,
    file: &std::path::Path,
    dev: bool,
) -> anyhow::Result<()> {
    let document = std::fs::read_to_string(file)
        .with_context(|| format!("reading update document {}", file.display()))?;
    let signals = Signals::open(config)?;
    let dev = if dev {
        DevContext::enabled()
    } else {
        DevContext::disabled()
    };

    let now = signals.clock.now_millis();
    match signals
        .orchestrator
        .process_update_str(buyer, package, now, &document, dev)
        .await
    {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            warn!(%buyer, status = ?e.processing_status(), error = %e, "update rejected");
            Err(e.into())
        }
    }
}

async fn encode(config: SignalsConfig, buyer: Option<&str>) -> anyhow::Result<()> {
    let signals = Signals::open(config)?;

    let Some(buyer) = buyer else {
        let stats = signals
            .worker
            .encode_protected_signals(RunSource::OnDemand)
            .wait()
            .await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    };

    let summary = match signals.encoder.encode_buyer(buyer).await? {
        EncodeOutcome::Encoded { version, size } => {
            json!({"buyer": buyer, "outcome": "encoded", "version": version, "size": size})
        }
        EncodeOutcome::Skipped(reason) => {
            json!({"buyer": buyer, "outcome": "skipped", "reason": format!("{reason:?}")})
        }
        EncodeOutcome::Failed(e) => {
            json!({"buyer": buyer, "outcome": "failed", "error": e.to_string()})
        }
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn show(config: SignalsConfig, buyer: &str) -> anyhow::Result<()> {
    let signals = Signals::open(config)?;
    let store = &signals.store;

    let stored: Vec<_> = store
        .get_signals_by_buyer(buyer)?
        .into_iter()
        .map(|signal| {
            json!({
                "id": signal.id,
                "key": hex::encode_upper(&signal.key),
                "value": hex::encode_upper(&signal.value),
                "creation_time": signal.creation_time,
                "package_name": signal.package_name,
            })
        })
        .collect();
    let payload = store.get_encoded_payload(buyer)?.map(|payload| {
        json!({
            "version": payload.version,
            "creation_time": payload.creation_time,
            "payload": hex::encode_upper(&payload.payload),
        })
    });

    let view = json!({
        "buyer": buyer,
        "signals": stored,
        "signals_update": store.get_signals_update_metadata(buyer)?,
        "encoder": store.get_encoder_metadata(buyer)?,
        "endpoint": store.get_encoder_endpoint(buyer)?,
        "payload": payload,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
