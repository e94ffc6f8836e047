// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cumulus worker.
//!
//! Receives job payloads from a compute backend and runs them with the
//! execution engine:
//! - `run <payload.json>` executes one batch and prints the report
//! - `serve` starts the HTTP entrypoint

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cumulus_worker::config::Config;
use cumulus_worker::engine::{EngineConfig, ExecutionEngine};
use cumulus_worker::job::Job;
use cumulus_worker::server::{self, AppState};
use cumulus_worker::status::StoreReporter;
use cumulus_worker::storage::LocalObjectStore;
use cumulus_worker::unit::{ProcessLauncher, UnitKind};

#[derive(Parser, Debug)]
#[command(name = "cumulus-worker")]
#[command(about = "Execution engine for cumulus job batches")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job payload and exit
    Run {
        /// Job payload (JSON)
        payload: PathBuf,
        /// Print the report as pretty JSON
        #[arg(long)]
        pretty: bool,
    },
    /// Serve job payloads over HTTP
    Serve {
        /// Port to listen on (overrides CUMULUS_HTTP_PORT)
        #[arg(long, short = 'p')]
        port: Option<u16>,
    },
}

fn build_engine(config: &Config) -> anyhow::Result<ExecutionEngine> {
    if config.unit_kind != UnitKind::Process {
        anyhow::bail!(
            "unit kind '{}' needs an embedded job function; the binary only runs process units",
            config.unit_kind.as_str()
        );
    }
    let launcher = Arc::new(ProcessLauncher::from_config(config)?);
    info!(program = %launcher.program().display(), "Process launcher initialized");

    let store = Arc::new(LocalObjectStore::new(&config.storage_dir));
    let reporter = Arc::new(StoreReporter::new(store.clone(), &config.status_prefix));

    Ok(ExecutionEngine::new(
        store,
        reporter,
        launcher,
        EngineConfig::from(config),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cumulus_worker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let args = Args::parse();
    let mut config = Config::from_env()?;

    info!(
        work_dir = %config.work_dir.display(),
        storage_dir = %config.storage_dir.display(),
        unit_kind = config.unit_kind.as_str(),
        "Starting Cumulus worker"
    );

    match args.command {
        Command::Run { payload, pretty } => {
            let raw = tokio::fs::read(&payload)
                .await
                .with_context(|| format!("reading {}", payload.display()))?;
            let job: Job = serde_json::from_slice(&raw).context("parsing job payload")?;

            let engine = build_engine(&config)?;
            let report = engine.run_batch(job).await?;

            let out = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{}", out);
        }
        Command::Serve { port } => {
            if let Some(port) = port {
                config.http_addr.set_port(port);
            }
            let state = AppState {
                engine: build_engine(&config)?,
                preinstalls: Arc::new(config.preinstalls.clone()),
            };
            server::serve(config.http_addr, state).await?;
            info!("Cumulus worker shut down");
        }
    }

    Ok(())
}
