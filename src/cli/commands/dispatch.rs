//! `dispatch`: run the orchestrator until every target expires.

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::watch;
use tracing::info;

use crate::application::{NodeRegistrar, Orchestrator};
use crate::cli::output::progress::DispatchProgress;
use crate::cli::output::{output, table::TableFormatter};
use crate::domain::models::config::Config;

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// Stop after this many ticks
    #[arg(long)]
    pub max_ticks: Option<u64>,

    /// Accept remote workers on this address (overrides network.listen)
    #[arg(long)]
    pub listen: Option<String>,

    /// Only use remote workers
    #[arg(long)]
    pub no_local_workers: bool,
}

pub async fn execute(args: DispatchArgs, config: Config, json_mode: bool) -> Result<()> {
    let registrar = NodeRegistrar::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = match args.listen.or_else(|| config.network.listen.clone()) {
        Some(addr) => {
            let (bound, handle) = registrar
                .listen(&addr, config.network.chunk_size, shutdown_rx.clone())
                .await
                .with_context(|| format!("failed to listen on {addr}"))?;
            info!(%bound, "accepting remote workers");
            Some(handle)
        }
        None => None,
    };

    let mut orchestrator =
        Orchestrator::new(config, registrar).context("failed to start dispatcher")?;
    if !args.no_local_workers {
        orchestrator.spawn_local_workers();
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let progress = (!json_mode).then(DispatchProgress::new);
    let result = orchestrator
        .run(args.max_ticks, shutdown_rx, |o| {
            if let Some(progress) = &progress {
                progress.update(&o.status());
            }
        })
        .await;
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(progress) = &progress {
                progress.fail(&e.to_string());
            }
            return Err(e).context("dispatch failed");
        }
    };

    if let Some(handle) = listener {
        handle.abort();
    }
    if let Some(progress) = progress {
        progress.finish(report.targets_finished);
        println!("{}", TableFormatter::new().format_status(&report.status));
    }
    output(&report, json_mode);
    Ok(())
}
