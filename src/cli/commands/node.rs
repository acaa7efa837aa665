//! `node`: serve one dispatcher as a remote worker.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::application::node_driver::{connect, register, NodeDriver};
use crate::application::worker::{CommandConcreteExecutor, CommandSymbolicExecutor, Executor};
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::config::Config;
use crate::domain::models::worker::{WorkerId, WorkerKind};

#[derive(Args, Debug)]
pub struct NodeArgs {
    /// Worker kind: concrete (vm) or symbolic (svm)
    #[arg(long, value_parser = parse_kind)]
    pub kind: WorkerKind,

    /// Dispatcher address (overrides network.master)
    #[arg(long)]
    pub master: Option<String>,

    /// Scratch directory (overrides workers.work_dir)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

fn parse_kind(s: &str) -> Result<WorkerKind, String> {
    WorkerKind::from_str(s).ok_or_else(|| format!("unknown worker kind: {s}"))
}

#[derive(Debug, Serialize)]
pub struct NodeSummary {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub master: String,
}

impl CommandOutput for NodeSummary {
    fn to_human(&self) -> String {
        format!("{} worker {} released by {}", self.kind, self.id, self.master)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: NodeArgs, config: Config, json_mode: bool) -> Result<()> {
    let master = args.master.unwrap_or_else(|| config.network.master.clone());
    let work_dir = args.work_dir.unwrap_or_else(|| config.workers.work_dir.clone());

    let mut conn = connect(&master, config.network.connect_retries, config.network.chunk_size)
        .await
        .with_context(|| format!("cannot reach dispatcher at {master}"))?;
    let id = register(&mut conn, args.kind)
        .await
        .context("registration failed")?;

    let executor = match args.kind {
        WorkerKind::Concrete => Executor::Concrete(Arc::new(CommandConcreteExecutor::new(
            id,
            work_dir.join(format!("vm-{id}")),
            config.vm.clone(),
        ))),
        WorkerKind::Symbolic => Executor::Symbolic(Arc::new(CommandSymbolicExecutor::new(
            id,
            work_dir.join(format!("svm-{id}")),
            config.svm.clone(),
        ))),
    };

    NodeDriver::new(id, conn, executor, work_dir.join(format!("node-{id}")))
        .run()
        .await
        .context("worker stopped with an error")?;

    output(
        &NodeSummary {
            id,
            kind: args.kind,
            master,
        },
        json_mode,
    );
    Ok(())
}
