//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::commands::{config::ConfigArgs, dispatch::DispatchArgs, node::NodeArgs};

#[derive(Parser, Debug)]
#[command(name = "concolic-dispatch")]
#[command(about = "Distributed concolic testing dispatcher", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file; defaults to .concolic/config.yaml and .concolic/local.yaml
    #[arg(short, long, global = true, env = "CONCOLIC_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dispatcher over the configured targets
    Dispatch(DispatchArgs),

    /// Run a remote worker that registers with a dispatcher
    Node(NodeArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
