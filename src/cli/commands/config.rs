//! `config`: show or validate the merged configuration.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::config::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the merged configuration
    Show,
    /// Check the configuration and summarize it
    Validate,
}

#[derive(Debug, Serialize)]
pub struct ValidationSummary {
    pub valid: bool,
    pub distributed: bool,
    pub targets: usize,
    pub trace_selection: String,
    pub test_strategy: String,
    pub local_workers: (usize, usize),
}

impl CommandOutput for ValidationSummary {
    fn to_human(&self) -> String {
        format!(
            "Configuration is valid\n  mode: {}\n  targets: {}\n  trace selection: {}\n  test order: {}\n  local workers: {} concrete, {} symbolic",
            if self.distributed { "distributed" } else { "single target" },
            self.targets,
            self.trace_selection,
            self.test_strategy,
            self.local_workers.0,
            self.local_workers.1,
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn execute(args: ConfigArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommand::Show => {
            if json_mode {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print!("{}", serde_yaml::to_string(config).context("failed to render configuration")?);
            }
            Ok(())
        }
        ConfigCommand::Validate => {
            ConfigLoader::validate(config)?;
            let summary = ValidationSummary {
                valid: true,
                distributed: config.is_distributed(),
                targets: config.test.items.len(),
                trace_selection: config.trace.selection.clone(),
                test_strategy: config.test_pool.strategy.clone(),
                local_workers: (config.workers.concrete, config.workers.symbolic),
            };
            output(&summary, json_mode);
            Ok(())
        }
    }
}
