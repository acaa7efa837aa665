//! Command-line interface.

pub mod commands;
pub mod output;
pub mod types;

pub use types::{Cli, Commands};

use anyhow::{Context, Result};

use crate::domain::models::config::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{LogConfig, LogRetention, LoggerImpl};

/// Load configuration, install logging and run the selected command.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    // `config` commands print to stdout and skip the global logger.
    let _logger = match cli.command {
        Commands::Config(_) => None,
        _ => Some(LoggerImpl::init(&LogConfig::from(&config.logging)).context("failed to initialize logging")?),
    };
    if let Some(dir) = config.logging.log_dir.clone() {
        let retention = LogRetention::new(config.logging.retention_days);
        tokio::spawn(async move {
            if let Err(e) = retention.cleanup_old_logs(&dir).await {
                tracing::warn!(error = %e, "log cleanup failed");
            }
        });
    }

    match cli.command {
        Commands::Dispatch(args) => commands::dispatch::execute(args, config, cli.json).await,
        Commands::Node(args) => commands::node::execute(args, config, cli.json).await,
        Commands::Config(args) => commands::config::execute(args, &config, cli.json),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Print an error with its cause chain and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        println!(
            "{}",
            serde_json::json!({ "error": err.to_string(), "causes": causes })
        );
    } else {
        eprintln!("{} {err}", console::style("error:").red().bold());
        for cause in err.chain().skip(1) {
            eprintln!("  {} {cause}", console::style("caused by:").dim());
        }
    }
    std::process::exit(1);
}
