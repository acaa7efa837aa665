//! Command-line parsing.

use clap::Parser;
use std::path::PathBuf;

use concolic_dispatch::cli::commands::config::ConfigCommand;
use concolic_dispatch::cli::{Cli, Commands};
use concolic_dispatch::domain::models::worker::WorkerKind;

#[test]
fn test_dispatch_arguments() {
    let cli = Cli::try_parse_from([
        "concolic-dispatch",
        "dispatch",
        "--max-ticks",
        "50",
        "--listen",
        "0.0.0.0:4000",
        "--no-local-workers",
    ])
    .unwrap();
    let Commands::Dispatch(args) = cli.command else {
        panic!("expected dispatch");
    };
    assert_eq!(args.max_ticks, Some(50));
    assert_eq!(args.listen.as_deref(), Some("0.0.0.0:4000"));
    assert!(args.no_local_workers);
}

#[test]
fn test_global_flags_follow_the_subcommand() {
    let cli = Cli::try_parse_from([
        "concolic-dispatch",
        "dispatch",
        "--json",
        "--config",
        "/etc/concolic.yaml",
    ])
    .unwrap();
    assert!(cli.json);
    assert_eq!(cli.config, Some(PathBuf::from("/etc/concolic.yaml")));
}

#[test]
fn test_config_path_from_environment() {
    temp_env::with_var("CONCOLIC_CONFIG", Some("/srv/run.yaml"), || {
        let cli = Cli::try_parse_from(["concolic-dispatch", "config", "show"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/srv/run.yaml")));
        assert!(matches!(
            cli.command,
            Commands::Config(ref args) if matches!(args.command, ConfigCommand::Show)
        ));
    });
}

#[test]
fn test_node_arguments() {
    let cli = Cli::try_parse_from([
        "concolic-dispatch",
        "node",
        "--kind",
        "svm",
        "--master",
        "10.0.0.1:4000",
        "--work-dir",
        "/tmp/node",
    ])
    .unwrap();
    let Commands::Node(args) = cli.command else {
        panic!("expected node");
    };
    assert_eq!(args.kind, WorkerKind::Symbolic);
    assert_eq!(args.master.as_deref(), Some("10.0.0.1:4000"));
    assert_eq!(args.work_dir, Some(PathBuf::from("/tmp/node")));
}

#[test]
fn test_unknown_worker_kind_rejected() {
    let err = Cli::try_parse_from(["concolic-dispatch", "node", "--kind", "gpu"]).unwrap_err();
    assert!(err.to_string().contains("unknown worker kind: gpu"));
}

#[test]
fn test_node_requires_kind() {
    assert!(Cli::try_parse_from(["concolic-dispatch", "node"]).is_err());
}

#[test]
fn test_config_validate() {
    let cli = Cli::try_parse_from(["concolic-dispatch", "config", "validate"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Config(ref args) if matches!(args.command, ConfigCommand::Validate)
    ));
}
