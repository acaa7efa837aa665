//! End-to-end dispatch runs against scripted workers.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use concolic_dispatch::application::orchestrator::{DispatchState, Orchestrator};
use concolic_dispatch::application::worker::Executor;
use concolic_dispatch::application::NodeRegistrar;
use concolic_dispatch::domain::models::worker::WorkerKind;

fn count_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).map(Iterator::count).unwrap_or(0)
}

#[tokio::test]
async fn test_single_target_explores_every_branch() {
    setup_test_logging();
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.test.items = vec!["toy".into()];
    config.vm.initial_tc = seed_elements();

    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();
    let vm = Arc::new(ScriptedConcrete::new(dir.path().join("vm")));
    let svm = Arc::new(ScriptedSymbolic::new());
    orchestrator.attach_local(Executor::Concrete(vm.clone()));
    orchestrator.attach_local(Executor::Symbolic(svm.clone()));

    assert_eq!(drive(&mut orchestrator, 2_000).await, DispatchState::Terminated);

    // xxx, axx, abx and abc reach distinct branches; the rest repeat them.
    assert_eq!(orchestrator.trace_pool().count_all_unique(), 4);
    assert_eq!(orchestrator.test_pool().count_all(), 10);
    assert_eq!(orchestrator.test_pool().duplicate_count(), 0);
    assert_eq!(vm.executions.load(Ordering::SeqCst), 10);
    assert_eq!(svm.solved.load(Ordering::SeqCst), 4);
    assert_eq!(svm.cleaned.load(Ordering::SeqCst), 4);

    let root = orchestrator.run_root().to_path_buf();
    assert!(root.join("log/finish.log").exists());
    let tree = std::fs::read_to_string(root.join("log/test_case_tree.log")).unwrap();
    assert!(tree.starts_with("Node tc-1: [tc-2 ]"));
    assert_eq!(count_entries(&root.join("test-case")), 10);
    assert_eq!(count_entries(&root.join("trace")), 4);

    let report = orchestrator.report();
    assert_eq!(report.targets_finished, 1);
    assert_eq!(report.status.tests_left, 0);
    assert_eq!(report.status.traces_left, 0);
}

#[tokio::test]
async fn test_converged_target_expires_on_the_next_tick() {
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.vm.initial_tc = seed_elements();
    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();
    orchestrator.attach_local(ScriptedConcrete::new(dir.path().join("vm")).into_executor());
    orchestrator.attach_local(ScriptedSymbolic::new().into_executor());

    let mut converged = false;
    for _ in 0..2_000 {
        if orchestrator.converged() {
            converged = true;
            break;
        }
        let state = orchestrator.tick().await.unwrap();
        assert_ne!(state, DispatchState::Terminated, "terminated before converging");
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert!(converged);

    let ticks = orchestrator.ticks();
    assert_eq!(orchestrator.tick().await.unwrap(), DispatchState::Terminated);
    assert_eq!(orchestrator.ticks(), ticks + 1);
}

#[tokio::test]
async fn test_terminated_dispatcher_ignores_further_ticks() {
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.vm.initial_tc = seed_elements();
    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();
    orchestrator.attach_local(ScriptedConcrete::new(dir.path().join("vm")).into_executor());
    orchestrator.attach_local(ScriptedSymbolic::new().into_executor());

    assert_eq!(drive(&mut orchestrator, 2_000).await, DispatchState::Terminated);
    let ticks = orchestrator.ticks();
    assert_eq!(orchestrator.tick().await.unwrap(), DispatchState::Terminated);
    assert_eq!(orchestrator.ticks(), ticks);
}

#[tokio::test]
async fn test_distributed_run_rotates_through_targets() {
    setup_test_logging();
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.mode.distributed = true;
    config.test.items = vec!["alpha".into(), "beta".into()];
    config.vm.initial_tc = seed_elements();

    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();
    let vm = Arc::new(ScriptedConcrete::new(dir.path().join("vm")));
    orchestrator.attach_local(Executor::Concrete(vm.clone()));
    orchestrator.attach_local(ScriptedSymbolic::new().into_executor());

    assert_eq!(drive(&mut orchestrator, 4_000).await, DispatchState::Terminated);
    assert_eq!(orchestrator.report().targets_finished, 2);
    assert_eq!(orchestrator.target().unwrap().name, "beta");
    assert_eq!(vm.executions.load(Ordering::SeqCst), 20);
    // Each target commences every worker anew.
    assert_eq!(vm.commences.load(Ordering::SeqCst), 2);

    let root = orchestrator.run_root().to_path_buf();
    for target in ["alpha", "beta"] {
        assert!(root.join(target).join("log/finish.log").exists(), "{target}");
        assert_eq!(count_entries(&root.join(target).join("test-case")), 10);
    }
    // Storage of a finished target is reclaimed; the last one is kept.
    assert!(!root.join("alpha/trace").exists());
    assert_eq!(count_entries(&root.join("beta/trace")), 4);
}

#[tokio::test]
async fn test_harness_description_seeds_the_pool() {
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.test.items = vec!["toy".into()];

    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();
    assert_eq!(orchestrator.test_pool().count_all(), 0);
    orchestrator.attach_local(
        ScriptedConcrete::new(dir.path().join("vm"))
            .with_harness("xxx")
            .into_executor(),
    );
    orchestrator.attach_local(ScriptedSymbolic::new().into_executor());

    assert_eq!(drive(&mut orchestrator, 2_000).await, DispatchState::Terminated);
    assert_eq!(orchestrator.test_pool().count_all(), 10);

    let stored = orchestrator
        .run_root()
        .join("guest-data/guest-config.json");
    let text = std::fs::read_to_string(stored).unwrap();
    assert!(text.contains("\"executable\": \"toy\""));
}

#[tokio::test]
async fn test_worker_error_is_logged_and_worker_restarts() {
    setup_test_logging();
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.mode.distributed = true;
    config.test.items = vec!["alpha".into()];
    config.vm.initial_tc = seed_elements();

    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();
    // zxx repeats the branch of xxx, so losing it leaves coverage intact.
    let vm = Arc::new(ScriptedConcrete::new(dir.path().join("vm")).failing_once_on(b"zxx"));
    orchestrator.attach_local(Executor::Concrete(vm.clone()));
    orchestrator.attach_local(ScriptedSymbolic::new().into_executor());

    assert_eq!(drive(&mut orchestrator, 2_000).await, DispatchState::Terminated);
    assert_eq!(orchestrator.trace_pool().count_all_unique(), 4);
    assert_eq!(orchestrator.test_pool().count_all(), 10);
    assert_eq!(vm.commences.load(Ordering::SeqCst), 2);

    let log = orchestrator.run_root().join("alpha/log");
    let errors = std::fs::read_to_string(log.join("node_error.log")).unwrap();
    assert!(errors.contains("guest crashed"));
    assert!(log.join("vm/1").exists());
    assert!(log.join("vm/1.input.bin").exists());

    let status = orchestrator.status();
    let vm_row = status
        .workers
        .iter()
        .find(|w| w.kind == WorkerKind::Concrete)
        .unwrap();
    assert_eq!(vm_row.status.error_count, 1);
}

#[tokio::test]
async fn test_tick_limit_stops_the_run() {
    let dir = temp_dir();
    let mut config = test_config(dir.path());
    config.vm.initial_tc = seed_elements();
    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let mut seen = 0;
    let report = orchestrator.run(Some(3), rx, |_| seen += 1).await.unwrap();
    assert_eq!(report.ticks, 3);
    assert_eq!(seen, 3);
    assert_eq!(orchestrator.state(), DispatchState::Terminated);
    assert!(report.run_root.join("log/finish.log").exists());
}

#[tokio::test]
async fn test_shutdown_signal_stops_the_run() {
    let dir = temp_dir();
    let config = test_config(dir.path());
    let mut orchestrator = Orchestrator::new(config, NodeRegistrar::new()).unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    tx.send(true).unwrap();
    let report = orchestrator.run(None, rx, |_| {}).await.unwrap();
    assert_eq!(report.ticks, 1);
    assert_eq!(orchestrator.state(), DispatchState::Terminated);
}
