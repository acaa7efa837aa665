//! Common test utilities for integration tests
//!
//! Provides shared fixtures and scripted executors standing in for the VM
//! and the symbolic engine.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use concolic_dispatch::application::orchestrator::{DispatchState, Orchestrator};
use concolic_dispatch::application::worker::{
    ConcreteExecutor, Executor, ImageSource, ProcessSlot, Session, SymbolicExecutor, TestBatch,
};
use concolic_dispatch::domain::errors::{DomainError, DomainResult};
use concolic_dispatch::domain::models::config::{Config, InitialElement};
use concolic_dispatch::domain::models::harness::{GuestData, HarnessArgument};
use concolic_dispatch::domain::models::test_case::{TestCase, TestCaseElement};
use concolic_dispatch::domain::models::trace::{encode_blocks, Block, TraceArtifact, TraceId};
use concolic_dispatch::domain::models::worker::ImageInfo;

/// Bytes the toy program checks one at a time.
pub const MAGIC: &[u8; 3] = b"abc";

/// Create a temporary directory for test isolation
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Setup test logging
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Wait for a condition to be true with timeout
pub async fn wait_for<F>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    false
}

/// Configuration rooted in `dir` with no in-process workers.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.dispatch.root = dir.join("dispatch");
    config.dispatch.poll_interval_ms = 1;
    config.workers.work_dir = dir.join("workers");
    config.workers.concrete = 0;
    config.workers.symbolic = 0;
    config
}

/// Tick until the dispatcher terminates or `max_ticks` pass.
pub async fn drive(orchestrator: &mut Orchestrator, max_ticks: usize) -> DispatchState {
    for _ in 0..max_ticks {
        let state = orchestrator.tick().await.expect("tick failed");
        if state == DispatchState::Terminated {
            return state;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    orchestrator.state()
}

/// The seed every toy exploration starts from.
pub fn seed_elements() -> Vec<InitialElement> {
    vec![InitialElement {
        name: "argv_1".into(),
        data: "xxx".into(),
    }]
}

pub fn input(data: &[u8]) -> TestCase {
    TestCase::new(vec![TestCaseElement::new("argv_1", data.to_vec())])
}

fn input_bytes(test: &TestCase) -> Vec<u8> {
    test.elements()
        .first()
        .map(|e| e.data.clone())
        .unwrap_or_default()
}

/// Number of leading bytes matching `MAGIC`.
pub fn matched(data: &[u8]) -> usize {
    MAGIC
        .iter()
        .zip(data)
        .take_while(|(m, d)| m == d)
        .count()
}

/// Blocks the toy program executes for `data`.
pub fn program(data: &[u8]) -> Vec<Block> {
    let mut blocks = vec![0x100];
    for (i, expected) in MAGIC.iter().enumerate() {
        if data.get(i) == Some(expected) {
            blocks.push(0x200 + i as Block);
        } else {
            blocks.push(0x300 + i as Block);
            return blocks;
        }
    }
    blocks.push(0x400);
    blocks
}

/// Harness with one concolic argument holding `value`.
pub fn harness(value: &str) -> GuestData {
    GuestData {
        executable: "toy".into(),
        arguments: vec![HarnessArgument {
            index: 1,
            size: value.len(),
            value: value.into(),
            concolic: true,
        }],
        ..GuestData::default()
    }
}

/// Runs the toy program and stores its traces under `dir`.
#[derive(Debug)]
pub struct ScriptedConcrete {
    dir: PathBuf,
    /// Fail the first execution of this input.
    fail_once_on: Mutex<Option<Vec<u8>>>,
    shared: Option<GuestData>,
    installed: Mutex<Option<ImageInfo>>,
    pub executions: AtomicUsize,
    pub commences: AtomicUsize,
}

impl ScriptedConcrete {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fail_once_on: Mutex::new(None),
            shared: Some(harness("xxx")),
            installed: Mutex::new(None),
            executions: AtomicUsize::new(0),
            commences: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing_once_on(self, data: &[u8]) -> Self {
        *self.fail_once_on.lock().unwrap() = Some(data.to_vec());
        self
    }

    /// Report a harness with one concolic argument holding `value`.
    #[must_use]
    pub fn with_harness(mut self, value: &str) -> Self {
        self.shared = Some(harness(value));
        self
    }

    pub fn into_executor(self) -> Executor {
        Executor::Concrete(Arc::new(self))
    }
}

#[async_trait]
impl ConcreteExecutor for ScriptedConcrete {
    async fn image_info(&self) -> DomainResult<Option<ImageInfo>> {
        Ok(self.installed.lock().unwrap().clone())
    }

    async fn update_image(&self, image: &ImageSource) -> DomainResult<()> {
        *self.installed.lock().unwrap() = Some(image.info.clone());
        Ok(())
    }

    async fn commence(&self, _session: &Session) -> DomainResult<()> {
        self.commences.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shared_data(&self) -> DomainResult<GuestData> {
        self.shared
            .clone()
            .ok_or_else(|| DomainError::Process("no harness description".into()))
    }

    async fn execute(&self, test: &TestCase, _processes: &ProcessSlot) -> DomainResult<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let data = input_bytes(test);
        let mut fail = self.fail_once_on.lock().unwrap();
        if fail.as_deref() == Some(data.as_slice()) {
            *fail = None;
            return Err(DomainError::Process("guest crashed".into()));
        }
        Ok(())
    }

    async fn store_trace(&self, test: &TestCase) -> DomainResult<TraceArtifact> {
        let artifact = TraceArtifact::allocate(&self.dir);
        std::fs::create_dir_all(&artifact.dir)?;
        std::fs::write(
            artifact.block_sequence_path(),
            encode_blocks(&program(&input_bytes(test))),
        )?;
        test.write_elements(&artifact.input_path())?;
        std::fs::write(artifact.input_record_path(), serde_json::to_vec(test)?)?;
        Ok(artifact)
    }

    async fn reset(&self) -> DomainResult<()> {
        Ok(())
    }
}

/// Negates each branch the recorded input reached, one test per branch.
#[derive(Debug, Default)]
pub struct ScriptedSymbolic {
    inputs: Mutex<HashMap<TraceId, TestCase>>,
    pub solved: AtomicUsize,
    pub cleaned: AtomicUsize,
    fail_solve: AtomicBool,
}

impl ScriptedSymbolic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_executor(self) -> Executor {
        Executor::Symbolic(Arc::new(self))
    }
}

/// Tests derived from `data`: every matched byte replaced by `z`, and the
/// first unmatched byte fixed to the expected one.
pub fn negations(data: &[u8]) -> Vec<Vec<u8>> {
    let k = matched(data);
    let mut out = Vec::new();
    for j in 0..k.min(MAGIC.len()) {
        let mut next = data.to_vec();
        next[j] = b'z';
        out.push(next);
    }
    if k < MAGIC.len() {
        let mut next = data.to_vec();
        if next.len() <= k {
            next.resize(k + 1, b'x');
        }
        next[k] = MAGIC[k];
        out.push(next);
    }
    out
}

#[async_trait]
impl SymbolicExecutor for ScriptedSymbolic {
    async fn commence(&self, _session: &Session) -> DomainResult<()> {
        Ok(())
    }

    async fn translate(&self, trace: &TraceArtifact, _processes: &ProcessSlot) -> DomainResult<()> {
        let path = trace.input_record_path();
        let bytes = std::fs::read(&path).map_err(|e| DomainError::resource(&path, e))?;
        let test: TestCase = serde_json::from_slice(&bytes)?;
        self.inputs.lock().unwrap().insert(trace.id.clone(), test);
        Ok(())
    }

    async fn solve(&self, _trace: &TraceArtifact, _processes: &ProcessSlot) -> DomainResult<()> {
        if self.fail_solve.swap(false, Ordering::SeqCst) {
            return Err(DomainError::Process("solver crashed".into()));
        }
        self.solved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn collect_tests(&self, trace: &TraceArtifact) -> DomainResult<TestBatch> {
        let input = self
            .inputs
            .lock()
            .unwrap()
            .get(&trace.id)
            .cloned()
            .ok_or_else(|| DomainError::resource(&trace.dir, "trace was not translated"))?;
        let tests = negations(&input_bytes(&input))
            .into_iter()
            .map(|data| {
                let name = input
                    .elements()
                    .first()
                    .map_or_else(|| "argv_1".to_string(), |e| e.name.clone());
                TestCase::new(vec![TestCaseElement::new(name, data)]).diff_against(&input)
            })
            .collect();
        Ok(TestBatch { input, tests })
    }

    async fn clean(&self, trace: &TraceArtifact) -> DomainResult<()> {
        self.inputs.lock().unwrap().remove(&trace.id);
        self.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) -> DomainResult<()> {
        self.inputs.lock().unwrap().clear();
        Ok(())
    }
}
