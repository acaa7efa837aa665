//! The dispatcher: rotates targets, drives every worker state machine once
//! per tick and routes traces and test cases between them.
//!
//! Each tick runs `SpecCheck` and then the action it chose: `NextTarget`
//! followed by `Dispatch`, `Dispatch` alone, or `Terminate`. The trace and
//! test pools are owned here and only touched from the tick.

mod decision;
mod status;

pub use decision::{decide, expiry, Decision, DispatchState, Expiry, Progress, Quotas, Snapshot};
pub use status::{DispatchStatus, WorkerRow};

use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::application::guarded::Guarded;
use crate::application::node_registrar::NodeRegistrar;
use crate::application::worker::{
    CommandConcreteExecutor, CommandSymbolicExecutor, Executor, ImageSource, RecoveryPolicy,
    RemoteWorker, Session, TestBatch, WorkItem, WorkerEvent, WorkerFlags, WorkerFsm,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::Config;
use crate::domain::models::harness::GuestData;
use crate::domain::models::target::{Target, TargetQueue};
use crate::domain::models::test_case::{load_test_dir, TestCase};
use crate::domain::models::trace::{TraceArtifact, TraceId};
use crate::domain::models::worker::{Connection, ImageInfo, WorkerId, WorkerKind, WorkerRecord};
use crate::infrastructure::storage::{RunLayout, RunRoot, StatSample, StatsRecorder};
use crate::services::test_pool::{Admission, TestPool};
use crate::services::trace_graph::InsertOutcome;
use crate::services::trace_pool::{GraphExport, TracePool, TracePoolOptions};

/// Outcome of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub run_root: PathBuf,
    pub ticks: u64,
    pub targets_finished: usize,
    pub status: DispatchStatus,
}

struct WorkerSlot {
    fsm: WorkerFsm,
    executor: Executor,
    /// Connection handle of a registered node.
    remote: Option<RemoteWorker>,
}

impl WorkerSlot {
    fn label(&self) -> String {
        format!("{}-{}", self.fsm.kind().label(), self.fsm.id())
    }
}

pub struct Orchestrator {
    config: Config,
    state: DispatchState,
    policy: RecoveryPolicy,
    quotas: Quotas,
    targets: TargetQueue,
    target: Option<Target>,
    run: RunRoot,
    layout: RunLayout,
    trace_pool: TracePool,
    test_pool: TestPool,
    /// Traces superseded during the current pass, still queued on workers.
    retracted: Vec<TraceId>,
    workers: Vec<WorkerSlot>,
    registrar: NodeRegistrar,
    stats: StatsRecorder,
    started: Instant,
    first: bool,
    seeded: bool,
    shared_data_owner: Option<WorkerId>,
    ticks: u64,
    targets_finished: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state)
            .field("target", &self.target)
            .field("workers", &self.workers.len())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

fn graph_export(config: &Config, layout: &RunLayout) -> Option<GraphExport> {
    config.trace.print_graph.then(|| GraphExport {
        dir: layout.graph_dir(),
        only_branches: config.trace.print_graph_only_branches,
    })
}

/// Move a trace directory, copying when a rename is not possible.
fn move_dir(from: &Path, to: &Path) -> DomainResult<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::create_dir_all(to).map_err(|e| DomainError::resource(to, e))?;
    for entry in std::fs::read_dir(from).map_err(|e| DomainError::resource(from, e))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    std::fs::remove_dir_all(from).map_err(|e| DomainError::resource(from, e))
}

impl Orchestrator {
    /// Create the run root and the pools. In single-target mode the first
    /// configured item (if any) becomes the target right away.
    pub fn new(config: Config, registrar: NodeRegistrar) -> DomainResult<Self> {
        let trace_strategy = config
            .trace
            .strategy()
            .ok_or_else(|| DomainError::InvalidStrategy(config.trace.selection.clone()))?;
        let test_strategy = config
            .test_pool
            .strategy()
            .ok_or_else(|| DomainError::InvalidStrategy(config.test_pool.strategy.clone()))?;
        let distributed = config.is_distributed();

        let mut targets = TargetQueue::from_items(&config.test.items, &config.test.seeds);
        let run = RunRoot::create(&config.dispatch.root)?;
        let (layout, target) = if distributed {
            (run.layout(targets.front())?, None)
        } else {
            (run.layout(None)?, targets.pop())
        };

        let trace_pool = TracePool::new(
            trace_strategy,
            TracePoolOptions {
                compress: config.trace.compress,
                export: graph_export(&config, &layout),
            },
        );
        let test_pool = TestPool::new(
            layout.test_case_dir(),
            layout.test_case_base_dir(),
            test_strategy,
            config.test_pool.base_cache_capacity,
        )?;
        let stats = StatsRecorder::new(layout.profile_dir(), Duration::from_secs(config.profile.interval));
        info!(
            root = %run.path().display(),
            distributed,
            targets = targets.len() + usize::from(target.is_some()),
            "dispatcher ready"
        );

        let mut orchestrator = Self {
            policy: RecoveryPolicy::for_mode(distributed),
            quotas: Quotas::from(&config.interval),
            config,
            state: DispatchState::Start,
            targets,
            target,
            run,
            layout,
            trace_pool,
            test_pool,
            retracted: Vec::new(),
            workers: Vec::new(),
            registrar,
            stats,
            started: Instant::now(),
            first: true,
            seeded: false,
            shared_data_owner: None,
            ticks: 0,
            targets_finished: 0,
        };
        if !distributed {
            orchestrator.seed_from_config()?;
        }
        Ok(orchestrator)
    }

    pub const fn state(&self) -> DispatchState {
        self.state
    }

    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn run_root(&self) -> &Path {
        self.run.path()
    }

    pub const fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub const fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub const fn trace_pool(&self) -> &TracePool {
        &self.trace_pool
    }

    pub const fn test_pool(&self) -> &TestPool {
        &self.test_pool
    }

    pub const fn registrar(&self) -> &NodeRegistrar {
        &self.registrar
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_flags(&self) -> Vec<(WorkerId, WorkerFlags)> {
        self.workers
            .iter()
            .map(|slot| (slot.fsm.id(), slot.fsm.flags()))
            .collect()
    }

    /// Add a worker under `id`. It receives its configuration on the next
    /// dispatch pass.
    pub fn attach(&mut self, id: WorkerId, executor: Executor, connection: Connection) {
        let mut record = WorkerRecord::new(id, executor.kind(), connection);
        record.target = self.target.clone();
        let fsm = WorkerFsm::new(Guarded::new(record), &executor, self.policy);
        info!(worker = id, kind = %executor.kind(), %connection, "worker attached");
        self.workers.push(WorkerSlot {
            fsm,
            executor,
            remote: None,
        });
    }

    /// Add an in-process worker and return its id.
    pub fn attach_local(&mut self, executor: Executor) -> WorkerId {
        let id = self.registrar.register_local(executor.kind());
        self.attach(id, executor, Connection::Local);
        id
    }

    /// Start the in-process workers the configuration asks for.
    pub fn spawn_local_workers(&mut self) {
        let work_dir = self.config.workers.work_dir.clone();
        for _ in 0..self.config.workers.concrete {
            let id = self.registrar.register_local(WorkerKind::Concrete);
            let exec = CommandConcreteExecutor::new(id, work_dir.join(format!("vm-{id}")), self.config.vm.clone());
            self.attach(id, Executor::Concrete(Arc::new(exec)), Connection::Local);
        }
        for _ in 0..self.config.workers.symbolic {
            let id = self.registrar.register_local(WorkerKind::Symbolic);
            let exec = CommandSymbolicExecutor::new(id, work_dir.join(format!("svm-{id}")), self.config.svm.clone());
            self.attach(id, Executor::Symbolic(Arc::new(exec)), Connection::Local);
        }
    }

    /// Attach nodes that registered since the last tick.
    fn attach_pending(&mut self) {
        for node in self.registrar.drain() {
            let connection = node
                .connection
                .peer()
                .map_or(Connection::Local, |peer| Connection::Remote { peer });
            let staging = self.config.workers.work_dir.join(format!("node-{}", node.id));
            let remote = RemoteWorker::new(node.id, node.connection, staging);
            let executor = match node.kind {
                WorkerKind::Concrete => Executor::Concrete(Arc::new(remote.clone())),
                WorkerKind::Symbolic => Executor::Symbolic(Arc::new(remote.clone())),
            };
            self.attach(node.id, executor, connection);
            if let Some(slot) = self.workers.last_mut() {
                slot.remote = Some(remote);
            }
        }
    }

    fn enter(&mut self, next: DispatchState) {
        if self.state == next {
            return;
        }
        match next {
            DispatchState::NextTarget | DispatchState::Terminate | DispatchState::Terminated => {
                info!(from = %self.state, to = %next, "dispatch state");
            }
            _ => debug!(from = %self.state, to = %next, "dispatch state"),
        }
        self.state = next;
    }

    /// All work for the current target is done: the pools are empty and no
    /// worker is busy, holds queued work or is recovering from an error.
    pub fn converged(&self) -> bool {
        self.seeded
            && !self.workers.is_empty()
            && self.test_pool.count_next() == 0
            && self.trace_pool.count_next() == 0
            && self.workers.iter().all(|slot| {
                let flags = slot.fsm.flags();
                flags.terminated || (!flags.active && slot.fsm.record().acquire().queued_work() == 0)
            })
    }

    pub fn expired(&self) -> Option<Expiry> {
        expiry(
            &self.quotas,
            &Progress {
                unique_traces: self.trace_pool.count_all_unique() as u64,
                tests: self.test_pool.count_all(),
                elapsed: self.started.elapsed(),
                converged: self.converged(),
            },
        )
    }

    fn snapshot(&self) -> Snapshot {
        let expired = if self.first {
            None
        } else {
            self.expired()
        };
        if let Some(reason) = expired {
            info!(
                target = self.target.as_ref().map_or("<none>", |t| t.name.as_str()),
                reason = reason.as_str(),
                "target expired"
            );
        }
        Snapshot {
            first: self.first,
            expired: expired.is_some(),
            has_next: self.targets.has_next(),
            distributed: self.config.is_distributed(),
        }
    }

    /// Run one `SpecCheck` and the action it chooses.
    #[instrument(skip(self), fields(tick = self.ticks + 1))]
    pub async fn tick(&mut self) -> DomainResult<DispatchState> {
        if self.state == DispatchState::Terminated {
            return Ok(self.state);
        }
        self.ticks += 1;
        self.attach_pending();

        self.enter(DispatchState::SpecCheck);
        match decide(&self.snapshot()) {
            Decision::NextTarget => {
                self.enter(DispatchState::NextTarget);
                self.next_target().await?;
                self.enter(DispatchState::Dispatch);
                self.dispatch().await?;
            }
            Decision::Dispatch => {
                self.enter(DispatchState::Dispatch);
                self.dispatch().await?;
            }
            Decision::Terminate => self.stop().await,
        }
        self.first = false;

        if self.state != DispatchState::Terminated {
            self.sample_stats();
        }
        Ok(self.state)
    }

    /// Tick until terminated, `max_ticks` is reached or `shutdown` flips.
    pub async fn run(
        &mut self,
        max_ticks: Option<u64>,
        shutdown: watch::Receiver<bool>,
        mut on_tick: impl FnMut(&Self),
    ) -> DomainResult<DispatchReport> {
        let poll = Duration::from_millis(self.config.dispatch.poll_interval_ms);
        loop {
            if self.tick().await? == DispatchState::Terminated {
                break;
            }
            on_tick(self);
            if max_ticks.is_some_and(|max| self.ticks >= max) {
                info!(ticks = self.ticks, "tick limit reached");
                self.stop().await;
                break;
            }
            tokio::time::sleep(poll).await;
            if *shutdown.borrow() {
                info!("shutdown requested");
                self.stop().await;
                break;
            }
        }
        Ok(self.report())
    }

    pub fn report(&self) -> DispatchReport {
        DispatchReport {
            run_root: self.run.path().to_path_buf(),
            ticks: self.ticks,
            targets_finished: self.targets_finished,
            status: self.status(),
        }
    }

    pub fn status(&self) -> DispatchStatus {
        DispatchStatus {
            target: self.target.as_ref().map(|t| t.name.clone()),
            elapsed_secs: self.started.elapsed().as_secs(),
            tests_left: self.test_pool.count_next(),
            tests_total: self.test_pool.count_all(),
            duplicate_tests: self.test_pool.duplicate_count(),
            traces_left: self.trace_pool.count_next(),
            traces_total: self.trace_pool.count_all_unique(),
            workers: self
                .workers
                .iter()
                .map(|slot| {
                    let record = slot.fsm.record().acquire();
                    WorkerRow {
                        id: record.id,
                        kind: record.kind,
                        connection: record.connection.to_string(),
                        state: slot.fsm.state_name(),
                        status: record.status(),
                    }
                })
                .collect(),
        }
    }

    /// Finish the current target, stop every worker and release remote nodes.
    pub async fn stop(&mut self) {
        if self.state == DispatchState::Terminated {
            return;
        }
        self.enter(DispatchState::Terminate);
        if let Err(e) = self.finish_target() {
            warn!(error = %e, "cannot write target summary");
        }
        for slot in &mut self.workers {
            slot.fsm.terminate().await;
            if let Some(remote) = &slot.remote {
                if let Err(e) = remote.shutdown().await {
                    debug!(worker = remote.id(), error = %e, "node already gone");
                }
            }
        }
        self.enter(DispatchState::Terminated);
        info!(
            ticks = self.ticks,
            targets = self.targets_finished,
            root = %self.run.path().display(),
            "dispatch terminated"
        );
    }

    fn finish_target(&mut self) -> DomainResult<()> {
        let status = self.status();
        self.layout
            .write_finish(&status.to_string(), &self.test_pool.test_tree())?;
        self.targets_finished += 1;
        info!(
            target = status.target.as_deref().unwrap_or("<none>"),
            tests = status.tests_total,
            traces = status.traces_total,
            duplicates = status.duplicate_tests,
            "target finished"
        );
        Ok(())
    }

    async fn next_target(&mut self) -> DomainResult<()> {
        if !self.first {
            self.finish_target()?;
            if let Err(e) = self.layout.remove_traces() {
                warn!(error = %e, "cannot reclaim trace storage");
            }
        }
        let target = self
            .targets
            .pop()
            .ok_or_else(|| DomainError::GraphConsistency("target rotation with an empty queue".into()))?;
        info!(target = %target.name, remaining = self.targets.len(), "starting target");

        self.layout = self.run.layout(Some(&target))?;
        self.trace_pool.clear();
        self.retracted.clear();
        self.trace_pool.set_export(graph_export(&self.config, &self.layout));
        self.test_pool.clear();
        self.test_pool
            .relocate(&self.layout.test_case_dir(), &self.layout.test_case_base_dir())?;
        self.stats = StatsRecorder::new(
            self.layout.profile_dir(),
            Duration::from_secs(self.config.profile.interval),
        );
        self.started = Instant::now();
        self.seeded = false;
        self.shared_data_owner = None;
        self.target = Some(target.clone());

        for slot in &mut self.workers {
            slot.fsm.terminate().await;
        }
        self.detach_broken_nodes().await;
        for slot in &mut self.workers {
            let record = slot.fsm.record().clone();
            record.with(|r| r.reset_runtime(Some(target.clone())));
            slot.fsm = WorkerFsm::new(record, &slot.executor, self.policy);
        }
        self.seed_from_config()
    }

    /// Seed from the target's seed directory, else from `vm.initial_tc`.
    /// Without either, seeding waits for the harness description.
    fn seed_from_config(&mut self) -> DomainResult<()> {
        let mut seeds = Vec::new();
        if let Some(dir) = self.target.as_ref().and_then(|t| t.seeds.clone()) {
            seeds = load_test_dir(&dir)?;
            if seeds.is_empty() {
                warn!(dir = %dir.display(), "seed directory holds no test cases");
            }
        }
        if seeds.is_empty() {
            seeds.extend(self.config.vm.initial_test_case());
        }
        if seeds.is_empty() {
            return Ok(());
        }
        self.seed(&seeds, "configuration")
    }

    fn seed(&mut self, tests: &[TestCase], source: &str) -> DomainResult<()> {
        let mut accepted = 0;
        for tc in tests {
            if let Admission::Accepted(_) = self.test_pool.insert(tc)? {
                accepted += 1;
            }
        }
        self.seeded = true;
        info!(source, offered = tests.len(), accepted, "test pool seeded");
        Ok(())
    }

    async fn dispatch(&mut self) -> DomainResult<()> {
        let mut workers = std::mem::take(&mut self.workers);
        let mut fatal = None;
        for slot in &mut workers {
            match self.dispatch_worker(slot).await {
                Ok(()) => {}
                Err(e @ DomainError::GraphConsistency(_)) => {
                    fatal = Some(e);
                    break;
                }
                Err(e) => self.report_exception(slot, &e),
            }
        }
        workers.append(&mut self.workers);
        self.workers = workers;
        fatal.map_or(Ok(()), Err)?;
        self.settle_traces();
        self.detach_broken_nodes().await;
        Ok(())
    }

    /// Drop superseded traces from worker queues and reclaim the directories
    /// of those no live worker still holds.
    fn settle_traces(&mut self) {
        if !self.retracted.is_empty() {
            let retracted: HashSet<TraceId> = self.retracted.drain(..).collect();
            for slot in &self.workers {
                let dropped = slot.fsm.record().with(|r| {
                    let before = r.queued_traces.len();
                    r.queued_traces.retain(|trace| !retracted.contains(&trace.id));
                    before - r.queued_traces.len()
                });
                if dropped > 0 {
                    debug!(worker = %slot.label(), dropped, "superseded traces dropped from queue");
                }
            }
        }
        if self.trace_pool.retired_count() == 0 {
            return;
        }
        let mut held = HashSet::new();
        for slot in self.workers.iter().filter(|slot| !slot.fsm.flags().terminated) {
            held.extend(slot.fsm.analyzing().cloned());
            let record = slot.fsm.record().acquire();
            held.extend(record.queued_traces.iter().map(|trace| trace.id.clone()));
        }
        let reclaimed = self.trace_pool.reclaim(&held);
        if reclaimed > 0 {
            debug!(reclaimed, "superseded trace directories removed");
        }
    }

    /// Drop nodes whose connection can no longer match replies to requests.
    async fn detach_broken_nodes(&mut self) {
        let mut index = 0;
        while index < self.workers.len() {
            let broken = self.workers[index]
                .remote
                .as_ref()
                .is_some_and(RemoteWorker::is_out_of_step);
            if !broken {
                index += 1;
                continue;
            }
            let mut slot = self.workers.remove(index);
            let err = DomainError::Protocol(format!("connection to {} is out of step", slot.label()));
            self.report_exception(&slot, &err);
            slot.fsm.terminate().await;
            if let Some(remote) = &slot.remote {
                if let Err(e) = remote.shutdown().await {
                    debug!(worker = remote.id(), error = %e, "node already gone");
                }
            }
            warn!(worker = %slot.label(), "node detached");
        }
    }

    async fn dispatch_worker(&mut self, slot: &mut WorkerSlot) -> DomainResult<()> {
        let flags = slot.fsm.flags();
        if flags.terminated {
            return Ok(());
        }
        if flags.error_ready {
            self.collect_errors(slot).await?;
        }

        if flags.needs_config {
            let session = self.session_for(slot.fsm.id(), slot.fsm.kind());
            slot.fsm.process(WorkerEvent::Config(session)).await?;
        } else if flags.needs_image {
            let image = self.image_source()?;
            slot.fsm.process(WorkerEvent::Image(image)).await?;
        }

        match &mut slot.fsm {
            WorkerFsm::Concrete(fsm) if flags.shared_data_ready => {
                let data = fsm.take_shared_data();
                fsm.process(WorkerEvent::Collected).await?;
                if let Some(data) = data {
                    self.ingest_shared_data(&data)?;
                }
            }
            WorkerFsm::Concrete(fsm) if flags.trace_ready => {
                let trace = fsm.take_trace();
                fsm.process(WorkerEvent::Collected).await?;
                if let Some(trace) = trace {
                    self.ingest_trace(&trace)?;
                }
            }
            WorkerFsm::Symbolic(fsm) if flags.result_ready => {
                let batch = fsm.take_batch();
                fsm.process(WorkerEvent::Collected).await?;
                if let Some(batch) = batch {
                    self.ingest_batch(&batch)?;
                }
            }
            _ => {}
        }

        self.top_up(slot).await?;
        slot.fsm.process(WorkerEvent::Poll).await?;
        Ok(())
    }

    async fn collect_errors(&mut self, slot: &mut WorkerSlot) -> DomainResult<()> {
        let errors = slot.fsm.record().with(WorkerRecord::take_errors);
        for err in &errors {
            match self.layout.record_node_error(err) {
                Ok(path) => warn!(
                    worker = err.worker_id,
                    kind = %err.kind,
                    state = %err.state,
                    log = %path.display(),
                    "worker error recorded"
                ),
                Err(e) => error!(worker = err.worker_id, error = %e, "cannot record worker error"),
            }
        }
        slot.fsm.process(WorkerEvent::ErrorsCollected).await?;
        Ok(())
    }

    /// The first concrete worker configured for a target also reports the
    /// target's harness description.
    fn session_for(&mut self, id: WorkerId, kind: WorkerKind) -> Session {
        let concrete = kind == WorkerKind::Concrete;
        let fetch_shared_data = concrete
            && match self.shared_data_owner {
                Some(owner) => owner == id,
                None => {
                    self.shared_data_owner = Some(id);
                    true
                }
            };
        Session {
            target: self.target.clone(),
            sync_image: concrete && self.config.image.update && self.config.image.path.is_some(),
            fetch_shared_data,
        }
    }

    fn image_source(&self) -> DomainResult<ImageSource> {
        let path = self.config.image.path.clone().ok_or_else(|| {
            DomainError::ValidationFailed("a worker asked for an image but none is configured".into())
        })?;
        let info = ImageInfo::from_path(&path).map_err(|e| DomainError::resource(&path, e))?;
        Ok(ImageSource { path, info })
    }

    fn ingest_shared_data(&mut self, data: &GuestData) -> DomainResult<()> {
        let path = self.layout.write_guest_data(data)?;
        debug!(path = %path.display(), "harness description stored");
        if self.seeded {
            return Ok(());
        }
        self.seed(std::slice::from_ref(&data.initial_test_case()), "harness")
    }

    fn ingest_trace(&mut self, artifact: &TraceArtifact) -> DomainResult<()> {
        let stored = TraceArtifact {
            id: artifact.id.clone(),
            dir: self.layout.trace_dir().join(&artifact.id),
        };
        move_dir(&artifact.dir, &stored.dir)?;
        let outcome = self.trace_pool.insert(stored)?;
        if let InsertOutcome::Superseded { replaced } = &outcome {
            self.retracted.push(replaced.clone());
        }
        debug!(
            trace = %artifact.id,
            novel = outcome.is_novel(),
            unique = self.trace_pool.count_all_unique(),
            "trace ingested"
        );
        Ok(())
    }

    fn ingest_batch(&mut self, batch: &TestBatch) -> DomainResult<()> {
        let parent = batch.input.issue_index();
        if parent.is_some() && !batch.input.is_patch() {
            self.test_pool.insert_base(&batch.input)?;
        }
        let admissions = self.test_pool.insert_batch(&batch.tests, parent)?;
        let accepted = admissions
            .iter()
            .filter(|a| matches!(a, Admission::Accepted(_)))
            .count();
        debug!(
            parent = ?parent,
            generated = batch.tests.len(),
            accepted,
            "test cases ingested"
        );
        Ok(())
    }

    /// Hand out work until the worker's queue reaches its low-water mark.
    async fn top_up(&mut self, slot: &mut WorkerSlot) -> DomainResult<()> {
        if !slot.fsm.flags().accepting_work {
            return Ok(());
        }
        let kind = slot.fsm.kind();
        let limit = match kind {
            WorkerKind::Concrete => self.config.dispatch.vm_test_multiplier,
            WorkerKind::Symbolic => self.config.dispatch.vm_trace_multiplier,
        }
        .max(1);

        while slot.fsm.record().acquire().queued_work() < limit {
            let item = match kind {
                WorkerKind::Concrete => self.test_pool.next().map(WorkItem::Test),
                WorkerKind::Symbolic => self.trace_pool.next()?.map(WorkItem::Trace),
            };
            let Some(item) = item else {
                break;
            };
            if slot.fsm.process(WorkerEvent::Work(item)).await? == crate::application::worker::Handled::Ignored {
                warn!(worker = slot.fsm.id(), "worker refused work");
                break;
            }
        }
        Ok(())
    }

    fn report_exception(&self, slot: &WorkerSlot, err: &DomainError) {
        let label = slot.label();
        let state = slot.fsm.state_name();
        error!(worker = %label, state, error = %err, "dispatch to worker failed");
        if let Err(e) = self
            .layout
            .record_exception(self.target.as_ref(), &label, state, err)
        {
            warn!(error = %e, "cannot write exception log");
        }
    }

    fn sample_stats(&mut self) {
        let sample = StatSample {
            tests_left: self.test_pool.count_next(),
            tests_total: self.test_pool.count_all(),
            traces_left: self.trace_pool.count_next(),
            traces_total: self.trace_pool.count_all_unique(),
        };
        if let Err(e) = self.stats.record(self.started.elapsed(), sample) {
            warn!(error = %e, "cannot write statistics");
        }
    }
}
