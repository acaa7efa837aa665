//! State machine driving one symbolic-execution worker.
//!
//! `Start → Commence → NextTrace → Translating → Executing → StoreResult →
//! ResultReady → NextTrace`

use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::guarded::Guarded;
use crate::application::worker::executor::{SymbolicExecutor, TestBatch};
use crate::application::worker::lifecycle::{
    expect_output, Handled, Lifecycle, RecoveryPolicy, TaskOutput, Validity, WorkItem,
    WorkerEvent, WorkerFlags,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::trace::{TraceArtifact, TraceId};
use crate::domain::models::worker::WorkerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicState {
    Start,
    Commence,
    NextTrace,
    Translating,
    Executing,
    StoreResult,
    ResultReady,
}

impl SymbolicState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Commence => "commence",
            Self::NextTrace => "next-trace",
            Self::Translating => "translating",
            Self::Executing => "executing",
            Self::StoreResult => "store-result",
            Self::ResultReady => "result-ready",
        }
    }

    const fn in_work_loop(self) -> bool {
        !matches!(self, Self::Start | Self::Commence)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolicGuards {
    pub task_finished: bool,
    pub has_queued_trace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicAction {
    None,
    Commence,
    TranslateQueued,
    TranslateItem,
    Solve,
    Collect,
    Capture,
    /// Remove what the finished trace left behind.
    Clean,
}

/// Transition table. `None` means the event is not handled in `state`.
pub fn transition(
    state: SymbolicState,
    event: &WorkerEvent,
    g: &SymbolicGuards,
) -> Option<(SymbolicState, SymbolicAction)> {
    use SymbolicAction as A;
    use SymbolicState as S;

    match (state, event) {
        (S::Start, WorkerEvent::Config(_)) => Some((S::Commence, A::Commence)),
        (S::Commence, WorkerEvent::Poll) if g.task_finished => Some((S::NextTrace, A::None)),
        (S::NextTrace, WorkerEvent::Poll) if g.task_finished && g.has_queued_trace => {
            Some((S::Translating, A::TranslateQueued))
        }
        (S::NextTrace, WorkerEvent::Work(WorkItem::Trace(_))) if g.task_finished => {
            Some((S::Translating, A::TranslateItem))
        }
        (S::Translating, WorkerEvent::Poll) if g.task_finished => Some((S::Executing, A::Solve)),
        (S::Executing, WorkerEvent::Poll) if g.task_finished => Some((S::StoreResult, A::Collect)),
        (S::StoreResult, WorkerEvent::Poll) if g.task_finished => {
            Some((S::ResultReady, A::Capture))
        }
        (S::ResultReady, WorkerEvent::Collected) => Some((S::NextTrace, A::Clean)),
        _ => None,
    }
}

/// A symbolic worker: turns traces into new test cases.
pub struct SymbolicFsm {
    state: SymbolicState,
    life: Lifecycle,
    executor: Arc<dyn SymbolicExecutor>,
    current: Option<TraceArtifact>,
    batch: Option<TestBatch>,
}

impl std::fmt::Debug for SymbolicFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolicFsm")
            .field("state", &self.state)
            .field("liveness", &self.life.liveness)
            .field("validity", &self.life.validity)
            .finish_non_exhaustive()
    }
}

impl SymbolicFsm {
    pub fn new(
        record: Guarded<WorkerRecord>,
        executor: Arc<dyn SymbolicExecutor>,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            state: SymbolicState::Start,
            life: Lifecycle::new(record, policy),
            executor,
            current: None,
            batch: None,
        }
    }

    pub const fn state(&self) -> SymbolicState {
        self.state
    }

    pub const fn record(&self) -> &Guarded<WorkerRecord> {
        &self.life.record
    }

    pub const fn validity(&self) -> Validity {
        self.life.validity
    }

    pub fn flags(&self) -> WorkerFlags {
        let mut flags = self
            .life
            .base_flags(self.state == SymbolicState::NextTrace, self.state.in_work_loop());
        if flags.terminated {
            return flags;
        }
        flags.needs_config = self.state == SymbolicState::Start;
        flags.result_ready = self.state == SymbolicState::ResultReady;
        flags
    }

    /// The trace between `Translating` and its cleanup.
    pub fn analyzing(&self) -> Option<&TraceId> {
        self.current.as_ref().map(|trace| &trace.id)
    }

    /// Test cases published in `ResultReady`.
    pub fn take_batch(&mut self) -> Option<TestBatch> {
        self.batch.take()
    }

    pub async fn process(&mut self, event: WorkerEvent) -> DomainResult<Handled> {
        if self.life.is_terminated() {
            return Ok(Handled::Ignored);
        }
        if self.life.apply_regions(&event).await {
            self.sync_status();
            return Ok(Handled::Applied);
        }

        if matches!(event, WorkerEvent::Poll) {
            if let Err(err) = self.life.task.poll() {
                self.fail(err).await;
                self.sync_status();
                return Ok(Handled::Applied);
            }
        }

        let guards = SymbolicGuards {
            task_finished: self.life.task.is_finished(),
            has_queued_trace: self.life.queued_work() > 0,
        };
        let Some((next, action)) = transition(self.state, &event, &guards) else {
            return Ok(self.unhandled(event));
        };

        if let WorkerEvent::Config(session) = &event {
            self.life.session = Some(session.clone());
        }

        let worker = self.life.record.acquire().id;
        debug!(
            worker,
            kind = "symbolic",
            from = self.state.as_str(),
            to = next.as_str(),
            event = event.name(),
            "transition"
        );
        self.state = next;

        if let Err(err) = self.perform(action, event) {
            self.fail(err).await;
        }
        self.sync_status();
        Ok(Handled::Applied)
    }

    fn unhandled(&mut self, event: WorkerEvent) -> Handled {
        match event {
            WorkerEvent::Work(WorkItem::Trace(trace)) => {
                self.life.record.with(|r| r.queued_traces.push_back(trace));
                Handled::Queued
            }
            WorkerEvent::Work(WorkItem::Test(_)) => {
                warn!("symbolic worker does not take test cases");
                Handled::Ignored
            }
            _ => Handled::Ignored,
        }
    }

    fn perform(&mut self, action: SymbolicAction, event: WorkerEvent) -> DomainResult<()> {
        let executor = Arc::clone(&self.executor);
        let processes = self.life.processes.clone();
        match action {
            SymbolicAction::None => Ok(()),
            SymbolicAction::Commence => {
                let session = self.life.session.clone().unwrap_or_default();
                self.life.spawn(async move {
                    executor.commence(&session).await?;
                    Ok(TaskOutput::Done)
                })
            }
            SymbolicAction::TranslateQueued => {
                let trace = self
                    .life
                    .record
                    .with(|r| r.queued_traces.pop_front())
                    .ok_or_else(|| DomainError::GraphConsistency("trace queue drained under guard".into()))?;
                self.translate(trace)
            }
            SymbolicAction::TranslateItem => match event {
                WorkerEvent::Work(WorkItem::Trace(trace)) => self.translate(trace),
                other => Err(DomainError::InvalidTransition {
                    from: self.state.as_str().into(),
                    event: other.name().into(),
                }),
            },
            SymbolicAction::Solve => {
                let trace = self.current_trace()?;
                self.life.spawn(async move {
                    executor.solve(&trace, &processes).await?;
                    Ok(TaskOutput::Done)
                })
            }
            SymbolicAction::Collect => {
                let trace = self.current_trace()?;
                self.life
                    .spawn(async move { Ok(TaskOutput::Tests(executor.collect_tests(&trace).await?)) })
            }
            SymbolicAction::Capture => match expect_output(&self.life.task, self.state.as_str())? {
                TaskOutput::Tests(batch) => {
                    self.batch = Some(batch);
                    Ok(())
                }
                other => Err(DomainError::GraphConsistency(format!(
                    "unexpected task output {other:?} in {}",
                    self.state.as_str()
                ))),
            },
            SymbolicAction::Clean => {
                let Some(trace) = self.current.take() else {
                    return Ok(());
                };
                self.life.spawn(async move {
                    executor.clean(&trace).await?;
                    Ok(TaskOutput::Done)
                })
            }
        }
    }

    fn translate(&mut self, trace: TraceArtifact) -> DomainResult<()> {
        let executor = Arc::clone(&self.executor);
        let processes = self.life.processes.clone();
        self.current = Some(trace.clone());
        self.life.spawn(async move {
            executor.translate(&trace, &processes).await?;
            Ok(TaskOutput::Done)
        })
    }

    fn current_trace(&self) -> DomainResult<TraceArtifact> {
        self.current
            .clone()
            .ok_or_else(|| DomainError::GraphConsistency("no trace under analysis".into()))
    }

    async fn fail(&mut self, err: DomainError) {
        self.life.report(self.state.as_str(), &err, None);
        self.life.validity = Validity::Error;

        match self.life.policy {
            RecoveryPolicy::Terminate => self.life.terminate().await,
            RecoveryPolicy::Restart => {
                self.life.discard_task().await;
                self.batch = None;
                self.state = SymbolicState::Commence;

                let executor = Arc::clone(&self.executor);
                let session = self.life.session.clone().unwrap_or_default();
                let abandoned = self.current.take();
                let restart = self.life.spawn(async move {
                    if let Some(trace) = abandoned {
                        if let Err(e) = executor.clean(&trace).await {
                            debug!(error = %e, "cleanup of abandoned trace failed");
                        }
                    }
                    executor.reset().await?;
                    executor.commence(&session).await?;
                    Ok(TaskOutput::Done)
                });
                if let Err(e) = restart {
                    warn!(error = %e, "could not restart worker, terminating");
                    self.life.terminate().await;
                }
            }
        }
    }

    fn sync_status(&self) {
        let active = self.flags().active;
        self.life.record.with(|r| r.active = active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::worker::executor::Session;
    use crate::application::worker::process::ProcessSlot;
    use crate::domain::models::test_case::{TestCase, TestCaseElement};
    use crate::domain::models::worker::{Connection, WorkerKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Scripted {
        fail_solve: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SymbolicExecutor for Scripted {
        async fn commence(&self, _session: &Session) -> DomainResult<()> {
            self.calls.lock().unwrap().push("commence".into());
            Ok(())
        }
        async fn translate(&self, trace: &TraceArtifact, _p: &ProcessSlot) -> DomainResult<()> {
            self.calls.lock().unwrap().push(format!("translate {}", trace.id));
            Ok(())
        }
        async fn solve(&self, trace: &TraceArtifact, _p: &ProcessSlot) -> DomainResult<()> {
            self.calls.lock().unwrap().push(format!("solve {}", trace.id));
            if self.fail_solve.load(Ordering::SeqCst) {
                return Err(DomainError::Process("solver crashed".into()));
            }
            Ok(())
        }
        async fn collect_tests(&self, _trace: &TraceArtifact) -> DomainResult<TestBatch> {
            Ok(TestBatch {
                input: TestCase::default().with_issue_index(1),
                tests: vec![TestCase::patch(
                    1,
                    vec![TestCaseElement::new("argv_1", b"y".to_vec())],
                )],
            })
        }
        async fn clean(&self, trace: &TraceArtifact) -> DomainResult<()> {
            self.calls.lock().unwrap().push(format!("clean {}", trace.id));
            Ok(())
        }
        async fn reset(&self) -> DomainResult<()> {
            self.calls.lock().unwrap().push("reset".into());
            Ok(())
        }
    }

    fn fsm(policy: RecoveryPolicy) -> (SymbolicFsm, Arc<Scripted>) {
        let exec = Arc::new(Scripted::default());
        let record = Guarded::new(WorkerRecord::new(7, WorkerKind::Symbolic, Connection::Local));
        (SymbolicFsm::new(record, exec.clone(), policy), exec)
    }

    fn trace(id: &str) -> TraceArtifact {
        TraceArtifact {
            id: id.into(),
            dir: format!("/tmp/{id}").into(),
        }
    }

    async fn poll_until(fsm: &mut SymbolicFsm, done: impl Fn(&SymbolicFsm) -> bool) {
        for _ in 0..400 {
            if done(fsm) {
                return;
            }
            fsm.process(WorkerEvent::Poll).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached, state {:?}", fsm.state());
    }

    #[test]
    fn test_transition_table() {
        let finished = SymbolicGuards {
            task_finished: true,
            has_queued_trace: false,
        };
        assert_eq!(
            transition(SymbolicState::NextTrace, &WorkerEvent::Poll, &finished),
            None
        );
        assert_eq!(
            transition(SymbolicState::ResultReady, &WorkerEvent::Collected, &finished),
            Some((SymbolicState::NextTrace, SymbolicAction::Clean))
        );
        assert_eq!(
            transition(
                SymbolicState::Translating,
                &WorkerEvent::Poll,
                &SymbolicGuards::default()
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_trace_to_batch_cycle() {
        let (mut fsm, exec) = fsm(RecoveryPolicy::Restart);
        assert!(fsm.flags().needs_config);
        fsm.process(WorkerEvent::Config(Session::default())).await.unwrap();
        poll_until(&mut fsm, |f| f.flags().idle).await;

        fsm.record().with(|r| r.queued_traces.push_back(trace("a")));
        poll_until(&mut fsm, |f| f.flags().result_ready).await;
        let batch = fsm.take_batch().unwrap();
        assert_eq!(batch.tests.len(), 1);

        fsm.process(WorkerEvent::Collected).await.unwrap();
        poll_until(&mut fsm, |f| f.flags().idle).await;
        assert_eq!(
            *exec.calls.lock().unwrap(),
            vec!["commence", "translate a", "solve a", "clean a"]
        );
    }

    #[tokio::test]
    async fn test_work_while_busy_is_queued() {
        let (mut fsm, _exec) = fsm(RecoveryPolicy::Restart);
        fsm.process(WorkerEvent::Config(Session::default())).await.unwrap();
        let handled = fsm.process(WorkerEvent::Work(WorkItem::Trace(trace("b")))).await.unwrap();
        assert_eq!(handled, Handled::Queued);
        assert_eq!(fsm.record().acquire().queued_traces.len(), 1);
    }

    #[tokio::test]
    async fn test_solver_failure_recovers() {
        let (mut fsm, exec) = fsm(RecoveryPolicy::Restart);
        exec.fail_solve.store(true, Ordering::SeqCst);
        fsm.process(WorkerEvent::Config(Session::default())).await.unwrap();
        poll_until(&mut fsm, |f| f.state() == SymbolicState::NextTrace).await;
        fsm.record().with(|r| r.queued_traces.push_back(trace("c")));
        poll_until(&mut fsm, |f| f.flags().error_ready).await;

        assert_eq!(fsm.state(), SymbolicState::Commence);
        assert!(fsm.flags().active);
        let errors = fsm.record().with(|r| r.take_errors());
        assert_eq!(errors[0].state, "executing");
        assert!(errors[0].input.is_none());

        exec.fail_solve.store(false, Ordering::SeqCst);
        fsm.process(WorkerEvent::ErrorsCollected).await.unwrap();
        poll_until(&mut fsm, |f| f.flags().idle).await;
        let calls = exec.calls.lock().unwrap();
        assert!(calls.contains(&"clean c".to_string()));
        assert!(calls.contains(&"reset".to_string()));
    }

    #[tokio::test]
    async fn test_terminated_worker_never_resumes() {
        let (mut fsm, _exec) = fsm(RecoveryPolicy::Restart);
        fsm.process(WorkerEvent::Terminate).await.unwrap();
        assert!(fsm.flags().terminated);
        let handled = fsm.process(WorkerEvent::Config(Session::default())).await.unwrap();
        assert_eq!(handled, Handled::Ignored);
        assert!(!fsm.flags().needs_config);
    }
}
