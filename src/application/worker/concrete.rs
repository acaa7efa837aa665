//! State machine driving one concrete-execution worker.
//!
//! `Start → [ValidateImage → UpdateImage] → Commence → [RxSharedData →
//! SharedDataReady] → NextTest → Executing → StoreTrace → TraceReady → NextTest`

use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::guarded::Guarded;
use crate::application::worker::executor::{ConcreteExecutor, ImageSource};
use crate::application::worker::lifecycle::{
    expect_output, Handled, Lifecycle, RecoveryPolicy, TaskOutput, Validity, WorkItem,
    WorkerEvent, WorkerFlags,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::harness::GuestData;
use crate::domain::models::test_case::TestCase;
use crate::domain::models::trace::TraceArtifact;
use crate::domain::models::worker::WorkerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcreteState {
    Start,
    ValidateImage,
    UpdateImage,
    Commence,
    RxSharedData,
    SharedDataReady,
    NextTest,
    Executing,
    StoreTrace,
    TraceReady,
}

impl ConcreteState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ValidateImage => "validate-image",
            Self::UpdateImage => "update-image",
            Self::Commence => "commence",
            Self::RxSharedData => "rx-shared-data",
            Self::SharedDataReady => "shared-data-ready",
            Self::NextTest => "next-test",
            Self::Executing => "executing",
            Self::StoreTrace => "store-trace",
            Self::TraceReady => "trace-ready",
        }
    }

    const fn in_work_loop(self) -> bool {
        matches!(
            self,
            Self::NextTest | Self::Executing | Self::StoreTrace | Self::TraceReady
        )
    }
}

/// Snapshot the guards are evaluated on.
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ConcreteGuards {
    pub task_finished: bool,
    /// No image has been offered yet.
    pub image_pending: bool,
    /// Result of the validation task, once taken.
    pub image_valid: Option<bool>,
    pub fetch_shared_data: bool,
    pub has_queued_test: bool,
}

/// Side effect attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcreteAction {
    None,
    ValidateImage,
    UpdateImage,
    Commence,
    FetchSharedData,
    ExecuteQueued,
    ExecuteItem,
    StoreTrace,
    /// Keep the finished task's output for the orchestrator.
    Capture,
}

/// Transition table. `None` means the event is not handled in `state`.
pub fn transition(
    state: ConcreteState,
    event: &WorkerEvent,
    g: &ConcreteGuards,
) -> Option<(ConcreteState, ConcreteAction)> {
    use ConcreteAction as A;
    use ConcreteState as S;

    match (state, event) {
        (S::Start, WorkerEvent::Config(session)) => Some(if session.sync_image {
            (S::ValidateImage, A::None)
        } else {
            (S::Commence, A::Commence)
        }),
        (S::ValidateImage, WorkerEvent::Image(_)) if g.image_pending => {
            Some((S::ValidateImage, A::ValidateImage))
        }
        (S::ValidateImage, WorkerEvent::Poll) if !g.image_pending && g.task_finished => {
            Some(if g.image_valid? {
                (S::Commence, A::Commence)
            } else {
                (S::UpdateImage, A::UpdateImage)
            })
        }
        (S::UpdateImage, WorkerEvent::Poll) if g.task_finished => Some((S::Commence, A::Commence)),
        (S::Commence, WorkerEvent::Poll) if g.task_finished => Some(if g.fetch_shared_data {
            (S::RxSharedData, A::FetchSharedData)
        } else {
            (S::NextTest, A::None)
        }),
        (S::RxSharedData, WorkerEvent::Poll) if g.task_finished => {
            Some((S::SharedDataReady, A::Capture))
        }
        (S::SharedDataReady, WorkerEvent::Collected) | (S::TraceReady, WorkerEvent::Collected) => {
            Some((S::NextTest, A::None))
        }
        (S::NextTest, WorkerEvent::Poll) if g.task_finished && g.has_queued_test => {
            Some((S::Executing, A::ExecuteQueued))
        }
        (S::NextTest, WorkerEvent::Work(WorkItem::Test(_))) if g.task_finished => {
            Some((S::Executing, A::ExecuteItem))
        }
        (S::Executing, WorkerEvent::Poll) if g.task_finished => Some((S::StoreTrace, A::StoreTrace)),
        (S::StoreTrace, WorkerEvent::Poll) if g.task_finished => Some((S::TraceReady, A::Capture)),
        _ => None,
    }
}

/// A concrete worker: runs tests, stores the traces they produce.
pub struct ConcreteFsm {
    state: ConcreteState,
    life: Lifecycle,
    executor: Arc<dyn ConcreteExecutor>,
    image: Option<ImageSource>,
    image_valid: Option<bool>,
    current: Option<TestCase>,
    shared_data: Option<GuestData>,
    trace: Option<TraceArtifact>,
}

impl std::fmt::Debug for ConcreteFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcreteFsm")
            .field("state", &self.state)
            .field("liveness", &self.life.liveness)
            .field("validity", &self.life.validity)
            .finish_non_exhaustive()
    }
}

impl ConcreteFsm {
    pub fn new(
        record: Guarded<WorkerRecord>,
        executor: Arc<dyn ConcreteExecutor>,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            state: ConcreteState::Start,
            life: Lifecycle::new(record, policy),
            executor,
            image: None,
            image_valid: None,
            current: None,
            shared_data: None,
            trace: None,
        }
    }

    pub const fn state(&self) -> ConcreteState {
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
            .base_flags(self.state == ConcreteState::NextTest, self.state.in_work_loop());
        if flags.terminated {
            return flags;
        }
        flags.needs_config = self.state == ConcreteState::Start;
        flags.needs_image = self.state == ConcreteState::ValidateImage && self.image.is_none();
        flags.shared_data_ready = self.state == ConcreteState::SharedDataReady;
        flags.trace_ready = self.state == ConcreteState::TraceReady;
        flags
    }

    /// Shared data published in `SharedDataReady`.
    pub fn take_shared_data(&mut self) -> Option<GuestData> {
        self.shared_data.take()
    }

    /// Trace published in `TraceReady`.
    pub fn take_trace(&mut self) -> Option<TraceArtifact> {
        self.trace.take()
    }

    /// Feed one event through the regions and the transition table.
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
            self.observe_validation();
        }

        let guards = self.guards();
        let Some((next, action)) = transition(self.state, &event, &guards) else {
            return Ok(self.unhandled(event));
        };

        match &event {
            WorkerEvent::Config(session) => self.life.session = Some(session.clone()),
            WorkerEvent::Image(source) => self.image = Some(source.clone()),
            _ => {}
        }

        let worker = self.life.record.acquire().id;
        debug!(
            worker,
            kind = "concrete",
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

    fn guards(&self) -> ConcreteGuards {
        ConcreteGuards {
            task_finished: self.life.task.is_finished(),
            image_pending: self.image.is_none(),
            image_valid: self.image_valid,
            fetch_shared_data: self
                .life
                .session
                .as_ref()
                .is_some_and(|s| s.fetch_shared_data),
            has_queued_test: self.life.queued_work() > 0,
        }
    }

    fn observe_validation(&mut self) {
        if self.state != ConcreteState::ValidateImage
            || self.image.is_none()
            || self.image_valid.is_some()
            || !self.life.task.is_finished()
        {
            return;
        }
        if let Some(TaskOutput::ImageValid(valid)) = self.life.task.take_output() {
            debug!(valid, "image validated");
            self.image_valid = Some(valid);
        }
    }

    fn unhandled(&mut self, event: WorkerEvent) -> Handled {
        match event {
            WorkerEvent::Work(WorkItem::Test(test)) => {
                self.life.record.with(|r| r.queued_tests.push_back(test));
                Handled::Queued
            }
            WorkerEvent::Work(WorkItem::Trace(trace)) => {
                warn!(trace = %trace.id, "concrete worker does not take traces");
                Handled::Ignored
            }
            _ => Handled::Ignored,
        }
    }

    fn perform(&mut self, action: ConcreteAction, event: WorkerEvent) -> DomainResult<()> {
        let executor = Arc::clone(&self.executor);
        match action {
            ConcreteAction::None => Ok(()),
            ConcreteAction::ValidateImage => {
                let image = self.source()?;
                self.life.spawn(async move {
                    let installed = executor.image_info().await?;
                    Ok(TaskOutput::ImageValid(installed.as_ref() == Some(&image.info)))
                })
            }
            ConcreteAction::UpdateImage => {
                let image = self.source()?;
                self.life.spawn(async move {
                    executor.update_image(&image).await?;
                    Ok(TaskOutput::Done)
                })
            }
            ConcreteAction::Commence => {
                let session = self.life.session.clone().unwrap_or_default();
                self.life.spawn(async move {
                    executor.commence(&session).await?;
                    Ok(TaskOutput::Done)
                })
            }
            ConcreteAction::FetchSharedData => self
                .life
                .spawn(async move { Ok(TaskOutput::SharedData(executor.shared_data().await?)) }),
            ConcreteAction::ExecuteQueued => {
                let test = self
                    .life
                    .record
                    .with(|r| r.queued_tests.pop_front())
                    .ok_or_else(|| DomainError::GraphConsistency("test queue drained under guard".into()))?;
                self.execute(test)
            }
            ConcreteAction::ExecuteItem => match event {
                WorkerEvent::Work(WorkItem::Test(test)) => self.execute(test),
                other => Err(DomainError::InvalidTransition {
                    from: self.state.as_str().into(),
                    event: other.name().into(),
                }),
            },
            ConcreteAction::StoreTrace => {
                let test = self.current.clone().ok_or_else(|| {
                    DomainError::GraphConsistency("no executed test to store a trace for".into())
                })?;
                self.life.spawn(async move {
                    Ok(TaskOutput::Trace(executor.store_trace(&test).await?))
                })
            }
            ConcreteAction::Capture => {
                match expect_output(&self.life.task, self.state.as_str())? {
                    TaskOutput::SharedData(data) => self.shared_data = Some(data),
                    TaskOutput::Trace(trace) => {
                        self.current = None;
                        self.trace = Some(trace);
                    }
                    other => {
                        return Err(DomainError::GraphConsistency(format!(
                            "unexpected task output {other:?} in {}",
                            self.state.as_str()
                        )))
                    }
                }
                Ok(())
            }
        }
    }

    fn execute(&mut self, test: TestCase) -> DomainResult<()> {
        let executor = Arc::clone(&self.executor);
        let processes = self.life.processes.clone();
        self.current = Some(test.clone());
        self.life.spawn(async move {
            executor.execute(&test, &processes).await?;
            Ok(TaskOutput::Done)
        })
    }

    fn source(&self) -> DomainResult<ImageSource> {
        self.image
            .clone()
            .ok_or_else(|| DomainError::GraphConsistency("image requested before it was supplied".into()))
    }

    async fn fail(&mut self, err: DomainError) {
        let input = matches!(self.state, ConcreteState::Executing | ConcreteState::StoreTrace)
            .then(|| self.current.clone())
            .flatten();
        self.life.report(self.state.as_str(), &err, input);
        self.life.validity = Validity::Error;

        match self.life.policy {
            RecoveryPolicy::Terminate => self.life.terminate().await,
            RecoveryPolicy::Restart => {
                self.life.discard_task().await;
                self.current = None;
                self.trace = None;
                self.shared_data = None;
                self.state = ConcreteState::Commence;

                let executor = Arc::clone(&self.executor);
                let session = self.life.session.clone().unwrap_or_default();
                let restart = self.life.spawn(async move {
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
