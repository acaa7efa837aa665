//! Pieces shared by both worker state machines: events, flags, the two
//! orthogonal regions and the single background-task slot.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::application::async_task::AsyncTask;
use crate::application::guarded::Guarded;
use crate::application::worker::executor::{ImageSource, Session, TestBatch};
use crate::application::worker::process::ProcessSlot;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::harness::GuestData;
use crate::domain::models::test_case::TestCase;
use crate::domain::models::trace::TraceArtifact;
use crate::domain::models::worker::{NodeError, WorkerRecord};

/// How long termination waits for a killed process or an aborted task.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Test(TestCase),
    Trace(TraceArtifact),
}

/// Events the orchestrator sends to a worker state machine.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Start,
    Config(Session),
    Image(ImageSource),
    Poll,
    Work(WorkItem),
    /// The published result or shared data has been taken.
    Collected,
    /// Pending error reports have been taken.
    ErrorsCollected,
    Terminate,
}

impl WorkerEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Config(_) => "config",
            Self::Image(_) => "image",
            Self::Poll => "poll",
            Self::Work(_) => "work",
            Self::Collected => "collected",
            Self::ErrorsCollected => "errors-collected",
            Self::Terminate => "terminate",
        }
    }
}

/// What became of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// The event caused a transition or a side effect.
    Applied,
    /// Nothing to do in the current state.
    Ignored,
    /// A work item arrived while the worker was busy and was queued instead.
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Error,
}

/// What a failed background task does to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Discard the task, reset local state and restart from commence.
    Restart,
    /// End the worker's lifecycle.
    Terminate,
}

impl RecoveryPolicy {
    /// Workers on a rotating target queue restart; single-target workers stop.
    pub const fn for_mode(distributed: bool) -> Self {
        if distributed {
            Self::Restart
        } else {
            Self::Terminate
        }
    }
}

/// Readiness flags read by the orchestrator once per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct WorkerFlags {
    pub needs_config: bool,
    pub needs_image: bool,
    pub shared_data_ready: bool,
    pub trace_ready: bool,
    pub result_ready: bool,
    pub error_ready: bool,
    /// Waiting for work with an empty queue and no task in flight.
    pub idle: bool,
    /// In the work loop; queued work will be picked up.
    pub accepting_work: bool,
    pub active: bool,
    pub terminated: bool,
}

/// Value produced by a worker's background task.
#[derive(Debug)]
pub enum TaskOutput {
    Done,
    ImageValid(bool),
    SharedData(GuestData),
    Trace(TraceArtifact),
    Tests(TestBatch),
}

/// Region state, task slot and record common to both worker kinds.
#[derive(Debug)]
pub struct Lifecycle {
    pub record: Guarded<WorkerRecord>,
    pub task: AsyncTask<TaskOutput>,
    pub processes: ProcessSlot,
    pub liveness: Liveness,
    pub validity: Validity,
    pub policy: RecoveryPolicy,
    pub session: Option<Session>,
    pub grace: Duration,
}

impl Lifecycle {
    pub fn new(record: Guarded<WorkerRecord>, policy: RecoveryPolicy) -> Self {
        Self {
            record,
            task: AsyncTask::idle(),
            processes: ProcessSlot::new(),
            liveness: Liveness::Active,
            validity: Validity::Valid,
            policy,
            session: None,
            grace: TERMINATE_GRACE,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.liveness == Liveness::Terminated
    }

    /// Start a background task. Refused while another is in flight.
    pub fn spawn<F>(&mut self, future: F) -> DomainResult<()>
    where
        F: Future<Output = DomainResult<TaskOutput>> + Send + 'static,
    {
        if !self.task.is_finished() {
            return Err(DomainError::InvalidTransition {
                from: "task in flight".into(),
                event: "spawn".into(),
            });
        }
        self.task = AsyncTask::spawn(future);
        Ok(())
    }

    /// Kill the owned process and drop the current task, discarding its error.
    pub async fn discard_task(&mut self) {
        if let Err(e) = self.processes.kill(self.grace).await {
            warn!(error = %e, "failed to stop worker process");
        }
        if let Some(e) = self.task.settle(self.grace).await {
            debug!(error = %e, "discarded error of abandoned task");
        }
        self.task = AsyncTask::idle();
    }

    /// Record a failure for the orchestrator to collect.
    pub fn report(&self, state: &str, err: &DomainError, input: Option<TestCase>) {
        let mut record = self.record.acquire();
        let entry = NodeError {
            worker_id: record.id,
            kind: record.kind,
            target: record.target.as_ref().map(|t| t.name.clone()),
            state: state.to_string(),
            message: err.to_string(),
            input,
        };
        error!(
            worker = entry.worker_id,
            kind = %entry.kind,
            target = entry.target.as_deref().unwrap_or("<none>"),
            state,
            has_input = entry.input.is_some(),
            error = %err,
            "worker task failed"
        );
        record.push_error(entry);
    }

    /// Enter `Terminated`: kill, settle, and never resume.
    pub async fn terminate(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.discard_task().await;
        self.liveness = Liveness::Terminated;
        self.record.with(|r| r.active = false);
    }

    pub fn queued_work(&self) -> usize {
        self.record.acquire().queued_work()
    }

    pub fn has_errors(&self) -> bool {
        !self.record.acquire().errors.is_empty()
    }

    /// Flags shared by both kinds. `waiting` is true in the state that takes
    /// the next unit of work; `in_loop` for every work-loop state.
    pub fn base_flags(&self, waiting: bool, in_loop: bool) -> WorkerFlags {
        let terminated = self.is_terminated();
        let idle = !terminated && waiting && self.task.is_finished() && self.queued_work() == 0;
        WorkerFlags {
            error_ready: self.has_errors(),
            idle,
            accepting_work: !terminated && in_loop,
            active: !terminated && (!idle || self.validity == Validity::Error),
            terminated,
            ..WorkerFlags::default()
        }
    }

    /// Apply the region transitions every event is checked against.
    /// Returns true when the event was consumed here.
    pub async fn apply_regions(&mut self, event: &WorkerEvent) -> bool {
        match event {
            WorkerEvent::Terminate => {
                self.terminate().await;
                true
            }
            WorkerEvent::ErrorsCollected => {
                self.validity = Validity::Valid;
                true
            }
            _ => false,
        }
    }
}

/// Output of a finished task, checked against the expected variant.
pub fn expect_output(task: &AsyncTask<TaskOutput>, state: &str) -> DomainResult<TaskOutput> {
    task.take_output().ok_or_else(|| {
        DomainError::GraphConsistency(format!("task in state {state} finished without output"))
    })
}
