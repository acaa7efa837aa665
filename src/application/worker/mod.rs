//! Worker lifecycle state machines and the executors they drive.

pub mod command;
pub mod concrete;
pub mod executor;
pub mod lifecycle;
pub mod process;
pub mod remote;
pub mod symbolic;

pub use command::{CommandConcreteExecutor, CommandSymbolicExecutor};
pub use concrete::{ConcreteFsm, ConcreteState};
pub use executor::{
    ConcreteExecutor, Executor, ImageSource, Session, SymbolicExecutor, TestBatch,
};
pub use lifecycle::{
    Handled, Liveness, RecoveryPolicy, Validity, WorkItem, WorkerEvent, WorkerFlags,
};
pub use process::ProcessSlot;
pub use remote::RemoteWorker;
pub use symbolic::{SymbolicFsm, SymbolicState};

use std::sync::Arc;

use crate::application::guarded::Guarded;
use crate::domain::errors::DomainResult;
use crate::domain::models::trace::TraceId;
use crate::domain::models::worker::{WorkerId, WorkerKind, WorkerRecord};

/// A worker state machine of either kind.
#[derive(Debug)]
pub enum WorkerFsm {
    Concrete(ConcreteFsm),
    Symbolic(SymbolicFsm),
}

impl WorkerFsm {
    /// A fresh state machine in `Start` driving `executor`.
    pub fn new(record: Guarded<WorkerRecord>, executor: &Executor, policy: RecoveryPolicy) -> Self {
        match executor {
            Executor::Concrete(exec) => Self::Concrete(ConcreteFsm::new(record, Arc::clone(exec), policy)),
            Executor::Symbolic(exec) => Self::Symbolic(SymbolicFsm::new(record, Arc::clone(exec), policy)),
        }
    }

    pub const fn kind(&self) -> WorkerKind {
        match self {
            Self::Concrete(_) => WorkerKind::Concrete,
            Self::Symbolic(_) => WorkerKind::Symbolic,
        }
    }

    pub const fn record(&self) -> &Guarded<WorkerRecord> {
        match self {
            Self::Concrete(fsm) => fsm.record(),
            Self::Symbolic(fsm) => fsm.record(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.record().acquire().id
    }

    pub fn flags(&self) -> WorkerFlags {
        match self {
            Self::Concrete(fsm) => fsm.flags(),
            Self::Symbolic(fsm) => fsm.flags(),
        }
    }

    pub const fn state_name(&self) -> &'static str {
        match self {
            Self::Concrete(fsm) => fsm.state().as_str(),
            Self::Symbolic(fsm) => fsm.state().as_str(),
        }
    }

    /// Trace a symbolic worker is working on.
    pub fn analyzing(&self) -> Option<&TraceId> {
        match self {
            Self::Concrete(_) => None,
            Self::Symbolic(fsm) => fsm.analyzing(),
        }
    }

    pub async fn process(&mut self, event: WorkerEvent) -> DomainResult<Handled> {
        match self {
            Self::Concrete(fsm) => fsm.process(event).await,
            Self::Symbolic(fsm) => fsm.process(event).await,
        }
    }

    pub async fn terminate(&mut self) {
        if let Err(e) = self.process(WorkerEvent::Terminate).await {
            tracing::warn!(error = %e, "terminate failed");
        }
    }
}
