//! The operations a worker state machine delegates to whatever actually runs
//! the target: local processes or a remote node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::application::worker::process::ProcessSlot;
use crate::domain::errors::DomainResult;
use crate::domain::models::harness::GuestData;
use crate::domain::models::target::Target;
use crate::domain::models::test_case::TestCase;
use crate::domain::models::trace::TraceArtifact;
use crate::domain::models::worker::{ImageInfo, WorkerKind};

/// Per-target parameters handed to a worker when it is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub target: Option<Target>,
    /// Validate the worker's image before commencing.
    pub sync_image: bool,
    /// This worker reports the target's shared data after commencing.
    pub fetch_shared_data: bool,
}

/// An image file offered to a concrete worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    pub path: PathBuf,
    pub info: ImageInfo,
}

/// Test cases generated from one trace, with the input that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBatch {
    /// The concrete input the trace was recorded with.
    pub input: TestCase,
    /// New test cases; patches refer to `input`'s issue index.
    pub tests: Vec<TestCase>,
}

/// Runs the target concretely and records traces.
#[async_trait]
pub trait ConcreteExecutor: Send + Sync {
    /// Identity of the image currently installed, if any.
    async fn image_info(&self) -> DomainResult<Option<ImageInfo>>;

    /// Replace the installed image.
    async fn update_image(&self, image: &ImageSource) -> DomainResult<()>;

    /// Prepare a clean environment for the session's target.
    async fn commence(&self, session: &Session) -> DomainResult<()>;

    /// Harness description of the current target.
    async fn shared_data(&self) -> DomainResult<GuestData>;

    /// Run one test. Any process launched goes through `processes`.
    async fn execute(&self, test: &TestCase, processes: &ProcessSlot) -> DomainResult<()>;

    /// Store the trace of the last execution together with its input.
    async fn store_trace(&self, test: &TestCase) -> DomainResult<TraceArtifact>;

    /// Drop any partial state left by a failed operation.
    async fn reset(&self) -> DomainResult<()>;
}

/// Explores traces symbolically and generates new test cases.
#[async_trait]
pub trait SymbolicExecutor: Send + Sync {
    async fn commence(&self, session: &Session) -> DomainResult<()>;

    /// Turn the trace into something the engine can analyze.
    async fn translate(&self, trace: &TraceArtifact, processes: &ProcessSlot) -> DomainResult<()>;

    /// Run the engine over a translated trace.
    async fn solve(&self, trace: &TraceArtifact, processes: &ProcessSlot) -> DomainResult<()>;

    /// Gather the test cases produced for `trace`.
    async fn collect_tests(&self, trace: &TraceArtifact) -> DomainResult<TestBatch>;

    /// Remove everything derived from `trace`.
    async fn clean(&self, trace: &TraceArtifact) -> DomainResult<()>;

    async fn reset(&self) -> DomainResult<()>;
}

/// An executor of either kind.
#[derive(Clone)]
pub enum Executor {
    Concrete(Arc<dyn ConcreteExecutor>),
    Symbolic(Arc<dyn SymbolicExecutor>),
}

impl Executor {
    pub const fn kind(&self) -> WorkerKind {
        match self {
            Self::Concrete(_) => WorkerKind::Concrete,
            Self::Symbolic(_) => WorkerKind::Symbolic,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Executor({})", self.kind())
    }
}
