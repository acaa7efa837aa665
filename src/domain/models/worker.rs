//! Worker identity, status and the shared per-worker record.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use crate::domain::models::target::Target;
use crate::domain::models::test_case::TestCase;
use crate::domain::models::trace::TraceArtifact;

/// Identifier assigned to a worker at registration.
pub type WorkerId = u64;

/// The two kinds of worker the dispatcher drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Runs the target under instrumentation and produces traces.
    Concrete,
    /// Consumes traces and produces new test cases.
    Symbolic,
}

impl WorkerKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Concrete => "concrete",
            Self::Symbolic => "symbolic",
        }
    }

    /// Short label used in status displays and log directory names.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Concrete => "vm",
            Self::Symbolic => "svm",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "concrete" | "vm" => Some(Self::Concrete),
            "symbolic" | "svm" => Some(Self::Symbolic),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a worker's queues and health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub test_case_count: usize,
    pub trace_count: usize,
    pub error_count: usize,
    pub active: bool,
}

/// Identity of the guest image a concrete worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub file_name: String,
    pub last_write_time: i64,
}

impl ImageInfo {
    /// Describe the image file at `path`.
    pub fn from_path(path: &std::path::Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified = meta.modified()?;
        let last_write_time = chrono::DateTime::<chrono::Utc>::from(modified).timestamp();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            file_name,
            last_write_time,
        })
    }
}

/// A failure reported by a worker, with the context needed to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub worker_id: WorkerId,
    pub kind: WorkerKind,
    pub target: Option<String>,
    pub state: String,
    pub message: String,
    /// Concrete input that triggered the failure, when known.
    #[serde(default)]
    pub input: Option<TestCase>,
}

impl NodeError {
    /// Text written to per-target error logs.
    pub fn log(&self) -> String {
        format!(
            "Target: {}\nWorker: {}-{} ({})\nState: {}\n{}\n",
            self.target.as_deref().unwrap_or("<none>"),
            self.kind.label(),
            self.worker_id,
            self.kind,
            self.state,
            self.message
        )
    }
}

/// How the dispatcher reaches a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connection {
    /// Worker runs inside the dispatcher process.
    Local,
    /// Worker registered over the network.
    Remote { peer: SocketAddr },
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote { peer } => write!(f, "{peer}"),
        }
    }
}

/// Per-worker state shared between the worker's driver and the dispatcher.
///
/// Always accessed through [`crate::application::Guarded`].
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub connection: Connection,
    /// Target the worker is currently assigned to.
    pub target: Option<Target>,
    pub queued_tests: VecDeque<TestCase>,
    pub queued_traces: VecDeque<TraceArtifact>,
    pub errors: Vec<NodeError>,
    pub error_count: usize,
    pub active: bool,
}

impl WorkerRecord {
    pub const fn new(id: WorkerId, kind: WorkerKind, connection: Connection) -> Self {
        Self {
            id,
            kind,
            connection,
            target: None,
            queued_tests: VecDeque::new(),
            queued_traces: VecDeque::new(),
            errors: Vec::new(),
            error_count: 0,
            active: true,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            test_case_count: self.queued_tests.len(),
            trace_count: self.queued_traces.len(),
            error_count: self.error_count,
            active: self.active,
        }
    }

    /// Number of queued units of work of the kind this worker consumes.
    pub fn queued_work(&self) -> usize {
        match self.kind {
            WorkerKind::Concrete => self.queued_tests.len(),
            WorkerKind::Symbolic => self.queued_traces.len(),
        }
    }

    pub fn push_error(&mut self, error: NodeError) {
        self.error_count += 1;
        self.errors.push(error);
    }

    pub fn take_errors(&mut self) -> Vec<NodeError> {
        std::mem::take(&mut self.errors)
    }

    /// Drop queued work and pending errors ahead of a new target.
    pub fn reset_runtime(&mut self, target: Option<Target>) {
        self.queued_tests.clear();
        self.queued_traces.clear();
        self.errors.clear();
        self.target = target;
        self.active = true;
    }
}
