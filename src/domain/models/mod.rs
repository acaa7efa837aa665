//! Domain models for targets, traces, test cases and workers.

pub mod config;
pub mod harness;
pub mod strategy;
pub mod target;
pub mod test_case;
pub mod trace;
pub mod worker;

pub use config::{
    Config, DispatchConfig, ImageConfig, InitialElement, IntervalConfig, LoggingConfig,
    ModeConfig, NetworkConfig, ProfileConfig, SvmArgs, SvmConfig, TestConfig, TestPoolConfig,
    TraceConfig, VmConfig, WorkersConfig,
};
pub use harness::{GuestData, HarnessArgument, HarnessFile, HarnessStdin};
pub use strategy::SelectionStrategy;
pub use target::{Target, TargetQueue};
pub use test_case::{IssueIndex, Patch, TestCase, TestCaseElement, TraceTag, TraceTagNode};
pub use trace::{Block, Trace, TraceArtifact, TraceBundle, TraceId};
pub use worker::{
    Connection, ImageInfo, NodeError, WorkerId, WorkerKind, WorkerRecord, WorkerStatus,
};
