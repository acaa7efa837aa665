//! concolic-dispatch: a distributed orchestrator for concolic testing.
//!
//! A dispatcher drives two kinds of workers. Concrete workers run a target
//! program on a test case and record the executed block sequence; symbolic
//! workers replay a recorded trace and derive new test cases that steer the
//! program down unexplored branches. The dispatcher deduplicates traces in a
//! prefix graph, deduplicates test cases by content and rotates through
//! targets until each one runs out of budget or converges.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): test cases, traces, targets, worker records
//!   and configuration
//! - **Service Layer** (`services`): the trace graph, trace selection, cycle
//!   detection and the two pools
//! - **Application Layer** (`application`): worker state machines, the
//!   dispatcher and the remote-worker plumbing
//! - **Infrastructure Layer** (`infrastructure`): wire protocol, persisted
//!   run layout, configuration loading and logging
//! - **CLI Layer** (`cli`): command-line interface

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::{DispatchReport, DispatchState, NodeDriver, NodeRegistrar, Orchestrator};
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{Config, SelectionStrategy, TestCase, Trace, TraceArtifact, WorkerKind};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{TestPool, TraceGraph, TracePool};
