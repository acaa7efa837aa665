//! Application layer: worker state machines, the dispatcher and the
//! node-side plumbing for remote workers.

pub mod async_task;
pub mod guarded;
pub mod node_driver;
pub mod node_registrar;
pub mod orchestrator;
pub mod worker;

pub use async_task::AsyncTask;
pub use guarded::Guarded;
pub use node_driver::NodeDriver;
pub use node_registrar::NodeRegistrar;
pub use orchestrator::{DispatchReport, DispatchState, DispatchStatus, Orchestrator};
pub use worker::{Executor, WorkerFsm};
