//! Persisted run layout: directories, logs and statistics.

pub mod layout;

pub use layout::{RunLayout, RunRoot, StatSample, StatsRecorder};
