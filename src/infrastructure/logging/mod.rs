//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber:
//! - JSON or pretty console output
//! - Rolling JSON log files
//! - Retention cleanup for old log files

pub mod config;
pub mod logger;
pub mod retention;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
pub use retention::LogRetention;
