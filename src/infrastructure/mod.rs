//! Infrastructure layer module
//!
//! - Wire protocol and connections to remote workers
//! - Persisted run layout and statistics
//! - Configuration management
//! - Logging infrastructure

pub mod config;
pub mod logging;
pub mod protocol;
pub mod storage;
