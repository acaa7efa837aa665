//! CLI command implementations.

pub mod config;
pub mod dispatch;
pub mod node;
