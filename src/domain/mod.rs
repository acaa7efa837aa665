//! Domain layer: errors and models shared by every other layer.

pub mod errors;
pub mod models;

pub use errors::{DomainError, DomainResult};
