//! Domain errors for the concolic dispatch system.

use thiserror::Error;

/// Domain-level errors that can occur while orchestrating workers.
///
/// Variants follow the failure classes the dispatcher reacts to: protocol
/// errors close a connection, process errors reset a worker, resource errors
/// abort one operation and graph consistency errors are invariant failures.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected packet: expected {expected}, received {received}")]
    UnexpectedPacket { expected: String, received: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource error at {path}: {reason}")]
    Resource { path: String, reason: String },

    #[error("Trace graph consistency violated: {0}")]
    GraphConsistency(String),

    #[error("Invalid test case: {0}")]
    InvalidTestCase(String),

    #[error("Base test case not found for issue index {0}")]
    BaseNotFound(u64),

    #[error("Invalid selection strategy: {0}")]
    InvalidStrategy(String),

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote worker failure: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Build a resource error for a filesystem path.
    pub fn resource(path: impl AsRef<std::path::Path>, reason: impl std::fmt::Display) -> Self {
        Self::Resource {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is recoverable by resetting the worker that raised it.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Process(_) | Self::Remote(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<nix::Error> for DomainError {
    fn from(err: nix::Error) -> Self {
        Self::Process(err.to_string())
    }
}
