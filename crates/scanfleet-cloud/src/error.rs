//! Cloud seam error types.

use thiserror::Error;

/// Errors from provisioning, reclamation, and readiness probing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("provider rejected the request: {0}")]
    Provisioning(String),

    #[error("instance would not stop or terminate: {0}")]
    Termination(String),

    #[error("instance {name} did not reach running within {secs}s")]
    LaunchTimeout { name: String, secs: u64 },

    #[error("engine software on {name} did not respond within {secs}s")]
    ReadyTimeout { name: String, secs: u64 },

    #[error("no such instance: {0}")]
    NotFound(String),
}

pub type CloudResult<T> = Result<T, CloudError>;
