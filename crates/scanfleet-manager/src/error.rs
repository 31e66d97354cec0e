//! Orchestrator error types.

use thiserror::Error;

use scanfleet_cloud::CloudError;
use scanfleet_core::error::RemoteError;
use scanfleet_pool::PoolError;

/// Errors surfaced by orchestration operations. The control loop itself
/// never terminates on these; they are logged, annotated onto the
/// affected engine, and retried on a later cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("engine pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("cloud provider error: {0}")]
    Cloud(#[from] CloudError),

    #[error("scan manager error: {0}")]
    Remote(#[from] RemoteError),

    #[error("engine {0} has no host record")]
    MissingHost(String),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
