//! scanfleet-cloud — the seam between the orchestrator and the cloud
//! provider.
//!
//! Defines the [`ComputeProvisioner`] contract the engine manager drives,
//! the bounded retry-with-backoff policy wrapped around every external
//! call, and the HTTP readiness probe a scan-manager client uses to
//! check engine software on a freshly launched instance.
//!
//! Concrete provider adapters (AWS, etc.) live outside this workspace;
//! they only need to implement [`ComputeProvisioner`].

pub mod error;
pub mod probe;
pub mod provisioner;
pub mod retry;

pub use error::{CloudError, CloudResult};
pub use probe::{ProbeResult, probe_engine};
pub use provisioner::{ComputeProvisioner, EngineTags, InstanceHandle, InstanceStatus};
pub use retry::RetryPolicy;
