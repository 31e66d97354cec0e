//! scanfleet-core — domain model for the dynamic engine fleet.
//!
//! Defines the engine lifecycle state machine, the capacity tier table
//! used to classify scans by size, the scan queue types exchanged between
//! the queue monitor and the engine manager, the scan-manager client
//! contract, and the fleet configuration structure.
//!
//! This crate holds no I/O. Cloud provisioning lives behind the
//! `scanfleet-cloud` traits; the engine registry lives in `scanfleet-pool`.

pub mod config;
pub mod engine;
pub mod error;
pub mod remote;
pub mod scan;
pub mod tier;

pub use config::{FleetConfig, IdlePolicyChoice, RetryConfig, TierConfig};
pub use engine::{Engine, EngineSnapshot, EngineState, HostInfo, StateChange};
pub use error::{ConfigError, RemoteError, RemoteResult, TierError, TransitionError};
pub use remote::{EngineRecord, ScanManagerClient};
pub use scan::{QueuedScan, ScanCompletion, ScanRequest};
pub use tier::{EngineTier, TierSet};
