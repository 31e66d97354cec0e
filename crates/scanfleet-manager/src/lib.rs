//! scanfleet-manager — the engine fleet orchestrator.
//!
//! One periodic control loop reconciles three independently changing
//! facts: the queue of pending work, the live state of cloud instances,
//! and billing-cycle economics. Each cycle applies finished async
//! operations, returns completed engines to idle, matches queued scans
//! to idle engines (provisioning under the tier cap when none fit),
//! reclaims engines past their billing boundary, and tops tiers up to
//! their standing idle minimum.
//!
//! Provisioning and reclamation are slow network operations; they run as
//! spawned tasks — one outstanding operation per engine — reporting back
//! over an event channel so the loop never blocks on the provider.

pub mod error;
pub mod manager;
mod provision;

pub use error::{ManagerError, ManagerResult};
pub use manager::EngineManager;
