//! scanfleet-pool — the authoritative registry of all engines.
//!
//! The pool owns every [`Engine`](scanfleet_core::Engine) and keeps
//! by-tier and by-state indices in lockstep with engine state: a
//! transition and its index update are one atomic operation under the
//! pool lock, so readers never observe an engine whose state disagrees
//! with its bucket.
//!
//! The pool is a passive index. Capacity policy — when to provision,
//! when to reclaim — lives in `scanfleet-manager`.

pub mod error;
pub mod policy;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use policy::{IdleCandidate, IdlePolicy, OldestIdleFirst, SoonestToExpire, policy_for};
pub use pool::{EnginePool, PoolStats, TierStats, TransitionListener};
