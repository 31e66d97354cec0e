//! Scan-manager API contract.
//!
//! The scan manager is an external collaborator: implementations own
//! their transport and session renewal entirely. The core only depends
//! on this trait, so tests and the local simulator swap in fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteResult;
use crate::scan::ScanRequest;
use crate::tier::EngineTier;

/// An engine registration record as the scan manager sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRecord {
    /// Server-assigned id; `None` until first registration.
    pub id: Option<u64>,
    pub name: String,
    /// Engine software base URL the scan manager dispatches to.
    pub uri: String,
    pub min_loc: u64,
    pub max_loc: u64,
    /// Concurrent scans the engine accepts. Dynamic engines run one.
    pub max_scans: u32,
    /// A blocked engine is registered but not dispatchable.
    pub blocked: bool,
}

impl EngineRecord {
    /// Registration record for an engine serving the given tier.
    pub fn for_tier(name: &str, uri: &str, tier: &EngineTier) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            uri: uri.to_string(),
            min_loc: tier.min_loc,
            max_loc: tier.max_loc,
            max_scans: 1,
            blocked: false,
        }
    }
}

/// Client for the central scan manager's REST API.
///
/// Credentials and cookie/token renewal are construction-time concerns of
/// the implementation; `login` establishes the initial session.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait ScanManagerClient: Send + Sync {
    async fn login(&self) -> RemoteResult<bool>;

    async fn get_pending_scans(&self) -> RemoteResult<Vec<ScanRequest>>;

    async fn get_registered_engines(&self) -> RemoteResult<Vec<EngineRecord>>;

    /// Register a new engine; the returned record carries the assigned id.
    async fn register_engine(&self, record: &EngineRecord) -> RemoteResult<EngineRecord>;

    /// Update an existing registration (re-enable, unblock, new uri).
    async fn update_engine(&self, record: &EngineRecord) -> RemoteResult<EngineRecord>;

    async fn unregister_engine(&self, id: u64) -> RemoteResult<()>;

    /// Probe the engine software on a provisioned instance.
    async fn ping_engine(&self, uri: &str) -> RemoteResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_for_tier_carries_tier_bounds() {
        let tier = EngineTier {
            name: "medium".to_string(),
            min_loc: 10_000,
            max_loc: 50_000,
            min_idle: 1,
            max_count: 3,
            instance_type: "m5.xlarge".to_string(),
        };
        let record = EngineRecord::for_tier("sf-engine-medium-1", "http://10.0.0.9:8088", &tier);
        assert_eq!(record.id, None);
        assert_eq!(record.min_loc, 10_000);
        assert_eq!(record.max_loc, 50_000);
        assert_eq!(record.max_scans, 1);
        assert!(!record.blocked);
    }
}
