//! Compute provisioner contract.
//!
//! The engine manager drives instance lifecycle exclusively through this
//! trait. Implementations wrap a provider SDK and are assumed safe for
//! concurrent use by multiple in-flight engine operations.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;

/// Provider-reported lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
    Unknown,
}

/// Handle to a cloud instance, as returned by launch/describe/list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    /// The instance's Name tag.
    pub name: String,
    /// Base URL of the engine software on the instance.
    pub url: String,
    /// Provider-reported launch time (epoch seconds), when known.
    pub launch_time: Option<u64>,
    pub status: InstanceStatus,
    /// Full tag map; reconciliation reads the tier marker from here.
    pub tags: HashMap<String, String>,
}

/// Tags stamped onto every engine instance so the fleet can be told
/// apart from everything else in the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTags {
    pub role: String,
    pub version: String,
    /// Set on launch; absent when used as an inventory filter.
    pub tier: Option<String>,
}

impl EngineTags {
    pub const ROLE_KEY: &'static str = "scanfleet:role";
    pub const VERSION_KEY: &'static str = "scanfleet:version";
    pub const TIER_KEY: &'static str = "scanfleet:tier";

    pub const ENGINE_ROLE: &'static str = "scan-engine";

    /// Tags for launching an engine of the given tier.
    pub fn for_tier(version: &str, tier: &str) -> Self {
        Self {
            role: Self::ENGINE_ROLE.to_string(),
            version: version.to_string(),
            tier: Some(tier.to_string()),
        }
    }

    /// Role+version filter for inventory listing.
    pub fn filter(version: &str) -> Self {
        Self {
            role: Self::ENGINE_ROLE.to_string(),
            version: version.to_string(),
            tier: None,
        }
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(Self::ROLE_KEY.to_string(), self.role.clone());
        map.insert(Self::VERSION_KEY.to_string(), self.version.clone());
        if let Some(tier) = &self.tier {
            map.insert(Self::TIER_KEY.to_string(), tier.clone());
        }
        map
    }

    /// Tier marker recorded on an instance, if present.
    pub fn tier_of(handle: &InstanceHandle) -> Option<&str> {
        handle.tags.get(Self::TIER_KEY).map(String::as_str)
    }
}

/// The cloud provider's instance API, as the orchestrator needs it.
#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    /// Launch a fresh instance. Returns once the provider accepts the
    /// request; the instance is usually still pending.
    async fn launch(
        &self,
        name: &str,
        instance_type: &str,
        tags: &EngineTags,
    ) -> CloudResult<InstanceHandle>;

    /// Start a previously stopped instance.
    async fn start(&self, instance_id: &str) -> CloudResult<()>;

    async fn stop(&self, instance_id: &str) -> CloudResult<()>;

    async fn terminate(&self, instance_id: &str) -> CloudResult<()>;

    async fn describe(&self, instance_id: &str) -> CloudResult<InstanceStatus>;

    async fn is_running(&self, instance_id: &str) -> CloudResult<bool> {
        Ok(self.describe(instance_id).await? == InstanceStatus::Running)
    }

    /// All instances carrying the given role/version tags, in any state.
    /// Used to rebuild pool state at startup.
    async fn list_engines(&self, filter: &EngineTags) -> CloudResult<Vec<InstanceHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_tags_carry_role_version_and_tier() {
        let tags = EngineTags::for_tier("1.2.0", "medium");
        let map = tags.to_map();
        assert_eq!(map[EngineTags::ROLE_KEY], "scan-engine");
        assert_eq!(map[EngineTags::VERSION_KEY], "1.2.0");
        assert_eq!(map[EngineTags::TIER_KEY], "medium");
    }

    #[test]
    fn filter_tags_omit_the_tier_marker() {
        let map = EngineTags::filter("1.2.0").to_map();
        assert!(!map.contains_key(EngineTags::TIER_KEY));
    }

    #[test]
    fn tier_of_reads_the_instance_tag() {
        let handle = InstanceHandle {
            id: "i-1".to_string(),
            name: "sf-engine-small-1".to_string(),
            url: "http://10.0.0.7:8088".to_string(),
            launch_time: Some(1000),
            status: InstanceStatus::Running,
            tags: EngineTags::for_tier("1.2.0", "small").to_map(),
        };
        assert_eq!(EngineTags::tier_of(&handle), Some("small"));
    }
}
