//! Fleet configuration.
//!
//! Bound once at startup (the daemon reads it from a TOML file) and
//! treated as immutable afterwards. Validation happens here so every
//! component can assume a well-formed config.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::tier::{EngineTier, TierSet};

/// Top-level configuration for the engine fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Prefix for generated engine names (`<prefix>-<tier>-<n>`).
    #[serde(default = "default_engine_prefix")]
    pub engine_prefix: String,

    /// Version marker tagged onto instances, so inventory reconciliation
    /// only adopts engines launched for this deployment.
    #[serde(default = "default_engine_version")]
    pub engine_version: String,

    /// The provider's minimum billable unit, in seconds.
    #[serde(default = "default_billing_interval_secs")]
    pub billing_interval_secs: u64,

    /// How long a launched instance may take to reach the running state.
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    /// How long the engine software may take to respond after the
    /// instance is running.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// How long a stop/terminate request may take to be confirmed.
    #[serde(default = "default_reclaim_timeout_secs")]
    pub reclaim_timeout_secs: u64,

    /// Polling cadence while waiting on instance launch and readiness.
    #[serde(default = "default_provision_poll_secs")]
    pub provision_poll_secs: u64,

    /// Scan queue polling cadence.
    #[serde(default = "default_monitor_poll_secs")]
    pub monitor_poll_secs: u64,

    /// Orchestration loop cadence.
    #[serde(default = "default_manager_cycle_secs")]
    pub manager_cycle_secs: u64,

    /// Bounded capacity of the incoming-work queue.
    #[serde(default = "default_queue_capacity")]
    pub incoming_queue_capacity: usize,

    /// Bounded capacity of the completed-work queue.
    #[serde(default = "default_queue_capacity")]
    pub completed_queue_capacity: usize,

    /// Warn once a queued scan has waited this long for capacity.
    #[serde(default = "default_queued_warn_secs")]
    pub queued_warn_secs: u64,

    /// Terminate expired instances instead of stopping them. Stopped
    /// instances are restarted on the next demand signal, trading a
    /// little storage cost for faster relaunch.
    #[serde(default)]
    pub terminate_on_expire: bool,

    /// Which idle engine gets the next scan of its tier.
    #[serde(default)]
    pub idle_policy: IdlePolicyChoice,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(rename = "tier")]
    pub tiers: Vec<TierConfig>,
}

/// Named idle-selection policy (see `scanfleet-pool`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdlePolicyChoice {
    /// Reuse the engine whose paid-for window runs out soonest.
    #[default]
    SoonestToExpire,
    /// Reuse the engine that has been idle the longest.
    OldestIdleFirst,
}

/// Bounded retry with exponential backoff, applied to every external
/// provisioner and scan-manager call.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// One `[[tier]]` table from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub min_loc: u64,
    pub max_loc: u64,
    #[serde(default)]
    pub min_idle: u32,
    pub max_count: u32,
    pub instance_type: String,
}

impl FleetConfig {
    /// Validate the whole structure. Tier-table problems surface through
    /// [`TierSet::new`]; interval and capacity fields must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tier_set()?;
        for (value, field) in [
            (self.billing_interval_secs, "billing_interval_secs"),
            (self.launch_timeout_secs, "launch_timeout_secs"),
            (self.ready_timeout_secs, "ready_timeout_secs"),
            (self.reclaim_timeout_secs, "reclaim_timeout_secs"),
            (self.provision_poll_secs, "provision_poll_secs"),
            (self.monitor_poll_secs, "monitor_poll_secs"),
            (self.manager_cycle_secs, "manager_cycle_secs"),
            (self.incoming_queue_capacity as u64, "incoming_queue_capacity"),
            (self.completed_queue_capacity as u64, "completed_queue_capacity"),
            (u64::from(self.retry.max_attempts), "retry.max_attempts"),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { field });
            }
        }
        Ok(())
    }

    /// Build the immutable tier table.
    pub fn tier_set(&self) -> Result<TierSet, ConfigError> {
        TierSet::new(
            self.tiers
                .iter()
                .map(|t| EngineTier {
                    name: t.name.clone(),
                    min_loc: t.min_loc,
                    max_loc: t.max_loc,
                    min_idle: t.min_idle,
                    max_count: t.max_count,
                    instance_type: t.instance_type.clone(),
                })
                .collect(),
        )
    }
}

fn default_engine_prefix() -> String {
    "sf-engine".to_string()
}

fn default_engine_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_billing_interval_secs() -> u64 {
    3600
}

fn default_launch_timeout_secs() -> u64 {
    60
}

fn default_ready_timeout_secs() -> u64 {
    300
}

fn default_reclaim_timeout_secs() -> u64 {
    120
}

fn default_provision_poll_secs() -> u64 {
    10
}

fn default_monitor_poll_secs() -> u64 {
    20
}

fn default_manager_cycle_secs() -> u64 {
    15
}

fn default_queue_capacity() -> usize {
    64
}

fn default_queued_warn_secs() -> u64 {
    600
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}
