//! Idle-selection policy.
//!
//! When several idle engines of a tier could take the next scan, the
//! policy decides which one goes first. The default consumes the engine
//! whose already-paid-for billing window runs out soonest, so reuse eats
//! time that would otherwise be reclaimed. The rule is swappable because
//! operators with long-running scans sometimes prefer plain
//! oldest-idle-first rotation.

use std::cmp::Ordering;
use std::sync::Arc;

use scanfleet_core::IdlePolicyChoice;

/// The facts the policy may rank on, extracted under the pool lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleCandidate {
    pub name: String,
    /// Upcoming expiration (epoch seconds); `None` sorts last.
    pub expire_at: Option<u64>,
    /// When the engine entered `Idle` (epoch seconds).
    pub idle_since: u64,
}

/// Orders idle candidates; the first entry is assigned next.
pub trait IdlePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn rank(&self, candidates: &mut [IdleCandidate]);
}

/// Prefer the engine with the earliest upcoming expiration.
#[derive(Debug, Default)]
pub struct SoonestToExpire;

impl IdlePolicy for SoonestToExpire {
    fn name(&self) -> &'static str {
        "soonest-to-expire"
    }

    fn rank(&self, candidates: &mut [IdleCandidate]) {
        candidates.sort_by(|a, b| {
            let key_a = a.expire_at.unwrap_or(u64::MAX);
            let key_b = b.expire_at.unwrap_or(u64::MAX);
            match key_a.cmp(&key_b) {
                Ordering::Equal => a.name.cmp(&b.name),
                other => other,
            }
        });
    }
}

/// Prefer the engine that has been idle the longest.
#[derive(Debug, Default)]
pub struct OldestIdleFirst;

impl IdlePolicy for OldestIdleFirst {
    fn name(&self) -> &'static str {
        "oldest-idle-first"
    }

    fn rank(&self, candidates: &mut [IdleCandidate]) {
        candidates.sort_by(|a, b| match a.idle_since.cmp(&b.idle_since) {
            Ordering::Equal => a.name.cmp(&b.name),
            other => other,
        });
    }
}

/// Resolve the configured policy name.
pub fn policy_for(choice: IdlePolicyChoice) -> Arc<dyn IdlePolicy> {
    match choice {
        IdlePolicyChoice::SoonestToExpire => Arc::new(SoonestToExpire),
        IdlePolicyChoice::OldestIdleFirst => Arc::new(OldestIdleFirst),
    }
}
