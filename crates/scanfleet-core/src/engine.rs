//! Engine — the lifecycle state machine for one dynamically provisioned
//! scan engine.
//!
//! An engine cycles through `Unprovisioned → Idle → Scanning → Idle →
//! Expiring → Unprovisioned`. Every transition closes out the wall-clock
//! time spent in the state being left, and entering `Idle` recomputes the
//! expiration deadline so the engine is reclaimed exactly at the next
//! billing-interval boundary — never before the time already paid for is
//! used up, never a full interval after.
//!
//! Engines do not mutate their owning pool; the pool applies transitions
//! under its own lock and keeps its indices in step.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Lifecycle state of a dynamic engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No backing instance; the slot can be (re)launched.
    Unprovisioned,
    /// Instance running and engine software responsive, awaiting work.
    Idle,
    /// Assigned to exactly one scan run.
    Scanning,
    /// Past its billing boundary; reclamation in progress.
    Expiring,
}

impl EngineState {
    /// All states, in lifecycle order. Used for elapsed-time accounting.
    pub const ALL: [EngineState; 4] = [
        EngineState::Unprovisioned,
        EngineState::Idle,
        EngineState::Scanning,
        EngineState::Expiring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Unprovisioned => "unprovisioned",
            EngineState::Idle => "idle",
            EngineState::Scanning => "scanning",
            EngineState::Expiring => "expiring",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor of the cloud host backing an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Provider instance id.
    pub instance_id: String,
    /// Base URL of the engine software on the instance.
    pub url: String,
    /// Launch time as reported by the provider (epoch seconds), when known.
    pub launch_time: Option<u64>,
}

/// An applied state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: EngineState,
    pub to: EngineState,
}

/// One dynamically provisioned scan engine and its lifecycle state.
///
/// Identity is `(name, tier)`, the only immutable properties. Equality
/// and hashing are defined on that pair alone.
#[derive(Debug, Clone)]
pub struct Engine {
    name: String,
    tier: String,
    state: EngineState,
    /// Epoch seconds when the current state was entered.
    state_entered_at: u64,
    /// Accumulated seconds per state, over the engine's whole life.
    elapsed: HashMap<EngineState, u64>,
    /// Epoch seconds when the backing instance launched.
    launch_time: Option<u64>,
    /// Epoch seconds at which an idle engine should be reclaimed.
    expire_at: Option<u64>,
    /// The scan run currently assigned, while `Scanning`.
    scan_run_id: Option<String>,
    host: Option<HostInfo>,
    /// Annotation from the most recent failed provisioning or reclaim
    /// attempt. Cleared by the next successful transition.
    last_error: Option<String>,
    /// The provider's minimum billable unit, in seconds.
    billing_interval_secs: u64,
}

impl Engine {
    pub fn new(
        name: impl Into<String>,
        tier: impl Into<String>,
        billing_interval_secs: u64,
        now: u64,
    ) -> Self {
        let mut elapsed = HashMap::with_capacity(EngineState::ALL.len());
        for state in EngineState::ALL {
            elapsed.insert(state, 0);
        }
        Self {
            name: name.into(),
            tier: tier.into(),
            state: EngineState::Unprovisioned,
            state_entered_at: now,
            elapsed,
            launch_time: None,
            expire_at: None,
            scan_run_id: None,
            host: None,
            last_error: None,
            billing_interval_secs,
        }
    }

    /// Rebuild an engine from an instance discovered in the provider's
    /// tagged inventory at startup. A running instance comes back `Idle`
    /// with its expiration recomputed from the provider-reported launch
    /// time; anything else becomes an unprovisioned slot.
    pub fn from_provisioned_instance(
        name: impl Into<String>,
        tier: impl Into<String>,
        billing_interval_secs: u64,
        host: HostInfo,
        is_running: bool,
        now: u64,
    ) -> Self {
        let mut engine = Self::new(name, tier, billing_interval_secs, now);
        if is_running {
            engine.launch_time = Some(host.launch_time.unwrap_or(now));
            engine.host = Some(host);
            engine.state = EngineState::Idle;
            engine.expire_at = engine.compute_expire_at(now);
        }
        engine
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn state_entered_at(&self) -> u64 {
        self.state_entered_at
    }

    pub fn launch_time(&self) -> Option<u64> {
        self.launch_time
    }

    pub fn expire_at(&self) -> Option<u64> {
        self.expire_at
    }

    pub fn scan_run_id(&self) -> Option<&str> {
        self.scan_run_id.as_deref()
    }

    pub fn host(&self) -> Option<&HostInfo> {
        self.host.as_ref()
    }

    pub fn url(&self) -> Option<&str> {
        self.host.as_ref().map(|h| h.url.as_str())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Seconds since the backing instance launched. Zero when unprovisioned.
    pub fn run_time(&self, now: u64) -> u64 {
        match self.launch_time {
            Some(t) => now.saturating_sub(t),
            None => 0,
        }
    }

    /// Seconds spent in the current state so far.
    pub fn elapsed_in_state(&self, now: u64) -> u64 {
        now.saturating_sub(self.state_entered_at)
    }

    /// Accumulated seconds per state, including the still-open time in the
    /// current state.
    pub fn elapsed_times(&self, now: u64) -> HashMap<EngineState, u64> {
        let mut totals = self.elapsed.clone();
        *totals.entry(self.state).or_insert(0) += self.elapsed_in_state(now);
        totals
    }

    // ── Mutators (used by the owning pool) ──────────────────────────

    pub fn set_host(&mut self, host: Option<HostInfo>) {
        self.host = host;
    }

    pub fn set_scan_run_id(&mut self, run_id: Option<String>) {
        self.scan_run_id = run_id;
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }

    /// Apply a state transition, closing out elapsed-time accounting for
    /// the state being left and performing the entry bookkeeping for the
    /// new state.
    ///
    /// Re-entering the current state is rejected as a
    /// [`TransitionError::SelfTransition`] and leaves the engine untouched.
    pub fn transition(
        &mut self,
        to: EngineState,
        now: u64,
    ) -> Result<StateChange, TransitionError> {
        let from = self.state;
        if from == to {
            return Err(TransitionError::SelfTransition(to));
        }
        if !transition_allowed(from, to) {
            return Err(TransitionError::Invalid { from, to });
        }

        // Close out the state being left before switching.
        let spent = now.saturating_sub(self.state_entered_at);
        *self.elapsed.entry(from).or_insert(0) += spent;

        // Leaving Unprovisioned means the instance is confirmed running:
        // pin the launch time, preferring the provider-reported one.
        if from == EngineState::Unprovisioned {
            let reported = self.host.as_ref().and_then(|h| h.launch_time);
            self.launch_time = Some(reported.unwrap_or(now));
        }

        self.state = to;
        self.state_entered_at = now;
        self.last_error = None;

        match to {
            EngineState::Unprovisioned => {
                self.host = None;
                self.launch_time = None;
                self.expire_at = None;
                self.scan_run_id = None;
            }
            EngineState::Idle => {
                self.expire_at = self.compute_expire_at(now);
                self.scan_run_id = None;
            }
            EngineState::Scanning => {
                self.expire_at = None;
            }
            EngineState::Expiring => {
                self.expire_at = None;
            }
        }

        Ok(StateChange { from, to })
    }

    /// Next billing-interval boundary strictly after `now`:
    /// `launch_time + (⌊run_time / interval⌋ + 1) × interval`.
    fn compute_expire_at(&self, now: u64) -> Option<u64> {
        let launch = self.launch_time?;
        if self.billing_interval_secs == 0 {
            return None;
        }
        let run = now.saturating_sub(launch);
        let intervals = run / self.billing_interval_secs + 1;
        Some(launch + intervals * self.billing_interval_secs)
    }

    /// Read-only view for status queries and dashboards.
    pub fn snapshot(&self, now: u64) -> EngineSnapshot {
        EngineSnapshot {
            name: self.name.clone(),
            tier: self.tier.clone(),
            state: self.state,
            host_url: self.host.as_ref().map(|h| h.url.clone()),
            launch_time: self.launch_time,
            expire_at: self.expire_at,
            run_time_secs: self.run_time(now),
            elapsed_secs: self.elapsed_times(now),
            scan_run_id: self.scan_run_id.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

// Identity is (name, tier); all other fields are mutable state.
impl PartialEq for Engine {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.tier == other.tier
    }
}

impl Eq for Engine {}

impl std::hash::Hash for Engine {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.tier.hash(state);
    }
}

/// Point-in-time view of a single engine, exposed for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub name: String,
    pub tier: String,
    pub state: EngineState,
    pub host_url: Option<String>,
    pub launch_time: Option<u64>,
    pub expire_at: Option<u64>,
    pub run_time_secs: u64,
    pub elapsed_secs: HashMap<EngineState, u64>,
    pub scan_run_id: Option<String>,
    pub last_error: Option<String>,
}

fn transition_allowed(from: EngineState, to: EngineState) -> bool {
    use EngineState::*;
    matches!(
        (from, to),
        (Unprovisioned, Idle) | (Idle, Scanning) | (Scanning, Idle) | (Idle, Expiring)
            | (Expiring, Unprovisioned)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600;

    fn test_host(launch_time: Option<u64>) -> HostInfo {
        HostInfo {
            instance_id: "i-0abc".to_string(),
            url: "http://10.0.0.5:8088".to_string(),
            launch_time,
        }
    }

    #[test]
    fn new_engine_starts_unprovisioned() {
        let engine = Engine::new("sf-engine-small-1", "small", HOUR, 1000);
        assert_eq!(engine.state(), EngineState::Unprovisioned);
        assert_eq!(engine.launch_time(), None);
        assert_eq!(engine.expire_at(), None);
        assert_eq!(engine.scan_run_id(), None);
        assert!(engine.host().is_none());
        assert_eq!(engine.run_time(5000), 0);
    }

    #[test]
    fn identity_is_name_and_tier() {
        let a = Engine::new("e1", "small", HOUR, 0);
        let mut b = Engine::new("e1", "small", HOUR, 500);
        b.set_error(Some("boom".to_string()));
        let c = Engine::new("e1", "medium", HOUR, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn self_transition_is_rejected_and_leaves_accounting_untouched() {
        let mut engine = Engine::new("e1", "small", HOUR, 1000);
        let before = engine.elapsed_times(1000);

        let err = engine.transition(EngineState::Unprovisioned, 2000);
        assert_eq!(
            err,
            Err(TransitionError::SelfTransition(EngineState::Unprovisioned))
        );
        // Entry timestamp unchanged, so elapsed accounting at the original
        // instant is identical.
        assert_eq!(engine.state_entered_at(), 1000);
        assert_eq!(engine.elapsed_times(1000), before);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut engine = Engine::new("e1", "small", HOUR, 1000);
        let err = engine.transition(EngineState::Scanning, 2000);
        assert_eq!(
            err,
            Err(TransitionError::Invalid {
                from: EngineState::Unprovisioned,
                to: EngineState::Scanning,
            })
        );
        assert_eq!(engine.state(), EngineState::Unprovisioned);
    }

    #[test]
    fn provisioning_sets_launch_time_from_host_record() {
        let mut engine = Engine::new("e1", "small", HOUR, 1000);
        engine.set_host(Some(test_host(Some(900))));

        engine.transition(EngineState::Idle, 1000).unwrap();
        assert_eq!(engine.launch_time(), Some(900));
        // run time 100s into the first hour → expires at launch + 1h.
        assert_eq!(engine.expire_at(), Some(900 + HOUR));
    }

    #[test]
    fn provisioning_falls_back_to_now_without_host_launch_time() {
        let mut engine = Engine::new("e1", "small", HOUR, 1000);
        engine.set_host(Some(test_host(None)));

        engine.transition(EngineState::Idle, 1234).unwrap();
        assert_eq!(engine.launch_time(), Some(1234));
        assert_eq!(engine.expire_at(), Some(1234 + HOUR));
    }

    #[test]
    fn expiration_is_next_billing_boundary_after_now() {
        // Launch at T0, 1.5h of run time: next boundary is the 2h mark.
        let t0 = 10_000;
        let mut engine = Engine::new("e1", "medium", HOUR, t0);
        engine.set_host(Some(test_host(Some(t0))));
        engine.transition(EngineState::Idle, t0).unwrap();
        engine.transition(EngineState::Scanning, t0 + 100).unwrap();

        engine.transition(EngineState::Idle, t0 + 5400).unwrap();
        assert_eq!(engine.expire_at(), Some(t0 + 2 * HOUR));
    }

    #[test]
    fn expiration_at_exact_boundary_moves_to_next_interval() {
        let t0 = 10_000;
        let mut engine = Engine::new("e1", "medium", HOUR, t0);
        engine.set_host(Some(test_host(Some(t0))));
        engine.transition(EngineState::Idle, t0).unwrap();
        engine.transition(EngineState::Scanning, t0 + 100).unwrap();

        // Exactly one full interval of run time: the 1h boundary is "now",
        // so the expiration lands strictly after, at 2h.
        engine.transition(EngineState::Idle, t0 + HOUR).unwrap();
        assert_eq!(engine.expire_at(), Some(t0 + 2 * HOUR));
    }

    #[test]
    fn scanning_clears_expiration_and_records_run() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_host(Some(test_host(Some(0))));
        engine.transition(EngineState::Idle, 0).unwrap();

        engine.transition(EngineState::Scanning, 10).unwrap();
        engine.set_scan_run_id(Some("run-42".to_string()));
        assert_eq!(engine.expire_at(), None);
        assert_eq!(engine.scan_run_id(), Some("run-42"));

        // Completion clears the run id and recomputes the boundary.
        engine.transition(EngineState::Idle, 20).unwrap();
        assert_eq!(engine.scan_run_id(), None);
        assert_eq!(engine.expire_at(), Some(HOUR));
    }

    #[test]
    fn full_round_trip_resets_all_mutable_fields() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_host(Some(test_host(Some(0))));

        engine.transition(EngineState::Idle, 0).unwrap();
        engine.transition(EngineState::Scanning, 100).unwrap();
        engine.set_scan_run_id(Some("run-1".to_string()));
        engine.transition(EngineState::Idle, 200).unwrap();
        engine.transition(EngineState::Expiring, HOUR).unwrap();
        engine.transition(EngineState::Unprovisioned, HOUR + 60).unwrap();

        assert_eq!(engine.state(), EngineState::Unprovisioned);
        assert!(engine.host().is_none());
        assert_eq!(engine.launch_time(), None);
        assert_eq!(engine.expire_at(), None);
        assert_eq!(engine.scan_run_id(), None);
    }

    #[test]
    fn elapsed_time_accumulates_per_state() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_host(Some(test_host(Some(0))));

        engine.transition(EngineState::Idle, 100).unwrap(); // 100s unprovisioned
        engine.transition(EngineState::Scanning, 160).unwrap(); // 60s idle
        engine.transition(EngineState::Idle, 460).unwrap(); // 300s scanning

        let totals = engine.elapsed_times(500);
        assert_eq!(totals[&EngineState::Unprovisioned], 100);
        // 60s from the first idle period plus 40s still open in the second.
        assert_eq!(totals[&EngineState::Idle], 100);
        assert_eq!(totals[&EngineState::Scanning], 300);
        assert_eq!(totals[&EngineState::Expiring], 0);
    }

    #[test]
    fn elapsed_totals_survive_round_trips() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_host(Some(test_host(Some(0))));
        engine.transition(EngineState::Idle, 10).unwrap();
        engine.transition(EngineState::Expiring, 20).unwrap();
        engine.transition(EngineState::Unprovisioned, 30).unwrap();

        engine.set_host(Some(test_host(Some(100))));
        engine.transition(EngineState::Idle, 100).unwrap();

        let totals = engine.elapsed_times(100);
        // 10s first unprovisioned stretch + 70s second stretch.
        assert_eq!(totals[&EngineState::Unprovisioned], 80);
        assert_eq!(totals[&EngineState::Idle], 10);
        assert_eq!(totals[&EngineState::Expiring], 10);
    }

    #[test]
    fn successful_transition_clears_error_annotation() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_error(Some("launch timed out".to_string()));
        engine.set_host(Some(test_host(Some(0))));

        engine.transition(EngineState::Idle, 10).unwrap();
        assert_eq!(engine.last_error(), None);
    }

    #[test]
    fn from_provisioned_instance_running() {
        let engine = Engine::from_provisioned_instance(
            "e1",
            "large",
            HOUR,
            test_host(Some(500)),
            true,
            5900,
        );
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.launch_time(), Some(500));
        // 5400s of run time → next boundary at launch + 2h.
        assert_eq!(engine.expire_at(), Some(500 + 2 * HOUR));
    }

    #[test]
    fn from_provisioned_instance_stopped_is_a_bare_slot() {
        let engine = Engine::from_provisioned_instance(
            "e1",
            "large",
            HOUR,
            test_host(Some(500)),
            false,
            5900,
        );
        assert_eq!(engine.state(), EngineState::Unprovisioned);
        assert!(engine.host().is_none());
        assert_eq!(engine.launch_time(), None);
    }

    #[test]
    fn snapshot_serializes_for_ops_tooling() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_host(Some(test_host(Some(0))));
        engine.transition(EngineState::Idle, 0).unwrap();

        let json = serde_json::to_value(engine.snapshot(30)).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["tier"], "small");
        assert_eq!(json["expire_at"], 3600);
        assert_eq!(json["elapsed_secs"]["idle"], 30);
    }

    #[test]
    fn snapshot_reflects_live_state() {
        let mut engine = Engine::new("e1", "small", HOUR, 0);
        engine.set_host(Some(test_host(Some(0))));
        engine.transition(EngineState::Idle, 0).unwrap();

        let snap = engine.snapshot(90);
        assert_eq!(snap.name, "e1");
        assert_eq!(snap.tier, "small");
        assert_eq!(snap.state, EngineState::Idle);
        assert_eq!(snap.host_url.as_deref(), Some("http://10.0.0.5:8088"));
        assert_eq!(snap.run_time_secs, 90);
        assert_eq!(snap.expire_at, Some(HOUR));
        assert_eq!(snap.elapsed_secs[&EngineState::Idle], 90);
    }
}
