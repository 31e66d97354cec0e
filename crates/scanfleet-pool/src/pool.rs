//! Engine pool — registry, indices, and atomic state transitions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use scanfleet_core::{
    Engine, EngineSnapshot, EngineState, HostInfo, StateChange, TierSet, TransitionError,
};

use crate::error::{PoolError, PoolResult};
use crate::policy::{IdleCandidate, IdlePolicy};

/// Notification hook invoked after every applied transition, outside the
/// pool lock. Purely observational: implementations must not assume
/// they can call back into the pool synchronously with ordering
/// guarantees.
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, name: &str, tier: &str, change: &StateChange);
}

/// Per-tier engine counts by state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub tier: String,
    pub unprovisioned: usize,
    pub idle: usize,
    pub scanning: usize,
    pub expiring: usize,
}

/// Pool-wide counts, one row per configured tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub tiers: Vec<TierStats>,
}

struct PoolInner {
    engines: HashMap<String, Engine>,
    by_tier: HashMap<String, BTreeSet<String>>,
    by_state: HashMap<EngineState, BTreeSet<String>>,
}

impl PoolInner {
    fn new() -> Self {
        let mut by_state = HashMap::with_capacity(EngineState::ALL.len());
        for state in EngineState::ALL {
            by_state.insert(state, BTreeSet::new());
        }
        Self {
            engines: HashMap::new(),
            by_tier: HashMap::new(),
            by_state,
        }
    }

    fn engine(&self, name: &str) -> PoolResult<&Engine> {
        self.engines
            .get(name)
            .ok_or_else(|| PoolError::UnknownEngine(name.to_string()))
    }

    fn engine_mut(&mut self, name: &str) -> PoolResult<&mut Engine> {
        self.engines
            .get_mut(name)
            .ok_or_else(|| PoolError::UnknownEngine(name.to_string()))
    }

    fn move_state_bucket(&mut self, name: &str, from: EngineState, to: EngineState) {
        if let Some(bucket) = self.by_state.get_mut(&from) {
            bucket.remove(name);
        }
        self.by_state
            .entry(to)
            .or_default()
            .insert(name.to_string());
    }

    fn names_in(&self, tier: &str, state: EngineState) -> Vec<String> {
        let Some(tier_bucket) = self.by_tier.get(tier) else {
            return Vec::new();
        };
        let Some(state_bucket) = self.by_state.get(&state) else {
            return Vec::new();
        };
        tier_bucket.intersection(state_bucket).cloned().collect()
    }
}

/// Thread-safe registry of all engines, indexed by tier and by state.
///
/// Every mutation funnels through the pool lock; a transition and its
/// index update are one atomic operation, so concurrent readers never
/// see a half-applied change.
pub struct EnginePool {
    tiers: Arc<TierSet>,
    policy: Arc<dyn IdlePolicy>,
    listener: Option<Arc<dyn TransitionListener>>,
    inner: RwLock<PoolInner>,
}

impl EnginePool {
    pub fn new(tiers: Arc<TierSet>, policy: Arc<dyn IdlePolicy>) -> Self {
        Self {
            tiers,
            policy,
            listener: None,
            inner: RwLock::new(PoolInner::new()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransitionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// Add a new engine. The tier must be configured and the name unused.
    pub async fn register(&self, engine: Engine) -> PoolResult<()> {
        if self.tiers.get(engine.tier()).is_none() {
            return Err(PoolError::UnknownTier(engine.tier().to_string()));
        }
        let mut inner = self.inner.write().await;
        if inner.engines.contains_key(engine.name()) {
            return Err(PoolError::DuplicateEngine(engine.name().to_string()));
        }
        let name = engine.name().to_string();
        let tier = engine.tier().to_string();
        let state = engine.state();

        inner.by_tier.entry(tier.clone()).or_default().insert(name.clone());
        inner.by_state.entry(state).or_default().insert(name.clone());
        inner.engines.insert(name.clone(), engine);

        info!(engine = %name, %tier, %state, "engine registered");
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.engines.contains_key(name)
    }

    /// Apply a state transition and its index update as one operation.
    ///
    /// A self-transition is reported (warn + `Err`) but not applied.
    pub async fn change_state(
        &self,
        name: &str,
        to: EngineState,
        now: u64,
    ) -> PoolResult<StateChange> {
        self.apply(name, to, now, |_| {}).await
    }

    /// `Idle → Scanning` plus recording the assigned scan run.
    pub async fn assign_scan(
        &self,
        name: &str,
        run_id: &str,
        now: u64,
    ) -> PoolResult<StateChange> {
        let run_id = run_id.to_string();
        self.apply(name, EngineState::Scanning, now, move |engine| {
            engine.set_scan_run_id(Some(run_id));
        })
        .await
    }

    /// `Scanning → Idle`; the engine's run id is cleared by the
    /// transition itself and its expiration recomputed.
    pub async fn complete_scan(&self, name: &str, now: u64) -> PoolResult<StateChange> {
        self.apply(name, EngineState::Idle, now, |_| {}).await
    }

    async fn apply(
        &self,
        name: &str,
        to: EngineState,
        now: u64,
        post: impl FnOnce(&mut Engine),
    ) -> PoolResult<StateChange> {
        let (tier, change) = {
            let mut inner = self.inner.write().await;
            let engine = inner.engine_mut(name)?;
            let tier = engine.tier().to_string();
            let change = match engine.transition(to, now) {
                Ok(change) => change,
                Err(TransitionError::SelfTransition(state)) => {
                    warn!(engine = %name, %state, "ignoring self-transition");
                    return Err(PoolError::SelfTransition {
                        name: name.to_string(),
                        state,
                    });
                }
                Err(TransitionError::Invalid { from, to }) => {
                    return Err(PoolError::InvalidTransition {
                        name: name.to_string(),
                        from,
                        to,
                    });
                }
            };
            post(inner.engine_mut(name)?);
            inner.move_state_bucket(name, change.from, change.to);
            (tier, change)
        };

        debug!(engine = %name, %tier, from = %change.from, to = %change.to, "state changed");
        if let Some(listener) = &self.listener {
            listener.on_transition(name, &tier, &change);
        }
        Ok(change)
    }

    pub async fn set_host(&self, name: &str, host: Option<HostInfo>) -> PoolResult<()> {
        let mut inner = self.inner.write().await;
        inner.engine_mut(name)?.set_host(host);
        Ok(())
    }

    /// Record a failure annotation on an engine without touching its
    /// state. Cleared by the engine's next successful transition.
    pub async fn annotate_error(&self, name: &str, error: String) -> PoolResult<()> {
        let mut inner = self.inner.write().await;
        inner.engine_mut(name)?.set_error(Some(error));
        Ok(())
    }

    pub async fn host_of(&self, name: &str) -> PoolResult<Option<HostInfo>> {
        let inner = self.inner.read().await;
        Ok(inner.engine(name)?.host().cloned())
    }

    /// Idle engines of a tier, ordered by the configured selection
    /// policy. The first entry should be assigned next.
    pub async fn find_idle(&self, tier: &str) -> Vec<String> {
        let mut candidates = {
            let inner = self.inner.read().await;
            inner
                .names_in(tier, EngineState::Idle)
                .into_iter()
                .filter_map(|name| {
                    inner.engines.get(&name).map(|engine| IdleCandidate {
                        name,
                        expire_at: engine.expire_at(),
                        idle_since: engine.state_entered_at(),
                    })
                })
                .collect::<Vec<_>>()
        };
        self.policy.rank(&mut candidates);
        candidates.into_iter().map(|c| c.name).collect()
    }

    /// Idle engines, across all tiers, whose expiration has passed.
    pub async fn expired_idle(&self, now: u64) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .by_state
            .get(&EngineState::Idle)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|name| {
                        inner
                            .engines
                            .get(*name)
                            .and_then(|e| e.expire_at())
                            .is_some_and(|t| t <= now)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Engines of a tier in a given state.
    pub async fn in_state(&self, tier: &str, state: EngineState) -> Vec<String> {
        self.inner.read().await.names_in(tier, state)
    }

    /// Map of in-flight scan runs to the engines running them.
    pub async fn scanning_runs(&self) -> HashMap<String, String> {
        let inner = self.inner.read().await;
        inner
            .by_state
            .get(&EngineState::Scanning)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|name| {
                        let run = inner.engines.get(name)?.scan_run_id()?;
                        Some((run.to_string(), name.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn count_by_state(&self, state: EngineState) -> usize {
        self.inner
            .read()
            .await
            .by_state
            .get(&state)
            .map_or(0, BTreeSet::len)
    }

    pub async fn count_by_state_in(&self, tier: &str, state: EngineState) -> usize {
        self.inner.read().await.names_in(tier, state).len()
    }

    /// Engines of a tier with a live backing instance (anything but
    /// `Unprovisioned`).
    pub async fn count_live(&self, tier: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .by_tier
            .get(tier)
            .map_or(0, |bucket| {
                bucket
                    .iter()
                    .filter(|name| {
                        inner
                            .engines
                            .get(*name)
                            .is_some_and(|e| e.state() != EngineState::Unprovisioned)
                    })
                    .count()
            })
    }

    /// All engine slots of a tier, live or not.
    pub async fn count_tier(&self, tier: &str) -> usize {
        self.inner
            .read()
            .await
            .by_tier
            .get(tier)
            .map_or(0, BTreeSet::len)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.engines.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.engines.is_empty()
    }

    /// Read-only view of every engine, for status queries and dashboards.
    pub async fn snapshot(&self, now: u64) -> Vec<EngineSnapshot> {
        let inner = self.inner.read().await;
        let mut snapshots: Vec<_> = inner.engines.values().map(|e| e.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Per-tier/state counts, one row per configured tier.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.read().await;
        let tiers = self
            .tiers
            .iter()
            .map(|tier| {
                let mut stats = TierStats {
                    tier: tier.name.clone(),
                    unprovisioned: 0,
                    idle: 0,
                    scanning: 0,
                    expiring: 0,
                };
                if let Some(bucket) = inner.by_tier.get(&tier.name) {
                    for name in bucket {
                        match inner.engines.get(name).map(Engine::state) {
                            Some(EngineState::Unprovisioned) => stats.unprovisioned += 1,
                            Some(EngineState::Idle) => stats.idle += 1,
                            Some(EngineState::Scanning) => stats.scanning += 1,
                            Some(EngineState::Expiring) => stats.expiring += 1,
                            None => {}
                        }
                    }
                }
                stats
            })
            .collect();
        PoolStats {
            total: inner.engines.len(),
            tiers,
        }
    }
}
