//! Engine manager — the orchestration loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use scanfleet_cloud::{ComputeProvisioner, EngineTags, InstanceStatus, RetryPolicy};
use scanfleet_core::{
    Engine, EngineRecord, EngineState, EngineTier, FleetConfig, HostInfo, QueuedScan,
    ScanCompletion, ScanManagerClient, TierSet,
};
use scanfleet_pool::EnginePool;

use crate::error::{ManagerError, ManagerResult};
use crate::provision::{EngineEvent, LaunchSpec, launch_engine, reclaim_engine};

/// Why a backlogged scan could not be assigned this cycle.
enum AssignOutcome {
    Assigned,
    /// No idle engine of the tier right now.
    NoIdle,
    /// Idle engines exist but every assignment attempt failed
    /// (registration rejected); retried next cycle.
    RetryLater,
}

/// The control loop that drives the engine fleet.
///
/// All pool mutation in response to queue items, async operation
/// outcomes, and expiration happens inside [`run_cycle`], so a cycle's
/// work fully completes before the next cycle snapshots pool state.
///
/// [`run_cycle`]: EngineManager::run_cycle
pub struct EngineManager {
    pool: Arc<EnginePool>,
    provisioner: Arc<dyn ComputeProvisioner>,
    client: Arc<dyn ScanManagerClient>,
    tiers: Arc<TierSet>,
    config: Arc<FleetConfig>,
    retry: RetryPolicy,
    incoming: Receiver<QueuedScan>,
    completed: Receiver<ScanCompletion>,
    /// Scans observed but not yet assigned; re-attempted every cycle.
    backlog: VecDeque<QueuedScan>,
    /// Engine name → tier, for launches in flight.
    pending_launches: HashMap<String, String>,
    /// Engines with a reclaim in flight.
    pending_reclaims: HashSet<String>,
    /// Stopped instances kept for restart, by engine name.
    parked: HashMap<String, HostInfo>,
    /// Scan-manager registration ids, by engine name.
    registrations: HashMap<String, u64>,
    /// Per-tier name sequence for new slots.
    name_seq: HashMap<String, u32>,
    events_tx: UnboundedSender<EngineEvent>,
    events_rx: UnboundedReceiver<EngineEvent>,
}

impl EngineManager {
    pub fn new(
        pool: Arc<EnginePool>,
        provisioner: Arc<dyn ComputeProvisioner>,
        client: Arc<dyn ScanManagerClient>,
        tiers: Arc<TierSet>,
        config: Arc<FleetConfig>,
        incoming: Receiver<QueuedScan>,
        completed: Receiver<ScanCompletion>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            provisioner,
            client,
            tiers,
            config,
            retry,
            incoming,
            completed,
            backlog: VecDeque::new(),
            pending_launches: HashMap::new(),
            pending_reclaims: HashSet::new(),
            parked: HashMap::new(),
            registrations: HashMap::new(),
            name_seq: HashMap::new(),
            events_tx,
            events_rx,
        }
    }

    /// Rebuild pool state from the provider's tagged inventory. Running
    /// instances come back as idle engines; stopped ones become
    /// relaunchable slots. Returns the number of adopted instances.
    pub async fn reconcile(&mut self, now: u64) -> ManagerResult<usize> {
        let provisioner = Arc::clone(&self.provisioner);
        let filter = EngineTags::filter(&self.config.engine_version);
        let handles = self
            .retry
            .run("list_engines", || {
                let provisioner = Arc::clone(&provisioner);
                let filter = filter.clone();
                async move { provisioner.list_engines(&filter).await }
            })
            .await
            .map_err(ManagerError::Cloud)?;

        let mut adopted = 0;
        for handle in handles {
            let Some(tier) = EngineTags::tier_of(&handle).map(str::to_string) else {
                warn!(instance = %handle.id, "tagged instance has no tier marker; skipping");
                continue;
            };
            if self.tiers.get(&tier).is_none() {
                warn!(instance = %handle.id, %tier, "instance tier not configured; skipping");
                continue;
            }
            if self.pool.contains(&handle.name).await {
                continue;
            }
            match handle.status {
                InstanceStatus::Running => {
                    let host = HostInfo {
                        instance_id: handle.id.clone(),
                        url: handle.url.clone(),
                        launch_time: handle.launch_time,
                    };
                    let engine = Engine::from_provisioned_instance(
                        handle.name.clone(),
                        tier.clone(),
                        self.config.billing_interval_secs,
                        host,
                        true,
                        now,
                    );
                    self.pool.register(engine).await?;
                    info!(engine = %handle.name, %tier, "adopted running instance");
                    adopted += 1;
                }
                InstanceStatus::Stopped => {
                    let engine = Engine::new(
                        handle.name.clone(),
                        tier.clone(),
                        self.config.billing_interval_secs,
                        now,
                    );
                    self.pool.register(engine).await?;
                    self.parked.insert(
                        handle.name.clone(),
                        HostInfo {
                            instance_id: handle.id.clone(),
                            url: handle.url.clone(),
                            launch_time: None,
                        },
                    );
                    info!(engine = %handle.name, %tier, "adopted stopped instance as relaunchable slot");
                    adopted += 1;
                }
                InstanceStatus::Terminated => {}
                other => {
                    warn!(
                        instance = %handle.id,
                        status = ?other,
                        "instance in transitional state; leaving for a later reconcile"
                    );
                }
            }
        }

        self.retract_stale_registrations().await;
        Ok(adopted)
    }

    /// Drop scan-manager registrations left behind by a previous process.
    /// A registered engine carrying our name prefix that is not currently
    /// scanning is not dispatchable and must not receive work.
    async fn retract_stale_registrations(&mut self) {
        let client = Arc::clone(&self.client);
        let records = match self
            .retry
            .run("get_registered_engines", || {
                let client = Arc::clone(&client);
                async move { client.get_registered_engines().await }
            })
            .await
        {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, "could not list registered engines; stale entries may linger");
                return;
            }
        };

        let scanning: HashSet<String> = self.pool.scanning_runs().await.into_values().collect();
        for record in records {
            if !record.name.starts_with(&self.config.engine_prefix) {
                continue;
            }
            let Some(id) = record.id else { continue };
            if scanning.contains(&record.name) {
                self.registrations.insert(record.name.clone(), id);
                continue;
            }
            info!(engine = %record.name, id, "retracting stale engine registration");
            let client = Arc::clone(&self.client);
            let result = self
                .retry
                .run("unregister_engine", || {
                    let client = Arc::clone(&client);
                    async move { client.unregister_engine(id).await }
                })
                .await;
            if let Err(error) = result {
                warn!(engine = %record.name, %error, "failed to retract stale registration");
            }
        }
    }

    /// One orchestration cycle. Applies finished async operations,
    /// drains both work queues, matches scans to engines, reclaims
    /// expired engines, and tops up standing capacity.
    pub async fn run_cycle(&mut self, now: u64) {
        self.apply_events(now).await;
        self.drain_completions(now).await;
        self.drain_incoming();
        self.process_backlog(now).await;
        self.sweep_expired(now).await;
        self.ensure_standing_capacity(now).await;

        let stats = self.pool.stats().await;
        debug!(
            engines = stats.total,
            backlog = self.backlog.len(),
            launches = self.pending_launches.len(),
            reclaims = self.pending_reclaims.len(),
            "cycle complete"
        );
    }

    /// Run the orchestration loop until shutdown.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "engine manager started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_cycle(epoch_secs()).await;
                }
                _ = shutdown.changed() => {
                    info!("engine manager shutting down");
                    break;
                }
            }
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn pending_launch_count(&self) -> usize {
        self.pending_launches.len()
    }

    pub fn pending_reclaim_count(&self) -> usize {
        self.pending_reclaims.len()
    }

    // ── Async operation outcomes ────────────────────────────────────

    async fn apply_events(&mut self, now: u64) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                EngineEvent::LaunchReady { name, tier, host } => {
                    self.pending_launches.remove(&name);
                    if let Err(error) = self.pool.set_host(&name, Some(host)).await {
                        error!(engine = %name, %error, "ready engine vanished from pool");
                        continue;
                    }
                    match self.pool.change_state(&name, EngineState::Idle, now).await {
                        Ok(_) => info!(engine = %name, %tier, "engine provisioned and ready"),
                        Err(error) => {
                            error!(engine = %name, %error, "could not mark engine idle");
                        }
                    }
                }
                EngineEvent::LaunchFailed { name, tier, error } => {
                    self.pending_launches.remove(&name);
                    let _ = self.pool.annotate_error(&name, error.clone()).await;
                    error!(
                        engine = %name,
                        %tier,
                        %error,
                        "engine launch failed; slot retried on the next demand signal"
                    );
                }
                EngineEvent::ReclaimConfirmed { name, tier, parked } => {
                    self.pending_reclaims.remove(&name);
                    if let Some(host) = parked {
                        self.parked.insert(name.clone(), host);
                    }
                    match self
                        .pool
                        .change_state(&name, EngineState::Unprovisioned, now)
                        .await
                    {
                        Ok(_) => info!(engine = %name, %tier, "instance reclaimed"),
                        Err(error) => {
                            error!(engine = %name, %error, "could not reset reclaimed engine");
                        }
                    }
                }
                EngineEvent::ReclaimFailed { name, tier, error } => {
                    self.pending_reclaims.remove(&name);
                    let _ = self.pool.annotate_error(&name, error.clone()).await;
                    error!(
                        engine = %name,
                        %tier,
                        %error,
                        "instance reclaim failed; engine stays expiring and excluded from matching"
                    );
                }
            }
        }
    }

    // ── Reclamation ─────────────────────────────────────────────────

    async fn drain_completions(&mut self, now: u64) {
        while let Ok(completion) = self.completed.try_recv() {
            let name = completion.engine_name.as_str();
            match self.pool.complete_scan(name, now).await {
                Ok(_) => {
                    info!(
                        engine = %name,
                        run = %completion.scan_run_id,
                        "scan completed; engine idle"
                    );
                    self.unregister(name).await;
                }
                Err(error) => {
                    warn!(
                        engine = %name,
                        run = %completion.scan_run_id,
                        %error,
                        "stale completion ignored"
                    );
                }
            }
        }
    }

    /// Take an engine out of the scan manager's dispatch rotation until
    /// it is next assigned.
    async fn unregister(&mut self, name: &str) {
        let Some(id) = self.registrations.get(name).copied() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let result = self
            .retry
            .run("unregister_engine", || {
                let client = Arc::clone(&client);
                async move { client.unregister_engine(id).await }
            })
            .await;
        match result {
            Ok(()) => {
                self.registrations.remove(name);
            }
            Err(error) => {
                warn!(
                    engine = %name,
                    %error,
                    "failed to unregister engine; retried on its next completion"
                );
            }
        }
    }

    async fn sweep_expired(&mut self, now: u64) {
        for name in self.pool.expired_idle(now).await {
            match self.pool.change_state(&name, EngineState::Expiring, now).await {
                Ok(_) => {
                    info!(engine = %name, "idle engine reached its billing boundary");
                }
                Err(error) => warn!(engine = %name, %error, "expiration transition failed"),
            }
        }

        // Issue reclaims for every expiring engine without one in flight;
        // this also re-attempts engines whose previous reclaim failed.
        let tier_names: Vec<String> = self.tiers.iter().map(|t| t.name.clone()).collect();
        for tier in tier_names {
            for name in self.pool.in_state(&tier, EngineState::Expiring).await {
                if self.pending_reclaims.contains(&name) {
                    continue;
                }
                let host = match self.pool.host_of(&name).await {
                    Ok(Some(host)) => host,
                    Ok(None) => {
                        error!(engine = %name, "expiring engine has no host record");
                        continue;
                    }
                    Err(error) => {
                        warn!(engine = %name, %error, "expiring engine vanished from pool");
                        continue;
                    }
                };
                self.pending_reclaims.insert(name.clone());
                info!(
                    engine = %name,
                    instance = %host.instance_id,
                    terminate = self.config.terminate_on_expire,
                    "reclaiming instance"
                );
                tokio::spawn(reclaim_engine(
                    Arc::clone(&self.provisioner),
                    self.retry,
                    name,
                    tier.clone(),
                    host,
                    self.config.terminate_on_expire,
                    Duration::from_secs(self.config.reclaim_timeout_secs),
                    Duration::from_secs(self.config.provision_poll_secs),
                    self.events_tx.clone(),
                ));
            }
        }
    }

    // ── Assignment ──────────────────────────────────────────────────

    fn drain_incoming(&mut self) {
        while let Ok(scan) = self.incoming.try_recv() {
            self.backlog.push_back(scan);
        }
    }

    async fn process_backlog(&mut self, now: u64) {
        // Each launch already in flight will absorb one queued scan of
        // its tier; count them so one scan never triggers two launches.
        let mut inbound: HashMap<String, usize> = HashMap::new();
        for tier in self.pending_launches.values() {
            *inbound.entry(tier.clone()).or_insert(0) += 1;
        }

        let mut kept = VecDeque::new();
        while let Some(scan) = self.backlog.pop_front() {
            match self.assign_to_idle(&scan, now).await {
                AssignOutcome::Assigned => continue,
                AssignOutcome::RetryLater => {}
                AssignOutcome::NoIdle => {
                    let reserved = inbound.entry(scan.tier.clone()).or_insert(0);
                    if *reserved > 0 {
                        *reserved -= 1;
                    } else if let Some(tier) = self.tiers.get(&scan.tier).cloned() {
                        if self.live_or_pending(&tier.name).await < tier.max_count as usize {
                            if let Err(error) = self.start_launch(&tier, now).await {
                                error!(tier = %tier.name, %error, "provisioning request failed");
                            }
                        } else {
                            debug!(
                                scan = %scan.request.id,
                                tier = %tier.name,
                                "tier at capacity; scan stays queued"
                            );
                        }
                    }
                }
            }

            let waited = now.saturating_sub(scan.request.submitted_at);
            if waited >= self.config.queued_warn_secs {
                warn!(
                    scan = %scan.request.id,
                    tier = %scan.tier,
                    waited_secs = waited,
                    "scan still waiting for engine capacity"
                );
            }
            kept.push_back(scan);
        }
        self.backlog = kept;
    }

    async fn assign_to_idle(&mut self, scan: &QueuedScan, now: u64) -> AssignOutcome {
        let Some(tier) = self.tiers.get(&scan.tier).cloned() else {
            warn!(scan = %scan.request.id, tier = %scan.tier, "queued scan has unknown tier");
            return AssignOutcome::RetryLater;
        };

        let idle = self.pool.find_idle(&scan.tier).await;
        if idle.is_empty() {
            return AssignOutcome::NoIdle;
        }
        for name in idle {
            match self.register_and_assign(&name, &tier, scan, now).await {
                Ok(()) => return AssignOutcome::Assigned,
                Err(error) => {
                    warn!(
                        engine = %name,
                        scan = %scan.request.id,
                        %error,
                        "assignment failed; trying next idle engine"
                    );
                    let _ = self.pool.annotate_error(&name, error.to_string()).await;
                }
            }
        }
        AssignOutcome::RetryLater
    }

    /// Enable the engine with the scan manager, then mark it scanning.
    /// Registration comes first so a rejected engine is never left in
    /// `Scanning` without being dispatchable.
    async fn register_and_assign(
        &mut self,
        name: &str,
        tier: &EngineTier,
        scan: &QueuedScan,
        now: u64,
    ) -> ManagerResult<()> {
        let host = self
            .pool
            .host_of(name)
            .await?
            .ok_or_else(|| ManagerError::MissingHost(name.to_string()))?;

        let mut record = EngineRecord::for_tier(name, &host.url, tier);
        record.id = self.registrations.get(name).copied();

        let client = Arc::clone(&self.client);
        let registered = self
            .retry
            .run("register_engine", || {
                let client = Arc::clone(&client);
                let record = record.clone();
                async move {
                    if record.id.is_some() {
                        client.update_engine(&record).await
                    } else {
                        client.register_engine(&record).await
                    }
                }
            })
            .await?;
        if let Some(id) = registered.id {
            self.registrations.insert(name.to_string(), id);
        }

        self.pool.assign_scan(name, &scan.request.run_id, now).await?;
        info!(
            engine = %name,
            tier = %tier.name,
            scan = %scan.request.id,
            run = %scan.request.run_id,
            "scan assigned"
        );
        Ok(())
    }

    // ── Provisioning ────────────────────────────────────────────────

    async fn live_or_pending(&self, tier: &str) -> usize {
        self.pool.count_live(tier).await
            + self
                .pending_launches
                .values()
                .filter(|t| t.as_str() == tier)
                .count()
    }

    /// Kick off an async launch for the tier, reusing an unprovisioned
    /// slot (and its parked instance, if any) before creating a new one.
    async fn start_launch(&mut self, tier: &EngineTier, now: u64) -> ManagerResult<()> {
        let existing = self
            .pool
            .in_state(&tier.name, EngineState::Unprovisioned)
            .await
            .into_iter()
            .find(|name| {
                !self.pending_launches.contains_key(name) && !self.pending_reclaims.contains(name)
            });
        let name = match existing {
            Some(name) => name,
            None => {
                if self.pool.count_tier(&tier.name).await >= tier.max_count as usize {
                    debug!(tier = %tier.name, "all slots busy; not creating another");
                    return Ok(());
                }
                let name = self.next_name(&tier.name).await;
                let engine = Engine::new(
                    name.clone(),
                    tier.name.clone(),
                    self.config.billing_interval_secs,
                    now,
                );
                self.pool.register(engine).await?;
                name
            }
        };

        let parked = self.parked.remove(&name);
        self.pending_launches.insert(name.clone(), tier.name.clone());
        info!(
            engine = %name,
            tier = %tier.name,
            instance_type = %tier.instance_type,
            restart = parked.is_some(),
            "provisioning engine"
        );
        let spec = LaunchSpec {
            name,
            tier: tier.name.clone(),
            instance_type: tier.instance_type.clone(),
            version: self.config.engine_version.clone(),
            launch_timeout: Duration::from_secs(self.config.launch_timeout_secs),
            ready_timeout: Duration::from_secs(self.config.ready_timeout_secs),
            poll: Duration::from_secs(self.config.provision_poll_secs),
        };
        tokio::spawn(launch_engine(
            Arc::clone(&self.provisioner),
            Arc::clone(&self.client),
            self.retry,
            spec,
            parked,
            self.events_tx.clone(),
        ));
        Ok(())
    }

    /// Keep each tier topped up to its standing idle minimum during
    /// otherwise-idle cycles, within the same hard cap as demand-driven
    /// provisioning.
    async fn ensure_standing_capacity(&mut self, now: u64) {
        let tiers: Vec<EngineTier> = self.tiers.iter().cloned().collect();
        for tier in tiers {
            loop {
                let idle = self
                    .pool
                    .count_by_state_in(&tier.name, EngineState::Idle)
                    .await;
                let pending = self
                    .pending_launches
                    .values()
                    .filter(|t| t.as_str() == tier.name)
                    .count();
                if idle + pending >= tier.min_idle as usize {
                    break;
                }
                if self.live_or_pending(&tier.name).await >= tier.max_count as usize {
                    break;
                }
                if let Err(error) = self.start_launch(&tier, now).await {
                    error!(tier = %tier.name, %error, "standing-capacity launch failed");
                    break;
                }
            }
        }
    }

    async fn next_name(&mut self, tier: &str) -> String {
        loop {
            let seq = self.name_seq.entry(tier.to_string()).or_insert(0);
            *seq += 1;
            let candidate = format!("{}-{}-{}", self.config.engine_prefix, tier, *seq);
            if !self.pool.contains(&candidate).await {
                return candidate;
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
