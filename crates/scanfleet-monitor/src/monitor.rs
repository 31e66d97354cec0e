//! Scan queue monitor — the polling loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use scanfleet_cloud::RetryPolicy;
use scanfleet_core::{QueuedScan, ScanCompletion, ScanManagerClient, TierSet};
use scanfleet_pool::EnginePool;

/// Polls the scan manager on a fixed cadence, classifies newly observed
/// pending scans, and detects completions of assigned scan runs by
/// diffing the pending set against the pool's in-flight runs.
pub struct ScanQueueMonitor {
    client: Arc<dyn ScanManagerClient>,
    pool: Arc<EnginePool>,
    tiers: Arc<TierSet>,
    retry: RetryPolicy,
    incoming_tx: Sender<QueuedScan>,
    completed_tx: Sender<ScanCompletion>,
    /// Scan ids already forwarded to the work queue, kept while the scan
    /// is still pending so each scan is enqueued exactly once.
    tracked: HashSet<String>,
    /// Run ids whose completion has been queued but whose engine has not
    /// yet returned to idle.
    announced: HashSet<String>,
}

impl ScanQueueMonitor {
    /// Build the monitor and its two bounded work queues. The returned
    /// receivers belong to the engine manager.
    pub fn new(
        client: Arc<dyn ScanManagerClient>,
        pool: Arc<EnginePool>,
        tiers: Arc<TierSet>,
        retry: RetryPolicy,
        incoming_capacity: usize,
        completed_capacity: usize,
    ) -> (Self, Receiver<QueuedScan>, Receiver<ScanCompletion>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(incoming_capacity);
        let (completed_tx, completed_rx) = mpsc::channel(completed_capacity);
        let monitor = Self {
            client,
            pool,
            tiers,
            retry,
            incoming_tx,
            completed_tx,
            tracked: HashSet::new(),
            announced: HashSet::new(),
        };
        (monitor, incoming_rx, completed_rx)
    }

    /// One polling cycle: fetch pending scans, enqueue unseen ones by
    /// tier, and queue completions for runs the manager no longer
    /// reports.
    pub async fn poll_cycle(&mut self) {
        let client = Arc::clone(&self.client);
        let pending = match self
            .retry
            .run("get_pending_scans", || {
                let client = Arc::clone(&client);
                async move { client.get_pending_scans().await }
            })
            .await
        {
            Ok(pending) => pending,
            Err(error) => {
                warn!(%error, "pending-scan fetch failed; retrying next cycle");
                return;
            }
        };

        let pending_ids: HashSet<&str> = pending.iter().map(|s| s.id.as_str()).collect();
        let pending_runs: HashSet<&str> = pending.iter().map(|s| s.run_id.as_str()).collect();

        for scan in &pending {
            if self.tracked.contains(&scan.id) {
                continue;
            }
            match self.tiers.classify(scan.loc) {
                Ok(tier) => {
                    let queued = QueuedScan {
                        tier: tier.name.clone(),
                        request: scan.clone(),
                    };
                    debug!(
                        scan = %scan.id,
                        tier = %tier.name,
                        loc = scan.loc,
                        "scan queued for assignment"
                    );
                    if enqueue(&self.incoming_tx, queued, "incoming").await {
                        self.tracked.insert(scan.id.clone());
                    }
                }
                Err(error) => {
                    // Held, not dropped: the scan stays in the manager's
                    // queue and is reconsidered next cycle.
                    warn!(
                        scan = %scan.id,
                        loc = scan.loc,
                        %error,
                        "scan does not fit any configured tier"
                    );
                }
            }
        }

        // Runs we believe are executing but the scan manager no longer
        // lists have completed (or were removed).
        let scanning = self.pool.scanning_runs().await;
        for (run_id, engine_name) in &scanning {
            if pending_runs.contains(run_id.as_str()) || self.announced.contains(run_id) {
                continue;
            }
            let completion = ScanCompletion {
                engine_name: engine_name.clone(),
                scan_run_id: run_id.clone(),
            };
            info!(engine = %engine_name, run = %run_id, "scan finished; queueing completion");
            if enqueue(&self.completed_tx, completion, "completed").await {
                self.announced.insert(run_id.clone());
            }
        }

        // Forget scans that left the queue and completions whose engine
        // has been returned to idle.
        self.tracked.retain(|id| pending_ids.contains(id.as_str()));
        self.announced.retain(|run| scanning.contains_key(run));
    }

    /// Run the polling loop until shutdown.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "scan queue monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.poll_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("scan queue monitor shutting down");
                    break;
                }
            }
        }
    }
}

/// Enqueue with backpressure: a full queue means the manager is falling
/// behind, which is surfaced as a warning before blocking. Work is never
/// dropped.
async fn enqueue<T>(tx: &Sender<T>, item: T, queue: &str) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(item)) => {
            warn!(queue, "work queue full — engine manager is falling behind");
            if tx.send(item).await.is_err() {
                error!(queue, "work queue closed; dropping item");
                return false;
            }
            true
        }
        Err(TrySendError::Closed(_)) => {
            error!(queue, "work queue closed; dropping item");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use scanfleet_core::error::{RemoteError, RemoteResult};
    use scanfleet_core::{Engine, EngineRecord, EngineState, EngineTier, HostInfo, ScanRequest};
    use scanfleet_pool::SoonestToExpire;

    const HOUR: u64 = 3600;

    #[derive(Default)]
    struct FakeScanManager {
        pending: Mutex<Vec<ScanRequest>>,
        fail_fetch: Mutex<bool>,
    }

    impl FakeScanManager {
        fn set_pending(&self, scans: Vec<ScanRequest>) {
            *self.pending.lock().unwrap() = scans;
        }
    }

    #[async_trait]
    impl ScanManagerClient for FakeScanManager {
        async fn login(&self) -> RemoteResult<bool> {
            Ok(true)
        }

        async fn get_pending_scans(&self) -> RemoteResult<Vec<ScanRequest>> {
            if *self.fail_fetch.lock().unwrap() {
                return Err(RemoteError::Transport("connection refused".to_string()));
            }
            Ok(self.pending.lock().unwrap().clone())
        }

        async fn get_registered_engines(&self) -> RemoteResult<Vec<EngineRecord>> {
            Ok(Vec::new())
        }

        async fn register_engine(&self, record: &EngineRecord) -> RemoteResult<EngineRecord> {
            Ok(record.clone())
        }

        async fn update_engine(&self, record: &EngineRecord) -> RemoteResult<EngineRecord> {
            Ok(record.clone())
        }

        async fn unregister_engine(&self, _id: u64) -> RemoteResult<()> {
            Ok(())
        }

        async fn ping_engine(&self, _uri: &str) -> RemoteResult<bool> {
            Ok(true)
        }
    }

    fn test_tiers() -> Arc<TierSet> {
        Arc::new(
            TierSet::new(vec![
                EngineTier {
                    name: "small".to_string(),
                    min_loc: 0,
                    max_loc: 10_000,
                    min_idle: 0,
                    max_count: 2,
                    instance_type: "m5.large".to_string(),
                },
                EngineTier {
                    name: "medium".to_string(),
                    min_loc: 10_000,
                    max_loc: 50_000,
                    min_idle: 0,
                    max_count: 2,
                    instance_type: "m5.xlarge".to_string(),
                },
            ])
            .unwrap(),
        )
    }

    fn scan(id: &str, loc: i64) -> ScanRequest {
        ScanRequest {
            id: id.to_string(),
            run_id: format!("run-{id}"),
            loc,
            submitted_at: 1000,
            project: None,
        }
    }

    struct Fixture {
        client: Arc<FakeScanManager>,
        pool: Arc<EnginePool>,
        monitor: ScanQueueMonitor,
        incoming: Receiver<QueuedScan>,
        completed: Receiver<ScanCompletion>,
    }

    fn fixture_with_capacity(incoming: usize, completed: usize) -> Fixture {
        let client = Arc::new(FakeScanManager::default());
        let tiers = test_tiers();
        let pool = Arc::new(EnginePool::new(tiers.clone(), Arc::new(SoonestToExpire)));
        let retry = RetryPolicy::new(1, Duration::from_millis(1));
        let (monitor, incoming, completed) = ScanQueueMonitor::new(
            client.clone(),
            pool.clone(),
            tiers,
            retry,
            incoming,
            completed,
        );
        Fixture {
            client,
            pool,
            monitor,
            incoming,
            completed,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_capacity(8, 8)
    }

    async fn scanning_engine(pool: &EnginePool, name: &str, run_id: &str) {
        pool.register(Engine::new(name, "medium", HOUR, 0)).await.unwrap();
        pool.set_host(
            name,
            Some(HostInfo {
                instance_id: format!("i-{name}"),
                url: format!("http://10.0.0.2:8088/{name}"),
                launch_time: Some(0),
            }),
        )
        .await
        .unwrap();
        pool.change_state(name, EngineState::Idle, 0).await.unwrap();
        pool.assign_scan(name, run_id, 10).await.unwrap();
    }

    #[tokio::test]
    async fn pending_scan_is_classified_and_enqueued() {
        let mut fx = fixture();
        fx.client.set_pending(vec![scan("s1", 15_000)]);

        fx.monitor.poll_cycle().await;

        let queued = fx.incoming.try_recv().unwrap();
        assert_eq!(queued.tier, "medium");
        assert_eq!(queued.request.id, "s1");
        assert!(fx.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn scans_are_enqueued_exactly_once_while_pending() {
        let mut fx = fixture();
        fx.client.set_pending(vec![scan("s1", 500)]);

        fx.monitor.poll_cycle().await;
        fx.monitor.poll_cycle().await;

        assert!(fx.incoming.try_recv().is_ok());
        assert!(fx.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn unclassifiable_scan_is_skipped_not_fatal() {
        let mut fx = fixture();
        fx.client.set_pending(vec![scan("bad", -1), scan("ok", 500)]);

        fx.monitor.poll_cycle().await;

        let queued = fx.incoming.try_recv().unwrap();
        assert_eq!(queued.request.id, "ok");
        assert!(fx.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_scan_is_held_for_retry() {
        let mut fx = fixture();
        fx.client.set_pending(vec![scan("huge", 1_000_000)]);

        fx.monitor.poll_cycle().await;
        assert!(fx.incoming.try_recv().is_err());

        // Still reconsidered after the tier table would change.
        fx.monitor.poll_cycle().await;
        assert!(fx.incoming.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_skips_the_cycle() {
        let mut fx = fixture();
        fx.client.set_pending(vec![scan("s1", 500)]);
        *fx.client.fail_fetch.lock().unwrap() = true;

        fx.monitor.poll_cycle().await;
        assert!(fx.incoming.try_recv().is_err());

        *fx.client.fail_fetch.lock().unwrap() = false;
        fx.monitor.poll_cycle().await;
        assert!(fx.incoming.try_recv().is_ok());
    }

    #[tokio::test]
    async fn finished_run_produces_a_completion() {
        let mut fx = fixture();
        scanning_engine(&fx.pool, "m1", "run-7").await;

        // The run is no longer pending: it finished.
        fx.monitor.poll_cycle().await;

        let completion = fx.completed.try_recv().unwrap();
        assert_eq!(completion.engine_name, "m1");
        assert_eq!(completion.scan_run_id, "run-7");
    }

    #[tokio::test]
    async fn completion_is_announced_once_while_engine_still_scanning() {
        let mut fx = fixture();
        scanning_engine(&fx.pool, "m1", "run-7").await;

        fx.monitor.poll_cycle().await;
        fx.monitor.poll_cycle().await;

        assert!(fx.completed.try_recv().is_ok());
        assert!(fx.completed.try_recv().is_err());
    }

    #[tokio::test]
    async fn still_pending_run_is_not_completed() {
        let mut fx = fixture();
        scanning_engine(&fx.pool, "m1", "run-s1").await;
        fx.client.set_pending(vec![scan("s1", 15_000)]);

        fx.monitor.poll_cycle().await;
        assert!(fx.completed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_until_drained_without_dropping() {
        let fx = fixture_with_capacity(1, 1);
        let Fixture {
            client,
            mut monitor,
            mut incoming,
            ..
        } = fx;
        client.set_pending(vec![scan("s1", 500), scan("s2", 500)]);

        // Drain the queue after a delay so the blocked send can finish.
        let drainer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let first = incoming.recv().await.unwrap();
            let second = incoming.recv().await.unwrap();
            vec![first.request.id, second.request.id]
        });

        monitor.poll_cycle().await;
        let seen = drainer.await.unwrap();
        assert_eq!(seen, vec!["s1".to_string(), "s2".to_string()]);
    }
}
