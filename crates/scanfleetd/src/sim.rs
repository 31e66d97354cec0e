//! In-process fakes for local simulation.
//!
//! `scanfleetd simulate` runs the whole orchestration stack against
//! these: a provisioner whose instances are running the moment they
//! launch, and a scan manager that emits a scripted series of scans,
//! each "executing" for a fixed window before disappearing from the
//! pending queue. Real deployments swap in provider adapters that
//! implement the same traits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use scanfleet_cloud::{
    CloudError, CloudResult, ComputeProvisioner, EngineTags, InstanceHandle, InstanceStatus,
};
use scanfleet_core::error::RemoteResult;
use scanfleet_core::{EngineRecord, ScanManagerClient, ScanRequest, TierSet};

/// Provisioner whose instances run instantly and never fail.
#[derive(Default)]
pub struct SimProvisioner {
    instances: Mutex<HashMap<String, InstanceHandle>>,
    next_id: AtomicU64,
}

#[async_trait]
impl ComputeProvisioner for SimProvisioner {
    async fn launch(
        &self,
        name: &str,
        instance_type: &str,
        tags: &EngineTags,
    ) -> CloudResult<InstanceHandle> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = InstanceHandle {
            id: format!("sim-{n:04}"),
            name: name.to_string(),
            url: format!("http://127.0.0.1:{}", 9000 + n),
            launch_time: Some(epoch_secs()),
            status: InstanceStatus::Running,
            tags: tags.to_map(),
        };
        debug!(instance = %handle.id, %name, instance_type, "simulated launch");
        self.instances
            .lock()
            .unwrap()
            .insert(handle.id.clone(), handle.clone());
        Ok(handle)
    }

    async fn start(&self, instance_id: &str) -> CloudResult<()> {
        self.set_status(instance_id, InstanceStatus::Running)
    }

    async fn stop(&self, instance_id: &str) -> CloudResult<()> {
        self.set_status(instance_id, InstanceStatus::Stopped)
    }

    async fn terminate(&self, instance_id: &str) -> CloudResult<()> {
        self.set_status(instance_id, InstanceStatus::Terminated)
    }

    async fn describe(&self, instance_id: &str) -> CloudResult<InstanceStatus> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|h| h.status)
            .ok_or_else(|| CloudError::NotFound(instance_id.to_string()))
    }

    async fn list_engines(&self, filter: &EngineTags) -> CloudResult<Vec<InstanceHandle>> {
        let wanted = filter.to_map();
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|h| wanted.iter().all(|(k, v)| h.tags.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

impl SimProvisioner {
    fn set_status(&self, instance_id: &str, status: InstanceStatus) -> CloudResult<()> {
        match self.instances.lock().unwrap().get_mut(instance_id) {
            Some(handle) => {
                debug!(instance = %instance_id, ?status, "simulated state change");
                handle.status = status;
                Ok(())
            }
            None => Err(CloudError::NotFound(instance_id.to_string())),
        }
    }
}

/// Scripted scan manager: `count` scans arrive one per `arrival_secs`,
/// sized round-robin across the configured tiers, and each stays pending
/// for `run_secs` before reading as finished.
pub struct SimScanManager {
    started_at: u64,
    count: u64,
    arrival_secs: u64,
    run_secs: u64,
    locs: Vec<i64>,
    registered: Mutex<HashMap<u64, EngineRecord>>,
    next_id: AtomicU64,
}

impl SimScanManager {
    pub fn new(tiers: &TierSet, count: u64, arrival_secs: u64, run_secs: u64) -> Self {
        // One representative LOC estimate per tier (the bucket midpoint).
        let locs = tiers
            .iter()
            .map(|t| ((t.min_loc + t.max_loc) / 2) as i64)
            .collect();
        Self {
            started_at: epoch_secs(),
            count,
            arrival_secs,
            run_secs,
            locs,
            registered: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ScanManagerClient for SimScanManager {
    async fn login(&self) -> RemoteResult<bool> {
        Ok(true)
    }

    async fn get_pending_scans(&self) -> RemoteResult<Vec<ScanRequest>> {
        let now = epoch_secs();
        let mut pending = Vec::new();
        for n in 0..self.count {
            let submitted_at = self.started_at + n * self.arrival_secs;
            if now >= submitted_at && now < submitted_at + self.run_secs {
                pending.push(ScanRequest {
                    id: format!("sim-scan-{n}"),
                    run_id: format!("sim-run-{n}"),
                    loc: self.locs[(n as usize) % self.locs.len()],
                    submitted_at,
                    project: Some(format!("sim-project-{n}")),
                });
            }
        }
        Ok(pending)
    }

    async fn get_registered_engines(&self) -> RemoteResult<Vec<EngineRecord>> {
        Ok(self.registered.lock().unwrap().values().cloned().collect())
    }

    async fn register_engine(&self, record: &EngineRecord) -> RemoteResult<EngineRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut registered = record.clone();
        registered.id = Some(id);
        self.registered.lock().unwrap().insert(id, registered.clone());
        Ok(registered)
    }

    async fn update_engine(&self, record: &EngineRecord) -> RemoteResult<EngineRecord> {
        if let Some(id) = record.id {
            self.registered.lock().unwrap().insert(id, record.clone());
        }
        Ok(record.clone())
    }

    async fn unregister_engine(&self, id: u64) -> RemoteResult<()> {
        self.registered.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn ping_engine(&self, _uri: &str) -> RemoteResult<bool> {
        Ok(true)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
