//! Background launch and reclaim operations.
//!
//! Each operation owns exactly one engine for its duration and reports
//! its outcome over the manager's event channel. Timeouts are the only
//! bound: a launch that misses its deadline terminates the instance
//! rather than leaving it orphaned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

use scanfleet_cloud::{CloudError, ComputeProvisioner, EngineTags, RetryPolicy};
use scanfleet_core::{HostInfo, ScanManagerClient};

/// Outcome of a background operation, applied by the next manager cycle.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    LaunchReady {
        name: String,
        tier: String,
        host: HostInfo,
    },
    LaunchFailed {
        name: String,
        tier: String,
        error: String,
    },
    ReclaimConfirmed {
        name: String,
        tier: String,
        /// The stopped instance, kept for restart under the stop policy.
        parked: Option<HostInfo>,
    },
    ReclaimFailed {
        name: String,
        tier: String,
        error: String,
    },
}

/// Everything a launch task needs, captured before spawning.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub name: String,
    pub tier: String,
    pub instance_type: String,
    pub version: String,
    pub launch_timeout: Duration,
    pub ready_timeout: Duration,
    pub poll: Duration,
}

/// Launch (or restart) an instance, wait for it to run, wait for the
/// engine software to answer, then report.
pub(crate) async fn launch_engine(
    provisioner: Arc<dyn ComputeProvisioner>,
    client: Arc<dyn ScanManagerClient>,
    retry: RetryPolicy,
    spec: LaunchSpec,
    parked: Option<HostInfo>,
    events: UnboundedSender<EngineEvent>,
) {
    let event = match run_launch(&provisioner, &client, retry, &spec, parked).await {
        Ok(host) => EngineEvent::LaunchReady {
            name: spec.name,
            tier: spec.tier,
            host,
        },
        Err(error) => EngineEvent::LaunchFailed {
            name: spec.name,
            tier: spec.tier,
            error: error.to_string(),
        },
    };
    let _ = events.send(event);
}

async fn run_launch(
    provisioner: &Arc<dyn ComputeProvisioner>,
    client: &Arc<dyn ScanManagerClient>,
    retry: RetryPolicy,
    spec: &LaunchSpec,
    parked: Option<HostInfo>,
) -> Result<HostInfo, CloudError> {
    let (instance_id, url, launch_time) = match parked {
        // A stopped instance from a previous billing window: restart it
        // instead of paying for a fresh launch.
        Some(host) => {
            let id = host.instance_id.clone();
            retry
                .run("start_instance", || {
                    let provisioner = Arc::clone(provisioner);
                    let id = id.clone();
                    async move { provisioner.start(&id).await }
                })
                .await?;
            (host.instance_id, host.url, None)
        }
        None => {
            let tags = EngineTags::for_tier(&spec.version, &spec.tier);
            let handle = retry
                .run("launch_instance", || {
                    let provisioner = Arc::clone(provisioner);
                    let name = spec.name.clone();
                    let instance_type = spec.instance_type.clone();
                    let tags = tags.clone();
                    async move { provisioner.launch(&name, &instance_type, &tags).await }
                })
                .await?;
            (handle.id, handle.url, handle.launch_time)
        }
    };

    let running = wait_until(spec.launch_timeout, spec.poll, || {
        let provisioner = Arc::clone(provisioner);
        let id = instance_id.clone();
        async move { matches!(provisioner.is_running(&id).await, Ok(true)) }
    })
    .await;
    if !running {
        abandon_instance(provisioner, retry, &instance_id, "launch timeout").await;
        return Err(CloudError::LaunchTimeout {
            name: spec.name.clone(),
            secs: spec.launch_timeout.as_secs(),
        });
    }
    debug!(engine = %spec.name, instance = %instance_id, "instance running; probing engine software");

    let ready = wait_until(spec.ready_timeout, spec.poll, || {
        let client = Arc::clone(client);
        let url = url.clone();
        async move { matches!(client.ping_engine(&url).await, Ok(true)) }
    })
    .await;
    if !ready {
        abandon_instance(provisioner, retry, &instance_id, "engine never responded").await;
        return Err(CloudError::ReadyTimeout {
            name: spec.name.clone(),
            secs: spec.ready_timeout.as_secs(),
        });
    }

    Ok(HostInfo {
        instance_id,
        url,
        launch_time,
    })
}

/// Stop or terminate an expired engine's instance and wait for the
/// provider to confirm.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn reclaim_engine(
    provisioner: Arc<dyn ComputeProvisioner>,
    retry: RetryPolicy,
    name: String,
    tier: String,
    host: HostInfo,
    terminate: bool,
    timeout: Duration,
    poll: Duration,
    events: UnboundedSender<EngineEvent>,
) {
    let instance_id = host.instance_id.clone();
    let op = if terminate {
        "terminate_instance"
    } else {
        "stop_instance"
    };

    let result: Result<(), CloudError> = async {
        retry
            .run(op, || {
                let provisioner = Arc::clone(&provisioner);
                let id = instance_id.clone();
                async move {
                    if terminate {
                        provisioner.terminate(&id).await
                    } else {
                        provisioner.stop(&id).await
                    }
                }
            })
            .await?;

        let stopped = wait_until(timeout, poll, || {
            let provisioner = Arc::clone(&provisioner);
            let id = instance_id.clone();
            async move { matches!(provisioner.is_running(&id).await, Ok(false)) }
        })
        .await;
        if !stopped {
            return Err(CloudError::Termination(format!(
                "instance {instance_id} still running after {}s",
                timeout.as_secs()
            )));
        }
        Ok(())
    }
    .await;

    let event = match result {
        Ok(()) => EngineEvent::ReclaimConfirmed {
            name,
            tier,
            parked: (!terminate).then_some(host),
        },
        Err(error) => EngineEvent::ReclaimFailed {
            name,
            tier,
            error: error.to_string(),
        },
    };
    let _ = events.send(event);
}

/// Poll `check` until it passes or the deadline expires. The first check
/// runs immediately.
async fn wait_until<F, Fut>(timeout: Duration, poll: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Best-effort terminate after a failed launch, so a half-provisioned
/// instance never keeps billing.
async fn abandon_instance(
    provisioner: &Arc<dyn ComputeProvisioner>,
    retry: RetryPolicy,
    instance_id: &str,
    reason: &str,
) {
    warn!(instance = %instance_id, reason, "abandoning instance");
    let result = retry
        .run("terminate_instance", || {
            let provisioner = Arc::clone(provisioner);
            let id = instance_id.to_string();
            async move { provisioner.terminate(&id).await }
        })
        .await;
    if let Err(error) = result {
        error!(
            instance = %instance_id,
            %error,
            "failed to terminate abandoned instance; it will be adopted by the next inventory reconcile"
        );
    }
}
