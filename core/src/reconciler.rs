//! Reconciler & Cleanup (C6): three independent, idempotent sweeps that
//! converge the relational store's view of the world with the runtime's.
//! Grounded in the teacher's pattern of spawning long-lived `tokio::spawn`
//! loop tasks from its service constructor (`DeploymentManagerBuilder::build`
//! starts the queue/run tasks the same way `spawn_ticker` here starts this
//! one) — each sweep is its own free function over `&Dal`/`&ContainerRuntime`
//! so it's testable without the ticker around it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use renderlite_common::ServiceStatus;
use tracing::{info, instrument, warn};

use crate::container::{canonical_name, ContainerRuntime};
use crate::error::Result;
use crate::events::{PubSub, RealtimeEvent};
use crate::persistence::Dal;

/// Deployment rows older than the 10 most recent per service are trimmed.
const DEPLOYMENT_HISTORY_LIMIT: usize = 10;

/// Failed services whose container has sat around longer than this are
/// reaped.
const FAILED_CONTAINER_MAX_AGE: chrono::Duration = chrono::Duration::hours(24);

/// Runs all three sweeps once, in the order the spec lists them. None of
/// the three observe each other's writes within a single call (each reads
/// its own fresh `list_services`), which is what keeps two back-to-back
/// calls idempotent (I8) as long as nothing external changed in between.
#[instrument(skip_all)]
pub async fn run_once(dal: &dyn Dal, runtime: &dyn ContainerRuntime, bus: &dyn PubSub) -> Result<()> {
    detect_drift(dal, runtime, bus).await?;
    trim_deployment_history(dal).await?;
    reap_failed_containers(dal, runtime).await?;
    Ok(())
}

/// Sweep 1: for every service the store believes is `RUNNING`, confirm the
/// runtime agrees; if not, mark it `STOPPED` with no container and publish
/// the status change. Then reap every managed container the runtime reports
/// as `exited`.
#[instrument(skip_all)]
pub async fn detect_drift(dal: &dyn Dal, runtime: &dyn ContainerRuntime, bus: &dyn PubSub) -> Result<()> {
    for service in dal.list_services().await? {
        if service.status != ServiceStatus::Running {
            continue;
        }
        let Some(container_id) = &service.container_id else {
            continue;
        };

        let name = canonical_name(&service.subdomain);
        let running = runtime.is_running(&name).await.unwrap_or(false);

        if !running {
            info!(service_id = %service.id, container_id, "drift detected: service marked RUNNING but container is not");
            let mut updated = service;
            updated.status = ServiceStatus::Stopped;
            updated.container_id = None;
            updated.updated_at = Utc::now();
            dal.update_service(&updated).await?;

            bus.publish(RealtimeEvent::ServiceStatus {
                service_id: updated.id,
                status: updated.status,
                timestamp: updated.updated_at,
            })
            .await;
        }
    }

    let reaped = runtime.reap_exited().await?;
    if !reaped.is_empty() {
        info!(count = reaped.len(), "reaped exited managed containers");
    }

    Ok(())
}

/// Sweep 2: keep only the 10 most recent deployment rows per service.
#[instrument(skip_all)]
pub async fn trim_deployment_history(dal: &dyn Dal) -> Result<()> {
    for service in dal.list_services().await? {
        let deployments = dal.list_deployments_for_service(service.id).await?;
        for stale in deployments.into_iter().skip(DEPLOYMENT_HISTORY_LIMIT) {
            dal.delete_deployment(stale.id).await?;
        }
    }
    Ok(())
}

/// Sweep 3: services stuck `FAILED` with a container more than 24h old get
/// their container removed and the reference cleared.
#[instrument(skip_all)]
pub async fn reap_failed_containers(dal: &dyn Dal, runtime: &dyn ContainerRuntime) -> Result<()> {
    let now = Utc::now();

    for service in dal.list_services().await? {
        if service.status != ServiceStatus::Failed {
            continue;
        }
        let Some(container_id) = service.container_id.clone() else {
            continue;
        };
        if now - service.updated_at < FAILED_CONTAINER_MAX_AGE {
            continue;
        }

        if let Err(e) = runtime.remove(&container_id).await {
            warn!(service_id = %service.id, error = %e, "failed to reap failed-service container");
            continue;
        }

        let mut updated = service;
        updated.container_id = None;
        updated.updated_at = now;
        dal.update_service(&updated).await?;
    }

    Ok(())
}

/// Spawns the periodic ticker: one sweep roughly 10s after startup, then
/// every `interval` thereafter, for the lifetime of the process.
pub fn spawn_ticker(
    dal: Arc<dyn Dal>,
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<dyn PubSub>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        loop {
            if let Err(e) = run_once(dal.as_ref(), runtime.as_ref(), bus.as_ref()).await {
                warn!(error = %e, "reconciler sweep failed");
            }
            tokio::time::sleep(interval).await;
        }
    })
}
