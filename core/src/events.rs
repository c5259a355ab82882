//! Event Bus & Subscription Hub (C4). Publication goes through a `PubSub`
//! trait rather than a hard-wired transport, the same way the teacher
//! takes its "recorder"/"getter" collaborators as generic parameters
//! (`LogRecorder`, `SecretRecorder`, `ActiveDeploymentsGetter`) instead of
//! owning a concrete implementation — so the worker process and the
//! REST/WS process can run the identical `EventHub` code against whatever
//! the deployment's external key-value bus actually is. The in-process
//! `tokio::sync::broadcast` implementation here is both the reference
//! implementation (nothing in the wider example pack depends on a pub/sub
//! crate) and what every test in this crate runs against.
//!
//! "Exactly one subscriber per hub process" (§4.4) is enforced the way the
//! teacher's gateway enforces its own single-subscriber `subscribe_projects`
//! contract: an `Arc<Mutex<Option<_>>>` slot that subscribing takes and
//! unsubscribing gives back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use renderlite_common::ServiceStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::container::ContainerRuntime;
use crate::persistence::Dal;

pub const REALTIME_CHANNEL: &str = "renderlite:realtime:events";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "deployment:log")]
    DeploymentLog {
        deployment_id: Uuid,
        log: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "deployment:status")]
    DeploymentStatus {
        deployment_id: Uuid,
        status: renderlite_common::DeploymentStatus,
        container_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "service:status")]
    ServiceStatus {
        service_id: Uuid,
        status: renderlite_common::ServiceStatus,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "service:metrics")]
    ServiceMetrics {
        service_id: Uuid,
        metrics: ServiceMetrics,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeEvent {
    /// The topic room this event belongs to: `deployment:<id>` or
    /// `service:<id>`. `user:<id>` notifications are out of this crate's
    /// scope (§4.4 notes they aren't core-critical) so no variant here
    /// produces one.
    pub fn topic(&self) -> String {
        match self {
            RealtimeEvent::DeploymentLog { deployment_id, .. }
            | RealtimeEvent::DeploymentStatus { deployment_id, .. } => {
                format!("deployment:{deployment_id}")
            }
            RealtimeEvent::ServiceStatus { service_id, .. }
            | RealtimeEvent::ServiceMetrics { service_id, .. } => format!("service:{service_id}"),
        }
    }
}

/// Abstracts the external key-value bus's pub/sub channel. Implemented
/// in-process by [`LocalPubSub`] for tests and standalone operation.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, event: RealtimeEvent);
    async fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent>;
}

/// In-process stand-in for the external bus, backed by a single
/// `tokio::sync::broadcast` channel shared by every publisher — matching
/// the "single shared pub/sub channel" the spec calls for rather than one
/// channel per topic, with topic filtering happening downstream in
/// [`EventHub`].
pub struct LocalPubSub {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl LocalPubSub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, event: RealtimeEvent) {
        // No listeners is not an error — matches the spec's "best effort"
        // delivery for log events and the general "the hub might not be
        // running yet" reality of a worker process that publishes
        // regardless of whether anyone's subscribed.
        let _ = self.sender.send(event);
    }

    async fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }
}

/// The subscription hub itself: holds the single subscription to the bus
/// (enforced by the `Option`-in-a-mutex slot) and re-emits events to
/// per-topic local rooms. Lives in the REST/WS process in the two-process
/// deployment model (§5); this crate only needs it wired up for its own
/// integration tests, since the REST/WS process is out of this
/// specification's scope.
pub struct EventHub {
    bus: Arc<dyn PubSub>,
    subscription: Mutex<Option<broadcast::Receiver<RealtimeEvent>>>,
}

impl EventHub {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self {
            bus,
            subscription: Mutex::new(None),
        }
    }

    /// Takes the single bus subscription. Returns `None` if a subscriber
    /// is already attached to this hub instance.
    pub async fn subscribe(&self) -> Option<broadcast::Receiver<RealtimeEvent>> {
        let mut slot = self.subscription.lock().await;
        if slot.is_some() {
            return None;
        }
        *slot = Some(self.bus.subscribe().await);
        slot.take()
    }

    /// Releases the single-subscriber slot so a future `subscribe` can
    /// succeed again — part of the clean-teardown contract in §9 (the
    /// pub/sub subscriber must be closed on shutdown, not leaked).
    pub async fn unsubscribe(&self) {
        let mut slot = self.subscription.lock().await;
        *slot = None;
    }

    pub async fn publish(&self, event: RealtimeEvent) {
        self.bus.publish(event).await;
    }
}

/// The set of services with at least one live `service:*` subscriber
/// (§4.4's metrics timer). The REST/WS process calls [`track`]/[`untrack`]
/// as WS clients attach to and detach from a `service:<id>` topic; the
/// ticker spawned by [`spawn_metrics_ticker`] samples every tracked
/// service on its own interval.
#[derive(Default)]
pub struct MetricsTracker {
    tracked: Mutex<HashSet<Uuid>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, service_id: Uuid) {
        self.tracked.lock().await.insert(service_id);
    }

    pub async fn untrack(&self, service_id: Uuid) {
        self.tracked.lock().await.remove(&service_id);
    }

    async fn snapshot(&self) -> Vec<Uuid> {
        self.tracked.lock().await.iter().copied().collect()
    }
}

/// Spawns the metrics-sampling ticker: every `interval` (5s by default),
/// samples [`ContainerRuntime::stats`] for each tracked service's live
/// container and publishes a `service:metrics` event. A sample that fails
/// because the container is gone is not retried as infrastructural — it's
/// drift: the service is marked `STOPPED` with no container, the new
/// status is published, and the service drops out of the tracked set
/// until something re-subscribes to it.
pub fn spawn_metrics_ticker(
    tracker: Arc<MetricsTracker>,
    dal: Arc<dyn Dal>,
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<dyn PubSub>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for service_id in tracker.snapshot().await {
                if let Err(e) = sample_one(&tracker, dal.as_ref(), runtime.as_ref(), bus.as_ref(), service_id).await {
                    warn!(%service_id, error = %e, "metrics sample failed");
                }
            }
        }
    })
}

#[instrument(skip(tracker, dal, runtime, bus))]
async fn sample_one(
    tracker: &MetricsTracker,
    dal: &dyn Dal,
    runtime: &dyn ContainerRuntime,
    bus: &dyn PubSub,
    service_id: Uuid,
) -> crate::error::Result<()> {
    let Some(service) = dal.get_service(service_id).await? else {
        tracker.untrack(service_id).await;
        return Ok(());
    };
    let Some(container_id) = service.container_id.clone() else {
        tracker.untrack(service_id).await;
        return Ok(());
    };

    match runtime.stats(&container_id).await {
        Ok(stats) => {
            let now = Utc::now();
            bus.publish(RealtimeEvent::ServiceMetrics {
                service_id,
                metrics: ServiceMetrics {
                    cpu_percent: stats.cpu_percent,
                    memory_usage: stats.memory_usage,
                    memory_limit: stats.memory_limit,
                    memory_percent: stats.memory_percent,
                    network_rx: stats.network_rx,
                    network_tx: stats.network_tx,
                    timestamp: now,
                },
                timestamp: now,
            })
            .await;
            Ok(())
        }
        Err(e) if e.is_runtime_not_found() => {
            info!(%service_id, "metrics sample found container gone, marking service STOPPED");
            let now = Utc::now();
            let mut updated = service;
            updated.status = ServiceStatus::Stopped;
            updated.container_id = None;
            updated.updated_at = now;
            dal.update_service(&updated).await?;
            bus.publish(RealtimeEvent::ServiceStatus {
                service_id,
                status: ServiceStatus::Stopped,
                timestamp: now,
            })
            .await;
            tracker.untrack(service_id).await;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
