//! Deployment Pipeline (C2): drives one job to a terminal outcome.
//! Grounded in the teacher's `State<Ctx>`/`EndState<Ctx>` typed-transition
//! shape (`deployer/src/deployment/mod.rs`'s state machine moves through
//! distinct Rust types rather than one large `match`), flattened here from
//! the teacher's fifteen-variant service lifecycle down to the four
//! persisted statuses the spec defines plus the internal, non-persisted
//! sub-steps of §4.2 that only ever report as `BUILDING` to the outside.

pub mod build;
pub mod clone;
pub mod run;
mod states;

use std::sync::Arc;

use async_trait::async_trait;
use renderlite_common::{Deployment, Domain, Service};
use tempfile::TempDir;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::container::ContainerRuntime;
use crate::error::Result;
use crate::events::{PubSub, RealtimeEvent};
use crate::persistence::Dal;
use crate::secrets::SecretKey;

#[derive(Debug, Clone)]
pub struct DeployJob {
    pub deployment_id: Uuid,
    pub service_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RollbackJob {
    pub deployment_id: Uuid,
    pub service_id: Uuid,
    pub target_deployment_id: Uuid,
}

/// The queue payload type: what C1 actually holds and leases out to a
/// worker, which then hands it to [`run_job`].
#[derive(Debug, Clone)]
pub enum PipelineJob {
    Deploy(DeployJob),
    Rollback(RollbackJob),
}

impl PipelineJob {
    pub fn deployment_id(&self) -> Uuid {
        match self {
            PipelineJob::Deploy(j) => j.deployment_id,
            PipelineJob::Rollback(j) => j.deployment_id,
        }
    }
}

/// Everything a pipeline step needs that isn't specific to the job in
/// progress: collaborators, shared config, key material.
pub struct PipelineContext {
    pub dal: Arc<dyn Dal>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub bus: Arc<dyn PubSub>,
    pub config: Arc<Config>,
    pub secret_key: SecretKey,
}

pub enum Outcome {
    Success { image_tag: String, container_id: String },
    Failed { reason: String },
}

pub enum Transition {
    Next(Box<dyn PipelineState>),
    Done(Outcome),
}

/// A single step in the pipeline's state machine. `advance` consumes the
/// current step (and the [`JobData`] it carries) and returns either the
/// next step or a terminal [`Outcome`]; steps never loop back.
#[async_trait]
pub trait PipelineState: Send {
    fn name(&self) -> &'static str;
    async fn advance(self: Box<Self>, ctx: &PipelineContext) -> Result<Transition>;
}

/// Accumulated state threaded through every step of one job. Not
/// persisted directly — each step writes the relevant fields back onto the
/// `Deployment`/`Service` rows itself as it completes.
pub(crate) struct JobData {
    pub deployment: Deployment,
    pub service: Service,
    pub domains: Vec<Domain>,
    pub work_dir: Option<TempDir>,
    pub is_rollback: bool,
    pub rollback_target_image_tag: Option<String>,
    pub rollback_target_commit_sha: Option<String>,
}

/// Runs `job` to completion, writing terminal state to the store and
/// emitting the terminal events regardless of how it ends. Infrastructural
/// errors surfaced by a step (a `?` that escapes `advance`) are treated the
/// same as a step explicitly returning `Outcome::Failed` — both are
/// business-level outcomes as far as C1 is concerned (see §7's propagation
/// policy: the pipeline never asks the queue to retry).
#[instrument(skip(ctx), fields(deployment_id = %job.deployment_id()))]
pub async fn run_job(job: PipelineJob, ctx: &PipelineContext) -> Result<()> {
    let (deployment_id, service_id, is_rollback, rollback_target) = match &job {
        PipelineJob::Deploy(j) => (j.deployment_id, j.service_id, false, None),
        PipelineJob::Rollback(j) => (j.deployment_id, j.service_id, true, Some(j.target_deployment_id)),
    };

    let deployment = ctx
        .dal
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("deployment {deployment_id}")))?;
    let service = ctx
        .dal
        .get_service(service_id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("service {service_id}")))?;

    let (rollback_target_image_tag, rollback_target_commit_sha) = match rollback_target {
        Some(target_id) => {
            let target = ctx
                .dal
                .get_deployment(target_id)
                .await?
                .ok_or_else(|| crate::error::Error::NotFound(format!("deployment {target_id}")))?;
            if target.status != renderlite_common::DeploymentStatus::Success {
                return fail_deployment(
                    ctx,
                    deployment,
                    service,
                    "rollback target is not a successful deployment".to_string(),
                )
                .await;
            }
            (target.image_tag.clone(), target.commit_sha.clone())
        }
        None => (None, None),
    };

    let data = JobData {
        deployment,
        service,
        domains: Vec::new(),
        work_dir: None,
        is_rollback,
        rollback_target_image_tag,
        rollback_target_commit_sha,
    };

    let mut state: Box<dyn PipelineState> = Box::new(states::Init::new(data));

    loop {
        let step_name = state.name();
        match state.advance(ctx).await {
            Ok(Transition::Next(next)) => state = next,
            Ok(Transition::Done(outcome)) => return finalize(ctx, outcome).await,
            Err(e) => {
                warn!(step = step_name, error = %e, "pipeline step failed");
                return recover_after_error(ctx, deployment_id, service_id, e.to_string()).await;
            }
        }
    }
}

async fn finalize(ctx: &PipelineContext, outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Success { .. } => {
            info!("deployment pipeline finished successfully");
            Ok(())
        }
        Outcome::Failed { reason } => {
            warn!(reason, "deployment pipeline finished with a failure");
            Ok(())
        }
    }
}

async fn fail_deployment(
    ctx: &PipelineContext,
    mut deployment: Deployment,
    mut service: Service,
    reason: String,
) -> Result<()> {
    let now = chrono::Utc::now();
    deployment.status = renderlite_common::DeploymentStatus::Failed;
    deployment.finished_at = Some(now);
    deployment.logs = format!("{}{reason}\n", deployment.logs);
    ctx.dal.update_deployment(&deployment).await?;

    service.status = renderlite_common::ServiceStatus::Failed;
    service.updated_at = now;
    ctx.dal.update_service(&service).await?;

    ctx.bus
        .publish(RealtimeEvent::DeploymentStatus {
            deployment_id: deployment.id,
            status: deployment.status,
            container_id: None,
            timestamp: now,
        })
        .await;
    ctx.bus
        .publish(RealtimeEvent::ServiceStatus {
            service_id: service.id,
            status: service.status,
            timestamp: now,
        })
        .await;

    Ok(())
}

/// Recovers after a step returns an error rather than an `Outcome` — loads
/// the rows fresh (a step may have already mutated and saved them before
/// failing) and marks both terminal `FAILED`.
async fn recover_after_error(
    ctx: &PipelineContext,
    deployment_id: Uuid,
    service_id: Uuid,
    reason: String,
) -> Result<()> {
    let deployment = ctx
        .dal
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("deployment {deployment_id}")))?;
    let service = ctx
        .dal
        .get_service(service_id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("service {service_id}")))?;

    if deployment.status == renderlite_common::DeploymentStatus::Success {
        // A step failed during best-effort cleanup after already recording
        // success; don't downgrade a completed deployment.
        return Ok(());
    }

    fail_deployment(ctx, deployment, service, reason).await
}

/// Cancels a still-`QUEUED` deployment (§5 Cancellation, §8 I-adjacent
/// "delete while queued is safe"). Called directly by ingress, not as a
/// pipeline step, since the job never reached a worker.
pub async fn cancel_queued(
    ctx: &PipelineContext,
    queue: &crate::queue::Queue<PipelineJob>,
    deployment_id: Uuid,
) -> Result<bool> {
    if !queue.remove(deployment_id).await? {
        return Ok(false);
    }

    let mut deployment = ctx
        .dal
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("deployment {deployment_id}")))?;
    let mut service = ctx
        .dal
        .get_service(deployment.service_id)
        .await?
        .ok_or_else(|| crate::error::Error::NotFound(format!("service {}", deployment.service_id)))?;

    let now = chrono::Utc::now();
    deployment.status = renderlite_common::DeploymentStatus::Failed;
    deployment.finished_at = Some(now);
    deployment.logs = format!("{}cancelled by user\n", deployment.logs);
    ctx.dal.update_deployment(&deployment).await?;

    service.status = renderlite_common::ServiceStatus::Failed;
    service.updated_at = now;
    ctx.dal.update_service(&service).await?;

    ctx.bus
        .publish(RealtimeEvent::DeploymentStatus {
            deployment_id,
            status: deployment.status,
            container_id: None,
            timestamp: now,
        })
        .await;
    ctx.bus
        .publish(RealtimeEvent::ServiceStatus {
            service_id: service.id,
            status: service.status,
            timestamp: now,
        })
        .await;

    Ok(true)
}
