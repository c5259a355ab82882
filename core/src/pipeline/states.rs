use async_trait::async_trait;
use chrono::Utc;
use renderlite_common::{DeploymentStatus, ServiceStatus};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::events::RealtimeEvent;
use crate::secrets::{decrypt_runtime_env, GIT_TOKEN_ENV_KEY};

use super::{build, clone, run, JobData, Outcome, PipelineContext, PipelineState, Transition};

/// Persists `line` onto the deployment row's accumulated log and publishes
/// a `deployment:log` event for it — the single place every step appends
/// output, matching the egress contract's "stream every meaningful
/// progress line through the log callback."
async fn emit_log(ctx: &PipelineContext, data: &JobData, line: &str) -> Result<()> {
    ctx.dal.append_deployment_log(data.deployment.id, line).await?;
    ctx.bus
        .publish(RealtimeEvent::DeploymentLog {
            deployment_id: data.deployment.id,
            log: line.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    Ok(())
}

async fn emit_logs(ctx: &PipelineContext, data: &JobData, lines: &[String]) -> Result<()> {
    for line in lines {
        emit_log(ctx, data, line).await?;
    }
    Ok(())
}

async fn emit_deployment_status(ctx: &PipelineContext, data: &JobData) -> Result<()> {
    ctx.bus
        .publish(RealtimeEvent::DeploymentStatus {
            deployment_id: data.deployment.id,
            status: data.deployment.status,
            container_id: data.service.container_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
    Ok(())
}

async fn emit_service_status(ctx: &PipelineContext, data: &JobData) -> Result<()> {
    ctx.bus
        .publish(RealtimeEvent::ServiceStatus {
            service_id: data.service.id,
            status: data.service.status,
            timestamp: Utc::now(),
        })
        .await;
    Ok(())
}

/// Writes a terminal failure directly, without touching fields the caller
/// didn't ask to change — unlike the generic top-level recovery path, each
/// call site here knows exactly what state the world is actually in.
async fn write_terminal_failure(
    ctx: &PipelineContext,
    data: &mut JobData,
    reason: &str,
    service_status: ServiceStatus,
    container_id: Option<String>,
) -> Result<()> {
    let now = Utc::now();
    data.deployment.status = DeploymentStatus::Failed;
    data.deployment.finished_at = Some(now);
    ctx.dal.update_deployment(&data.deployment).await?;
    emit_log(ctx, data, reason).await?;
    emit_deployment_status(ctx, data).await?;

    data.service.status = service_status;
    data.service.container_id = container_id;
    data.service.updated_at = now;
    ctx.dal.update_service(&data.service).await?;
    emit_service_status(ctx, data).await?;

    Ok(())
}

pub(crate) struct Init {
    data: JobData,
}

impl Init {
    pub fn new(data: JobData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl PipelineState for Init {
    fn name(&self) -> &'static str {
        "init"
    }

    #[instrument(skip_all)]
    async fn advance(mut self: Box<Self>, ctx: &PipelineContext) -> Result<Transition> {
        let now = Utc::now();
        self.data.deployment.status = DeploymentStatus::Building;
        self.data.deployment.started_at = Some(now);

        if self.data.is_rollback {
            self.data.deployment.image_tag = self.data.rollback_target_image_tag.clone();
            self.data.deployment.commit_sha = self.data.rollback_target_commit_sha.clone();
        }

        ctx.dal.update_deployment(&self.data.deployment).await?;
        emit_deployment_status(ctx, &self.data).await?;

        self.data.service.status = ServiceStatus::Deploying;
        self.data.service.updated_at = now;
        ctx.dal.update_service(&self.data.service).await?;
        emit_service_status(ctx, &self.data).await?;

        if self.data.is_rollback {
            return Ok(Transition::Next(Box::new(FetchRoutingInputs { data: self.data })));
        }

        let work_dir = tempfile::Builder::new()
            .prefix(&format!("renderlite-{}-", self.data.deployment.id))
            .tempdir()
            .map_err(Error::Io)?;
        self.data.work_dir = Some(work_dir);

        Ok(Transition::Next(Box::new(CloneStep { data: self.data })))
    }
}

pub(crate) struct CloneStep {
    data: JobData,
}

#[async_trait]
impl PipelineState for CloneStep {
    fn name(&self) -> &'static str {
        "clone"
    }

    #[instrument(skip_all)]
    async fn advance(mut self: Box<Self>, ctx: &PipelineContext) -> Result<Transition> {
        let token = match self.data.service.env.get(GIT_TOKEN_ENV_KEY) {
            Some(envelope) => Some(crate::secrets::decrypt(&ctx.secret_key, envelope)?),
            None => None,
        };

        let work_dir = self
            .data
            .work_dir
            .as_ref()
            .expect("clone step always runs after init created the work dir")
            .path()
            .to_path_buf();

        let clone_result = clone::shallow_clone(
            &self.data.service.repo_url,
            &self.data.service.branch,
            token.as_deref(),
            &work_dir,
            ctx.config.clone_timeout(),
        )
        .await;

        if let Err(e) = clone_result {
            let reason = format!("clone failed: {e}");
            write_terminal_failure(ctx, &mut self.data, &reason, ServiceStatus::Failed, None).await?;
            return Ok(Transition::Done(Outcome::Failed { reason }));
        }

        emit_log(ctx, &self.data, &format!("cloned {} @ {}", self.data.service.repo_url, self.data.service.branch)).await?;

        let commit_sha = clone::head_commit_sha(&work_dir).await?;
        self.data.deployment.commit_sha = Some(commit_sha);
        ctx.dal.update_deployment(&self.data.deployment).await?;

        Ok(Transition::Next(Box::new(BuildStep { data: self.data })))
    }
}

pub(crate) struct BuildStep {
    data: JobData,
}

#[async_trait]
impl PipelineState for BuildStep {
    fn name(&self) -> &'static str {
        "build"
    }

    #[instrument(skip_all)]
    async fn advance(mut self: Box<Self>, ctx: &PipelineContext) -> Result<Transition> {
        let commit_sha = self
            .data
            .deployment
            .commit_sha
            .clone()
            .expect("clone step always records a commit sha before build runs");
        let tag = build::image_tag(&self.data.service.subdomain, &commit_sha);

        let work_dir = self
            .data
            .work_dir
            .as_ref()
            .expect("build step always runs after init created the work dir")
            .path()
            .to_path_buf();

        let mut lines = Vec::new();
        let build_result = build::build_image(
            ctx.runtime.as_ref(),
            &work_dir,
            &tag,
            ctx.config.build_timeout(),
            &mut |line| lines.push(line),
        )
        .await;
        emit_logs(ctx, &self.data, &lines).await?;

        if let Err(e) = build_result {
            let reason = format!("build failed: {e}");
            write_terminal_failure(ctx, &mut self.data, &reason, ServiceStatus::Failed, None).await?;
            return Ok(Transition::Done(Outcome::Failed { reason }));
        }

        self.data.deployment.image_tag = Some(tag);
        ctx.dal.update_deployment(&self.data.deployment).await?;

        Ok(Transition::Next(Box::new(FetchRoutingInputs { data: self.data })))
    }
}

pub(crate) struct FetchRoutingInputs {
    data: JobData,
}

#[async_trait]
impl PipelineState for FetchRoutingInputs {
    fn name(&self) -> &'static str {
        "fetch_routing_inputs"
    }

    async fn advance(mut self: Box<Self>, ctx: &PipelineContext) -> Result<Transition> {
        self.data.domains = ctx.dal.list_verified_domains(self.data.service.id).await?;
        Ok(Transition::Next(Box::new(RunStep { data: self.data })))
    }
}

pub(crate) struct RunStep {
    data: JobData,
}

#[async_trait]
impl PipelineState for RunStep {
    fn name(&self) -> &'static str {
        "run"
    }

    #[instrument(skip_all)]
    async fn advance(mut self: Box<Self>, ctx: &PipelineContext) -> Result<Transition> {
        let image = self
            .data
            .deployment
            .image_tag
            .clone()
            .ok_or_else(|| Error::Integrity("no image tag available to run".into()))?;

        let env = decrypt_runtime_env(&ctx.secret_key, &self.data.service.env)?;
        let blue_green = run::choose_policy(&self.data.service);
        let health_check = run::default_health_check_options(
            std::time::Duration::from_secs(ctx.config.health_check_start_delay_sec),
            std::time::Duration::from_secs(
                self.data
                    .service
                    .health_check_timeout_sec
                    .map(u64::from)
                    .unwrap_or(ctx.config.health_check_timeout_sec),
            ),
            ctx.config.health_check_retries,
        );

        let inputs = run::RunInputs {
            service: &self.data.service,
            image: &image,
            env: &env,
            container_port: ctx.config.container_port,
            domains: &self.data.domains,
            health_check,
        };

        let mut lines = Vec::new();
        let mut log_fn = |line: String| lines.push(line);

        let outcome = if blue_green {
            run::run_blue_green(ctx.runtime.as_ref(), &inputs, &ctx.config.base_domain, &mut log_fn).await
        } else {
            run::run_traditional(ctx.runtime.as_ref(), &inputs, &ctx.config.base_domain, &mut log_fn).await
        };
        emit_logs(ctx, &self.data, &lines).await?;

        match outcome? {
            run::RunOutcome::Success { container_id } => {
                Ok(Transition::Next(Box::new(Finalize { data: self.data, container_id })))
            }
            run::RunOutcome::HealthCheckFailed => {
                let reason = "health check failed, deployment rolled back".to_string();
                if blue_green {
                    // The previous container (C1) was never touched; the
                    // service stays RUNNING on it, per the spec's boundary
                    // behavior for blue/green health check failure.
                    write_terminal_failure(
                        ctx,
                        &mut self.data,
                        &reason,
                        ServiceStatus::Running,
                        self.data.service.container_id.clone(),
                    )
                    .await?;
                } else {
                    // Traditional mode stopped (and `run()` then removed)
                    // the old container before the new one failed health
                    // checks; nothing is left listening.
                    write_terminal_failure(ctx, &mut self.data, &reason, ServiceStatus::Failed, None).await?;
                }
                Ok(Transition::Done(Outcome::Failed { reason }))
            }
        }
    }
}

pub(crate) struct Finalize {
    data: JobData,
    container_id: String,
}

#[async_trait]
impl PipelineState for Finalize {
    fn name(&self) -> &'static str {
        "finalize"
    }

    #[instrument(skip_all)]
    async fn advance(mut self: Box<Self>, ctx: &PipelineContext) -> Result<Transition> {
        let now = Utc::now();
        let image_tag = self
            .data
            .deployment
            .image_tag
            .clone()
            .expect("run only succeeds once an image tag is set");

        self.data.deployment.status = DeploymentStatus::Success;
        self.data.deployment.finished_at = Some(now);
        ctx.dal.update_deployment(&self.data.deployment).await?;

        // Set the new container id before emitting `deployment:status`, since
        // that event's `containerId` field exists to convey the new live
        // container at finalize (cf. S1/S2) — emitting before this line would
        // report `None` (or the old container on a redeploy).
        self.data.service.container_id = Some(self.container_id.clone());
        emit_deployment_status(ctx, &self.data).await?;

        self.data.service.status = ServiceStatus::Running;
        self.data.service.updated_at = now;
        ctx.dal.update_service(&self.data.service).await?;
        emit_service_status(ctx, &self.data).await?;

        // `self.data.work_dir` (a `TempDir`) is dropped here unconditionally,
        // removing the working directory regardless of outcome.
        Ok(Transition::Done(Outcome::Success { image_tag, container_id: self.container_id }))
    }
}
