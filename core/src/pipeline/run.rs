//! Run step (§4.2 step 5): branches between blue/green and traditional
//! deployment policy, grounded in the spec's own branch condition rather
//! than a teacher file (no blue/green swap exists anywhere in the example
//! pack — the closest relative is the teacher's stop/start restart flow in
//! `deployer/src/deployment/run.rs`, which the traditional branch below
//! follows directly).

use std::collections::HashMap;
use std::time::Duration;

use renderlite_common::{Domain, Service};
use tracing::instrument;

use crate::container::health::{wait_until_healthy, HealthCheckOptions};
use crate::container::{canonical_name, staging_name, ContainerRuntime, RunOptions};
use crate::error::Result;

pub struct RunInputs<'a> {
    pub service: &'a Service,
    pub image: &'a str,
    pub env: &'a HashMap<String, String>,
    pub container_port: u16,
    pub domains: &'a [Domain],
    pub health_check: HealthCheckOptions,
}

pub enum RunOutcome {
    Success { container_id: String },
    HealthCheckFailed,
}

fn hosts_for(service: &Service, domains: &[Domain], base_domain: &str) -> Vec<String> {
    let mut hosts = vec![format!("{}.{base_domain}", service.subdomain)];
    hosts.extend(domains.iter().map(|d| d.hostname.clone()));
    hosts
}

/// Decides policy per §4.2 step 5: blue/green iff the service already has a
/// live container *and* a health check path is configured, traditional
/// otherwise.
pub fn choose_policy(service: &Service) -> bool {
    service.container_id.is_some() && service.health_check_path.is_some()
}

#[instrument(skip_all, fields(subdomain = %inputs.service.subdomain))]
pub async fn run_blue_green(
    runtime: &dyn ContainerRuntime,
    inputs: &RunInputs<'_>,
    base_domain: &str,
    on_log: &mut dyn FnMut(String),
) -> Result<RunOutcome> {
    let service = inputs.service;
    let staging = staging_name(&service.subdomain);
    let canonical = canonical_name(&service.subdomain);
    let hosts = hosts_for(service, inputs.domains, base_domain);

    on_log(format!("starting staging container {staging}"));
    let staging_id = runtime
        .run(RunOptions {
            name: &staging,
            image: inputs.image,
            subdomain: &service.subdomain,
            env: inputs.env,
            container_port: inputs.container_port,
            hosts: &hosts,
        })
        .await?;

    let ip = runtime.ip(&staging_id).await?;
    let path = service
        .health_check_path
        .as_deref()
        .expect("blue/green is only chosen when a health check path is configured");

    on_log(format!("health-checking {staging} at {ip}:{}{path}", inputs.container_port));
    let healthy = wait_until_healthy(&ip, inputs.container_port, path, &inputs.health_check).await;

    if !healthy {
        on_log(format!("health check failed for {staging}, rolling back to the live container"));
        runtime.remove(&staging_id).await?;
        return Ok(RunOutcome::HealthCheckFailed);
    }

    on_log("health check passed, swapping staging container into place".to_string());
    let old_id = service
        .container_id
        .clone()
        .expect("blue/green is only chosen when a container is already live");
    runtime.remove(&old_id).await?;
    runtime.rename(&staging_id, &canonical).await?;

    Ok(RunOutcome::Success { container_id: staging_id })
}

#[instrument(skip_all, fields(subdomain = %inputs.service.subdomain))]
pub async fn run_traditional(
    runtime: &dyn ContainerRuntime,
    inputs: &RunInputs<'_>,
    base_domain: &str,
    on_log: &mut dyn FnMut(String),
) -> Result<RunOutcome> {
    let service = inputs.service;
    let canonical = canonical_name(&service.subdomain);
    let hosts = hosts_for(service, inputs.domains, base_domain);

    if let Some(old_id) = &service.container_id {
        on_log(format!("stopping previous container {old_id}"));
        runtime.stop(old_id).await?;
    }

    on_log(format!("starting {canonical}"));
    let new_id = runtime
        .run(RunOptions {
            name: &canonical,
            image: inputs.image,
            subdomain: &service.subdomain,
            env: inputs.env,
            container_port: inputs.container_port,
            hosts: &hosts,
        })
        .await?;

    if let Some(path) = &service.health_check_path {
        let ip = runtime.ip(&new_id).await?;
        on_log(format!("health-checking {canonical} at {ip}:{}{path}", inputs.container_port));
        let healthy = wait_until_healthy(&ip, inputs.container_port, path, &inputs.health_check).await;

        if !healthy {
            on_log(format!("health check failed for {canonical}, removing it"));
            runtime.remove(&new_id).await?;
            return Ok(RunOutcome::HealthCheckFailed);
        }
    }

    Ok(RunOutcome::Success { container_id: new_id })
}

pub fn default_health_check_options(
    start_delay: Duration,
    per_attempt_timeout: Duration,
    max_attempts: u32,
) -> HealthCheckOptions {
    HealthCheckOptions { start_delay, per_attempt_timeout, max_attempts }
}
