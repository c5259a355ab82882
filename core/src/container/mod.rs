//! Container Controller (C3): a thin, typed wrapper over the container
//! runtime. Grounded in the teacher's `ContainerSettings`/`DockerContext`
//! split (`deployer/src/project/docker.rs`) — a small struct owning the
//! `bollard::Docker` handle plus the handful of runtime-wide constants
//! (managed network, platform label), with typed methods standing in for
//! raw API calls, rather than scattering `bollard` calls across the
//! pipeline.

pub mod health;
pub mod labels;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, Stats as DockerStats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{instrument, warn};

use crate::error::{Error, Result};

use self::labels::{LabelOptions, RouterSpec};

/// The seam the pipeline and reconciler depend on instead of the concrete
/// `bollard`-backed [`ContainerController`] — the same "inject a trait
/// instead of the real collaborator" shape the teacher uses for its
/// `ActiveDeploymentsGetter`/`DeploymentUpdater` collaborators, here letting
/// the end-to-end pipeline tests run without a live Docker daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, opts: RunOptions<'_>) -> Result<String>;
    async fn rename(&self, id: &str, new_name: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn ip(&self, id: &str) -> Result<String>;
    async fn stats(&self, id: &str) -> Result<ContainerStats>;
    async fn list_managed(&self) -> Result<Vec<bollard::models::ContainerSummary>>;
    async fn reap_exited(&self) -> Result<Vec<String>>;
    async fn build_image(&self, context_tar: Vec<u8>, image_tag: &str, timeout: Duration) -> Result<()>;
    /// True if the named container currently exists and is reported
    /// `running` by the runtime. Used by the Reconciler's drift sweep.
    async fn is_running(&self, name: &str) -> Result<bool>;
}

/// `renderlite-<subdomain>` container names bear this prefix; the staging
/// container during a blue/green swap adds `-new`. Both are owned
/// deterministically by the pipeline (§5), which is what lets the
/// Reconciler (C6) answer "what should exist?" purely from the Service row.
pub const CONTAINER_NAME_PREFIX: &str = "renderlite-";
pub const STAGING_SUFFIX: &str = "-new";

pub fn canonical_name(subdomain: &str) -> String {
    format!("{CONTAINER_NAME_PREFIX}{subdomain}")
}

pub fn staging_name(subdomain: &str) -> String {
    format!("{CONTAINER_NAME_PREFIX}{subdomain}{STAGING_SUFFIX}")
}

const MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
const CPU_QUOTA_MICROS: i64 = 50_000; // 0.5 cores at the standard 100ms period
const CPU_PERIOD_MICROS: i64 = 100_000;
const STOP_GRACE_SECONDS: i64 = 10;

#[derive(Clone)]
pub struct ContainerController {
    docker: Docker,
    managed_network: String,
    proxy_label_prefix: String,
    enable_tls: bool,
}

pub struct RunOptions<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub subdomain: &'a str,
    pub env: &'a HashMap<String, String>,
    pub container_port: u16,
    /// Hostnames routed at this container: the subdomain host first, then
    /// one per verified custom domain.
    pub hosts: &'a [String],
}

pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
}

impl ContainerController {
    pub fn new(
        docker: Docker,
        managed_network: String,
        proxy_label_prefix: String,
        enable_tls: bool,
    ) -> Self {
        Self {
            docker,
            managed_network,
            proxy_label_prefix,
            enable_tls,
        }
    }

    pub fn connect(
        docker_host: &str,
        managed_network: String,
        proxy_label_prefix: String,
        enable_tls: bool,
    ) -> Result<Self> {
        let docker = Docker::connect_with_unix(docker_host, 60, bollard::API_DEFAULT_VERSION)?;
        Ok(Self::new(docker, managed_network, proxy_label_prefix, enable_tls))
    }

    /// Creates and starts a container under `opts.name`. If a container
    /// with that name already exists, it is stopped and removed first —
    /// this is what lets the pipeline re-create the canonical container on
    /// every traditional deploy without a separate "does it exist" check.
    #[instrument(skip(self, opts), fields(name = %opts.name, subdomain = %opts.subdomain))]
    pub async fn run(&self, opts: RunOptions<'_>) -> Result<String> {
        if let Some(existing) = self.find_by_name(opts.name).await? {
            self.stop(&existing).await.ok();
            self.remove(&existing).await.ok();
        }

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let routers = router_specs(opts.subdomain, opts.hosts);
        let label_opts = LabelOptions {
            proxy_prefix: &self.proxy_label_prefix,
            managed_network: &self.managed_network,
            subdomain: opts.subdomain,
            container_port: opts.container_port,
            enable_tls: self.enable_tls,
            routers: &routers,
        };
        let labels = labels::build(&label_opts);

        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            memory: Some(MEMORY_LIMIT_BYTES),
            cpu_quota: Some(CPU_QUOTA_MICROS),
            cpu_period: Some(CPU_PERIOD_MICROS),
            network_mode: Some(self.managed_network.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(opts.image.to_string()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_opts = CreateContainerOptions {
            name: opts.name,
            platform: None,
        };

        let created = self.docker.create_container(Some(create_opts), config).await?;

        self.docker
            .connect_network(
                &self.managed_network,
                ConnectNetworkOptions {
                    container: created.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .or_else(|e| {
                // Already-attached-via-NetworkMode is not an error for us.
                if matches!(&e, DockerError::DockerResponseServerError { status_code, .. } if *status_code == 403)
                {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(created.id)
    }

    /// Renames a running container, used for the blue/green swap's final
    /// step (§4.2): the staging container becomes the canonical one in
    /// place, instead of being torn down and recreated (see DESIGN.md for
    /// why this implementation picked rename over recreate).
    #[instrument(skip(self))]
    pub async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        self.docker.rename_container(id, bollard::container::RenameContainerOptions { name: new_name }).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<()> {
        let opts = StopContainerOptions { t: STOP_GRACE_SECONDS };
        match self.docker.stop_container(id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.stop(id).await.ok();

        let opts = RemoveContainerOptions { force: true, ..Default::default() };
        match self.docker.remove_container(id, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The container's address on the managed network, used for health
    /// checks against its private port.
    #[instrument(skip(self))]
    pub async fn ip(&self, id: &str) -> Result<String> {
        let inspect = self.docker.inspect_container(id, None).await?;

        inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| networks.get(&self.managed_network).cloned())
            .and_then(|network| network.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::Integrity(format!("container {id} has no address on the managed network")))
    }

    /// One-shot stats sample (`stream = false`). Computes CPU percent from
    /// cpu-delta / system-delta × online-cpus × 100, memory percent from
    /// used/limit, and sums per-interface RX/TX byte counters, per §4.3.
    #[instrument(skip(self))]
    pub async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let opts = StatsOptions { stream: false, one_shot: true };
        let mut stream = self.docker.stats(id, Some(opts));

        let sample: DockerStats = stream
            .next()
            .await
            .ok_or_else(|| Error::Integrity(format!("no stats sample for container {id}")))??;

        Ok(compute_stats(&sample))
    }

    /// Every container bearing the platform's `managed` label.
    #[instrument(skip(self))]
    pub async fn list_managed(&self) -> Result<Vec<bollard::models::ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", labels::MANAGED_LABEL)]);

        let opts = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        Ok(self.docker.list_containers(Some(opts)).await?)
    }

    /// Removes every managed container currently in the `exited` state.
    #[instrument(skip(self))]
    pub async fn reap_exited(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", labels::MANAGED_LABEL)]);
        filters.insert("status".to_string(), vec!["exited".to_string()]);

        let opts = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let exited = self.docker.list_containers(Some(opts)).await?;
        let mut reaped = Vec::new();

        for container in exited {
            if let Some(id) = container.id {
                if let Err(e) = self.remove(&id).await {
                    warn!(container_id = %id, error = %e, "failed to reap exited container");
                    continue;
                }
                reaped.push(id);
            }
        }

        Ok(reaped)
    }

    /// Builds the image at `context_path` from its `Dockerfile`, tagging it
    /// `image_tag`. Buildpack building (when no `Dockerfile` is present) is
    /// handled one level up, in the pipeline's build step, since it shells
    /// out to a separate tool rather than talking to the Docker daemon.
    #[instrument(skip(self), fields(image_tag))]
    pub async fn build_image(
        &self,
        context_tar: Vec<u8>,
        image_tag: &str,
        timeout: Duration,
    ) -> Result<()> {
        let opts = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: image_tag,
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(opts, None, Some(context_tar.into()));

        tokio::time::timeout(timeout, async {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            return Err(Error::Validation(error));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::Timeout(format!("image build exceeded {timeout:?}")))?
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let opts = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let matches = self.docker.list_containers(Some(opts)).await?;
        Ok(matches.into_iter().find_map(|c| c.id))
    }

    /// True if a container named `name` exists and its runtime state is
    /// `running`. Absence is not an error here — it's the Reconciler's
    /// "nothing to see" case.
    #[instrument(skip(self))]
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let opts = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let matches = self.docker.list_containers(Some(opts)).await?;
        Ok(matches
            .into_iter()
            .any(|c| c.state.as_deref() == Some("running")))
    }
}

#[async_trait]
impl ContainerRuntime for ContainerController {
    async fn run(&self, opts: RunOptions<'_>) -> Result<String> {
        ContainerController::run(self, opts).await
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        ContainerController::rename(self, id, new_name).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        ContainerController::stop(self, id).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        ContainerController::remove(self, id).await
    }

    async fn ip(&self, id: &str) -> Result<String> {
        ContainerController::ip(self, id).await
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        ContainerController::stats(self, id).await
    }

    async fn list_managed(&self) -> Result<Vec<bollard::models::ContainerSummary>> {
        ContainerController::list_managed(self).await
    }

    async fn reap_exited(&self) -> Result<Vec<String>> {
        ContainerController::reap_exited(self).await
    }

    async fn build_image(&self, context_tar: Vec<u8>, image_tag: &str, timeout: Duration) -> Result<()> {
        ContainerController::build_image(self, context_tar, image_tag, timeout).await
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        ContainerController::is_running(self, name).await
    }
}

fn router_specs<'a>(subdomain: &str, hosts: &'a [String]) -> Vec<RouterSpec<'a>> {
    // The first host is always the subdomain itself, keyed to a router
    // named after the subdomain; every additional verified custom domain
    // gets its own `-domain-<i>` router name, per §4.3.
    hosts
        .iter()
        .enumerate()
        .map(|(i, host)| RouterSpec {
            name: if i == 0 {
                subdomain.to_string()
            } else {
                format!("{subdomain}-domain-{}", i - 1)
            },
            host,
        })
        .collect()
}

fn compute_stats(sample: &DockerStats) -> ContainerStats {
    let cpu_delta = sample.cpu_stats.cpu_usage.total_usage as f64
        - sample.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = sample.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - sample.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let online_cpus = sample.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;

    let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus * 100.0
    } else {
        0.0
    };

    let memory_usage = sample.memory_stats.usage.unwrap_or(0);
    let memory_limit = sample.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        (memory_usage as f64 / memory_limit as f64) * 100.0
    } else {
        0.0
    };

    let (mut rx, mut tx) = (0u64, 0u64);
    if let Some(networks) = &sample.networks {
        for iface in networks.values() {
            rx += iface.rx_bytes;
            tx += iface.tx_bytes;
        }
    }

    ContainerStats {
        cpu_percent,
        memory_usage,
        memory_limit,
        memory_percent,
        network_rx: rx,
        network_tx: tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_staging_names_are_deterministic() {
        assert_eq!(canonical_name("api-x-ab12cd"), "renderlite-api-x-ab12cd");
        assert_eq!(staging_name("api-x-ab12cd"), "renderlite-api-x-ab12cd-new");
    }

    #[test]
    fn router_specs_include_one_entry_per_host() {
        let hosts = vec![
            "api-x-ab12cd.renderlite.local".to_string(),
            "api.example.com".to_string(),
        ];
        let specs = router_specs("api-x-ab12cd", &hosts);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].host, "api-x-ab12cd.renderlite.local");
        assert_eq!(specs[1].host, "api.example.com");
    }
}
