//! End-to-end deployment pipeline scenarios (S1-S6), run against a fake
//! `ContainerRuntime` so they exercise the real state machine, queue, and
//! reconciler without needing a live Docker daemon. Clones still go through
//! the real `git` binary (against a local fixture repository) since that's
//! the one external tool cheap enough to depend on in a test environment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use renderlite_common::{Deployment, DeploymentStatus, Envelope, Service, ServiceStatus};
use renderlite_core::config::Config;
use renderlite_core::container::{canonical_name, staging_name, ContainerRuntime, ContainerStats, RunOptions};
use renderlite_core::error::Result;
use renderlite_core::events::{LocalPubSub, PubSub, RealtimeEvent};
use renderlite_core::persistence::{Dal, SqliteDal};
use renderlite_core::pipeline::{self, DeployJob, PipelineContext, PipelineJob, RollbackJob};
use renderlite_core::queue::{Queue, QueueConfig, QueueName};
use renderlite_core::reconciler;
use renderlite_core::secrets::SecretKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

struct ContainerRecord {
    name: String,
    running: bool,
}

/// A trait-object stand-in for the real `bollard`-backed controller. Tracks
/// just enough state (name, running/removed) for the scenarios below to
/// assert on; health checks still hit a real loopback listener, since that's
/// the only way to exercise the health-check polling itself.
#[derive(Default)]
struct FakeContainerRuntime {
    containers: StdMutex<HashMap<String, ContainerRecord>>,
    removed: StdMutex<Vec<String>>,
    build_calls: StdMutex<u32>,
}

impl FakeContainerRuntime {
    fn running_names(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.running)
            .map(|r| r.name.clone())
            .collect()
    }

    fn kill_by_name(&self, name: &str) {
        for record in self.containers.lock().unwrap().values_mut() {
            if record.name == name {
                record.running = false;
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn run(&self, opts: RunOptions<'_>) -> Result<String> {
        let id = format!("fake-{}", Uuid::new_v4());
        self.containers.lock().unwrap().insert(
            id.clone(),
            ContainerRecord { name: opts.name.to_string(), running: true },
        );
        Ok(id)
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        if let Some(record) = self.containers.lock().unwrap().get_mut(id) {
            record.name = new_name.to_string();
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        if let Some(record) = self.containers.lock().unwrap().get_mut(id) {
            record.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn ip(&self, _id: &str) -> Result<String> {
        Ok("127.0.0.1".to_string())
    }

    async fn stats(&self, _id: &str) -> Result<ContainerStats> {
        unimplemented!("not exercised by these scenarios")
    }

    async fn list_managed(&self) -> Result<Vec<bollard::models::ContainerSummary>> {
        Ok(Vec::new())
    }

    async fn reap_exited(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn build_image(&self, _context_tar: Vec<u8>, _image_tag: &str, _timeout: Duration) -> Result<()> {
        *self.build_calls.lock().unwrap() += 1;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.containers.lock().unwrap().values().any(|r| r.name == name && r.running))
    }
}

fn test_config(container_port: u16) -> Config {
    Config {
        base_domain: "renderlite.local".to_string(),
        container_port,
        build_timeout_ms: 15_000,
        clone_timeout_ms: 15_000,
        health_check_start_delay_sec: 0,
        health_check_timeout_sec: 1,
        health_check_retries: 2,
        enable_tls: false,
        encryption_key: "11".repeat(32),
        queue_concurrency: 2,
        queue_rate_limit: 100,
        queue_rate_window_sec: 60,
        queue_max_attempts: 3,
        queue_retry_base_delay_ms: 1,
        reconcile_interval_min: 60,
        docker_host: "unix:///var/run/docker.sock".to_string(),
        managed_network: "renderlite_net".to_string(),
        proxy_label_prefix: "traefik".to_string(),
        database_url: "sqlite://unused".to_string(),
    }
}

async fn test_context(runtime: Arc<FakeContainerRuntime>, container_port: u16) -> (PipelineContext, Arc<dyn Dal>) {
    let dal: Arc<dyn Dal> = Arc::new(SqliteDal::new_in_memory().await.unwrap());
    let bus: Arc<dyn PubSub> = Arc::new(LocalPubSub::default());
    let config = Arc::new(test_config(container_port));
    let secret_key = SecretKey::from_hex(&config.encryption_key).unwrap();

    let ctx = PipelineContext {
        dal: dal.clone(),
        runtime,
        bus,
        config,
        secret_key,
    };
    (ctx, dal)
}

fn sample_webhook_secret() -> Envelope {
    Envelope::new("aa", "bb", "cc")
}

fn sample_service(subdomain: &str, repo_dir: &Path, health_check_path: Option<&str>) -> Service {
    let now = chrono::Utc::now();
    Service {
        id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        name: "api-x".into(),
        repo_url: repo_dir.to_string_lossy().into_owned(),
        branch: "main".into(),
        runtime_hint: None,
        subdomain: subdomain.into(),
        status: ServiceStatus::Created,
        container_id: None,
        env: Default::default(),
        health_check_path: health_check_path.map(str::to_string),
        health_check_interval_sec: None,
        health_check_timeout_sec: None,
        webhook_secret: sample_webhook_secret(),
        created_at: now,
        updated_at: now,
    }
}

fn sample_deployment(service_id: Uuid) -> Deployment {
    let now = chrono::Utc::now();
    Deployment {
        id: Uuid::new_v4(),
        service_id,
        status: DeploymentStatus::Queued,
        commit_sha: None,
        image_tag: None,
        logs: String::new(),
        created_at: now,
        started_at: None,
        finished_at: None,
    }
}

/// Initializes a throwaway git repository at `dir`, with or without a
/// `Dockerfile`, and returns its full commit hash. `shallow_clone` happily
/// clones a plain local path, so no server is needed.
fn init_fixture_repo(dir: &Path, with_dockerfile: bool) -> String {
    let run = |args: &[&str]| {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("git must be available to run these tests");
        assert!(status.success(), "git {args:?} failed");
    };

    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "renderlite-tests"]);

    if with_dockerfile {
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
    } else {
        std::fs::write(dir.join("README.md"), "placeholder\n").unwrap();
    }

    run(&["add", "-A"]);
    run(&["commit", "-q", "-m", "initial"]);
    run(&["branch", "-M", "main"]);

    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// A minimal loopback HTTP responder: every connection gets the same status
/// line back, regardless of what it asked for. Enough to drive
/// `wait_until_healthy` through a real TCP round trip.
async fn spawn_health_responder(status_line: &'static str) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").as_bytes())
                    .await;
            });
        }
    });

    (port, handle)
}

#[tokio::test]
async fn s1_happy_path_builds_and_runs_with_no_health_check() {
    let repo_dir = tempfile::tempdir().unwrap();
    // Uses a Dockerfile so the build goes through the mocked
    // `ContainerRuntime::build_image` rather than shelling out to `pack`,
    // which isn't assumed to be installed wherever this suite runs.
    init_fixture_repo(repo_dir.path(), true);

    let runtime = Arc::new(FakeContainerRuntime::default());
    let (ctx, dal) = test_context(runtime.clone(), 3000).await;

    let service = sample_service("api-x-ab12cd", repo_dir.path(), None);
    dal.create_service(&service).await.unwrap();
    let deployment = sample_deployment(service.id);
    dal.create_deployment(&deployment).await.unwrap();

    pipeline::run_job(
        PipelineJob::Deploy(DeployJob { deployment_id: deployment.id, service_id: service.id }),
        &ctx,
    )
    .await
    .unwrap();

    let final_deployment = dal.get_deployment(deployment.id).await.unwrap().unwrap();
    assert_eq!(final_deployment.status, DeploymentStatus::Success);
    assert_eq!(final_deployment.image_tag.as_deref().unwrap().split(':').next().unwrap(), "renderlite-api-x-ab12cd");
    assert!(!final_deployment.logs.is_empty());

    let final_service = dal.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(final_service.status, ServiceStatus::Running);
    assert!(final_service.container_id.is_some());

    assert!(runtime.running_names().contains(&canonical_name("api-x-ab12cd")));
    assert_eq!(*runtime.build_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn s2_blue_green_swap_succeeds_on_first_healthy_response() {
    let repo_dir = tempfile::tempdir().unwrap();
    init_fixture_repo(repo_dir.path(), true);

    let (port, _server) = spawn_health_responder("HTTP/1.1 200 OK").await;

    let runtime = Arc::new(FakeContainerRuntime::default());
    let (ctx, dal) = test_context(runtime.clone(), port).await;

    let mut service = sample_service("api-x-ab12cd", repo_dir.path(), Some("/healthz"));
    // Already RUNNING with a live container (C1) so the run step picks the
    // blue/green policy instead of traditional.
    let old_id = runtime
        .run(RunOptions {
            name: &canonical_name(&service.subdomain),
            image: "renderlite-api-x-ab12cd:old",
            subdomain: &service.subdomain,
            env: &HashMap::new(),
            container_port: port,
            hosts: &[format!("{}.renderlite.local", service.subdomain)],
        })
        .await
        .unwrap();
    service.status = ServiceStatus::Running;
    service.container_id = Some(old_id.clone());
    dal.create_service(&service).await.unwrap();
    let deployment = sample_deployment(service.id);
    dal.create_deployment(&deployment).await.unwrap();

    pipeline::run_job(
        PipelineJob::Deploy(DeployJob { deployment_id: deployment.id, service_id: service.id }),
        &ctx,
    )
    .await
    .unwrap();

    let final_deployment = dal.get_deployment(deployment.id).await.unwrap().unwrap();
    assert_eq!(final_deployment.status, DeploymentStatus::Success);

    let final_service = dal.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(final_service.status, ServiceStatus::Running);
    assert_ne!(final_service.container_id.as_deref(), Some(old_id.as_str()));

    // C1 and the `-new` staging container are both gone; only the canonical
    // name is left running.
    let running = runtime.running_names();
    assert_eq!(running, vec![canonical_name("api-x-ab12cd")]);
    assert!(!running.contains(&staging_name("api-x-ab12cd")));
}

#[tokio::test]
async fn s3_blue_green_health_check_failure_leaves_the_old_container_running() {
    let repo_dir = tempfile::tempdir().unwrap();
    init_fixture_repo(repo_dir.path(), true);

    let (port, _server) = spawn_health_responder("HTTP/1.1 503 Service Unavailable").await;

    let runtime = Arc::new(FakeContainerRuntime::default());
    let (ctx, dal) = test_context(runtime.clone(), port).await;

    let mut service = sample_service("api-x-ab12cd", repo_dir.path(), Some("/healthz"));
    let old_id = runtime
        .run(RunOptions {
            name: &canonical_name(&service.subdomain),
            image: "renderlite-api-x-ab12cd:old",
            subdomain: &service.subdomain,
            env: &HashMap::new(),
            container_port: port,
            hosts: &[format!("{}.renderlite.local", service.subdomain)],
        })
        .await
        .unwrap();
    service.status = ServiceStatus::Running;
    service.container_id = Some(old_id.clone());
    dal.create_service(&service).await.unwrap();
    let deployment = sample_deployment(service.id);
    dal.create_deployment(&deployment).await.unwrap();

    pipeline::run_job(
        PipelineJob::Deploy(DeployJob { deployment_id: deployment.id, service_id: service.id }),
        &ctx,
    )
    .await
    .unwrap();

    let final_deployment = dal.get_deployment(deployment.id).await.unwrap().unwrap();
    assert_eq!(final_deployment.status, DeploymentStatus::Failed);

    let final_service = dal.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(final_service.status, ServiceStatus::Running);
    assert_eq!(final_service.container_id.as_deref(), Some(old_id.as_str()));

    // Only C1 survives; the `-new` staging container was rolled back.
    let running = runtime.running_names();
    assert_eq!(running, vec![canonical_name("api-x-ab12cd")]);
}

#[tokio::test]
async fn s4_rollback_reuses_the_target_image_and_commit_without_cloning_or_building() {
    let runtime = Arc::new(FakeContainerRuntime::default());
    let (ctx, dal) = test_context(runtime.clone(), 3000).await;

    let repo_dir = tempfile::tempdir().unwrap();
    let mut service = sample_service("web-ab12cd", repo_dir.path(), None);
    let old_id = runtime
        .run(RunOptions {
            name: &canonical_name(&service.subdomain),
            image: "renderlite-web-ab12cd:e4f5a6b",
            subdomain: &service.subdomain,
            env: &HashMap::new(),
            container_port: 3000,
            hosts: &[format!("{}.renderlite.local", service.subdomain)],
        })
        .await
        .unwrap();
    service.status = ServiceStatus::Running;
    service.container_id = Some(old_id);
    dal.create_service(&service).await.unwrap();

    let mut d1 = sample_deployment(service.id);
    d1.status = DeploymentStatus::Success;
    d1.commit_sha = Some("a1b2c3d0000000000000000000000000000000".to_string());
    d1.image_tag = Some("renderlite-web-ab12cd:a1b2c3d".to_string());
    dal.create_deployment(&d1).await.unwrap();

    let mut d2 = sample_deployment(service.id);
    d2.status = DeploymentStatus::Success;
    d2.commit_sha = Some("e4f5a6b0000000000000000000000000000000".to_string());
    d2.image_tag = Some("renderlite-web-ab12cd:e4f5a6b".to_string());
    dal.create_deployment(&d2).await.unwrap();

    let d3 = sample_deployment(service.id);
    dal.create_deployment(&d3).await.unwrap();

    pipeline::run_job(
        PipelineJob::Rollback(RollbackJob {
            deployment_id: d3.id,
            service_id: service.id,
            target_deployment_id: d1.id,
        }),
        &ctx,
    )
    .await
    .unwrap();

    let final_d3 = dal.get_deployment(d3.id).await.unwrap().unwrap();
    assert_eq!(final_d3.status, DeploymentStatus::Success);
    assert_eq!(final_d3.image_tag, d1.image_tag);
    assert_eq!(final_d3.commit_sha, d1.commit_sha);

    let final_service = dal.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(final_service.status, ServiceStatus::Running);
    assert!(final_service.container_id.is_some());

    // No build ever happened for the rollback job.
    assert_eq!(*runtime.build_calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn s5_cancelling_a_queued_deployment_marks_it_failed_without_touching_the_runtime() {
    let runtime = Arc::new(FakeContainerRuntime::default());
    let (ctx, dal) = test_context(runtime.clone(), 3000).await;

    let repo_dir = tempfile::tempdir().unwrap();
    let service = sample_service("api-x-ab12cd", repo_dir.path(), None);
    dal.create_service(&service).await.unwrap();
    let deployment = sample_deployment(service.id);
    dal.create_deployment(&deployment).await.unwrap();

    let queue_config = QueueConfig {
        concurrency: 1,
        rate_limit: 100,
        rate_window: Duration::from_secs(60),
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(1),
    };
    let queue: Queue<PipelineJob> = Queue::new(QueueName::Build, queue_config);
    queue
        .enqueue(
            deployment.id,
            PipelineJob::Deploy(DeployJob { deployment_id: deployment.id, service_id: service.id }),
        )
        .await
        .unwrap();

    let cancelled = pipeline::cancel_queued(&ctx, &queue, deployment.id).await.unwrap();
    assert!(cancelled);
    assert!(!queue.contains(deployment.id).await);

    let final_deployment = dal.get_deployment(deployment.id).await.unwrap().unwrap();
    assert_eq!(final_deployment.status, DeploymentStatus::Failed);
    assert!(final_deployment.logs.contains("cancelled by user"));

    let final_service = dal.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(final_service.status, ServiceStatus::Failed);

    assert!(runtime.running_names().is_empty());
}

#[tokio::test]
async fn s6_reconciler_repairs_drift_and_emits_no_new_deployment() {
    let runtime = Arc::new(FakeContainerRuntime::default());
    let dal: Arc<dyn Dal> = Arc::new(SqliteDal::new_in_memory().await.unwrap());
    let bus = LocalPubSub::default();
    let mut subscriber = bus.subscribe().await;

    let repo_dir = tempfile::tempdir().unwrap();
    let mut service = sample_service("api-x-ab12cd", repo_dir.path(), None);
    let container_id = runtime
        .run(RunOptions {
            name: &canonical_name(&service.subdomain),
            image: "renderlite-api-x-ab12cd:a1b2c3d",
            subdomain: &service.subdomain,
            env: &HashMap::new(),
            container_port: 3000,
            hosts: &[format!("{}.renderlite.local", service.subdomain)],
        })
        .await
        .unwrap();
    service.status = ServiceStatus::Running;
    service.container_id = Some(container_id);
    dal.create_service(&service).await.unwrap();

    let deployments_before = dal.list_deployments_for_service(service.id).await.unwrap().len();

    // Operator kills the container out of band.
    runtime.kill_by_name(&canonical_name(&service.subdomain));

    reconciler::run_once(dal.as_ref(), runtime.as_ref(), &bus).await.unwrap();

    let final_service = dal.get_service(service.id).await.unwrap().unwrap();
    assert_eq!(final_service.status, ServiceStatus::Stopped);
    assert!(final_service.container_id.is_none());

    let deployments_after = dal.list_deployments_for_service(service.id).await.unwrap().len();
    assert_eq!(deployments_before, deployments_after);

    let RealtimeEvent::ServiceStatus { status, service_id, .. } = subscriber.recv().await.unwrap() else {
        panic!("expected a service:status event");
    };
    assert_eq!(status, ServiceStatus::Stopped);
    assert_eq!(service_id, service.id);
}
