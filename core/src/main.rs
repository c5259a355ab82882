//! Worker process entrypoint: parses [`Config`], wires every long-lived
//! collaborator together, and spawns the queue worker loops, the metrics
//! ticker's sibling (the Reconciler ticker), and waits for a shutdown
//! signal. Follows the teacher's own binary shape (`clap::Parser::parse()`,
//! a `tracing_subscriber::fmt` layer gated by `EnvFilter`, collaborators
//! built once and handed to long-lived spawned tasks) rather than anything
//! bespoke.

use std::sync::Arc;

use clap::Parser;
use renderlite_core::config::Config;
use renderlite_core::container::ContainerController;
use renderlite_core::events::LocalPubSub;
use renderlite_core::persistence::{Dal, SqliteDal};
use renderlite_core::pipeline::{run_job, PipelineContext, PipelineJob};
use renderlite_core::queue::{QueueConfig, QueueName, Scheduler};
use renderlite_core::reconciler;
use renderlite_core::secrets::SecretKey;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::parse();
    let config = Arc::new(config);

    let secret_key = SecretKey::from_hex(&config.encryption_key)?;

    let runtime = Arc::new(ContainerController::connect(
        &config.docker_host,
        config.managed_network.clone(),
        config.proxy_label_prefix.clone(),
        config.enable_tls,
    )?);

    let dal: Arc<dyn Dal> = Arc::new(SqliteDal::new(&config.database_url).await?);
    let bus: Arc<dyn renderlite_core::events::PubSub> = Arc::new(LocalPubSub::default());

    let queue_config = QueueConfig {
        concurrency: config.queue_concurrency,
        rate_limit: config.queue_rate_limit,
        rate_window: std::time::Duration::from_secs(config.queue_rate_window_sec),
        max_attempts: config.queue_max_attempts,
        retry_base_delay: std::time::Duration::from_millis(config.queue_retry_base_delay_ms),
    };
    let scheduler = Arc::new(Scheduler::<PipelineJob>::new(queue_config));

    let ctx = Arc::new(PipelineContext {
        dal: dal.clone(),
        runtime: runtime.clone(),
        bus: bus.clone(),
        config: config.clone(),
        secret_key,
    });

    let reconciler_handle = reconciler::spawn_ticker(
        dal.clone(),
        runtime.clone(),
        bus.clone(),
        config.reconcile_interval(),
    );

    let build_workers: Vec<_> = (0..config.queue_concurrency)
        .map(|_| spawn_worker(scheduler.queue(QueueName::Build).clone(), ctx.clone()))
        .collect();
    let rollback_workers: Vec<_> = (0..config.queue_concurrency)
        .map(|_| spawn_worker(scheduler.queue(QueueName::Rollback).clone(), ctx.clone()))
        .collect();

    info!("renderlite worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");

    reconciler_handle.abort();
    for worker in build_workers.into_iter().chain(rollback_workers) {
        worker.abort();
    }

    Ok(())
}

fn spawn_worker(
    queue: Arc<renderlite_core::queue::Queue<PipelineJob>>,
    ctx: Arc<PipelineContext>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let lease = queue.lease().await;
            let job = lease.payload().clone();
            match run_job(job, &ctx).await {
                Ok(()) => lease.ack().await,
                Err(e) if e.is_infrastructural() => {
                    error!(error = %e, "infrastructural error running pipeline job, will retry");
                    lease.nack().await;
                }
                Err(e) => {
                    error!(error = %e, "pipeline job failed with a business-level error");
                    lease.ack().await;
                }
            }
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
