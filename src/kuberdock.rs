use std::sync::Arc;
use std::time::Duration;

use kapi::config::Config;
use kapi::images::ImageProbe;
use kapi::ippool::IpAddrPool;
use kapi::kube_client::KubeClient;
use kapi::lock::ExclusiveLock;
use kapi::node::UnmanagedNodes;
use kapi::pod::PodCollection;
use kapi::pstorage::{storage_backend, PersistentStorage};
use kapi::reconciler::Reconciler;
use kapi::sse::EventPublisher;
use kapi::tasks::{job_channel, Job};
use tracing::{error, info};

/// How often a disk-GC cycle is scheduled.
const DISK_GC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_flags()?);
    info!(ip_mode = ?config.ip_mode, storage = ?config.storage, "starting control plane");

    let db = kapi::store::connect(&config.database_url).await?;
    let settings = kapi::store::system_settings(&db).await?;

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client.clone()).await?;

    let kube = KubeClient::connect().await?;
    let locks = ExclusiveLock::new(redis.clone());
    let publisher = EventPublisher::new(redis.clone());

    let runner = Arc::new(UnmanagedNodes);
    let backend = storage_backend(&config, runner.clone());
    let pstorage = PersistentStorage::new(
        db.clone(),
        backend,
        &config,
        settings.persistent_disk_max_size,
    );
    let ippool = IpAddrPool::new(db.clone(), kube.clone(), config.ip_mode);
    let images = ImageProbe::new(db.clone());

    // The command surface consumed by the HTTP layer.
    let _pods = PodCollection::new(
        db.clone(),
        kube.clone(),
        ippool,
        pstorage.clone(),
        locks.clone(),
        images,
    );

    let (jobs, worker) = job_channel(db.clone(), pstorage, locks);
    let worker_task = tokio::spawn(worker.run());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let gc_jobs = jobs.clone();
    let mut gc_shutdown = shutdown_rx.clone();
    let gc_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(DISK_GC_INTERVAL);
        loop {
            tokio::select! {
                _ = gc_shutdown.changed() => break,
                _ = tick.tick() => gc_jobs.submit(Job::PersistentDiskGc),
            }
        }
    });

    let reconciler = Reconciler {
        db,
        kube,
        redis: redis.clone(),
        publisher,
        router: runner.clone(),
        fs_limits: runner,
        jobs,
    };
    let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let sse_addr = config.sse_listen_addr;
    let routes = kapi::sse::routes(redis_client, redis, config.sse_keepalive_interval);
    let mut sse_shutdown = shutdown_rx;
    let sse_task = tokio::spawn(async move {
        let (addr, server) =
            warp::serve(routes).bind_with_graceful_shutdown(sse_addr, async move {
                let _ = sse_shutdown.changed().await;
            });
        info!(%addr, "event stream listening");
        server.await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for (name, task) in [
        ("reconciler", reconciler_task),
        ("gc scheduler", gc_task),
        ("event stream", sse_task),
        ("job worker", worker_task),
    ] {
        if let Err(e) = task.await {
            error!(error = %e, task = name, "task did not shut down cleanly");
        }
    }
    Ok(())
}
