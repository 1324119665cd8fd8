pub mod args;
pub mod artifacts;
pub mod cache;
pub mod config;
pub mod deployment;
pub mod error;
pub mod handlers;
pub mod persistence;
pub mod recovery;
pub mod runtime;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use args::DaemonArgs;
use artifacts::ArtifactStore;
use cache::LayerCache;
use deployment::{Scheduler, SchedulerConfig};
use error::Error;
use persistence::{BuildStore, Persistence};
use runtime::{ContainerRuntime, DockerRuntime};

/// Assemble and run the daemon: open the store, reconcile stale builds,
/// then serve the RPC surface until shutdown. Recovery runs strictly before
/// the listener binds.
pub async fn start(args: DaemonArgs) -> Result<(), Error> {
    let persistence = Persistence::new(&args.db_path)
        .await
        .map_err(|err| Error::StoreUnavailable(err.to_string()))?;
    let store: Arc<dyn BuildStore> = Arc::new(persistence);

    let closed = recovery::reconcile(store.as_ref(), recovery::DEFAULT_HORIZON).await?;
    if closed > 0 {
        info!(closed, "recovered stale builds from a previous run");
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(&args.docker_host)
            .map_err(|err| Error::Fatal(format!("cannot reach container engine: {err}")))?,
    );

    let cache = LayerCache::new(
        args.state_dir.join("layers"),
        Duration::from_secs(args.layer_lock_timeout_secs),
        Duration::from_secs(args.layer_cache_ttl_secs),
    );
    let artifacts = ArtifactStore::new(args.state_dir.join("artifacts"));

    let mut scheduler_config = SchedulerConfig::new(args.state_dir.clone());
    scheduler_config.build_timeout = Duration::from_secs(args.build_timeout_secs);
    if let Some(max) = args.max_concurrent_builds {
        scheduler_config.max_concurrent_builds = max;
    }

    spawn_maintenance(
        cache.clone(),
        artifacts.clone(),
        Duration::from_secs(args.artifact_ttl_secs),
    );

    let scheduler = Scheduler::new(store, runtime, cache, artifacts, scheduler_config);
    let router = handlers::make_router(scheduler.clone());

    info!(address = %args.address, "smidr daemon listening");
    axum::Server::try_bind(&args.address)
        .map_err(|err| Error::Fatal(format!("cannot bind {}: {err}", args.address)))?
        .serve(router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| Error::Fatal(format!("server error: {err}")))?;

    // Listener is down; cancel live executors and wait out the grace period.
    scheduler.shutdown().await;
    info!("smidr daemon stopped");

    Ok(())
}

/// Hourly eviction sweeps over the layer cache and artifact store.
fn spawn_maintenance(cache: LayerCache, artifacts: ArtifactStore, artifact_ttl: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Err(err) = cache.evict_idle().await {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "layer cache eviction sweep failed"
                );
            }
            if let Err(err) = artifacts.evict_older_than(artifact_ttl).await {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "artifact retention sweep failed"
                );
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            "failed to listen for shutdown signal"
        );
    }
}
