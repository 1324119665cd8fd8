pub mod executor;
pub mod filter;
pub mod log_hub;
pub mod render;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use smidr_common::build::CancelResponse;
use smidr_common::log::{LogItem, LogStream};

use crate::artifacts::ArtifactStore;
use crate::cache::LayerCache;
use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::persistence::{
    ArtifactRecord, Build, BuildFilter, BuildOutcome, BuildStatus, BuildStore,
};
use crate::runtime::ContainerRuntime;

use executor::{BuildContext, BuildExecutor};
use log_hub::LogHub;

pub const PLAIN_LOG_FILE: &str = "build-log.txt";
pub const JSON_LOG_FILE: &str = "build-log.jsonl";

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub state_dir: PathBuf,
    /// Global cap on concurrently running builds.
    pub max_concurrent_builds: usize,
    pub build_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl SchedulerConfig {
    pub fn new(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            max_concurrent_builds: num_cpus::get(),
            build_timeout: Duration::from_secs(24 * 3600),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub customer: String,
    pub target: Option<String>,
    pub config_yaml: String,
    pub force_clean: bool,
    pub force_image_rebuild: bool,
    pub submitter_host: String,
    pub submitter_user: String,
}

/// A log stream handed to one follower.
pub enum LogSubscription {
    /// Build is live: buffered entries plus a channel of subsequent ones.
    Live {
        snapshot: Vec<LogItem>,
        receiver: mpsc::Receiver<LogItem>,
        subscriber: log_hub::SubscriberId,
        hub: Arc<LogHub>,
    },
    /// Build is finished: everything it ever logged, from disk.
    Replay { entries: Vec<LogItem> },
}

struct LiveBuild {
    hub: Arc<LogHub>,
    cancel: CancellationToken,
}

struct SchedulerInner {
    store: Arc<dyn BuildStore>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: LayerCache,
    artifacts: ArtifactStore,
    config: SchedulerConfig,
    global_slots: Arc<Semaphore>,
    /// Tenant key -> binary token serializing that tenant's builds. Entries
    /// are created lazily and live for the daemon's lifetime.
    tenants: Mutex<HashMap<String, Arc<Semaphore>>>,
    live: Mutex<HashMap<String, LiveBuild>>,
    shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

/// Central coordinator: admission, per-build lifecycle, and the read path
/// binding persistence, logging and the executor together.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn BuildStore>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: LayerCache,
        artifacts: ArtifactStore,
        config: SchedulerConfig,
    ) -> Self {
        let max = config.max_concurrent_builds.max(1);

        Self {
            inner: Arc::new(SchedulerInner {
                store,
                runtime,
                cache,
                artifacts,
                config,
                global_slots: Arc::new(Semaphore::new(max)),
                tenants: Mutex::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: tokio::sync::Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Synchronous admission: the build row is durably `Queued` and its log
    /// hub exists before this returns. Execution is deferred to a worker.
    #[instrument(skip_all, fields(customer = %request.customer))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Build> {
        let config = BuildConfig::from_yaml(&request.config_yaml)?;
        let target = config.resolve_target(request.target.as_deref())?;

        let build_id = new_build_id(&request.customer);
        let build_root = self
            .inner
            .config
            .state_dir
            .join("builds")
            .join(&build_id);
        let deploy_dir = build_root.join("deploy");
        let log_path = build_root.join(PLAIN_LOG_FILE);
        let json_log_path = build_root.join(JSON_LOG_FILE);

        tokio::fs::create_dir_all(&build_root)
            .await
            .map_err(|err| Error::Fatal(format!("cannot create build root: {err}")))?;
        let hub = Arc::new(
            LogHub::new(&log_path, &json_log_path)
                .map_err(|err| Error::Fatal(format!("cannot create build logs: {err}")))?,
        );

        let build = Build {
            id: build_id.clone(),
            customer: request.customer.clone(),
            project: config.project_name().to_string(),
            target: target.clone(),
            machine: config.machine.clone(),
            config_snapshot: request.config_yaml.clone(),
            submitter_host: request.submitter_host.clone(),
            submitter_user: request.submitter_user.clone(),
            build_root: build_root.display().to_string(),
            deploy_dir: deploy_dir.display().to_string(),
            log_path: log_path.display().to_string(),
            json_log_path: json_log_path.display().to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: BuildStatus::Queued,
            exit_code: None,
            duration_secs: None,
            error_message: None,
            deleted: false,
        };
        self.inner.store.create(&build).await?;

        let cancel = self.inner.shutdown.child_token();
        self.inner
            .live
            .lock()
            .expect("live builds lock poisoned")
            .insert(
                build_id.clone(),
                LiveBuild {
                    hub: hub.clone(),
                    cancel: cancel.clone(),
                },
            );

        let ctx = BuildContext {
            build_id: build_id.clone(),
            customer: request.customer,
            target,
            config,
            force_clean: request.force_clean,
            force_image_rebuild: request.force_image_rebuild,
            build_root,
            deploy_dir,
            build_timeout: self.inner.config.build_timeout,
        };

        let inner = self.inner.clone();
        self.inner
            .tasks
            .lock()
            .await
            .spawn(async move { run_build(inner, ctx, hub, cancel).await });

        info!(%build_id, "build submitted");

        Ok(build)
    }

    pub async fn get(&self, id: &str) -> Result<Build> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn list(&self, filter: &BuildFilter) -> Result<Vec<Build>> {
        Ok(self.inner.store.list(filter).await?)
    }

    /// Artifacts are only listed once a build completed successfully.
    pub async fn artifacts(&self, id: &str) -> Result<Vec<ArtifactRecord>> {
        let build = self.inner.store.get(id).await?;
        if build.status != BuildStatus::Completed {
            return Err(Error::IllegalTransition(format!(
                "artifacts for {id} are unavailable while the build is {}",
                build.status
            )));
        }

        Ok(self.inner.store.artifacts(id).await?)
    }

    /// Attach a log follower: a live hub when the build is running, a replay
    /// of the structured log file once it is finished.
    pub async fn subscribe(&self, id: &str) -> Result<LogSubscription> {
        let live = {
            let live = self.inner.live.lock().expect("live builds lock poisoned");
            live.get(id).map(|entry| entry.hub.clone())
        };

        if let Some(hub) = live {
            let (snapshot, subscriber, receiver) = hub.subscribe();
            return Ok(LogSubscription::Live {
                snapshot,
                receiver,
                subscriber,
                hub,
            });
        }

        let build = self.inner.store.get(id).await?;
        let entries = match tokio::fs::read_to_string(&build.json_log_path).await {
            Ok(raw) => raw
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(Error::Fatal(format!("cannot read build log: {err}"))),
        };

        Ok(LogSubscription::Replay { entries })
    }

    /// Cancel a live build. Finished builds report `NotCancellable` rather
    /// than erroring.
    pub async fn cancel(&self, id: &str) -> Result<CancelResponse> {
        let cancelled = {
            let live = self.inner.live.lock().expect("live builds lock poisoned");
            live.get(id).map(|entry| entry.cancel.cancel()).is_some()
        };

        if cancelled {
            info!(build_id = %id, "cancelling build");
            return Ok(CancelResponse {
                success: true,
                message: "cancellation requested".to_string(),
            });
        }

        let build = self.inner.store.get(id).await?;
        Ok(CancelResponse {
            success: false,
            message: format!("build is {} and not cancellable", build.status),
        })
    }

    /// Cancel all live executors and wait up to the configured grace period.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down, cancelling live builds");
        self.inner.shutdown.cancel();

        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        let mut tasks = self.inner.tasks.lock().await;
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(stragglers = tasks.len(), "shutdown grace expired, aborting executors");
                tasks.abort_all();
                break;
            }
            if tokio::time::timeout(remaining, tasks.join_next())
                .await
                .is_err()
            {
                continue;
            }
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.inner.live.lock().unwrap().len()
    }
}

impl SchedulerInner {
    fn tenant_slot(&self, customer: &str) -> Arc<Semaphore> {
        let mut tenants = self.tenants.lock().expect("tenant map lock poisoned");
        tenants
            .entry(customer.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    fn forget(&self, build_id: &str) {
        self.live
            .lock()
            .expect("live builds lock poisoned")
            .remove(build_id);
    }
}

/// One build's worker: admission, persistence transitions, execution.
/// Tokens are released on every exit path by permit drop.
async fn run_build(
    inner: Arc<SchedulerInner>,
    ctx: BuildContext,
    hub: Arc<LogHub>,
    cancel: CancellationToken,
) {
    let queued_at = Instant::now();
    hub.append(
        LogStream::Stdout,
        format!("build {} queued, waiting for build slot", ctx.build_id),
    );

    // Tenant token first, then the global slot; both are held until this
    // function returns.
    let Some(_tenant_permit) = acquire(&cancel, inner.tenant_slot(&ctx.customer)).await else {
        finish(&inner, &ctx.build_id, &hub, BuildOutcome::cancelled(queued_at.elapsed())).await;
        return;
    };
    let Some(_global_permit) = acquire(&cancel, inner.global_slots.clone()).await else {
        finish(&inner, &ctx.build_id, &hub, BuildOutcome::cancelled(queued_at.elapsed())).await;
        return;
    };

    // The Running transition is durable before any container side-effect.
    if let Err(err) = inner.store.start(&ctx.build_id).await {
        error!(
            error = &err as &dyn std::error::Error,
            build_id = %ctx.build_id,
            "failed to persist build start"
        );
        finish(
            &inner,
            &ctx.build_id,
            &hub,
            BuildOutcome::failed(1, queued_at.elapsed(), format!("cannot start build: {err}")),
        )
        .await;
        return;
    }

    let executor = BuildExecutor::new(
        inner.store.clone(),
        inner.runtime.clone(),
        inner.cache.clone(),
        inner.artifacts.clone(),
        hub.clone(),
        cancel,
    );
    let outcome = executor.run(&ctx).await;

    finish(&inner, &ctx.build_id, &hub, outcome).await;
}

/// Persist the terminal transition, then release the hub and registry entry.
async fn finish(inner: &SchedulerInner, build_id: &str, hub: &LogHub, outcome: BuildOutcome) {
    if let Err(err) = inner.store.complete(build_id, &outcome).await {
        // In-memory state stays authoritative for connected clients; the
        // next startup's recovery pass finalizes the row.
        error!(
            error = &err as &dyn std::error::Error,
            build_id = %build_id,
            "failed to persist terminal status"
        );
    }

    hub.close();
    inner.forget(build_id);
}

async fn acquire(
    cancel: &CancellationToken,
    semaphore: Arc<Semaphore>,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    }
}

fn new_build_id(customer: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{customer}-{}", &suffix[..8])
}
