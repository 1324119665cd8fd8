use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use smidr_common::log::LogStream;

use crate::artifacts::ArtifactStore;
use crate::cache::LayerCache;
use crate::config::BuildConfig;
use crate::persistence::{ArtifactRecord, BuildOutcome, BuildStore};
use crate::runtime::{shell, ContainerConfig, ContainerRuntime, ExecOptions, Mount, OutputLine};

use super::filter;
use super::log_hub::LogHub;
use super::render::{self, RenderPaths};

const CONTAINER_HOME: &str = "/home/builder";
const CONTAINER_LAYERS: &str = "/home/builder/layers";
const CONTAINER_EXTRA_LAYERS: &str = "/home/builder/extra";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(2);
const STDERR_TAIL_LIMIT: usize = 200;
const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/// Everything one build run needs to know; owned by the executor for the
/// build's lifetime.
#[derive(Clone, Debug)]
pub struct BuildContext {
    pub build_id: String,
    pub customer: String,
    pub target: String,
    pub config: BuildConfig,
    pub force_clean: bool,
    pub force_image_rebuild: bool,
    pub build_root: PathBuf,
    pub deploy_dir: PathBuf,
    pub build_timeout: Duration,
}

enum PhaseError {
    Fatal { exit_code: i64, message: String },
    Cancelled,
}

impl PhaseError {
    fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            exit_code: 1,
            message: message.into(),
        }
    }
}

impl From<crate::runtime::RuntimeError> for PhaseError {
    fn from(err: crate::runtime::RuntimeError) -> Self {
        match err {
            crate::runtime::RuntimeError::Cancelled => Self::Cancelled,
            other => Self::fatal(other.to_string()),
        }
    }
}

impl From<crate::cache::CacheError> for PhaseError {
    fn from(err: crate::cache::CacheError) -> Self {
        Self::fatal(err.to_string())
    }
}

impl From<std::io::Error> for PhaseError {
    fn from(err: std::io::Error) -> Self {
        Self::fatal(format!("build I/O error: {err}"))
    }
}

struct PreparedContainer {
    id: String,
    /// In-container build directory, unique per build id.
    build_dir: String,
    /// Whether commands must source the OE init script first.
    needs_init: bool,
}

/// Drives a single build inside one container, from directory preparation
/// through artifact extraction. Never returns an error: every failure mode
/// is folded into the terminal [`BuildOutcome`].
pub struct BuildExecutor {
    store: Arc<dyn BuildStore>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: LayerCache,
    artifacts: ArtifactStore,
    hub: Arc<LogHub>,
    cancel: CancellationToken,
}

impl BuildExecutor {
    pub fn new(
        store: Arc<dyn BuildStore>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: LayerCache,
        artifacts: ArtifactStore,
        hub: Arc<LogHub>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            runtime,
            cache,
            artifacts,
            hub,
            cancel,
        }
    }

    #[instrument(skip_all, fields(build_id = %ctx.build_id, target = %ctx.target))]
    pub async fn run(&self, ctx: &BuildContext) -> BuildOutcome {
        let started = Instant::now();

        let result = self.execute(ctx).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                info!(duration_secs = elapsed.as_secs(), "build completed");
                self.hub
                    .append(LogStream::Stdout, "Build completed successfully");
                BuildOutcome::completed(elapsed)
            }
            Err(PhaseError::Cancelled) => {
                info!("build cancelled");
                self.hub.append(LogStream::Stderr, "Build cancelled");
                BuildOutcome::cancelled(elapsed)
            }
            Err(PhaseError::Fatal { exit_code, message }) => {
                error!(%message, "build failed");
                self.hub
                    .append(LogStream::Stderr, format!("ERROR: {message}"));
                BuildOutcome::failed(exit_code, elapsed, message)
            }
        }
    }

    async fn execute(&self, ctx: &BuildContext) -> Result<(), PhaseError> {
        self.prepare_directories(ctx).await?;
        let extra_layer_dirs = self.acquire_layers(ctx).await?;
        let mut container = self.prepare_container(ctx, &extra_layer_dirs).await?;

        // Teardown must run on success, failure, cancellation and panic.
        let phases = std::panic::AssertUnwindSafe(self.run_in_container(ctx, &mut container))
            .catch_unwind()
            .await;
        self.teardown(&container.id).await;

        match phases {
            Ok(result) => result,
            Err(_) => Err(PhaseError::fatal("build phases panicked")),
        }
    }

    /// Phase 1: per-build directory tree, writable by the in-container user.
    async fn prepare_directories(&self, ctx: &BuildContext) -> Result<(), PhaseError> {
        if ctx.force_clean {
            self.hub
                .append(LogStream::Stdout, "force clean: removing existing build state");
            // The log sinks under the build root are already open; only the
            // BitBake state is removed.
            for dir in ["conf", "tmp", "deploy", "downloads", "sstate"] {
                let path = ctx.build_root.join(dir);
                if path.exists() {
                    tokio::fs::remove_dir_all(&path).await?;
                }
            }
        }

        for dir in [
            ctx.build_root.clone(),
            ctx.build_root.join("conf"),
            ctx.build_root.join("tmp"),
            ctx.deploy_dir.clone(),
            self.downloads_dir(ctx),
            self.sstate_dir(ctx),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).await?;
            }
        }

        Ok(())
    }

    /// Phase 2: ensure every repository-backed layer is cached and every
    /// local layer exists. Returns the deduplicated parent directories of
    /// local layers, for read-only mounting.
    async fn acquire_layers(&self, ctx: &BuildContext) -> Result<Vec<PathBuf>, PhaseError> {
        let outcomes = self.cache.ensure_all(&ctx.config.layers).await;

        let mut failed = Vec::new();
        for outcome in &outcomes {
            match &outcome.result {
                Ok(path) => self.hub.append(
                    LogStream::Stdout,
                    format!("layer {} ready at {}", outcome.name, path.display()),
                ),
                Err(err) => {
                    self.hub.append(
                        LogStream::Stderr,
                        format!("ERROR: layer {} failed: {err}", outcome.name),
                    );
                    failed.push(outcome.name.clone());
                }
            }
        }
        if !failed.is_empty() {
            return Err(PhaseError::fatal(format!(
                "layer fetch failed for: {}",
                failed.join(", ")
            )));
        }

        let mut parents = BTreeSet::new();
        for layer in &ctx.config.layers {
            let Some(path) = &layer.path else { continue };
            let path = expand_home(path);
            if !path.is_dir() {
                return Err(PhaseError::fatal(format!(
                    "local layer {} not found at {}",
                    layer.name,
                    path.display()
                )));
            }
            if let Some(parent) = path.parent() {
                parents.insert(parent.to_path_buf());
            }
        }

        Ok(parents.into_iter().collect())
    }

    /// Phase 3: image pull, container creation, start.
    async fn prepare_container(
        &self,
        ctx: &BuildContext,
        extra_layer_dirs: &[PathBuf],
    ) -> Result<PreparedContainer, PhaseError> {
        let image = ctx.config.container_image();
        self.hub
            .append(LogStream::Stdout, format!("using container image {image}"));
        self.runtime.pull_if_absent(image).await?;

        let build_dir = container_build_dir(&ctx.build_id);

        let mut env = vec![
            ("HOME".to_string(), CONTAINER_HOME.to_string()),
            ("USER".to_string(), "builder".to_string()),
        ];
        for var in PROXY_VARS {
            if let Ok(value) = std::env::var(var) {
                env.push((var.to_string(), value));
            }
        }

        let mut mounts = vec![
            Mount::read_write(ctx.build_root.clone(), build_dir.clone()),
            Mount::read_write(
                self.downloads_dir(ctx),
                format!("{CONTAINER_HOME}/downloads"),
            ),
            Mount::read_write(self.sstate_dir(ctx), format!("{CONTAINER_HOME}/sstate")),
            Mount::read_only(self.cache.root().to_path_buf(), CONTAINER_LAYERS.to_string()),
        ];
        for parent in extra_layer_dirs {
            let slot = parent
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "layers".to_string());
            mounts.push(Mount::read_only(
                parent.clone(),
                format!("{CONTAINER_EXTRA_LAYERS}/{slot}"),
            ));
        }

        let host_cpus = num_cpus::get() as f64;
        let config = ContainerConfig {
            name: format!("smidr-build-{}", ctx.build_id),
            image: image.to_string(),
            env,
            mounts,
            memory_bytes: ctx
                .config
                .resources
                .memory_gb
                .map(|gb| (gb as i64) * 1024 * 1024 * 1024),
            cpus: ctx.config.resources.cpus.map(|cpus| cpus.min(host_cpus)),
            workdir: Some(build_dir.clone()),
        };

        let id = self.runtime.create(&config).await?;
        self.runtime.start(&id).await?;
        self.hub
            .append(LogStream::Stdout, format!("container {} started", config.name));

        Ok(PreparedContainer {
            id,
            build_dir,
            needs_init: true,
        })
    }

    /// Phases 4-9.
    async fn run_in_container(
        &self,
        ctx: &BuildContext,
        container: &mut PreparedContainer,
    ) -> Result<(), PhaseError> {
        self.probe_environment(ctx, container).await?;
        self.materialize_config(ctx, container).await?;

        if ctx.force_image_rebuild {
            self.hub.append(
                LogStream::Stdout,
                format!("force image rebuild: cleaning {}", ctx.target),
            );
            let script = bitbake_script(container, &format!("-c cleanall {}", ctx.target));
            let code = self
                .exec_logged(&container.id, script, ctx.build_timeout, None)
                .await?;
            if code != 0 {
                warn!(exit_code = code, "cleanall failed, continuing");
            }
        }

        // Phase 6: surface network errors before investing in compilation.
        self.hub
            .append(LogStream::Stdout, format!("fetching sources for {}", ctx.target));
        let script = bitbake_script(container, &format!("-c fetch {}", ctx.target));
        let code = self
            .exec_logged(&container.id, script, ctx.build_timeout, None)
            .await?;
        if code != 0 {
            return Err(PhaseError::Fatal {
                exit_code: code,
                message: format!("source fetch for {} failed", ctx.target),
            });
        }

        // Phase 7 with a single targeted retry (phase 8).
        self.hub
            .append(LogStream::Stdout, format!("building {}", ctx.target));
        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let script = bitbake_script(container, &ctx.target);
        let code = self
            .exec_logged(
                &container.id,
                script.clone(),
                ctx.build_timeout,
                Some(stderr_tail.clone()),
            )
            .await?;

        let final_code = if code != 0 {
            let tail = stderr_tail.lock().expect("stderr tail lock poisoned").clone();
            match failed_recipe(&tail) {
                Some(recipe) => {
                    self.recover_recipe(ctx, container, &recipe, &tail).await?;

                    self.hub.append(
                        LogStream::Stdout,
                        format!("retrying build of {} after recovering {recipe}", ctx.target),
                    );
                    self.exec_logged(&container.id, script, ctx.build_timeout, None)
                        .await?
                }
                None => code,
            }
        } else {
            code
        };

        if final_code != 0 {
            return Err(PhaseError::Fatal {
                exit_code: final_code,
                message: format!("bitbake {} failed", ctx.target),
            });
        }

        self.extract_artifacts(ctx).await;

        Ok(())
    }

    /// Phase 4: bitbake discoverability and required layer mounts.
    async fn probe_environment(
        &self,
        ctx: &BuildContext,
        container: &mut PreparedContainer,
    ) -> Result<(), PhaseError> {
        for required in ["poky", "meta-openembedded"] {
            let code = self
                .exec_quiet(
                    &container.id,
                    format!("test -d {CONTAINER_LAYERS}/{required}"),
                )
                .await?;
            if code != 0 {
                return Err(PhaseError::fatal(format!(
                    "required layer {required} is not mounted at {CONTAINER_LAYERS}/{required}; \
                     add it to the configuration's layers"
                )));
            }
        }

        let code = self
            .exec_quiet(&container.id, "which bitbake".to_string())
            .await?;
        container.needs_init = code != 0;

        if container.needs_init {
            let code = self
                .exec_quiet(
                    &container.id,
                    format!("test -f {CONTAINER_LAYERS}/poky/{OE_INIT_SCRIPT}"),
                )
                .await?;
            if code != 0 {
                return Err(PhaseError::fatal(format!(
                    "bitbake is not on PATH and {CONTAINER_LAYERS}/poky/{OE_INIT_SCRIPT} is missing"
                )));
            }
        }

        Ok(())
    }

    /// Phase 5: render local.conf and bblayers.conf into the build root,
    /// which the container sees through its bind mount.
    async fn materialize_config(
        &self,
        ctx: &BuildContext,
        container: &PreparedContainer,
    ) -> Result<(), PhaseError> {
        let layer_dirs = self.discover_layer_dirs(ctx).await?;
        if layer_dirs.is_empty() {
            return Err(PhaseError::fatal(format!(
                "no layers compatible with series {} were found",
                ctx.config.yocto_series
            )));
        }

        let paths = RenderPaths {
            build_dir: container.build_dir.clone(),
            downloads_dir: format!("{CONTAINER_HOME}/downloads"),
            sstate_dir: format!("{CONTAINER_HOME}/sstate"),
        };
        let local = render::local_conf(&ctx.config, &paths, num_cpus::get() as u32);
        let bblayers = render::bblayers_conf(&layer_dirs);

        let conf_dir = ctx.build_root.join("conf");
        tokio::fs::write(conf_dir.join("local.conf"), local).await?;
        tokio::fs::write(conf_dir.join("bblayers.conf"), bblayers).await?;

        self.hub.append(
            LogStream::Stdout,
            format!("configured {} bitbake layers", layer_dirs.len()),
        );

        Ok(())
    }

    /// Scan mounted layer trees for `conf/layer.conf` files compatible with
    /// the configured series, returning container-side directories.
    async fn discover_layer_dirs(&self, ctx: &BuildContext) -> Result<Vec<String>, PhaseError> {
        let series = ctx.config.yocto_series.clone();
        let cache_root = self.cache.root().to_path_buf();

        let mut roots = vec![(cache_root, CONTAINER_LAYERS.to_string())];
        for layer in &ctx.config.layers {
            let Some(path) = &layer.path else { continue };
            let path = expand_home(path);
            if let Some(parent) = path.parent() {
                let slot = parent
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "layers".to_string());
                roots.push((parent.to_path_buf(), format!("{CONTAINER_EXTRA_LAYERS}/{slot}")));
            }
        }
        roots.dedup();

        let dirs = tokio::task::spawn_blocking(move || {
            let mut dirs = Vec::new();
            for (host_root, container_root) in roots {
                for entry in walkdir::WalkDir::new(&host_root)
                    .max_depth(4)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if entry.file_name() != "layer.conf"
                        || entry.path().parent().and_then(Path::file_name)
                            != Some(std::ffi::OsStr::new("conf"))
                    {
                        continue;
                    }
                    let Some(layer_dir) = entry.path().parent().and_then(Path::parent) else {
                        continue;
                    };
                    let Ok(contents) = std::fs::read_to_string(entry.path()) else {
                        continue;
                    };
                    if !render::series_compatible(&contents, &series) {
                        debug!(layer = %layer_dir.display(), "skipping series-incompatible layer");
                        continue;
                    }
                    let Ok(relative) = layer_dir.strip_prefix(&host_root) else {
                        continue;
                    };
                    dirs.push(format!("{container_root}/{}", relative.display()));
                }
            }
            dirs.sort();
            dirs.dedup();
            dirs
        })
        .await
        .map_err(|err| PhaseError::fatal(format!("layer scan panicked: {err}")))?;

        Ok(dirs)
    }

    /// Phase 8: cleanup for the failed recipe before the single retry.
    async fn recover_recipe(
        &self,
        ctx: &BuildContext,
        container: &PreparedContainer,
        recipe: &str,
        stderr_tail: &[String],
    ) -> Result<(), PhaseError> {
        self.hub.append(
            LogStream::Stdout,
            format!("attempting recovery for failed recipe {recipe}"),
        );

        if has_pseudo_mismatch(stderr_tail) {
            let workdirs = format!("{}/tmp/work/*/{recipe}/*", container.build_dir);
            let script = format!(
                "rm -rf {workdirs}/packages-split {workdirs}/sstate-build-package* {workdirs}/pseudo"
            );
            let code = self.exec_quiet(&container.id, script).await?;
            if code != 0 {
                warn!(recipe, "pseudo workdir cleanup failed, continuing");
            }
        }

        let script = bitbake_script(container, &format!("-c cleansstate {recipe}"));
        let code = self
            .exec_logged(&container.id, script, ctx.build_timeout, None)
            .await?;
        if code != 0 {
            warn!(recipe, exit_code = code, "cleansstate failed, continuing");
        }

        Ok(())
    }

    /// Phase 9: non-fatal to the build result.
    async fn extract_artifacts(&self, ctx: &BuildContext) {
        match self
            .artifacts
            .ingest(&ctx.customer, &ctx.build_id, &ctx.target, &ctx.deploy_dir)
            .await
        {
            Ok(ingested) => {
                for artifact in ingested {
                    let record = ArtifactRecord {
                        build_id: ctx.build_id.clone(),
                        path: artifact.path,
                        kind: artifact.kind.into(),
                        size: artifact.size,
                        checksum: artifact.checksum,
                        created_at: Utc::now(),
                    };
                    if let Err(err) = self.store.add_artifact(&record).await {
                        warn!(
                            error = &err as &dyn std::error::Error,
                            path = %record.path,
                            "failed to record artifact"
                        );
                    }
                }
            }
            Err(err) => {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "artifact extraction failed; build remains successful"
                );
                self.hub.append(
                    LogStream::Stderr,
                    format!("WARNING: artifact extraction failed: {err}"),
                );
            }
        }
    }

    /// Phase 10: stop then force-remove, on every exit path.
    async fn teardown(&self, container_id: &str) {
        if let Err(err) = self.runtime.stop(container_id, STOP_GRACE).await {
            warn!(
                error = &err as &dyn std::error::Error,
                "failed to stop build container"
            );
        }
        if let Err(err) = self.runtime.remove(container_id).await {
            warn!(
                error = &err as &dyn std::error::Error,
                "failed to remove build container"
            );
        }
    }

    /// Exec with output streamed through the log hub; optionally collects a
    /// bounded stderr tail for failure-pattern matching.
    async fn exec_logged(
        &self,
        container_id: &str,
        script: String,
        timeout: Duration,
        stderr_tail: Option<Arc<Mutex<Vec<String>>>>,
    ) -> Result<i64, PhaseError> {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);

        let hub = self.hub.clone();
        let pump = tokio::spawn(async move {
            while let Some(OutputLine { stream, line }) = rx.recv().await {
                if let Some(progress) = filter::parse_progress(&line) {
                    debug!(
                        current = progress.current,
                        total = progress.total,
                        task = progress.task.as_deref().unwrap_or(""),
                        "build progress"
                    );
                }
                if let Some(tail) = &stderr_tail {
                    if stream == LogStream::Stderr || line.contains("ERROR") {
                        let mut tail = tail.lock().expect("stderr tail lock poisoned");
                        if tail.len() == STDERR_TAIL_LIMIT {
                            tail.remove(0);
                        }
                        tail.push(line.clone());
                    }
                }
                hub.append_container(stream, line);
            }
        });

        let options = ExecOptions {
            env: Vec::new(),
            workdir: None,
            timeout,
            cancel: self.cancel.clone(),
        };
        let result = self
            .runtime
            .exec(container_id, &shell(script), &options, tx)
            .await;
        let _ = pump.await;

        Ok(result?)
    }

    /// Exec whose output nobody needs.
    async fn exec_quiet(&self, container_id: &str, script: String) -> Result<i64, PhaseError> {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(64);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let options = ExecOptions {
            env: Vec::new(),
            workdir: None,
            timeout: PROBE_TIMEOUT,
            cancel: self.cancel.clone(),
        };
        let result = self
            .runtime
            .exec(container_id, &shell(script), &options, tx)
            .await;
        let _ = drain.await;

        Ok(result?)
    }

    fn downloads_dir(&self, ctx: &BuildContext) -> PathBuf {
        ctx.config
            .build
            .downloads_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| ctx.build_root.join("downloads"))
    }

    fn sstate_dir(&self, ctx: &BuildContext) -> PathBuf {
        ctx.config
            .build
            .sstate_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| ctx.build_root.join("sstate"))
    }
}

const OE_INIT_SCRIPT: &str = "oe-init-build-env";

/// Per-build in-container path, derived from the id's random suffix.
fn container_build_dir(build_id: &str) -> String {
    let suffix = build_id.rsplit('-').next().unwrap_or(build_id);
    format!("{CONTAINER_HOME}/build-{suffix}")
}

fn bitbake_script(container: &PreparedContainer, args: &str) -> String {
    if container.needs_init {
        format!(
            "source {CONTAINER_LAYERS}/poky/{OE_INIT_SCRIPT} {} >/dev/null && bitbake {args}",
            container.build_dir
        )
    } else {
        format!("cd {} && bitbake {args}", container.build_dir)
    }
}

/// Expand a leading `~` and make relative paths absolute against the
/// current directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    }

    let path = PathBuf::from(path);
    if path.is_relative() {
        std::env::current_dir().map(|cwd| cwd.join(&path)).unwrap_or(path)
    } else {
        path
    }
}

static TASK_FAILED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Task \(([^)]+\.bb):do_[a-z0-9_]+\) failed").expect("task pattern is valid")
});

/// Recipe base name from a `Task (...:do_xxx) failed` line, if any.
fn failed_recipe(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        let captures = TASK_FAILED_RE.captures(line)?;
        let path = Path::new(captures.get(1)?.as_str());
        let stem = path.file_stem()?.to_str()?;

        // Recipes are named <name>_<version>.bb; names never contain '_'.
        Some(stem.split('_').next().unwrap_or(stem).to_string())
    })
}

fn has_pseudo_mismatch(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|line| line.contains("pseudo") && line.contains("mismatch"))
}
