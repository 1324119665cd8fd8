pub mod lock;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::LayerSpec;

pub use lock::CacheLock;

/// Hosts whose git servers misbehave under `--depth 1`.
const SHALLOW_DENYLIST: &[&str] = &["git.code.sf.net", "sourceforge.net"];

const META_SUFFIX: &str = ".smidr_meta.json";
const DEFAULT_BRANCH: &str = "master";
const EVICTION_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git {context} failed: {stderr}")]
    Git { context: String, stderr: String },
    #[error("timed out waiting for lock {}, held by {}", path.display(), held_by.as_deref().unwrap_or("unknown"))]
    LockTimeout {
        path: PathBuf,
        held_by: Option<String>,
    },
    #[error("branch {branch} not found in {url}, nor any {branch}-* fallback")]
    BranchNotFound { url: String, branch: String },
    #[error("layer {0} has no repository url")]
    NoUrl(String),
}

/// Sidecar tracking when a cached repository was last used.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMeta {
    /// Unix seconds.
    pub last_access: i64,
}

/// Per-layer result of `ensure_all`; failures are collected, not
/// short-circuited.
#[derive(Debug)]
pub struct LayerOutcome {
    pub name: String,
    pub url: String,
    pub result: Result<PathBuf, CacheError>,
}

/// Content-addressed on-disk cache of git-cloned layers, keyed by
/// repository URL. Per-URL mutual exclusion is a filesystem lock, so
/// processes sharing the cache directory exclude each other too.
#[derive(Clone)]
pub struct LayerCache {
    root: PathBuf,
    lock_timeout: Duration,
    ttl: Duration,
}

impl LayerCache {
    pub fn new(root: PathBuf, lock_timeout: Duration, ttl: Duration) -> Self {
        Self {
            root,
            lock_timeout,
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fan out one worker per unique repository URL. Success is per-layer;
    /// the overall call never fails early.
    pub async fn ensure_all(&self, layers: &[LayerSpec]) -> Vec<LayerOutcome> {
        let mut unique: BTreeMap<String, (String, String)> = BTreeMap::new();
        for layer in layers {
            let Some(url) = &layer.url else { continue };
            let branch = layer
                .branch
                .clone()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
            unique
                .entry(url.clone())
                .or_insert_with(|| (layer.name.clone(), branch));
        }

        let mut workers = JoinSet::new();
        for (url, (name, branch)) in unique {
            let cache = self.clone();
            workers.spawn(async move {
                let result = cache.ensure(&url, &branch).await;
                LayerOutcome { name, url, result }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(
                    error = &err as &dyn std::error::Error,
                    "layer fetch worker panicked"
                ),
            }
        }
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));

        outcomes
    }

    /// Clone or refresh one repository, holding its lock across the whole
    /// git window.
    #[instrument(skip(self))]
    pub async fn ensure(&self, url: &str, branch: &str) -> Result<PathBuf, CacheError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let name = repo_name(url);
        let path = self.root.join(&name);
        let _lock = CacheLock::acquire(
            &self.root.join(format!("{name}.lock")),
            self.lock_timeout,
        )
        .await?;

        if path.join(".git").exists() {
            self.refresh(&path, branch).await?;
        } else {
            self.clone_repo(url, branch, &path).await?;
        }

        self.touch(&name).await?;

        Ok(path)
    }

    async fn refresh(&self, path: &Path, branch: &str) -> Result<(), CacheError> {
        debug!(path = %path.display(), "refreshing cached repository");
        git(&["fetch", "origin"], Some(path)).await?;
        git(&["pull", "--ff-only", "origin", branch], Some(path)).await?;

        Ok(())
    }

    async fn clone_repo(&self, url: &str, branch: &str, path: &Path) -> Result<(), CacheError> {
        let resolved = resolve_branch(url, branch).await?;
        info!(%url, branch = %resolved, "cloning layer repository");

        let path_arg = path.display().to_string();
        let mut args = vec!["clone", "--branch", resolved.as_str()];
        if !SHALLOW_DENYLIST.iter().any(|host| url.contains(host)) {
            args.extend_from_slice(&["--depth", "1"]);
        }
        args.push(url);
        args.push(path_arg.as_str());

        git(&args, None).await?;

        Ok(())
    }

    /// Refresh the repository's last-access stamp.
    pub async fn touch(&self, name: &str) -> Result<(), CacheError> {
        let meta = CacheMeta {
            last_access: Utc::now().timestamp(),
        };
        let raw = serde_json::to_string(&meta).unwrap_or_default();
        tokio::fs::write(self.meta_path(name), raw).await?;

        Ok(())
    }

    /// Delete cached repositories idle past the TTL. Entries without a meta
    /// sidecar are left alone.
    pub async fn evict_idle(&self) -> Result<Vec<PathBuf>, CacheError> {
        let now = Utc::now().timestamp();
        let mut removed = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            let Some(meta) = self.read_meta(&name).await else {
                continue;
            };
            if now - meta.last_access <= self.ttl.as_secs() as i64 {
                continue;
            }

            let lock_path = self.root.join(format!("{name}.lock"));
            let lock = match CacheLock::acquire(&lock_path, EVICTION_LOCK_TIMEOUT).await {
                Ok(lock) => lock,
                Err(CacheError::LockTimeout { .. }) => {
                    debug!(%name, "skipping eviction of locked repository");
                    continue;
                }
                Err(err) => return Err(err),
            };

            info!(%name, idle_secs = now - meta.last_access, "evicting idle layer repository");
            tokio::fs::remove_dir_all(entry.path()).await?;
            tokio::fs::remove_file(self.meta_path(&name)).await?;
            drop(lock);

            removed.push(entry.path());
        }

        Ok(removed)
    }

    async fn read_meta(&self, name: &str) -> Option<CacheMeta> {
        let raw = tokio::fs::read_to_string(self.meta_path(name)).await.ok()?;

        serde_json::from_str(&raw).ok()
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}{META_SUFFIX}"))
    }
}

/// Directory name a repository URL caches under.
pub fn repo_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}

/// Exact branch when the remote has it, otherwise the first remote branch
/// named `<branch>-*`.
async fn resolve_branch(url: &str, branch: &str) -> Result<String, CacheError> {
    let listing = git(&["ls-remote", "--heads", url], None).await?;

    let mut heads = listing.lines().filter_map(|line| {
        line.split('\t')
            .nth(1)
            .and_then(|r| r.strip_prefix("refs/heads/"))
    });

    if heads.clone().any(|head| head == branch) {
        return Ok(branch.to_string());
    }

    let prefix = format!("{branch}-");
    heads
        .find(|head| head.starts_with(&prefix))
        .map(str::to_string)
        .ok_or_else(|| CacheError::BranchNotFound {
            url: url.to_string(),
            branch: branch.to_string(),
        })
}

async fn git(args: &[&str], cwd: Option<&Path>) -> Result<String, CacheError> {
    let mut command = Command::new("git");
    command.args(args).stdin(Stdio::null());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = command.output().await?;
    if !output.status.success() {
        return Err(CacheError::Git {
            context: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn cache(root: &Path) -> LayerCache {
        LayerCache::new(
            root.to_path_buf(),
            Duration::from_secs(1),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn repo_names_from_urls() {
        assert_eq!(repo_name("https://git.yoctoproject.org/poky"), "poky");
        assert_eq!(repo_name("https://git.yoctoproject.org/poky/"), "poky");
        assert_eq!(
            repo_name("https://github.com/openembedded/meta-openembedded.git"),
            "meta-openembedded"
        );
    }

    #[tokio::test]
    async fn touch_writes_readable_meta() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        tokio::fs::create_dir_all(dir.path()).await.unwrap();

        cache.touch("poky").await.unwrap();

        let meta = cache.read_meta("poky").await.unwrap();
        assert!((Utc::now().timestamp() - meta.last_access).abs() < 5);
        assert!(dir.path().join("poky.smidr_meta.json").exists());
    }

    #[tokio::test]
    async fn eviction_removes_only_stale_entries_with_meta() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        // Stale entry.
        tokio::fs::create_dir_all(dir.path().join("poky")).await.unwrap();
        tokio::fs::write(
            dir.path().join(format!("poky{META_SUFFIX}")),
            serde_json::to_string(&CacheMeta {
                last_access: Utc::now().timestamp() - 7200,
            })
            .unwrap(),
        )
        .await
        .unwrap();

        // Fresh entry.
        tokio::fs::create_dir_all(dir.path().join("meta-oe")).await.unwrap();
        cache.touch("meta-oe").await.unwrap();

        // No meta sidecar: conservative, left alone.
        tokio::fs::create_dir_all(dir.path().join("mystery")).await.unwrap();

        let removed = cache.evict_idle().await.unwrap();
        assert_eq!(removed, vec![dir.path().join("poky")]);
        assert!(!dir.path().join("poky").exists());
        assert!(dir.path().join("meta-oe").exists());
        assert!(dir.path().join("mystery").exists());
    }

    #[tokio::test]
    async fn eviction_skips_locked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        tokio::fs::create_dir_all(dir.path().join("poky")).await.unwrap();
        tokio::fs::write(
            dir.path().join(format!("poky{META_SUFFIX}")),
            serde_json::to_string(&CacheMeta {
                last_access: Utc::now().timestamp() - 7200,
            })
            .unwrap(),
        )
        .await
        .unwrap();

        let _held = CacheLock::acquire(&dir.path().join("poky.lock"), Duration::from_secs(1))
            .await
            .unwrap();

        let removed = cache.evict_idle().await.unwrap();
        assert!(removed.is_empty());
        assert!(dir.path().join("poky").exists());
    }

    #[tokio::test]
    async fn ensure_all_skips_local_layers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        let outcomes = cache
            .ensure_all(&[LayerSpec {
                name: "meta-local".to_string(),
                url: None,
                branch: None,
                path: Some("/opt/layers/meta-local".to_string()),
            }])
            .await;

        assert!(outcomes.is_empty());
    }
}
