use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::CacheError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Contents of a lock file, for diagnosing a stuck holder.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Filesystem lock with exclusive-create semantics, shared across threads
/// and processes using the same cache directory. Released on drop.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    /// Poll for the lock until `timeout` elapses.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, CacheError> {
        let deadline = Instant::now() + timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        hostname: gethostname::gethostname().to_string_lossy().into_owned(),
                        acquired_at: Utc::now(),
                    };
                    let _ = file.write_all(
                        serde_json::to_string(&info).unwrap_or_default().as_bytes(),
                    );

                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(CacheError::LockTimeout {
                            path: path.to_path_buf(),
                            held_by: read_holder(path),
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_holder(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let info: LockInfo = serde_json::from_str(&raw).ok()?;

    Some(format!(
        "pid {} on {} since {}",
        info.pid, info.hostname, info.acquired_at
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("poky.lock");

        let lock = CacheLock::acquire(&lock_path, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(lock_path.exists());

        drop(lock);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn held_lock_times_out_with_holder_info() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("poky.lock");

        let _held = CacheLock::acquire(&lock_path, Duration::from_secs(1))
            .await
            .unwrap();

        let err = CacheLock::acquire(&lock_path, Duration::from_millis(300))
            .await
            .unwrap_err();
        match err {
            CacheError::LockTimeout { held_by, .. } => {
                let holder = held_by.expect("holder info should be readable");
                assert!(holder.contains(&std::process::id().to_string()));
            }
            other => panic!("expected lock timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn released_lock_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("meta-oe.lock");

        let first = CacheLock::acquire(&lock_path, Duration::from_secs(1))
            .await
            .unwrap();
        drop(first);

        CacheLock::acquire(&lock_path, Duration::from_millis(300))
            .await
            .unwrap();
    }
}
