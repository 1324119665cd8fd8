use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use smidr_common::build::ArtifactKind;

pub const METADATA_FILE: &str = "build-metadata.json";

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("artifact I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("deploy directory {0} does not exist")]
    MissingDeployDir(PathBuf),
}

/// Summary written beside the extracted deploy tree.
#[derive(Debug, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub build_id: String,
    pub customer: String,
    pub target: String,
    pub extracted_at: DateTime<Utc>,
    pub artifact_count: usize,
}

/// One file copied out of the deploy tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestedArtifact {
    /// Path relative to the deploy root.
    pub path: String,
    pub kind: ArtifactKind,
    pub size: i64,
    /// Empty for symlinks.
    pub checksum: String,
}

/// Filesystem-backed collection of per-build deploy trees. Builds have
/// unique roots, so there is no cross-build contention.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn build_dir(&self, customer: &str, build_id: &str) -> PathBuf {
        self.root.join(customer).join(build_id)
    }

    /// Copy the deploy tree verbatim into the store, preserving symlinks
    /// (recorded with size 0 and no checksum), and write the metadata file.
    #[instrument(skip(self, deploy_dir), fields(deploy_dir = %deploy_dir.display()))]
    pub async fn ingest(
        &self,
        customer: &str,
        build_id: &str,
        target: &str,
        deploy_dir: &Path,
    ) -> Result<Vec<IngestedArtifact>, ArtifactError> {
        if !deploy_dir.is_dir() {
            return Err(ArtifactError::MissingDeployDir(deploy_dir.to_path_buf()));
        }

        let dest = self.build_dir(customer, build_id);
        let source = deploy_dir.to_path_buf();
        let metadata = BuildMetadata {
            build_id: build_id.to_string(),
            customer: customer.to_string(),
            target: target.to_string(),
            extracted_at: Utc::now(),
            artifact_count: 0,
        };

        let artifacts = tokio::task::spawn_blocking(move || {
            let mut artifacts = copy_tree(&source, &dest)?;
            artifacts.sort_by(|a, b| a.path.cmp(&b.path));

            let metadata = BuildMetadata {
                artifact_count: artifacts.len(),
                ..metadata
            };
            std::fs::write(
                dest.join(METADATA_FILE),
                serde_json::to_vec_pretty(&metadata).unwrap_or_default(),
            )?;

            Ok::<_, ArtifactError>(artifacts)
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;

        info!(count = artifacts.len(), "extracted build artifacts");

        Ok(artifacts)
    }

    /// Retention sweep: remove per-build artifact directories whose metadata
    /// is older than `ttl`. Directories without readable metadata are left
    /// alone.
    pub async fn evict_older_than(&self, ttl: Duration) -> Result<Vec<PathBuf>, ArtifactError> {
        let root = self.root.clone();

        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = Vec::new();
            let cutoff = Utc::now() - chrono::Duration::seconds(ttl.as_secs() as i64);

            let customers = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(removed),
                Err(err) => return Err(ArtifactError::Io(err)),
            };

            for customer in customers.flatten() {
                if !customer.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                for build in std::fs::read_dir(customer.path())?.flatten() {
                    let metadata_path = build.path().join(METADATA_FILE);
                    let Ok(raw) = std::fs::read_to_string(&metadata_path) else {
                        continue;
                    };
                    let Ok(metadata) = serde_json::from_str::<BuildMetadata>(&raw) else {
                        continue;
                    };

                    if metadata.extracted_at < cutoff {
                        std::fs::remove_dir_all(build.path())?;
                        removed.push(build.path());
                    }
                }
            }

            Ok(removed)
        })
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;

        if !removed.is_empty() {
            info!(count = removed.len(), "evicted expired artifact trees");
        }

        Ok(removed)
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<Vec<IngestedArtifact>, ArtifactError> {
    let mut artifacts = Vec::new();

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "skipping unreadable deploy entry"
                );
                continue;
            }
        };

        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walked path is under its root");
        if relative.as_os_str().is_empty() {
            std::fs::create_dir_all(dest)?;
            continue;
        }
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.exists() || target.is_symlink() {
                std::fs::remove_file(&target)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;

            artifacts.push(IngestedArtifact {
                path: relative.to_string_lossy().into_owned(),
                kind: classify(relative),
                size: 0,
                checksum: String::new(),
            });
        } else {
            std::fs::copy(entry.path(), &target)?;

            artifacts.push(IngestedArtifact {
                path: relative.to_string_lossy().into_owned(),
                kind: classify(relative),
                size: entry.metadata().map(|m| m.len() as i64).unwrap_or_default(),
                checksum: sha256_file(entry.path())?,
            });
        }
    }

    Ok(artifacts)
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;

    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Artifact type from the file name alone; pure.
pub fn classify(path: &Path) -> ArtifactKind {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    const IMAGE: &[&str] = &[
        ".wic", ".wic.gz", ".wic.bz2", ".wic.xz", ".ext4", ".ext3", ".img", ".iso", ".cpio",
        ".squashfs", ".ubi", ".vmdk", ".rootfs",
    ];
    const ARCHIVE: &[&str] = &[".tar", ".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".zip"];
    const TEXT: &[&str] = &[".txt", ".log", ".manifest"];
    const METADATA: &[&str] = &[".json", ".env", ".testdata"];

    if IMAGE.iter().any(|ext| name.ends_with(ext)) {
        ArtifactKind::Image
    } else if ARCHIVE.iter().any(|ext| name.ends_with(ext)) {
        ArtifactKind::Archive
    } else if TEXT.iter().any(|ext| name.ends_with(ext)) {
        ArtifactKind::Text
    } else if METADATA.iter().any(|ext| name.ends_with(ext)) {
        ArtifactKind::Metadata
    } else {
        ArtifactKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_extension() {
        assert_eq!(
            classify(Path::new("images/core-image-minimal-qemux86-64.wic")),
            ArtifactKind::Image
        );
        assert_eq!(
            classify(Path::new("core-image-minimal.tar.bz2")),
            ArtifactKind::Archive
        );
        assert_eq!(
            classify(Path::new("core-image-minimal.manifest")),
            ArtifactKind::Text
        );
        assert_eq!(
            classify(Path::new("core-image-minimal.testdata.json")),
            ArtifactKind::Metadata
        );
        assert_eq!(classify(Path::new("bzImage")), ArtifactKind::Unknown);
    }

    #[tokio::test]
    async fn ingest_copies_tree_and_preserves_symlinks() {
        let deploy = tempfile::tempdir().unwrap();
        let images = deploy.path().join("images/qemux86-64");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(
            images.join("core-image-minimal-qemux86-64.wic"),
            b"image bits",
        )
        .unwrap();
        std::os::unix::fs::symlink(
            "core-image-minimal-qemux86-64.wic",
            images.join("core-image-minimal.wic"),
        )
        .unwrap();

        let store_root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_root.path().to_path_buf());

        let artifacts = store
            .ingest("acme", "acme-01ab23cd", "core-image-minimal", deploy.path())
            .await
            .unwrap();

        assert_eq!(artifacts.len(), 2);

        let file = artifacts
            .iter()
            .find(|a| a.path == "images/qemux86-64/core-image-minimal-qemux86-64.wic")
            .unwrap();
        assert_eq!(file.kind, ArtifactKind::Image);
        assert_eq!(file.size, 10);
        assert_eq!(file.checksum.len(), 64);

        let link = artifacts
            .iter()
            .find(|a| a.path == "images/qemux86-64/core-image-minimal.wic")
            .unwrap();
        assert_eq!(link.size, 0);
        assert!(link.checksum.is_empty());

        let copied_link = store
            .build_dir("acme", "acme-01ab23cd")
            .join("images/qemux86-64/core-image-minimal.wic");
        let target = std::fs::read_link(copied_link).unwrap();
        assert_eq!(
            target,
            PathBuf::from("core-image-minimal-qemux86-64.wic")
        );

        let metadata: BuildMetadata = serde_json::from_str(
            &std::fs::read_to_string(
                store
                    .build_dir("acme", "acme-01ab23cd")
                    .join(METADATA_FILE),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(metadata.artifact_count, 2);
        assert_eq!(metadata.target, "core-image-minimal");
    }

    #[tokio::test]
    async fn ingest_checksums_are_stable() {
        let deploy = tempfile::tempdir().unwrap();
        std::fs::write(deploy.path().join("hello.txt"), b"hello world\n").unwrap();

        let store_root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_root.path().to_path_buf());

        let artifacts = store
            .ingest("acme", "acme-ffffffff", "core-image-minimal", deploy.path())
            .await
            .unwrap();

        assert_eq!(
            artifacts[0].checksum,
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447"
        );
    }

    #[tokio::test]
    async fn missing_deploy_dir_is_an_error() {
        let store_root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_root.path().to_path_buf());

        let result = store
            .ingest(
                "acme",
                "acme-01ab23cd",
                "core-image-minimal",
                Path::new("/nonexistent/deploy"),
            )
            .await;
        assert!(matches!(result, Err(ArtifactError::MissingDeployDir(_))));
    }

    #[tokio::test]
    async fn retention_sweep_removes_only_expired_trees() {
        let store_root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_root.path().to_path_buf());

        let old_dir = store.build_dir("acme", "acme-00000001");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(
            old_dir.join(METADATA_FILE),
            serde_json::to_string(&BuildMetadata {
                build_id: "acme-00000001".to_string(),
                customer: "acme".to_string(),
                target: "core-image-minimal".to_string(),
                extracted_at: Utc::now() - chrono::Duration::days(30),
                artifact_count: 0,
            })
            .unwrap(),
        )
        .unwrap();

        let fresh_dir = store.build_dir("acme", "acme-00000002");
        std::fs::create_dir_all(&fresh_dir).unwrap();
        std::fs::write(
            fresh_dir.join(METADATA_FILE),
            serde_json::to_string(&BuildMetadata {
                build_id: "acme-00000002".to_string(),
                customer: "acme".to_string(),
                target: "core-image-minimal".to_string(),
                extracted_at: Utc::now(),
                artifact_count: 0,
            })
            .unwrap(),
        )
        .unwrap();

        // No metadata: left alone.
        let opaque_dir = store.build_dir("acme", "acme-00000003");
        std::fs::create_dir_all(&opaque_dir).unwrap();

        let removed = store
            .evict_older_than(Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, vec![old_dir.clone()]);
        assert!(!old_dir.exists());
        assert!(fresh_dir.exists());
        assert!(opaque_dir.exists());
    }
}
