pub mod artifact;
pub mod build;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub use artifact::{ArtifactKind, ArtifactRecord};
pub use build::{Build, BuildFilter, BuildOutcome, BuildStatus};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("build already exists: {0}")]
    AlreadyExists(String),
    #[error("build not found: {0}")]
    NotFound(String),
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: BuildStatus,
        to: BuildStatus,
    },
}

/// Durable record of builds and artifacts; the single source of truth for
/// build existence and terminal status.
#[async_trait]
pub trait BuildStore: Send + Sync + 'static {
    async fn create(&self, build: &Build) -> Result<(), StoreError>;

    /// `Queued -> Running`, stamping `started_at`.
    async fn start(&self, id: &str) -> Result<(), StoreError>;

    /// Transition to a terminal status. Idempotent for a repeated identical
    /// outcome; any other re-completion is an illegal transition.
    async fn complete(&self, id: &str, outcome: &BuildOutcome) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Build, StoreError>;

    async fn list(&self, filter: &BuildFilter) -> Result<Vec<Build>, StoreError>;

    /// Builds still persisted as non-terminal within the staleness horizon.
    async fn stale_builds(&self, horizon: Duration) -> Result<Vec<Build>, StoreError>;

    async fn soft_delete(&self, id: &str) -> Result<(), StoreError>;

    /// Purge the build row; artifacts cascade.
    async fn hard_delete(&self, id: &str) -> Result<(), StoreError>;

    async fn add_artifact(&self, artifact: &ArtifactRecord) -> Result<(), StoreError>;

    async fn artifacts(&self, build_id: &str) -> Result<Vec<ArtifactRecord>, StoreError>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS builds (
        id TEXT PRIMARY KEY,
        customer TEXT NOT NULL,
        project TEXT NOT NULL,
        target TEXT NOT NULL,
        machine TEXT NOT NULL,
        config_snapshot TEXT NOT NULL,
        submitter_host TEXT NOT NULL,
        submitter_user TEXT NOT NULL,
        build_root TEXT NOT NULL,
        deploy_dir TEXT NOT NULL,
        log_path TEXT NOT NULL,
        json_log_path TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        status TEXT NOT NULL,
        exit_code INTEGER,
        duration_secs INTEGER,
        error_message TEXT,
        deleted INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_builds_customer ON builds(customer)",
    "CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status)",
    "CREATE INDEX IF NOT EXISTS idx_builds_created_at ON builds(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_builds_deleted ON builds(deleted)",
    "CREATE TABLE IF NOT EXISTS build_artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
        path TEXT NOT NULL,
        kind TEXT NOT NULL,
        size INTEGER NOT NULL,
        checksum TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_build ON build_artifacts(build_id)",
    "CREATE VIEW IF NOT EXISTS stale_builds AS
        SELECT * FROM builds
        WHERE status IN ('Queued', 'Running') AND deleted = 0",
];

/// SQLite-backed [`BuildStore`]. New connections should be made by cloning
/// rather than calling [`Persistence::new`] again.
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        Self::from_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        // One connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true),
            )
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }
}

#[async_trait]
impl BuildStore for Persistence {
    async fn create(&self, build: &Build) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO builds (
                id, customer, project, target, machine, config_snapshot,
                submitter_host, submitter_user, build_root, deploy_dir,
                log_path, json_log_path, created_at, started_at, completed_at,
                status, exit_code, duration_secs, error_message, deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&build.id)
        .bind(&build.customer)
        .bind(&build.project)
        .bind(&build.target)
        .bind(&build.machine)
        .bind(&build.config_snapshot)
        .bind(&build.submitter_host)
        .bind(&build.submitter_user)
        .bind(&build.build_root)
        .bind(&build.deploy_dir)
        .bind(&build.log_path)
        .bind(&build.json_log_path)
        .bind(build.created_at)
        .bind(build.started_at)
        .bind(build.completed_at)
        .bind(build.status)
        .bind(build.exit_code)
        .bind(build.duration_secs)
        .bind(&build.error_message)
        .bind(build.deleted)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::AlreadyExists(build.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn start(&self, id: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE builds SET status = ?, started_at = ? WHERE id = ? AND status = ?",
        )
        .bind(BuildStatus::Running)
        .bind(Utc::now())
        .bind(id)
        .bind(BuildStatus::Queued)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let current = self.get(id).await?;
        Err(StoreError::IllegalTransition {
            id: id.to_string(),
            from: current.status,
            to: BuildStatus::Running,
        })
    }

    async fn complete(&self, id: &str, outcome: &BuildOutcome) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<Build> = sqlx::query_as("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if current.status.is_terminal() {
            let identical = current.status == outcome.status
                && current.exit_code == Some(outcome.exit_code)
                && current.error_message == outcome.error_message;

            return if identical {
                Ok(())
            } else {
                Err(StoreError::IllegalTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: outcome.status,
                })
            };
        }

        if !outcome.status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: current.status,
                to: outcome.status,
            });
        }

        sqlx::query(
            "UPDATE builds
                SET status = ?, exit_code = ?, duration_secs = ?, error_message = ?, completed_at = ?
                WHERE id = ?",
        )
        .bind(outcome.status)
        .bind(outcome.exit_code)
        .bind(outcome.duration.as_secs() as i64)
        .bind(&outcome.error_message)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Build, StoreError> {
        sqlx::query_as("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: &BuildFilter) -> Result<Vec<Build>, StoreError> {
        let mut query = sqlx::QueryBuilder::new("SELECT * FROM builds WHERE 1 = 1");

        if let Some(customer) = &filter.customer {
            query.push(" AND customer = ").push_bind(customer);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        if !filter.include_deleted {
            query.push(" AND deleted = 0");
        }
        query.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        Ok(query
            .build_query_as::<Build>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn stale_builds(&self, horizon: Duration) -> Result<Vec<Build>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::hours(24));

        Ok(
            sqlx::query_as("SELECT * FROM stale_builds WHERE created_at >= ?")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn soft_delete(&self, id: &str) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE builds SET deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn hard_delete(&self, id: &str) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM builds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn add_artifact(&self, artifact: &ArtifactRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO build_artifacts (build_id, path, kind, size, checksum, created_at)
                VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&artifact.build_id)
        .bind(&artifact.path)
        .bind(artifact.kind)
        .bind(artifact.size)
        .bind(&artifact.checksum)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn artifacts(&self, build_id: &str) -> Result<Vec<ArtifactRecord>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT build_id, path, kind, size, checksum, created_at
                FROM build_artifacts WHERE build_id = ?
                ORDER BY created_at DESC, id DESC",
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
