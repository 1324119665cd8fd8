use std::time::Duration;

use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

use smidr_common::build::{BuildDetails, BuildState, BuildStatusResponse};

/// Persisted lifecycle states.
#[derive(sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum BuildStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl From<BuildStatus> for BuildState {
    fn from(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Queued => Self::Queued,
            BuildStatus::Running => Self::Running,
            BuildStatus::Completed => Self::Completed,
            BuildStatus::Failed => Self::Failed,
            BuildStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<BuildState> for BuildStatus {
    fn from(state: BuildState) -> Self {
        match state {
            BuildState::Queued => Self::Queued,
            BuildState::Running => Self::Running,
            BuildState::Completed => Self::Completed,
            BuildState::Failed => Self::Failed,
            BuildState::Cancelled => Self::Cancelled,
        }
    }
}

/// One row of the `builds` table; the durable record of a build.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Build {
    pub id: String,
    pub customer: String,
    pub project: String,
    pub target: String,
    pub machine: String,
    /// Immutable snapshot of the submitted configuration.
    pub config_snapshot: String,
    pub submitter_host: String,
    pub submitter_user: String,
    pub build_root: String,
    pub deploy_dir: String,
    pub log_path: String,
    pub json_log_path: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BuildStatus,
    pub exit_code: Option<i64>,
    pub duration_secs: Option<i64>,
    pub error_message: Option<String>,
    pub deleted: bool,
}

impl Build {
    pub fn status_response(&self) -> BuildStatusResponse {
        BuildStatusResponse {
            id: self.id.clone(),
            target: self.target.clone(),
            state: self.status.into(),
            exit_code: self.exit_code,
            error_message: self.error_message.clone(),
            config_label: Some(self.project.clone()),
            start_time: self.started_at.map(|t| t.timestamp()),
            end_time: self.completed_at.map(|t| t.timestamp()),
        }
    }
}

impl From<Build> for BuildDetails {
    fn from(build: Build) -> Self {
        BuildDetails {
            id: build.id,
            customer: build.customer,
            project: build.project,
            target: build.target,
            machine: build.machine,
            state: build.status.into(),
            created_at: build.created_at,
            started_at: build.started_at,
            completed_at: build.completed_at,
            exit_code: build.exit_code,
            duration_secs: build.duration_secs,
            error_message: build.error_message,
            deleted: build.deleted,
        }
    }
}

/// Terminal outcome recorded by `BuildStore::complete`.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    pub exit_code: i64,
    pub duration: Duration,
    pub error_message: Option<String>,
}

impl BuildOutcome {
    pub fn completed(duration: Duration) -> Self {
        Self {
            status: BuildStatus::Completed,
            exit_code: 0,
            duration,
            error_message: None,
        }
    }

    pub fn failed(exit_code: i64, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::Failed,
            exit_code,
            duration,
            error_message: Some(message.into()),
        }
    }

    pub fn cancelled(duration: Duration) -> Self {
        Self {
            status: BuildStatus::Cancelled,
            exit_code: 130,
            duration,
            error_message: None,
        }
    }
}

/// Filter for `BuildStore::list`; results are ordered by `created_at`
/// descending.
#[derive(Clone, Debug, Default)]
pub struct BuildFilter {
    pub customer: Option<String>,
    pub status: Option<BuildStatus>,
    pub include_deleted: bool,
    pub limit: Option<u32>,
}
