use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States a build can be in.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BuildState {
    /// Build is waiting for a tenant or global slot
    Queued,

    /// Build is owned by a live executor
    Running,

    /// BitBake finished and artifacts were extracted
    Completed,

    /// Something in the build pipeline failed
    Failed,

    /// The build was cancelled by a client or daemon shutdown
    Cancelled,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Body of `POST /builds`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StartBuildRequest {
    /// Build configuration as a YAML document.
    pub config: String,
    /// Target image recipe; falls back to the configuration's default target.
    pub target: Option<String>,
    pub customer: String,
    #[serde(default)]
    pub force_clean: bool,
    #[serde(default)]
    pub force_image_rebuild: bool,
    /// Host the submission originated from; the daemon's hostname when absent.
    pub submitter_host: Option<String>,
    /// User the submission originated from; the daemon's user when absent.
    pub submitter_user: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BuildStatusResponse {
    pub id: String,
    pub target: String,
    pub state: BuildState,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub config_label: Option<String>,
    /// Unix seconds.
    pub start_time: Option<i64>,
    /// Unix seconds.
    pub end_time: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuildDetails {
    pub id: String,
    pub customer: String,
    pub project: String,
    pub target: String,
    pub machine: String,
    pub state: BuildState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub duration_secs: Option<i64>,
    pub error_message: Option<String>,
    pub deleted: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

/// What kind of file an extracted artifact is.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ArtifactKind {
    Image,
    Archive,
    Text,
    Metadata,
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ArtifactSummary {
    /// Path relative to the build's deploy root.
    pub path: String,
    pub kind: ArtifactKind,
    pub size: i64,
    /// Hex SHA-256; empty for symlinks.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{ArtifactKind, BuildState};

    #[test]
    fn test_state_deser() {
        assert_eq!(BuildState::Running, BuildState::from_str("ruNning").unwrap());
        assert_eq!(BuildState::Queued, BuildState::from_str("queued").unwrap());
        assert_eq!(BuildState::Cancelled, BuildState::from_str("Cancelled").unwrap());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BuildState::Queued.is_terminal());
        assert!(!BuildState::Running.is_terminal());
        assert!(BuildState::Completed.is_terminal());
        assert!(BuildState::Failed.is_terminal());
        assert!(BuildState::Cancelled.is_terminal());
    }

    #[test]
    fn test_artifact_kind_roundtrip() {
        assert_eq!(ArtifactKind::Image, ArtifactKind::from_str("image").unwrap());
        assert_eq!("metadata", ArtifactKind::Metadata.to_string());
    }
}
