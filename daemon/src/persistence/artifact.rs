use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

use smidr_common::build::{ArtifactKind as WireKind, ArtifactSummary};

#[derive(sqlx::Type, Debug, Display, Clone, Copy, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum ArtifactKind {
    Image,
    Archive,
    Text,
    Metadata,
    Unknown,
}

impl From<ArtifactKind> for WireKind {
    fn from(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Image => Self::Image,
            ArtifactKind::Archive => Self::Archive,
            ArtifactKind::Text => Self::Text,
            ArtifactKind::Metadata => Self::Metadata,
            ArtifactKind::Unknown => Self::Unknown,
        }
    }
}

impl From<WireKind> for ArtifactKind {
    fn from(kind: WireKind) -> Self {
        match kind {
            WireKind::Image => Self::Image,
            WireKind::Archive => Self::Archive,
            WireKind::Text => Self::Text,
            WireKind::Metadata => Self::Metadata,
            WireKind::Unknown => Self::Unknown,
        }
    }
}

/// One row of `build_artifacts`; read-only once written.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ArtifactRecord {
    pub build_id: String,
    /// Path relative to the build's deploy root.
    pub path: String,
    pub kind: ArtifactKind,
    pub size: i64,
    /// Hex SHA-256; empty when no checksum applies (symlinks).
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl From<ArtifactRecord> for ArtifactSummary {
    fn from(record: ArtifactRecord) -> Self {
        ArtifactSummary {
            path: record.path,
            kind: record.kind.into(),
            size: record.size,
            checksum: record.checksum,
            created_at: record.created_at,
        }
    }
}
