//! Domain model types
//!
//! Plain data records shared by the repository, service and API layers.
//! All ids are owned values; relationships are by-id and resolved on
//! demand rather than held as object graphs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Users & permissions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

/// Per-dataset permission kind. Higher kinds imply lower ones:
/// `admin ⊃ write ⊃ read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Read,
    Write,
    Admin,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Whether holding `self` satisfies a requirement of `required`.
    pub fn satisfies(&self, required: PermissionKind) -> bool {
        *self >= required
    }
}

// ============================================================================
// Datasets, refs, commits
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub creator: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named movable pointer into the commit graph. `main` is created with the
/// dataset and protected from deletion.
#[derive(Debug, Clone, Serialize)]
pub struct Ref {
    pub dataset_id: Uuid,
    pub name: String,
    pub commit_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub const MAIN_REF: &str = "main";

#[derive(Debug, Clone, Serialize)]
pub struct Commit {
    pub commit_id: String,
    pub dataset_id: Uuid,
    pub parent_commit_id: Option<String>,
    pub message: String,
    pub author_id: Uuid,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
}

/// One manifest entry: a logical row position bound to a content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub table_key: String,
    pub row_index: i64,
    pub row_hash: String,
}

impl ManifestEntry {
    /// Stable `"<table_key>:<1-based row index>"` identifier.
    pub fn logical_row_id(&self) -> String {
        format!("{}:{}", self.table_key, self.row_index)
    }
}

// ============================================================================
// Schemas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub dtype: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

/// Per-commit schema: one record holding a map keyed by table_key, so a
/// multi-sheet import captures each sheet's columns separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSchema {
    pub tables: BTreeMap<String, TableSchema>,
}

// ============================================================================
// Jobs (analysis runs)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Import,
    Sampling,
    Exploration,
    Profiling,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Sampling => "sampling",
            Self::Exploration => "exploration",
            Self::Profiling => "profiling",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            "sampling" => Some(Self::Sampling),
            "exploration" => Some(Self::Exploration),
            "profiling" => Some(Self::Profiling),
            _ => None,
        }
    }

    pub const ALL: [RunType; 4] = [
        Self::Import,
        Self::Sampling,
        Self::Exploration,
        Self::Profiling,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed state-machine transitions. Terminal states absorb everything.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        match (self, to) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            // Recovery sweep resets presumed-dead running jobs.
            (Self::Running, Self::Pending) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRun {
    pub id: Uuid,
    pub run_type: RunType,
    pub status: RunStatus,
    pub dataset_id: Uuid,
    pub source_commit_id: Option<String>,
    pub user_id: Uuid,
    pub run_parameters: serde_json::Value,
    pub output_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Progress written into `run_parameters.progress` after every batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub bytes_processed: u64,
    pub bytes_total: u64,
    pub rows_processed: u64,
}

/// Resume checkpoint written into `run_parameters.checkpoint` at the
/// configured batch interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub file_position: u64,
    pub rows_emitted_per_sheet: BTreeMap<String, u64>,
    pub manifest_length: u64,
    pub parent_at_start: Option<String>,
}

// ============================================================================
// Overview
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TableOverview {
    pub key: String,
    pub row_count: i64,
    pub column_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefOverview {
    pub name: String,
    pub commit_id: Option<String>,
    pub tables: Vec<TableOverview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetOverview {
    pub refs: Vec<RefOverview>,
    pub default_ref: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_hierarchy() {
        assert!(PermissionKind::Admin.satisfies(PermissionKind::Read));
        assert!(PermissionKind::Admin.satisfies(PermissionKind::Write));
        assert!(PermissionKind::Write.satisfies(PermissionKind::Read));
        assert!(!PermissionKind::Read.satisfies(PermissionKind::Write));
        assert!(!PermissionKind::Write.satisfies(PermissionKind::Admin));
    }

    #[test]
    fn test_terminal_states_absorb_transitions() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            for target in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal:?} must not transition to {target:?}"
                );
            }
        }
    }

    #[test]
    fn test_running_job_can_be_reset_for_recovery() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_logical_row_id_shape() {
        let entry = ManifestEntry {
            table_key: "primary".into(),
            row_index: 7,
            row_hash: "ab".repeat(32),
        };
        assert_eq!(entry.logical_row_id(), "primary:7");
    }
}
