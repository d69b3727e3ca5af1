//! Migration status state machine and live run state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a migration run or of a single table within it.
///
/// Runs move `pending -> running -> (paused <-> running)` and end in one of
/// the terminal states. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed | MigrationStatus::Failed | MigrationStatus::Cancelled
        )
    }

    /// Stable string form used in the store and in events.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of a migration run, shared between the engine task and
/// status readers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub total_tables: usize,
    pub completed_tables: usize,
    pub total_rows: i64,
    pub migrated_rows: i64,
    pub current_table: String,
    pub tables: HashMap<String, TableState>,
    pub errors: Vec<String>,
}

impl MigrationState {
    /// Fresh state for a run that has not started phases yet.
    pub fn new() -> Self {
        Self {
            status: MigrationStatus::Pending,
            started_at: Utc::now(),
            total_tables: 0,
            completed_tables: 0,
            total_rows: 0,
            migrated_rows: 0,
            current_table: String::new(),
            tables: HashMap::new(),
            errors: Vec::new(),
        }
    }
}

impl Default for MigrationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Live state of a single table migration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableState {
    pub name: String,
    pub schema: String,
    pub status: MigrationStatus,
    pub total_rows: i64,
    pub migrated_rows: i64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TableState {
    /// State for a table entering the data phase.
    pub fn started(schema: &str, name: &str, total_rows: i64) -> Self {
        Self {
            name: name.to_string(),
            schema: schema.to_string(),
            status: MigrationStatus::Running,
            total_rows,
            migrated_rows: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: String::new(),
        }
    }
}
