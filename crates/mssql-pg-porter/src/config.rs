//! Connection, migration, and validation configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Default number of rows per batch when the config leaves it unset.
pub const DEFAULT_BATCH_SIZE: i64 = 10_000;

/// Default number of sampled rows for validation.
pub const DEFAULT_SAMPLE_SIZE: i64 = 100;

/// Kind of a saved database connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Mssql,
    Postgres,
}

/// A saved connection entry.
///
/// Non-deleted entries are unique on (kind, connection string, database).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub id: String,
    pub name: String,
    pub kind: ConnectionKind,
    pub connection_string: String,
    pub database: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ConnectionConfig {
    /// The tuple non-deleted entries are unique over.
    pub fn unique_key(&self) -> (ConnectionKind, &str, &str) {
        (self.kind, self.connection_string.as_str(), self.database.as_str())
    }
}

/// Result of a connection test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub server_version: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub databases: Vec<String>,
}

impl ConnectionTestResult {
    /// A failed test with the given message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Configuration for a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    pub source_connection_string: String,
    pub target_connection_string: String,
    pub source_database: String,
    pub target_database: String,

    pub include_schema: bool,
    pub include_data: bool,
    pub include_views: bool,
    pub include_procedures: bool,
    pub include_functions: bool,
    pub include_triggers: bool,

    /// Tables to migrate; empty means all non-excluded tables.
    /// Entries match either "schema.name" or the bare table name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_tables: Vec<String>,

    /// Tables to skip. Exclusion wins over inclusion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tables: Vec<String>,

    /// Rows per batch for data migration.
    pub batch_size: i64,

    /// Degree of table-level parallelism. Phase 2 currently runs tables
    /// sequentially; the knob is normalized and persisted for hosts that
    /// opt into parallel semantics later.
    pub parallel_tables: i64,

    /// Drop target tables before creating them.
    pub drop_target_if_exists: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_connection_string: String::new(),
            target_connection_string: String::new(),
            source_database: String::new(),
            target_database: String::new(),
            include_schema: true,
            include_data: true,
            include_views: false,
            include_procedures: false,
            include_functions: false,
            include_triggers: false,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            parallel_tables: 1,
            drop_target_if_exists: false,
        }
    }
}

impl MigrationConfig {
    /// Fill non-positive knobs with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.batch_size <= 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.parallel_tables <= 0 {
            self.parallel_tables = 1;
        }
        self
    }

    /// Reject configurations that cannot start a run.
    pub fn validate(&self) -> Result<()> {
        if self.source_connection_string.trim().is_empty() {
            return Err(MigrateError::Config(
                "source connection string is required".into(),
            ));
        }
        if self.target_connection_string.trim().is_empty() {
            return Err(MigrateError::Config(
                "target connection string is required".into(),
            ));
        }
        if self.source_database.trim().is_empty() {
            return Err(MigrateError::Config("source database is required".into()));
        }
        Ok(())
    }

    /// Whether a table is selected by the include/exclude lists.
    ///
    /// Entries match as "schema.name" or as a bare table name. An empty
    /// include list selects everything; exclusion always wins.
    pub fn selects(&self, schema: &str, name: &str) -> bool {
        let full = format!("{}.{}", schema, name);
        if matches_entry(&self.exclude_tables, &full, name) {
            return false;
        }
        if self.include_tables.is_empty() {
            return true;
        }
        matches_entry(&self.include_tables, &full, name)
    }
}

fn matches_entry(entries: &[String], full: &str, bare: &str) -> bool {
    entries.iter().any(|e| e == full || e == bare)
}

/// Configuration for a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    pub migration_id: String,
    pub row_count_validation: bool,
    pub checksum_validation: bool,
    pub sample_comparison: bool,
    pub sample_size: i64,

    /// Tables to validate; empty means all. Matched like migration filters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            migration_id: String::new(),
            row_count_validation: true,
            checksum_validation: true,
            sample_comparison: true,
            sample_size: DEFAULT_SAMPLE_SIZE,
            tables: Vec::new(),
        }
    }
}

impl ValidationConfig {
    /// Fill non-positive knobs with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.sample_size <= 0 {
            self.sample_size = DEFAULT_SAMPLE_SIZE;
        }
        self
    }

    /// Whether a table is selected by the validation filter.
    pub fn selects(&self, schema: &str, name: &str) -> bool {
        if self.tables.is_empty() {
            return true;
        }
        let full = format!("{}.{}", schema, name);
        matches_entry(&self.tables, &full, name)
    }
}
