//! Persistent records and the store interface the embedded host store
//! must implement. [`MemoryStore`] backs tests and hosts that do not
//! persist anything.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConnectionConfig, ConnectionKind};
use crate::error::{MigrateError, Result};
use crate::state::MigrationStatus;
use crate::validate::ValidationResult;

/// Log severity for migration log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// A migration log entry. Write-only once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub migration_id: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(migration_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            level,
            message: message.into(),
            table: None,
            details: None,
            timestamp: Utc::now(),
        }
    }
}

/// A persisted migration job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: String,
    pub name: String,
    pub source_database: String,
    pub target_database: String,
    pub status: MigrationStatus,
    /// JSON-encoded MigrationConfig.
    pub config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub total_tables: usize,
    pub completed_tables: usize,
    pub total_rows: i64,
    pub migrated_rows: i64,
}

/// Aggregate progress written back to the migration record.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationTotals {
    pub total_tables: usize,
    pub completed_tables: usize,
    pub total_rows: i64,
    pub migrated_rows: i64,
}

/// A persisted validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub id: String,
    pub migration_id: String,
    pub status: String,
    /// JSON-encoded ValidationConfig.
    pub config: String,
    pub results: Vec<ValidationResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Interface to the host's embedded store.
///
/// The store's own concurrency model is treated as thread-safe; the engine
/// serializes nothing on top of it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<()>;

    /// Update a migration's status. Terminal statuses set `completed_at`.
    async fn update_migration_status(&self, id: &str, status: MigrationStatus) -> Result<()>;

    async fn update_migration_progress(&self, id: &str, totals: MigrationTotals) -> Result<()>;

    async fn get_migration(&self, id: &str) -> Result<Option<MigrationRecord>>;

    /// Most recent migrations first.
    async fn list_migrations(&self, limit: usize) -> Result<Vec<MigrationRecord>>;

    async fn add_log(&self, entry: &LogEntry) -> Result<()>;

    /// Most recent entries first.
    async fn list_logs(&self, migration_id: &str, limit: usize) -> Result<Vec<LogEntry>>;

    /// Insert or replace a connection entry. Fails when another non-deleted
    /// entry exists with the same (kind, connection string, database).
    async fn save_connection(&self, cfg: &ConnectionConfig) -> Result<()>;

    /// Non-deleted connections, most recently used first; entries never
    /// used sort last. Optionally filtered by kind.
    async fn list_connections(&self, kind: Option<ConnectionKind>) -> Result<Vec<ConnectionConfig>>;

    /// Stamp a connection's last-used timestamp.
    async fn update_connection_last_used(&self, id: &str) -> Result<()>;

    /// Soft-delete a connection by id.
    async fn delete_connection(&self, id: &str) -> Result<()>;

    async fn save_validation_report(&self, report: &ValidationReport) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    migrations: Vec<MigrationRecord>,
    logs: Vec<LogEntry>,
    connections: HashMap<String, ConnectionConfig>,
    reports: Vec<ValidationReport>,
}

/// In-memory store used by tests and by hosts without persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.migrations.push(record.clone());
        Ok(())
    }

    async fn update_migration_status(&self, id: &str, status: MigrationStatus) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(rec) = inner.migrations.iter_mut().find(|m| m.id == id) {
            rec.status = status;
            match status {
                MigrationStatus::Running if rec.started_at.is_none() => {
                    rec.started_at = Some(Utc::now());
                }
                s if s.is_terminal() => rec.completed_at = Some(Utc::now()),
                _ => {}
            }
        }
        Ok(())
    }

    async fn update_migration_progress(&self, id: &str, totals: MigrationTotals) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(rec) = inner.migrations.iter_mut().find(|m| m.id == id) {
            rec.total_tables = totals.total_tables;
            rec.completed_tables = totals.completed_tables;
            rec.total_rows = totals.total_rows;
            rec.migrated_rows = totals.migrated_rows;
        }
        Ok(())
    }

    async fn get_migration(&self, id: &str) -> Result<Option<MigrationRecord>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.migrations.iter().find(|m| m.id == id).cloned())
    }

    async fn list_migrations(&self, limit: usize) -> Result<Vec<MigrationRecord>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.migrations.iter().rev().take(limit).cloned().collect())
    }

    async fn add_log(&self, entry: &LogEntry) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, migration_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|l| l.migration_id == migration_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_connection(&self, cfg: &ConnectionConfig) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let duplicate = inner.connections.values().any(|existing| {
            existing.id != cfg.id
                && existing.deleted_at.is_none()
                && existing.unique_key() == cfg.unique_key()
        });
        if duplicate {
            return Err(MigrateError::Config(format!(
                "connection to {} already exists",
                cfg.database
            )));
        }
        inner.connections.insert(cfg.id.clone(), cfg.clone());
        Ok(())
    }

    async fn list_connections(&self, kind: Option<ConnectionKind>) -> Result<Vec<ConnectionConfig>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut out: Vec<ConnectionConfig> = inner
            .connections
            .values()
            .filter(|c| c.deleted_at.is_none())
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .cloned()
            .collect();
        // Most recently used first; never-used entries (None) sort last
        out.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(out)
    }

    async fn update_connection_last_used(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(cfg) = inner.connections.get_mut(id) {
            if cfg.deleted_at.is_none() {
                cfg.last_used_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn delete_connection(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(cfg) = inner.connections.get_mut(id) {
            cfg.deleted_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn save_validation_report(&self, report: &ValidationReport) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.reports.push(report.clone());
        Ok(())
    }
}
