//! The operation surface the host (GUI or otherwise) drives.
//!
//! One service owns the store and event sink, keeps at most one live
//! migration engine, and wires concrete drivers to the engine and
//! validator.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::config::{
    ConnectionConfig, ConnectionKind, ConnectionTestResult, MigrationConfig, ValidationConfig,
};
use crate::engine::MigrationEngine;
use crate::error::{MigrateError, Result};
use crate::events::EventSink;
use crate::schema::{SqlObject, SqlObjectKind, Table};
use crate::source::{MssqlSource, SourceReader};
use crate::state::{MigrationState, MigrationStatus};
use crate::store::{LogEntry, MigrationRecord, Store, ValidationReport};
use crate::target::{PgTarget, TargetWriter};
use crate::validate::{ValidationResult, ValidationStatus, Validator};

/// Host-facing entry points for connections, schema browsing, migration
/// control, and validation.
pub struct MigrationService {
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    current: Mutex<Option<Arc<MigrationEngine>>>,
}

impl MigrationService {
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            events,
            current: Mutex::new(None),
        }
    }

    // ===== Connections =====

    /// Test a source connection string.
    pub async fn test_source(&self, conn_str: &str) -> ConnectionTestResult {
        MssqlSource::test(conn_str).await
    }

    /// Test a target connection string.
    pub async fn test_target(&self, conn_str: &str) -> ConnectionTestResult {
        PgTarget::test(conn_str).await
    }

    /// Save a connection entry, assigning an id when absent.
    pub async fn save_connection(&self, mut cfg: ConnectionConfig) -> Result<ConnectionConfig> {
        if cfg.id.is_empty() {
            cfg.id = Uuid::new_v4().to_string();
        }
        self.store.save_connection(&cfg).await?;
        Ok(cfg)
    }

    /// Non-deleted connections, optionally filtered by kind.
    pub async fn list_connections(
        &self,
        kind: Option<ConnectionKind>,
    ) -> Result<Vec<ConnectionConfig>> {
        self.store.list_connections(kind).await
    }

    /// Soft-delete a connection.
    pub async fn delete_connection(&self, id: &str) -> Result<()> {
        self.store.delete_connection(id).await
    }

    // ===== Schema browsing =====

    /// List tables in a source database.
    pub async fn get_tables(&self, conn_str: &str, database: &str) -> Result<Vec<Table>> {
        let source = MssqlSource::connect(conn_str, database).await?;
        self.touch_saved_connections(conn_str, database).await;
        let tables = source.list_tables().await;
        source.close().await;
        tables
    }

    /// Full metadata for one source table.
    pub async fn get_table_details(
        &self,
        conn_str: &str,
        database: &str,
        schema: &str,
        name: &str,
    ) -> Result<Table> {
        let source = MssqlSource::connect(conn_str, database).await?;
        let details = source.describe_table(schema, name).await;
        source.close().await;
        details
    }

    /// Enumerate programmable objects of one kind in a source database.
    pub async fn get_objects(
        &self,
        conn_str: &str,
        database: &str,
        kind: SqlObjectKind,
    ) -> Result<Vec<SqlObject>> {
        let source = MssqlSource::connect(conn_str, database).await?;
        let objects = source.list_objects(kind).await;
        source.close().await;
        objects
    }

    // ===== Migration control =====

    /// Create a migration record, open both connections, and start the
    /// engine on a background task. Returns the migration id.
    ///
    /// Connection failures surface synchronously and mark the record
    /// failed; one migration runs at a time.
    pub async fn start_migration(&self, config: MigrationConfig, name: &str) -> Result<String> {
        let config = config.normalized();
        config.validate()?;

        let mut current = self.current.lock().await;
        if let Some(engine) = current.as_ref() {
            if !engine.status().status.is_terminal() {
                return Err(MigrateError::Config(
                    "another migration is already running".into(),
                ));
            }
        }

        let migration_id = Uuid::new_v4().to_string();
        let record = MigrationRecord {
            id: migration_id.clone(),
            name: name.to_string(),
            source_database: config.source_database.clone(),
            target_database: config.target_database.clone(),
            status: MigrationStatus::Pending,
            config: serde_json::to_string(&config)?,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            total_tables: 0,
            completed_tables: 0,
            total_rows: 0,
            migrated_rows: 0,
        };
        self.store.create_migration(&record).await?;

        let source = match MssqlSource::connect(
            &config.source_connection_string,
            &config.source_database,
        )
        .await
        {
            Ok(s) => s,
            Err(e) => {
                self.store
                    .update_migration_status(&migration_id, MigrationStatus::Failed)
                    .await?;
                return Err(e);
            }
        };

        let target = match PgTarget::connect(
            &config.target_connection_string,
            &config.target_database,
        )
        .await
        {
            Ok(t) => t,
            Err(e) => {
                source.close().await;
                self.store
                    .update_migration_status(&migration_id, MigrationStatus::Failed)
                    .await?;
                return Err(e);
            }
        };

        self.touch_saved_connections(
            &config.source_connection_string,
            &config.source_database,
        )
        .await;
        self.touch_saved_connections(
            &config.target_connection_string,
            &config.target_database,
        )
        .await;

        let engine = Arc::new(MigrationEngine::new(
            migration_id.clone(),
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.events),
        ));
        engine.spawn(Arc::new(source), Arc::new(target));
        *current = Some(engine);

        Ok(migration_id)
    }

    /// Pause the active migration.
    pub async fn pause_migration(&self) -> Result<()> {
        self.active().await?.pause().await
    }

    /// Resume the active migration.
    pub async fn resume_migration(&self) -> Result<()> {
        self.active().await?.resume().await
    }

    /// Cancel the active migration.
    pub async fn cancel_migration(&self) -> Result<()> {
        self.active().await?.cancel().await
    }

    /// Live state of the most recent migration.
    pub async fn get_status(&self) -> Result<MigrationState> {
        Ok(self.active().await?.status())
    }

    /// Most recent migration records.
    pub async fn get_history(&self, limit: usize) -> Result<Vec<MigrationRecord>> {
        self.store.list_migrations(limit).await
    }

    /// Most recent log entries for a migration.
    pub async fn get_logs(&self, migration_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.store.list_logs(migration_id, limit).await
    }

    // ===== Validation =====

    /// Run a validation pass and persist the report.
    pub async fn start_validation(
        &self,
        source_conn_str: &str,
        target_conn_str: &str,
        config: ValidationConfig,
        source_database: &str,
        target_database: &str,
    ) -> Result<Vec<ValidationResult>> {
        let started_at = Utc::now();
        let source: Arc<dyn SourceReader> =
            Arc::new(MssqlSource::connect(source_conn_str, source_database).await?);
        let target: Arc<dyn TargetWriter> =
            Arc::new(PgTarget::connect(target_conn_str, target_database).await?);

        let validator = Validator::new(
            Arc::clone(&source),
            Arc::clone(&target),
            Arc::clone(&self.events),
        );
        let results = validator.run(&config).await;

        source.close().await;
        target.close().await;
        let results = results?;

        let report = ValidationReport {
            id: Uuid::new_v4().to_string(),
            migration_id: config.migration_id.clone(),
            status: overall_status(&results).as_str().to_string(),
            config: serde_json::to_string(&config)?,
            results: results.clone(),
            started_at,
            completed_at: Some(Utc::now()),
        };
        self.store.save_validation_report(&report).await?;

        Ok(results)
    }

    /// Stamp saved connection entries matching the string (and database,
    /// when one is given) as used. Matching follows the saved-entry
    /// uniqueness tuple; misses are fine, ad-hoc strings are never saved.
    async fn touch_saved_connections(&self, conn_str: &str, database: &str) {
        let Ok(connections) = self.store.list_connections(None).await else {
            return;
        };
        for cfg in connections {
            if cfg.connection_string == conn_str
                && (database.is_empty() || cfg.database == database)
            {
                if let Err(e) = self.store.update_connection_last_used(&cfg.id).await {
                    warn!("Failed to stamp last-used for connection {}: {}", cfg.id, e);
                }
            }
        }
    }

    async fn active(&self) -> Result<Arc<MigrationEngine>> {
        self.current
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| MigrateError::Config("no migration has been started".into()))
    }
}

/// Worst per-table status, in severity order.
fn overall_status(results: &[ValidationResult]) -> ValidationStatus {
    let mut worst = ValidationStatus::Success;
    for result in results {
        worst = match (worst, result.status) {
            (_, ValidationStatus::Error) | (ValidationStatus::Error, _) => ValidationStatus::Error,
            (_, ValidationStatus::Mismatch) | (ValidationStatus::Mismatch, _) => {
                ValidationStatus::Mismatch
            }
            (_, ValidationStatus::Warning) | (ValidationStatus::Warning, _) => {
                ValidationStatus::Warning
            }
            _ => ValidationStatus::Success,
        };
    }
    worst
}
