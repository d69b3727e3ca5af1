//! The four-phase migration engine.
//!
//! A run executes on a background task: schema, data, foreign keys, then
//! the programmable-object advisory pass. Pause and cancel are observed at
//! cooperative checkpoints between phases, tables, and batches; cancel
//! always wins over pause.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::MigrationConfig;
use crate::convert::TypeMapper;
use crate::error::{MigrateError, Result};
use crate::events::{EventSink, MigrationEvent};
use crate::schema::{SqlObjectKind, Table};
use crate::source::SourceReader;
use crate::state::{MigrationState, MigrationStatus, TableState};
use crate::store::{LogEntry, LogLevel, MigrationTotals, Store};
use crate::target::TargetWriter;

/// Orchestrates a single migration run.
pub struct MigrationEngine {
    migration_id: String,
    config: MigrationConfig,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    state: Arc<RwLock<MigrationState>>,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Per-run working set shared across phases.
struct RunContext {
    tables: Vec<Table>,
    /// Full descriptors, keyed by "schema.name", populated on first describe.
    descriptors: HashMap<String, Table>,
    /// Tables that passed Phase 1 or were judged to already exist on target.
    ready: HashSet<String>,
}

impl MigrationEngine {
    /// Create an engine for one run. The configuration must already be
    /// normalized and validated.
    pub fn new(
        migration_id: impl Into<String>,
        config: MigrationConfig,
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            migration_id: migration_id.into(),
            config,
            store,
            events,
            state: Arc::new(RwLock::new(MigrationState::new())),
            pause,
            cancel: CancellationToken::new(),
        }
    }

    /// Snapshot of the live run state.
    pub fn status(&self) -> MigrationState {
        self.state.read().expect("state lock poisoned").clone()
    }

    /// Pause the run at its next checkpoint. Requires `running`.
    pub async fn pause(&self) -> Result<()> {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if state.status != MigrationStatus::Running {
                return Err(MigrateError::Config(format!(
                    "cannot pause a {} migration",
                    state.status
                )));
            }
            state.status = MigrationStatus::Paused;
        }
        let _ = self.pause.send(true);
        self.persist_status(MigrationStatus::Paused).await;
        self.log(LogLevel::Info, "Migration paused").await;
        Ok(())
    }

    /// Resume a paused run. Requires `paused`.
    pub async fn resume(&self) -> Result<()> {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if state.status != MigrationStatus::Paused {
                return Err(MigrateError::Config(format!(
                    "cannot resume a {} migration",
                    state.status
                )));
            }
            state.status = MigrationStatus::Running;
        }
        let _ = self.pause.send(false);
        self.persist_status(MigrationStatus::Running).await;
        self.log(LogLevel::Info, "Migration resumed").await;
        Ok(())
    }

    /// Cancel the run. Accepted in any non-terminal state; irreversible.
    pub async fn cancel(&self) -> Result<()> {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if state.status.is_terminal() {
                return Err(MigrateError::Config(format!(
                    "cannot cancel a {} migration",
                    state.status
                )));
            }
            state.status = MigrationStatus::Cancelled;
        }
        self.cancel.cancel();
        self.persist_status(MigrationStatus::Cancelled).await;
        self.log(LogLevel::Info, "Migration cancelled").await;
        Ok(())
    }

    /// Start the run on a background task. The caller has already opened
    /// both connections; the engine owns them until the run exits.
    pub fn spawn(
        self: &Arc<Self>,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(source, target).await;
        })
    }

    fn start_running_if_not_terminal(&self) -> bool {
        let mut state = self.state.write().expect("state lock poisoned");
        if state.status.is_terminal() {
            // Cancelled before the task started
            return false;
        }
        state.status = MigrationStatus::Running;
        state.started_at = Utc::now();
        true
    }

    async fn run(&self, source: Arc<dyn SourceReader>, target: Arc<dyn TargetWriter>) {
        if !self.start_running_if_not_terminal() {
            source.close().await;
            target.close().await;
            return;
        }
        self.persist_status(MigrationStatus::Running).await;

        let result = self.run_phases(source.as_ref(), target.as_ref()).await;

        // Connections are released on every exit path
        source.close().await;
        target.close().await;

        // A cancel that lands after the last checkpoint must win over the
        // run's own outcome
        let cancelled = self.cancel.is_cancelled();
        match result {
            Ok(()) if !cancelled => {
                self.set_status(MigrationStatus::Completed);
                self.persist_status(MigrationStatus::Completed).await;
                self.events.emit(MigrationEvent::Complete {
                    migration_id: self.migration_id.clone(),
                });
                self.log(LogLevel::Info, "Migration completed successfully")
                    .await;
            }
            Ok(()) | Err(MigrateError::Cancelled) => {
                // Status was already recorded by cancel()
                self.log(LogLevel::Info, "Migration stopped after cancellation")
                    .await;
            }
            Err(e) if cancelled => {
                self.log(
                    LogLevel::Info,
                    format!("Migration stopped after cancellation: {}", e),
                )
                .await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn run_phases(&self, source: &dyn SourceReader, target: &dyn TargetWriter) -> Result<()> {
        let all_tables = source.list_tables().await?;
        let tables: Vec<Table> = all_tables
            .into_iter()
            .filter(|t| self.config.selects(&t.schema, &t.name))
            .collect();

        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.total_tables = tables.len();
        }
        self.log(
            LogLevel::Info,
            format!("Starting migration of {} tables", tables.len()),
        )
        .await;

        let mut ctx = RunContext {
            tables,
            descriptors: HashMap::new(),
            ready: HashSet::new(),
        };

        if self.config.include_schema {
            self.checkpoint().await?;
            self.log(LogLevel::Info, "Phase 1: Migrating schema").await;
            self.migrate_schema(source, target, &mut ctx).await?;
        }

        if self.config.include_data {
            self.checkpoint().await?;
            self.log(LogLevel::Info, "Phase 2: Migrating data").await;
            self.migrate_data(source, target, &mut ctx).await?;
        }

        if self.config.include_schema {
            self.checkpoint().await?;
            self.log(LogLevel::Info, "Phase 3: Creating foreign keys").await;
            self.create_foreign_keys(source, target, &mut ctx).await?;
        }

        if self.config.include_views
            || self.config.include_procedures
            || self.config.include_functions
            || self.config.include_triggers
        {
            self.checkpoint().await?;
            self.log(LogLevel::Info, "Phase 4: Scanning programmable objects")
                .await;
            self.scan_programmable_objects(source).await?;
        }

        Ok(())
    }

    /// Phase 1: create schemas, tables, and secondary indexes.
    async fn migrate_schema(
        &self,
        source: &dyn SourceReader,
        target: &dyn TargetWriter,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let mut mapper = TypeMapper::new();
        let tables = ctx.tables.clone();

        for table in &tables {
            self.checkpoint().await?;

            let details = match self.describe(source, ctx, &table.schema, &table.name).await {
                Ok(d) => d,
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format!("Failed to describe {}: {}", table.full_name(), e),
                    )
                    .await;
                    continue;
                }
            };

            if let Err(e) = target.create_schema(&table.schema).await {
                self.log(
                    LogLevel::Warn,
                    format!("Failed to create schema {}: {}", table.schema, e),
                )
                .await;
            }

            if self.config.drop_target_if_exists {
                if let Err(e) = target.drop_table_if_exists(&table.schema, &table.name).await {
                    self.log(
                        LogLevel::Warn,
                        format!("Failed to drop table {}: {}", table.full_name(), e),
                    )
                    .await;
                }
            }

            let create_ddl = mapper.create_table_ddl(&details);
            if let Err(e) = target.execute_ddl(&create_ddl).await {
                self.log(
                    LogLevel::Error,
                    format!("Failed to create table {}: {}", table.full_name(), e),
                )
                .await;
                self.flush_warnings(&mut mapper).await;
                continue;
            }

            for index in &details.indexes {
                let index_ddl = mapper.index_ddl(&details, index);
                if let Err(e) = target.execute_ddl(&index_ddl).await {
                    self.log(
                        LogLevel::Warn,
                        format!("Failed to create index {}: {}", index.name, e),
                    )
                    .await;
                }
            }

            self.log(
                LogLevel::Info,
                format!("Created table {}", table.full_name()),
            )
            .await;
            self.flush_warnings(&mut mapper).await;
            ctx.ready.insert(table.full_name());
        }

        Ok(())
    }

    /// Phase 2: bulk-load table data in ordered batches.
    async fn migrate_data(
        &self,
        source: &dyn SourceReader,
        target: &dyn TargetWriter,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let total_rows: i64 = ctx.tables.iter().map(|t| t.row_count.max(0)).sum();
        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.total_rows = total_rows;
        }

        // With an intact target, pre-existing constraints could reject rows
        // that arrive before their referenced tables load
        let fk_checks_disabled = if !self.config.drop_target_if_exists {
            match target.disable_fk_checks().await {
                Ok(()) => true,
                Err(e) => {
                    self.log(
                        LogLevel::Warn,
                        format!("Failed to disable FK checks: {}", e),
                    )
                    .await;
                    false
                }
            }
        } else {
            false
        };

        let tables = ctx.tables.clone();
        for table in &tables {
            self.checkpoint().await?;

            if !self.table_ready(target, ctx, table).await {
                self.log(
                    LogLevel::Warn,
                    format!(
                        "Skipping data for {}: table missing on target",
                        table.full_name()
                    ),
                )
                .await;
                self.complete_table(table, MigrationStatus::Failed, "table missing on target")
                    .await;
                continue;
            }

            match self.migrate_table_data(source, target, ctx, table).await {
                Ok(rows) => {
                    self.complete_table(table, MigrationStatus::Completed, "").await;
                    self.events.emit(MigrationEvent::TableComplete {
                        migration_id: self.migration_id.clone(),
                        table: table.full_name(),
                        rows_migrated: rows,
                    });
                    self.log(
                        LogLevel::Info,
                        format!("Completed {}: {} rows migrated", table.full_name(), rows),
                    )
                    .await;
                }
                Err(MigrateError::Cancelled) => return Err(MigrateError::Cancelled),
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format!("Failed to migrate data for {}: {}", table.full_name(), e),
                    )
                    .await;
                    self.complete_table(table, MigrationStatus::Failed, &e.to_string())
                        .await;
                }
            }

            self.persist_progress().await;
        }

        if fk_checks_disabled {
            if let Err(e) = target.enable_fk_checks().await {
                self.log(
                    LogLevel::Warn,
                    format!("Failed to re-enable FK checks: {}", e),
                )
                .await;
            }
        }

        Ok(())
    }

    /// Copy one table's rows. Returns the number of rows migrated.
    async fn migrate_table_data(
        &self,
        source: &dyn SourceReader,
        target: &dyn TargetWriter,
        ctx: &mut RunContext,
        table: &Table,
    ) -> Result<i64> {
        let full_name = table.full_name();
        let details = self.describe(source, ctx, &table.schema, &table.name).await?;

        // No columns means no stable read order; nothing to copy either
        let Some(order_by) = details.order_by_column().map(str::to_string) else {
            self.log(
                LogLevel::Warn,
                format!("Skipping {}: table has no columns", full_name),
            )
            .await;
            return Ok(0);
        };

        self.log(
            LogLevel::Info,
            format!(
                "Migrating data for {} ({} rows)",
                full_name, details.row_count
            ),
        )
        .await;

        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.current_table = full_name.clone();
            state.tables.insert(
                full_name.clone(),
                TableState::started(&table.schema, &table.name, details.row_count),
            );
        }

        if let Err(e) = target.disable_triggers(&table.schema, &table.name).await {
            self.log(
                LogLevel::Warn,
                format!("Failed to disable triggers for {}: {}", full_name, e),
            )
            .await;
        }

        let copy_result = self
            .copy_batches(source, target, &details, &order_by)
            .await;

        // Re-enable is attempted even when the copy failed
        if let Err(e) = target.enable_triggers(&table.schema, &table.name).await {
            self.log(
                LogLevel::Warn,
                format!("Failed to enable triggers for {}: {}", full_name, e),
            )
            .await;
        }

        let migrated = copy_result?;

        for col in details.identity_columns() {
            if let Err(e) = target
                .sync_sequence(&table.schema, &table.name, &col.name)
                .await
            {
                self.log(
                    LogLevel::Warn,
                    format!(
                        "Failed to sync sequence for {}.{}: {}",
                        full_name, col.name, e
                    ),
                )
                .await;
            }
        }

        Ok(migrated)
    }

    /// The batch loop: read ordered pages from the source and stream each
    /// through bulk-copy, observing pause/cancel between batches.
    async fn copy_batches(
        &self,
        source: &dyn SourceReader,
        target: &dyn TargetWriter,
        details: &Table,
        order_by: &str,
    ) -> Result<i64> {
        let full_name = details.full_name();
        let columns = details.column_names();
        let mut migrated = 0i64;
        let mut offset = 0i64;

        loop {
            self.checkpoint().await?;

            let rows = self
                .cancellable(source.read_batch(
                    &details.schema,
                    &details.name,
                    &details.columns,
                    order_by,
                    offset,
                    self.config.batch_size,
                ))
                .await?;

            if rows.is_empty() {
                break;
            }

            let written = self
                .cancellable(target.bulk_copy(&details.schema, &details.name, &columns, &rows))
                .await?;

            migrated += written as i64;
            offset += rows.len() as i64;

            let processed = {
                let mut state = self.state.write().expect("state lock poisoned");
                state.migrated_rows += written as i64;
                if let Some(ts) = state.tables.get_mut(&full_name) {
                    ts.migrated_rows = migrated;
                }
                migrated
            };

            // Source row counts are statistics-based estimates
            let percentage = if details.row_count > 0 {
                (processed as f64 / details.row_count as f64) * 100.0
            } else {
                0.0
            };
            self.events.emit(MigrationEvent::Progress {
                migration_id: self.migration_id.clone(),
                table: full_name.clone(),
                total_rows: details.row_count,
                processed_rows: processed,
                percentage,
            });
        }

        Ok(migrated)
    }

    /// Phase 3: add foreign keys once every table's data is in place.
    async fn create_foreign_keys(
        &self,
        source: &dyn SourceReader,
        target: &dyn TargetWriter,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let mapper = TypeMapper::new();
        let tables = ctx.tables.clone();

        for table in &tables {
            self.checkpoint().await?;

            let Ok(details) = self.describe(source, ctx, &table.schema, &table.name).await else {
                continue;
            };

            for fk in &details.foreign_keys {
                let ddl = mapper.foreign_key_ddl(&details, fk);
                if let Err(e) = target.execute_ddl(&ddl).await {
                    // Orphaned source rows commonly prevent FK creation
                    self.log(
                        LogLevel::Warn,
                        format!("Failed to create foreign key {}: {}", fk.name, e),
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    /// Phase 4: enumerate programmable objects and emit advisory warnings.
    /// No target DDL is generated for them.
    async fn scan_programmable_objects(&self, source: &dyn SourceReader) -> Result<()> {
        let passes: [(bool, SqlObjectKind, &str); 4] = [
            (
                self.config.include_views,
                SqlObjectKind::View,
                "Manual conversion required",
            ),
            (
                self.config.include_procedures,
                SqlObjectKind::Procedure,
                "Manual conversion to PL/pgSQL required",
            ),
            (
                self.config.include_functions,
                SqlObjectKind::Function,
                "Manual conversion to PL/pgSQL required",
            ),
            (
                self.config.include_triggers,
                SqlObjectKind::Trigger,
                "Manual conversion to PL/pgSQL required",
            ),
        ];

        for (enabled, kind, advice) in passes {
            if !enabled {
                continue;
            }
            self.checkpoint().await?;

            match source.list_objects(kind).await {
                Ok(objects) => {
                    for obj in objects {
                        self.log(
                            LogLevel::Warn,
                            format!("{} {}: {}", kind.noun(), obj.full_name(), advice),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    self.log(
                        LogLevel::Warn,
                        format!("Failed to list {}s: {}", kind.noun().to_lowercase(), e),
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    /// Describe a table once per run, caching the descriptor across phases.
    async fn describe(
        &self,
        source: &dyn SourceReader,
        ctx: &mut RunContext,
        schema: &str,
        name: &str,
    ) -> Result<Table> {
        let key = format!("{}.{}", schema, name);
        if let Some(details) = ctx.descriptors.get(&key) {
            return Ok(details.clone());
        }
        let details = self.cancellable(source.describe_table(schema, name)).await?;
        ctx.descriptors.insert(key, details.clone());
        Ok(details)
    }

    /// Whether a table may receive data: it passed Phase 1, or, when the
    /// schema phase was skipped, it already exists on the target.
    async fn table_ready(
        &self,
        target: &dyn TargetWriter,
        ctx: &mut RunContext,
        table: &Table,
    ) -> bool {
        if ctx.ready.contains(&table.full_name()) {
            return true;
        }
        if self.config.include_schema {
            // Phase 1 ran and this table did not survive it
            return false;
        }
        match target.table_exists(&table.schema, &table.name).await {
            Ok(exists) => {
                if exists {
                    ctx.ready.insert(table.full_name());
                }
                exists
            }
            Err(e) => {
                warn!("Existence check failed for {}: {}", table.full_name(), e);
                false
            }
        }
    }

    /// Wait at the checkpoint while paused; fail fast when cancelled.
    /// Cancel takes precedence over pause.
    async fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let mut paused = self.pause.subscribe();
        while *paused.borrow() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(MigrateError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run an I/O future under the run's cancellation scope.
    async fn cancellable<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MigrateError::Cancelled),
            result = fut => result,
        }
    }

    async fn complete_table(&self, table: &Table, status: MigrationStatus, error: &str) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.completed_tables += 1;
        if let Some(ts) = state.tables.get_mut(&table.full_name()) {
            ts.status = status;
            ts.completed_at = Some(Utc::now());
            ts.error = error.to_string();
        } else if status == MigrationStatus::Failed {
            let mut ts = TableState::started(&table.schema, &table.name, table.row_count);
            ts.status = status;
            ts.completed_at = Some(Utc::now());
            ts.error = error.to_string();
            state.tables.insert(table.full_name(), ts);
        }
    }

    fn set_status(&self, status: MigrationStatus) {
        let mut state = self.state.write().expect("state lock poisoned");
        if !state.status.is_terminal() {
            state.status = status;
        }
    }

    async fn fail(&self, error: MigrateError) {
        let message = error.to_string();
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if !state.status.is_terminal() {
                state.status = MigrationStatus::Failed;
            }
            state.errors.push(message.clone());
        }
        self.persist_status(MigrationStatus::Failed).await;
        // The log keeps the full cause chain; the event stays terse
        self.log(LogLevel::Error, error.format_detailed()).await;
        self.events.emit(MigrationEvent::Error {
            migration_id: self.migration_id.clone(),
            error: message,
        });
    }

    async fn persist_status(&self, status: MigrationStatus) {
        if let Err(e) = self
            .store
            .update_migration_status(&self.migration_id, status)
            .await
        {
            warn!("Failed to persist migration status: {}", e);
        }
    }

    async fn persist_progress(&self) {
        let totals = {
            let state = self.state.read().expect("state lock poisoned");
            MigrationTotals {
                total_tables: state.total_tables,
                completed_tables: state.completed_tables,
                total_rows: state.total_rows,
                migrated_rows: state.migrated_rows,
            }
        };
        if let Err(e) = self
            .store
            .update_migration_progress(&self.migration_id, totals)
            .await
        {
            self.log(
                LogLevel::Warn,
                format!("Failed to update progress: {}", e),
            )
            .await;
        }
    }

    async fn flush_warnings(&self, mapper: &mut TypeMapper) {
        for warning in mapper.take_warnings() {
            self.log(LogLevel::Warn, warning).await;
        }
    }

    async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let entry = LogEntry::new(&self.migration_id, level, message.clone());
        if let Err(e) = self.store.add_log(&entry).await {
            warn!("Failed to persist log entry: {}", e);
        }
        self.events.emit(MigrationEvent::Log {
            migration_id: self.migration_id.clone(),
            level,
            message,
            timestamp: entry.timestamp,
        });
    }
}
