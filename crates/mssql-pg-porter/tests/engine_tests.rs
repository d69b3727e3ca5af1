//! Engine and validator tests against in-memory fake drivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::sync::Semaphore;
use tokio::time::sleep;

use chrono::Utc;
use mssql_pg_porter::{
    ChannelSink, Column, MemoryStore, MigrateError, MigrationConfig, MigrationEngine,
    MigrationEvent, MigrationRecord, MigrationStatus, NullSink, Result, SourceChecksum,
    SourceReader, SqlObject, SqlObjectKind, SqlValue, Store, Table, TargetWriter,
    ValidationConfig, ValidationStatus, Validator,
};

// ===== Fake source =====

#[derive(Clone)]
struct FakeTableDef {
    table: Table,
    rows: Vec<Vec<SqlValue>>,
}

#[derive(Default)]
struct FakeSource {
    tables: Vec<FakeTableDef>,
    objects: Vec<SqlObject>,
    /// When set, each read_batch consumes one permit before returning.
    gate: Option<Arc<Semaphore>>,
    /// Overrides the computed checksum per "schema.name".
    checksum_overrides: Mutex<HashMap<String, SourceChecksum>>,
    /// When set, list_tables fails as if the catalog were unreachable.
    fail_listing: bool,
    closed: AtomicBool,
}

impl FakeSource {
    fn new(tables: Vec<FakeTableDef>) -> Self {
        Self {
            tables,
            ..Default::default()
        }
    }

    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn override_checksum(&self, table: &str, checksum: SourceChecksum) {
        self.checksum_overrides
            .lock()
            .unwrap()
            .insert(table.to_string(), checksum);
    }

    fn def(&self, schema: &str, name: &str) -> Result<&FakeTableDef> {
        self.tables
            .iter()
            .find(|d| d.table.schema == schema && d.table.name == name)
            .ok_or_else(|| MigrateError::SchemaIntrospection(format!("{}.{}", schema, name)))
    }

    fn column_index(def: &FakeTableDef, name: &str) -> usize {
        def.table
            .columns
            .iter()
            .position(|c| c.name == name)
            .expect("column exists")
    }
}

#[async_trait]
impl SourceReader for FakeSource {
    async fn list_tables(&self) -> Result<Vec<Table>> {
        if self.fail_listing {
            return Err(MigrateError::SchemaIntrospection(
                "listing tables: catalog unreachable".into(),
            ));
        }
        Ok(self
            .tables
            .iter()
            .map(|d| Table {
                schema: d.table.schema.clone(),
                name: d.table.name.clone(),
                row_count: d.rows.len() as i64,
                ..Default::default()
            })
            .collect())
    }

    async fn describe_table(&self, schema: &str, name: &str) -> Result<Table> {
        let def = self.def(schema, name)?;
        let mut table = def.table.clone();
        table.row_count = def.rows.len() as i64;
        Ok(table)
    }

    async fn list_objects(&self, kind: SqlObjectKind) -> Result<Vec<SqlObject>> {
        Ok(self
            .objects
            .iter()
            .filter(|o| o.kind == kind)
            .cloned()
            .collect())
    }

    async fn read_batch(
        &self,
        schema: &str,
        name: &str,
        _columns: &[Column],
        _order_by: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let def = self.def(schema, name)?;
        let start = (offset as usize).min(def.rows.len());
        let end = (start + limit as usize).min(def.rows.len());
        Ok(def.rows[start..end].to_vec())
    }

    async fn count_rows(&self, schema: &str, name: &str) -> Result<i64> {
        Ok(self.def(schema, name)?.rows.len() as i64)
    }

    async fn table_checksum(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        _order_by: &str,
    ) -> Result<SourceChecksum> {
        let full = format!("{}.{}", schema, name);
        if let Some(checksum) = self.checksum_overrides.lock().unwrap().get(&full) {
            return Ok(checksum.clone());
        }
        let def = self.def(schema, name)?;
        let indices: Vec<usize> = columns
            .iter()
            .map(|c| Self::column_index(def, &c.name))
            .collect();
        Ok(SourceChecksum {
            digest: rows_digest(&def.rows, &indices),
            fallback: false,
        })
    }

    async fn sample_keys(
        &self,
        schema: &str,
        name: &str,
        key_columns: &[Column],
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let def = self.def(schema, name)?;
        let indices: Vec<usize> = key_columns
            .iter()
            .map(|c| Self::column_index(def, &c.name))
            .collect();
        Ok(def
            .rows
            .iter()
            .take(limit as usize)
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }

    async fn fetch_row(
        &self,
        schema: &str,
        name: &str,
        _columns: &[Column],
        key_columns: &[Column],
        key: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>> {
        let def = self.def(schema, name)?;
        let indices: Vec<usize> = key_columns
            .iter()
            .map(|c| Self::column_index(def, &c.name))
            .collect();
        Ok(def
            .rows
            .iter()
            .find(|row| indices.iter().zip(key).all(|(&i, k)| &row[i] == k))
            .cloned())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ===== Fake target =====

#[derive(Default)]
struct TargetState {
    /// Ordered trace of every operation.
    ops: Vec<String>,
    /// Rows per "schema.name", with the column order seen at copy time.
    rows: HashMap<String, Vec<Vec<SqlValue>>>,
    columns: HashMap<String, Vec<String>>,
    /// Sequence values after sync, per "schema.name.column".
    sequences: HashMap<String, i64>,
    existing: Vec<String>,
}

#[derive(Default)]
struct FakeTarget {
    state: Mutex<TargetState>,
    /// DDL containing this fragment fails.
    fail_ddl_containing: Option<String>,
    closed: AtomicBool,
}

impl FakeTarget {
    fn new() -> Self {
        Self::default()
    }

    fn failing_ddl(fragment: &str) -> Self {
        Self {
            fail_ddl_containing: Some(fragment.to_string()),
            ..Default::default()
        }
    }

    fn seed_table(&self, schema: &str, name: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        let full = format!("{}.{}", schema, name);
        let mut state = self.state.lock().unwrap();
        state.existing.push(full.clone());
        state
            .columns
            .insert(full.clone(), columns.iter().map(|c| c.to_string()).collect());
        state.rows.insert(full, rows);
    }

    fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    fn rows_in(&self, full: &str) -> Vec<Vec<SqlValue>> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(full)
            .cloned()
            .unwrap_or_default()
    }

    fn total_rows(&self) -> i64 {
        self.state
            .lock()
            .unwrap()
            .rows
            .values()
            .map(|r| r.len() as i64)
            .sum()
    }

    fn sequence(&self, key: &str) -> Option<i64> {
        self.state.lock().unwrap().sequences.get(key).copied()
    }

    fn record(&self, op: String) {
        self.state.lock().unwrap().ops.push(op);
    }

    fn column_index(state: &TargetState, full: &str, name: &str) -> Option<usize> {
        state.columns.get(full)?.iter().position(|c| c == name)
    }
}

#[async_trait]
impl TargetWriter for FakeTarget {
    async fn create_schema(&self, schema: &str) -> Result<()> {
        self.record(format!("create_schema:{}", schema));
        Ok(())
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<()> {
        if let Some(fragment) = &self.fail_ddl_containing {
            if ddl.contains(fragment.as_str()) {
                return Err(MigrateError::ddl(ddl.to_string(), "simulated failure"));
            }
        }
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("ddl:{}", ddl));
        if let Some(rest) = ddl.strip_prefix("CREATE TABLE ") {
            let qualified: String = rest
                .chars()
                .take_while(|&c| c != ' ' && c != '(')
                .collect();
            let full = qualified.replace('"', "");
            state.existing.push(full.clone());
            state.rows.entry(full).or_default();
        }
        Ok(())
    }

    async fn execute_ddl_batch(&self, statements: &[String]) -> Result<()> {
        for stmt in statements {
            self.execute_ddl(stmt).await?;
        }
        Ok(())
    }

    async fn bulk_copy(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        let full = format!("{}.{}", schema, table);
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("copy:{}:{}", full, rows.len()));
        state.columns.insert(full.clone(), columns.to_vec());
        state.rows.entry(full).or_default().extend(rows.to_vec());
        Ok(rows.len() as u64)
    }

    async fn disable_triggers(&self, schema: &str, table: &str) -> Result<()> {
        self.record(format!("disable_triggers:{}.{}", schema, table));
        Ok(())
    }

    async fn enable_triggers(&self, schema: &str, table: &str) -> Result<()> {
        self.record(format!("enable_triggers:{}.{}", schema, table));
        Ok(())
    }

    async fn disable_fk_checks(&self) -> Result<()> {
        self.record("disable_fk_checks".into());
        Ok(())
    }

    async fn enable_fk_checks(&self) -> Result<()> {
        self.record("enable_fk_checks".into());
        Ok(())
    }

    async fn sync_sequence(&self, schema: &str, table: &str, column: &str) -> Result<()> {
        let full = format!("{}.{}", schema, table);
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("sync_sequence:{}.{}", full, column));

        // setval(MAX(col) or 1): the next allocated value is one higher
        let max = Self::column_index(&state, &full, column)
            .and_then(|idx| {
                state.rows.get(&full).and_then(|rows| {
                    rows.iter()
                        .filter_map(|row| match row.get(idx) {
                            Some(SqlValue::I32(v)) => Some(*v as i64),
                            Some(SqlValue::I64(v)) => Some(*v),
                            _ => None,
                        })
                        .max()
                })
            })
            .unwrap_or(1);
        state.sequences.insert(format!("{}.{}", full, column), max);
        Ok(())
    }

    async fn drop_table_if_exists(&self, schema: &str, table: &str) -> Result<()> {
        let full = format!("{}.{}", schema, table);
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("drop:{}", full));
        state.existing.retain(|t| t != &full);
        state.rows.remove(&full);
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let full = format!("{}.{}", schema, table);
        Ok(self.state.lock().unwrap().existing.contains(&full))
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let full = format!("{}.{}", schema, table);
        Ok(self
            .state
            .lock()
            .unwrap()
            .rows
            .get(&full)
            .map_or(0, |r| r.len() as i64))
    }

    async fn table_checksum(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        _order_by: &str,
    ) -> Result<String> {
        let full = format!("{}.{}", schema, table);
        let state = self.state.lock().unwrap();
        let rows = state.rows.get(&full).cloned().unwrap_or_default();
        let indices: Vec<usize> = columns
            .iter()
            .filter_map(|c| Self::column_index(&state, &full, c))
            .collect();
        Ok(rows_digest(&rows, &indices))
    }

    async fn sample_rows(
        &self,
        schema: &str,
        table: &str,
        _columns: &[String],
        _order_by: &str,
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let full = format!("{}.{}", schema, table);
        Ok(self
            .state
            .lock()
            .unwrap()
            .rows
            .get(&full)
            .map(|rows| rows.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_row(
        &self,
        schema: &str,
        table: &str,
        _columns: &[String],
        key_columns: &[String],
        key: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>> {
        let full = format!("{}.{}", schema, table);
        let state = self.state.lock().unwrap();
        let indices: Vec<usize> = key_columns
            .iter()
            .filter_map(|c| Self::column_index(&state, &full, c))
            .collect();
        if indices.len() != key_columns.len() {
            return Ok(None);
        }
        Ok(state.rows.get(&full).and_then(|rows| {
            rows.iter()
                .find(|row| indices.iter().zip(key).all(|(&i, k)| &row[i] == k))
                .cloned()
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Deterministic digest over projected row values, shared by both fakes so
/// equal data yields equal checksums.
fn rows_digest(rows: &[Vec<SqlValue>], indices: &[usize]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    let mut hasher = Md5::new();
    for row in rows {
        for &idx in indices {
            let text = row[idx].to_text().unwrap_or_else(|| "NULL".into());
            hasher.update(text);
            hasher.update(b"|");
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ===== Builders =====

fn int_col(name: &str, identity: bool, pk: bool) -> Column {
    Column {
        name: name.to_string(),
        data_type: "int".to_string(),
        is_nullable: false,
        is_identity: identity,
        is_primary_key: pk,
        ..Default::default()
    }
}

fn nvarchar_col(name: &str, max_length: i32) -> Column {
    Column {
        name: name.to_string(),
        data_type: "nvarchar".to_string(),
        max_length,
        is_nullable: false,
        ..Default::default()
    }
}

fn users_def(rows: Vec<Vec<SqlValue>>) -> FakeTableDef {
    FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Users".into(),
            columns: vec![int_col("Id", true, true), nvarchar_col("Name", 100)],
            primary_key: vec!["Id".into()],
            ..Default::default()
        },
        rows,
    }
}

fn user_rows(count: i32) -> Vec<Vec<SqlValue>> {
    (1..=count)
        .map(|i| vec![SqlValue::I32(i), SqlValue::Text(format!("user-{i}"))])
        .collect()
}

fn base_config() -> MigrationConfig {
    MigrationConfig {
        source_connection_string: "Server=src".into(),
        target_connection_string: "host=tgt".into(),
        source_database: "app".into(),
        target_database: "app".into(),
        drop_target_if_exists: true,
        ..Default::default()
    }
}

struct Harness {
    engine: Arc<MigrationEngine>,
    source: Arc<FakeSource>,
    target: Arc<FakeTarget>,
    store: Arc<MemoryStore>,
    handle: tokio::task::JoinHandle<()>,
}

fn migration_record(id: &str) -> MigrationRecord {
    MigrationRecord {
        id: id.to_string(),
        name: "test run".into(),
        source_database: "app".into(),
        target_database: "app".into(),
        status: MigrationStatus::Pending,
        config: "{}".into(),
        started_at: None,
        completed_at: None,
        created_at: Utc::now(),
        total_tables: 0,
        completed_tables: 0,
        total_rows: 0,
        migrated_rows: 0,
    }
}

async fn launch(config: MigrationConfig, source: FakeSource, target: FakeTarget) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .create_migration(&migration_record("test-migration"))
        .await
        .unwrap();
    let source = Arc::new(source);
    let target = Arc::new(target);
    let engine = Arc::new(MigrationEngine::new(
        "test-migration",
        config.normalized(),
        store.clone() as Arc<dyn Store>,
        Arc::new(NullSink),
    ));
    let handle = engine.spawn(source.clone(), target.clone());
    Harness {
        engine,
        source,
        target,
        store,
        handle,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

// ===== Engine tests =====

#[tokio::test]
async fn test_fk_ddl_runs_only_after_all_data() {
    let customers = FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Customers".into(),
            columns: vec![int_col("Id", true, true), nvarchar_col("Name", 80)],
            primary_key: vec!["Id".into()],
            ..Default::default()
        },
        rows: vec![
            vec![SqlValue::I32(1), SqlValue::Text("acme".into())],
            vec![SqlValue::I32(2), SqlValue::Text("globex".into())],
        ],
    };
    let orders = FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Orders".into(),
            columns: vec![int_col("Id", true, true), int_col("CustomerId", false, false)],
            primary_key: vec!["Id".into()],
            foreign_keys: vec![mssql_pg_porter::ForeignKey {
                name: "FK_Orders_Customers".into(),
                columns: vec!["CustomerId".into()],
                referenced_schema: "dbo".into(),
                referenced_table: "Customers".into(),
                referenced_columns: vec!["Id".into()],
                on_delete: "NO_ACTION".into(),
                on_update: "NO_ACTION".into(),
            }],
            ..Default::default()
        },
        rows: vec![vec![SqlValue::I32(10), SqlValue::I32(1)]],
    };

    let h = launch(
        base_config(),
        FakeSource::new(vec![orders, customers]),
        FakeTarget::new(),
    )
    .await;
    h.handle.await.unwrap();

    assert_eq!(h.engine.status().status, MigrationStatus::Completed);
    let ops = h.target.ops();

    // CREATE TABLE statements never embed foreign keys
    for op in ops.iter().filter(|o| o.starts_with("ddl:CREATE TABLE")) {
        assert!(!op.contains("FOREIGN KEY"), "FK leaked into {op}");
    }

    // Every copy precedes the first ADD CONSTRAINT
    let first_fk = ops
        .iter()
        .position(|o| o.contains("ADD CONSTRAINT"))
        .expect("FK was created");
    let last_copy = ops
        .iter()
        .rposition(|o| o.starts_with("copy:"))
        .expect("data was copied");
    assert!(last_copy < first_fk, "copy after FK creation: {ops:?}");

    assert_eq!(h.target.rows_in("dbo.Customers").len(), 2);
    assert_eq!(h.target.rows_in("dbo.Orders").len(), 1);

    // Trigger toggles pair around each table's copies
    let disables = ops.iter().filter(|o| o.starts_with("disable_triggers")).count();
    let enables = ops.iter().filter(|o| o.starts_with("enable_triggers")).count();
    assert_eq!(disables, 2);
    assert_eq!(enables, 2);
}

#[tokio::test]
async fn test_identity_table_roundtrip() {
    let h = launch(
        base_config(),
        FakeSource::new(vec![users_def(user_rows(3))]),
        FakeTarget::new(),
    )
    .await;
    h.handle.await.unwrap();

    assert_eq!(h.engine.status().status, MigrationStatus::Completed);

    let ops = h.target.ops();
    let create = ops
        .iter()
        .find(|o| o.starts_with("ddl:CREATE TABLE"))
        .expect("table was created");
    assert_eq!(
        create,
        "ddl:CREATE TABLE \"dbo\".\"Users\" (\n    \"Id\" SERIAL,\n    \"Name\" VARCHAR(50) NOT NULL,\n    PRIMARY KEY (\"Id\")\n)"
    );

    assert_eq!(h.target.rows_in("dbo.Users").len(), 3);
    // setval(MAX(Id)) leaves nextval at MAX + 1
    assert_eq!(h.target.sequence("dbo.Users.Id"), Some(3));

    let record = h.store.get_migration("test-migration").await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::Completed);
    assert_eq!(record.migrated_rows, 3);
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_progress_events_track_batches() {
    let store = Arc::new(MemoryStore::new());
    let (sink, mut events) = ChannelSink::new();
    let engine = Arc::new(MigrationEngine::new(
        "test-migration",
        MigrationConfig {
            batch_size: 10,
            ..base_config()
        }
        .normalized(),
        store as Arc<dyn Store>,
        Arc::new(sink),
    ));
    let handle = engine.spawn(
        Arc::new(FakeSource::new(vec![users_def(user_rows(25))])),
        Arc::new(FakeTarget::new()),
    );
    handle.await.unwrap();

    let mut processed = Vec::new();
    let mut table_complete_rows = None;
    while let Ok(event) = events.try_recv() {
        match event {
            MigrationEvent::Progress {
                processed_rows,
                total_rows,
                percentage,
                ..
            } => {
                assert_eq!(total_rows, 25);
                assert!((0.0..=100.0).contains(&percentage));
                processed.push(processed_rows);
            }
            MigrationEvent::TableComplete { rows_migrated, .. } => {
                table_complete_rows = Some(rows_migrated);
            }
            _ => {}
        }
    }

    assert_eq!(processed, vec![10, 20, 25]);
    assert_eq!(table_complete_rows, Some(25));
}

#[tokio::test]
async fn test_pause_gates_progress_and_resume_completes() {
    let gate = Arc::new(Semaphore::new(3));
    let h = launch(
        MigrationConfig {
            batch_size: 100,
            ..base_config()
        },
        FakeSource::new(vec![users_def(user_rows(1000))]).with_gate(gate.clone()),
        FakeTarget::new(),
    )
    .await;

    wait_until(|| h.engine.status().migrated_rows == 300).await;
    h.engine.pause().await.unwrap();
    gate.add_permits(1000);

    // At most the one in-flight batch lands after pause; progress then stops
    let mut last = h.engine.status().migrated_rows;
    loop {
        sleep(Duration::from_millis(120)).await;
        let now = h.engine.status().migrated_rows;
        if now == last {
            break;
        }
        last = now;
    }
    assert_eq!(h.engine.status().status, MigrationStatus::Paused);
    assert!(last <= 400, "paused run kept migrating: {last}");
    assert!(last < 1000);

    h.engine.resume().await.unwrap();
    h.handle.await.unwrap();

    let state = h.engine.status();
    assert_eq!(state.status, MigrationStatus::Completed);
    assert_eq!(state.migrated_rows, 1000);
    assert_eq!(h.target.rows_in("dbo.Users").len(), 1000);
}

#[tokio::test]
async fn test_cancel_is_terminal_and_accounting_is_exact() {
    let gate = Arc::new(Semaphore::new(2));
    let h = launch(
        MigrationConfig {
            batch_size: 100,
            ..base_config()
        },
        FakeSource::new(vec![users_def(user_rows(1000))]).with_gate(gate.clone()),
        FakeTarget::new(),
    )
    .await;

    wait_until(|| h.engine.status().migrated_rows == 200).await;
    h.engine.cancel().await.unwrap();
    gate.add_permits(1000);
    h.handle.await.unwrap();

    let state = h.engine.status();
    assert_eq!(state.status, MigrationStatus::Cancelled);
    // MigratedRows equals exactly what reached the target
    assert_eq!(state.migrated_rows, h.target.total_rows());
    assert!(state.migrated_rows < 1000);

    let record = h.store.get_migration("test-migration").await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::Cancelled);
    assert!(record.completed_at.is_some());

    // Cancel is not reversible
    assert!(h.engine.resume().await.is_err());
    assert!(h.engine.cancel().await.is_err());

    // Connections were released
    assert!(h.source.closed.load(Ordering::SeqCst));
    assert!(h.target.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_schema_failure_skips_table_and_run_continues() {
    let broken = FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Broken".into(),
            columns: vec![int_col("Id", false, true)],
            primary_key: vec!["Id".into()],
            ..Default::default()
        },
        rows: vec![vec![SqlValue::I32(1)]],
    };

    let h = launch(
        base_config(),
        FakeSource::new(vec![broken, users_def(user_rows(2))]),
        FakeTarget::failing_ddl("\"Broken\""),
    )
    .await;
    h.handle.await.unwrap();

    let state = h.engine.status();
    assert_eq!(state.status, MigrationStatus::Completed);
    assert!(h.target.rows_in("dbo.Broken").is_empty());
    assert_eq!(h.target.rows_in("dbo.Users").len(), 2);
    assert_eq!(
        state.tables.get("dbo.Broken").map(|t| t.status),
        Some(MigrationStatus::Failed)
    );

    let logs = h.store.list_logs("test-migration", 100).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.message.contains("Failed to create table dbo.Broken")));
}

#[tokio::test]
async fn test_include_exclude_filters_with_exclude_winning() {
    let mk = |name: &str| FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: name.into(),
            columns: vec![int_col("Id", false, true)],
            primary_key: vec!["Id".into()],
            ..Default::default()
        },
        rows: vec![vec![SqlValue::I32(1)]],
    };

    let h = launch(
        MigrationConfig {
            include_tables: vec!["dbo.Alpha".into(), "Beta".into()],
            exclude_tables: vec!["Beta".into()],
            ..base_config()
        },
        FakeSource::new(vec![mk("Alpha"), mk("Beta"), mk("Gamma")]),
        FakeTarget::new(),
    )
    .await;
    h.handle.await.unwrap();

    assert_eq!(h.target.rows_in("dbo.Alpha").len(), 1);
    assert!(h.target.rows_in("dbo.Beta").is_empty());
    assert!(h.target.rows_in("dbo.Gamma").is_empty());
    assert_eq!(h.engine.status().total_tables, 1);
}

#[tokio::test]
async fn test_table_without_columns_is_skipped_in_data_phase() {
    let empty = FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Degenerate".into(),
            ..Default::default()
        },
        rows: Vec::new(),
    };

    let h = launch(base_config(), FakeSource::new(vec![empty]), FakeTarget::new()).await;
    h.handle.await.unwrap();

    assert_eq!(h.engine.status().status, MigrationStatus::Completed);
    assert!(h.target.ops().iter().all(|o| !o.starts_with("copy:")));
}

#[tokio::test]
async fn test_fk_checks_toggled_when_target_kept() {
    let target = FakeTarget::new();
    target.seed_table("dbo", "Users", &["Id", "Name"], Vec::new());

    let h = launch(
        MigrationConfig {
            include_schema: false,
            drop_target_if_exists: false,
            ..base_config()
        },
        FakeSource::new(vec![users_def(user_rows(5))]),
        target,
    )
    .await;
    h.handle.await.unwrap();

    let ops = h.target.ops();
    let disable = ops.iter().position(|o| o == "disable_fk_checks").unwrap();
    let enable = ops.iter().position(|o| o == "enable_fk_checks").unwrap();
    let copy = ops.iter().position(|o| o.starts_with("copy:")).unwrap();
    assert!(disable < copy && copy < enable, "{ops:?}");
    assert_eq!(h.target.rows_in("dbo.Users").len(), 5);
}

#[tokio::test]
async fn test_data_skipped_when_target_table_missing() {
    let h = launch(
        MigrationConfig {
            include_schema: false,
            drop_target_if_exists: false,
            ..base_config()
        },
        FakeSource::new(vec![users_def(user_rows(5))]),
        FakeTarget::new(),
    )
    .await;
    h.handle.await.unwrap();

    assert_eq!(h.engine.status().status, MigrationStatus::Completed);
    assert!(h.target.rows_in("dbo.Users").is_empty());
    assert_eq!(
        h.engine.status().tables.get("dbo.Users").map(|t| t.status),
        Some(MigrationStatus::Failed)
    );
}

#[tokio::test]
async fn test_programmable_objects_emit_advisories_only() {
    let mut source = FakeSource::new(vec![]);
    source.objects = vec![
        SqlObject {
            schema: "dbo".into(),
            name: "ActiveUsers".into(),
            kind: SqlObjectKind::View,
            definition: Some("CREATE VIEW ...".into()),
        },
        SqlObject {
            schema: "dbo".into(),
            name: "PruneSessions".into(),
            kind: SqlObjectKind::Procedure,
            definition: None,
        },
    ];

    let h = launch(
        MigrationConfig {
            include_views: true,
            include_procedures: true,
            include_functions: true,
            include_triggers: true,
            ..base_config()
        },
        source,
        FakeTarget::new(),
    )
    .await;
    h.handle.await.unwrap();

    // Advisory pass generates no DDL
    assert!(h.target.ops().iter().all(|o| !o.starts_with("ddl:")));

    let logs = h.store.list_logs("test-migration", 100).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.message == "View dbo.ActiveUsers: Manual conversion required"));
    assert!(logs.iter().any(|l| l.message
        == "Stored procedure dbo.PruneSessions: Manual conversion to PL/pgSQL required"));
}

#[tokio::test]
async fn test_run_level_failure_emits_error_event() {
    let store = Arc::new(MemoryStore::new());
    store
        .create_migration(&migration_record("test-migration"))
        .await
        .unwrap();
    let (sink, mut events) = ChannelSink::new();
    let engine = Arc::new(MigrationEngine::new(
        "test-migration",
        base_config().normalized(),
        store.clone() as Arc<dyn Store>,
        Arc::new(sink),
    ));

    let source = FakeSource {
        fail_listing: true,
        ..FakeSource::new(vec![])
    };
    let handle = engine.spawn(Arc::new(source), Arc::new(FakeTarget::new()));
    handle.await.unwrap();

    let state = engine.status();
    assert_eq!(state.status, MigrationStatus::Failed);
    assert_eq!(state.errors.len(), 1);
    assert!(state.errors[0].contains("catalog unreachable"));

    let record = store.get_migration("test-migration").await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::Failed);
    assert!(record.completed_at.is_some());

    let mut saw_error_event = false;
    while let Ok(event) = events.try_recv() {
        if let MigrationEvent::Error { error, .. } = event {
            assert!(error.contains("Schema introspection failed"));
            saw_error_event = true;
        }
    }
    assert!(saw_error_event);

    let logs = store.list_logs("test-migration", 100).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.message.contains("catalog unreachable")));
}

#[tokio::test]
async fn test_pause_requires_running() {
    let store = Arc::new(MemoryStore::new());
    let engine = MigrationEngine::new(
        "test-migration",
        base_config().normalized(),
        store as Arc<dyn Store>,
        Arc::new(NullSink),
    );
    // Still pending: nothing to pause or resume
    assert!(engine.pause().await.is_err());
    assert!(engine.resume().await.is_err());
    // Cancel is accepted in any non-terminal state
    assert!(engine.cancel().await.is_ok());
    assert!(engine.cancel().await.is_err());
}

// ===== Validator tests =====

fn email_users_def(rows: Vec<Vec<SqlValue>>) -> FakeTableDef {
    FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Users".into(),
            columns: vec![int_col("Id", false, true), nvarchar_col("Email", 200)],
            primary_key: vec!["Id".into()],
            ..Default::default()
        },
        rows,
    }
}

fn validation_config() -> ValidationConfig {
    ValidationConfig {
        migration_id: "test-migration".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_validation_passes_on_identical_data() {
    let rows = vec![
        vec![SqlValue::I32(1), SqlValue::Text("a@x".into())],
        vec![SqlValue::I32(2), SqlValue::Text("b@x".into())],
    ];
    let source = Arc::new(FakeSource::new(vec![email_users_def(rows.clone())]));
    let target = Arc::new(FakeTarget::new());
    target.seed_table("dbo", "Users", &["Id", "Email"], rows);

    let validator = Validator::new(source, target, Arc::new(NullSink));
    let results = validator.run(&validation_config()).await.unwrap();

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.status, ValidationStatus::Success);
    assert!(result.row_count_match);
    assert!(result.checksum_match);
    assert_eq!(result.sample_matches, 2);
    assert_eq!(result.sample_mismatches, 0);
}

#[tokio::test]
async fn test_validation_reports_value_mismatch() {
    let source = Arc::new(FakeSource::new(vec![email_users_def(vec![vec![
        SqlValue::I32(7),
        SqlValue::Text("A@x".into()),
    ]])]));
    let target = Arc::new(FakeTarget::new());
    target.seed_table(
        "dbo",
        "Users",
        &["Id", "Email"],
        vec![vec![SqlValue::I32(7), SqlValue::Text("a@x".into())]],
    );

    let validator = Validator::new(source, target, Arc::new(NullSink));
    let results = validator.run(&validation_config()).await.unwrap();
    let result = &results[0];

    assert!(result.row_count_match);
    assert!(!result.checksum_match);
    assert_eq!(result.sample_mismatches, 1);
    assert_eq!(result.status, ValidationStatus::Mismatch);

    let detail = &result.mismatched_rows[0];
    assert_eq!(detail.primary_key, vec!["7".to_string()]);
    assert_eq!(detail.column_differences.len(), 1);
    let diff = &detail.column_differences[0];
    assert_eq!(diff.column, "Email");
    assert_eq!(diff.source_value, "A@x");
    assert_eq!(diff.target_value, "a@x");
}

#[tokio::test]
async fn test_validation_reports_missing_target_row() {
    let source = Arc::new(FakeSource::new(vec![email_users_def(vec![
        vec![SqlValue::I32(1), SqlValue::Text("a@x".into())],
        vec![SqlValue::I32(2), SqlValue::Text("b@x".into())],
    ])]));
    let target = Arc::new(FakeTarget::new());
    target.seed_table(
        "dbo",
        "Users",
        &["Id", "Email"],
        vec![vec![SqlValue::I32(1), SqlValue::Text("a@x".into())]],
    );

    let validator = Validator::new(source, target, Arc::new(NullSink));
    let results = validator.run(&validation_config()).await.unwrap();
    let result = &results[0];

    assert!(!result.row_count_match);
    assert_eq!(result.sample_mismatches, 1);
    assert_eq!(result.status, ValidationStatus::Mismatch);
    assert!(matches!(
        result.mismatched_rows[0].kind,
        mssql_pg_porter::MismatchKind::Missing
    ));
}

#[tokio::test]
async fn test_fallback_checksum_mismatch_is_a_warning() {
    let rows = vec![vec![SqlValue::I32(1), SqlValue::Text("a@x".into())]];
    let source = FakeSource::new(vec![email_users_def(rows.clone())]);
    source.override_checksum(
        "dbo.Users",
        SourceChecksum {
            digest: "client-side-digest".into(),
            fallback: true,
        },
    );
    let target = Arc::new(FakeTarget::new());
    target.seed_table("dbo", "Users", &["Id", "Email"], rows);

    let validator = Validator::new(Arc::new(source), target, Arc::new(NullSink));
    let results = validator.run(&validation_config()).await.unwrap();
    let result = &results[0];

    // Counts and samples agree; only the incomparable digests differ
    assert!(result.row_count_match);
    assert_eq!(result.sample_mismatches, 0);
    assert!(!result.checksum_match);
    assert!(result.checksum_fallback);
    assert_eq!(result.status, ValidationStatus::Warning);
}

#[tokio::test]
async fn test_checksum_with_no_comparable_columns_is_a_warning() {
    let def = FakeTableDef {
        table: Table {
            schema: "dbo".into(),
            name: "Blobs".into(),
            columns: vec![Column {
                name: "Payload".into(),
                data_type: "varbinary".into(),
                is_nullable: true,
                ..Default::default()
            }],
            ..Default::default()
        },
        rows: vec![vec![SqlValue::Bytes(vec![1, 2, 3])]],
    };
    let source = Arc::new(FakeSource::new(vec![def]));
    let target = Arc::new(FakeTarget::new());
    target.seed_table(
        "dbo",
        "Blobs",
        &["Payload"],
        vec![vec![SqlValue::Bytes(vec![1, 2, 3])]],
    );

    let validator = Validator::new(source, target, Arc::new(NullSink));
    let results = validator.run(&validation_config()).await.unwrap();
    assert_eq!(results[0].status, ValidationStatus::Warning);
}

#[tokio::test]
async fn test_validation_mismatch_details_truncated_to_ten() {
    let source_rows: Vec<Vec<SqlValue>> = (1..=15)
        .map(|i| vec![SqlValue::I32(i), SqlValue::Text(format!("s-{i}"))])
        .collect();
    let target_rows: Vec<Vec<SqlValue>> = (1..=15)
        .map(|i| vec![SqlValue::I32(i), SqlValue::Text(format!("t-{i}"))])
        .collect();

    let source = Arc::new(FakeSource::new(vec![email_users_def(source_rows)]));
    let target = Arc::new(FakeTarget::new());
    target.seed_table("dbo", "Users", &["Id", "Email"], target_rows);

    let validator = Validator::new(source, target, Arc::new(NullSink));
    let results = validator.run(&validation_config()).await.unwrap();
    let result = &results[0];

    assert_eq!(result.sample_mismatches, 15);
    assert_eq!(result.mismatched_rows.len(), 10);
    assert_eq!(result.status, ValidationStatus::Mismatch);
}

#[tokio::test]
async fn test_validation_table_filter() {
    let rows = vec![vec![SqlValue::I32(1), SqlValue::Text("a@x".into())]];
    let mut other = email_users_def(rows.clone());
    other.table.name = "Ignored".into();

    let source = Arc::new(FakeSource::new(vec![email_users_def(rows.clone()), other]));
    let target = Arc::new(FakeTarget::new());
    target.seed_table("dbo", "Users", &["Id", "Email"], rows);

    let validator = Validator::new(source, target, Arc::new(NullSink));
    let results = validator
        .run(&ValidationConfig {
            tables: vec!["dbo.Users".into()],
            ..validation_config()
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].table_name, "dbo.Users");
}
