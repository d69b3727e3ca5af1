//! Source reader abstraction and the MSSQL implementation.
//!
//! [`SourceReader`] is the seam the engine and validator depend on, so both
//! can run against in-memory fakes. [`MssqlSource`] implements it over a
//! single Tiberius TDS connection.

use async_trait::async_trait;
use md5::{Digest, Md5};
use tiberius::{Client, Config, Query, Row};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionTestResult;
use crate::error::{MigrateError, Result};
use crate::schema::{Column, ForeignKey, Index, SqlObject, SqlObjectKind, Table};
use crate::value::{SqlNullType, SqlValue};

/// Batch size used when the checksum fallback streams rows client-side.
const CHECKSUM_FALLBACK_BATCH: i64 = 10_000;

/// A table-level checksum computed on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChecksum {
    /// Hex-encoded digest.
    pub digest: String,
    /// Whether the client-side fallback produced it. Fallback digests are
    /// self-consistent but not comparable to the target's composite-row hash.
    pub fallback: bool,
}

/// Reads schema and data from the source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// All user tables with schema, name, and approximate row count only.
    async fn list_tables(&self) -> Result<Vec<Table>>;

    /// Full metadata for one table: columns, primary key, foreign keys,
    /// indexes, and an exact row count (-1 when the count fails).
    async fn describe_table(&self, schema: &str, name: &str) -> Result<Table>;

    /// Enumerate programmable objects of one kind.
    async fn list_objects(&self, kind: SqlObjectKind) -> Result<Vec<SqlObject>>;

    /// Read one ordered page of rows.
    async fn read_batch(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        order_by: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>>;

    /// Exact row count.
    async fn count_rows(&self, schema: &str, name: &str) -> Result<i64>;

    /// Table-level content checksum over the given columns, ordered by
    /// `order_by`.
    async fn table_checksum(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        order_by: &str,
    ) -> Result<SourceChecksum>;

    /// First `limit` key tuples in key order.
    async fn sample_keys(
        &self,
        schema: &str,
        name: &str,
        key_columns: &[Column],
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>>;

    /// Fetch a single row by key equality.
    async fn fetch_row(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        key_columns: &[Column],
        key: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>>;

    /// Release the connection.
    async fn close(&self);
}

type TdsClient = Client<Compat<TcpStream>>;

/// MSSQL source reader over a single TDS connection.
pub struct MssqlSource {
    client: Mutex<Option<TdsClient>>,
}

impl MssqlSource {
    /// Connect using an ADO.NET-style connection string, overriding the
    /// database when one is given.
    pub async fn connect(conn_str: &str, database: &str) -> Result<Self> {
        let mut config = Config::from_ado_string(conn_str)?;
        if !database.is_empty() {
            config.database(database);
        }

        let client = Self::open(config).await?;
        info!("Connected to MSSQL source");
        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    /// Test a connection string: server version plus the visible databases.
    pub async fn test(conn_str: &str) -> ConnectionTestResult {
        let config = match Config::from_ado_string(conn_str) {
            Ok(c) => c,
            Err(e) => {
                return ConnectionTestResult::failure(format!("Invalid connection string: {}", e))
            }
        };

        let mut client = match Self::open(config).await {
            Ok(c) => c,
            Err(e) => return ConnectionTestResult::failure(format!("Failed to connect: {}", e)),
        };

        let version = match client.simple_query("SELECT @@VERSION").await {
            Ok(stream) => match stream.into_row().await {
                Ok(Some(row)) => row.get::<&str, _>(0).unwrap_or_default().to_string(),
                _ => String::new(),
            },
            Err(e) => {
                return ConnectionTestResult::failure(format!(
                    "Failed to get server version: {}",
                    e
                ))
            }
        };
        // @@VERSION is multi-line; keep the product line
        let server_version = version.lines().next().unwrap_or_default().trim().to_string();

        let mut databases = Vec::new();
        match client
            .simple_query("SELECT name FROM sys.databases WHERE state = 0 ORDER BY name")
            .await
        {
            Ok(stream) => {
                if let Ok(rows) = stream.into_first_result().await {
                    for row in rows {
                        if let Some(name) = row.get::<&str, _>(0) {
                            databases.push(name.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                return ConnectionTestResult::failure(format!("Failed to list databases: {}", e))
            }
        }

        ConnectionTestResult {
            success: true,
            message: "Connection successful".into(),
            server_version,
            databases,
        }
    }

    async fn open(config: Config) -> Result<TdsClient> {
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| MigrateError::pool(e, "connecting to MSSQL host"))?;
        tcp.set_nodelay(true).ok();
        Ok(Client::connect(config, tcp.compat_write()).await?)
    }

    async fn lock_client(&self) -> Result<MutexGuard<'_, Option<TdsClient>>> {
        let guard = self.client.lock().await;
        if guard.is_none() {
            return Err(MigrateError::pool("connection closed", "MSSQL source"));
        }
        Ok(guard)
    }

    async fn query_single_i64(&self, sql: &str) -> Result<Option<i64>> {
        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let stream = client.simple_query(sql).await?;
        let row = stream.into_row().await?;
        Ok(row.and_then(|r| r.get::<i64, _>(0)))
    }

    /// Run a two-parameter (schema, table) catalog query.
    async fn catalog_query(&self, sql: &'static str, schema: &str, name: &str) -> Result<Vec<Row>> {
        let schema = schema.to_string();
        let name = name.to_string();
        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let mut query = Query::new(sql);
        query.bind(&schema);
        query.bind(&name);
        let rows = query.query(client).await?.into_first_result().await?;
        Ok(rows)
    }

    async fn load_columns(&self, schema: &str, name: &str) -> Result<Vec<Column>> {
        let sql = r#"
            SELECT
                c.name,
                t.name,
                CAST(c.max_length AS INT),
                CAST(c.precision AS INT),
                CAST(c.scale AS INT),
                c.is_nullable,
                c.is_identity,
                dc.definition
            FROM sys.columns c
            INNER JOIN sys.types t ON c.user_type_id = t.user_type_id
            INNER JOIN sys.tables tb ON c.object_id = tb.object_id
            INNER JOIN sys.schemas s ON tb.schema_id = s.schema_id
            LEFT JOIN sys.default_constraints dc ON c.default_object_id = dc.object_id
            WHERE s.name = @P1 AND tb.name = @P2
            ORDER BY c.column_id
        "#;

        let rows = self.catalog_query(sql, schema, name).await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let mut column = Column {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                data_type: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                max_length: row.get::<i32, _>(2).unwrap_or(0),
                precision: row.get::<i32, _>(3).unwrap_or(0),
                scale: row.get::<i32, _>(4).unwrap_or(0),
                is_nullable: row.get::<bool, _>(5).unwrap_or(true),
                is_identity: row.get::<bool, _>(6).unwrap_or(false),
                default_value: row.get::<&str, _>(7).map(str::to_string),
                is_primary_key: false,
            };
            // (n)varchar(max) and friends report -1 through the catalog
            if column.max_length < -1 {
                column.max_length = -1;
            }
            columns.push(column);
        }
        Ok(columns)
    }

    async fn load_primary_key(&self, schema: &str, name: &str) -> Result<Vec<String>> {
        let sql = r#"
            SELECT col.name
            FROM sys.indexes idx
            INNER JOIN sys.index_columns ic
                ON idx.object_id = ic.object_id AND idx.index_id = ic.index_id
            INNER JOIN sys.columns col
                ON ic.object_id = col.object_id AND ic.column_id = col.column_id
            INNER JOIN sys.tables t ON idx.object_id = t.object_id
            INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE idx.is_primary_key = 1 AND s.name = @P1 AND t.name = @P2
            ORDER BY ic.key_ordinal
        "#;

        let rows = self.catalog_query(sql, schema, name).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get::<&str, _>(0).map(str::to_string))
            .collect())
    }

    async fn load_foreign_keys(&self, schema: &str, name: &str) -> Result<Vec<ForeignKey>> {
        let sql = r#"
            SELECT
                fk.name,
                COL_NAME(fkc.parent_object_id, fkc.parent_column_id),
                OBJECT_SCHEMA_NAME(fk.referenced_object_id),
                OBJECT_NAME(fk.referenced_object_id),
                COL_NAME(fkc.referenced_object_id, fkc.referenced_column_id),
                fk.delete_referential_action_desc,
                fk.update_referential_action_desc
            FROM sys.foreign_keys fk
            INNER JOIN sys.foreign_key_columns fkc
                ON fk.object_id = fkc.constraint_object_id
            INNER JOIN sys.tables t ON fk.parent_object_id = t.object_id
            INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2
            ORDER BY fk.name, fkc.constraint_column_id
        "#;

        let rows = self.catalog_query(sql, schema, name).await?;
        let mut fks: Vec<ForeignKey> = Vec::new();
        for row in rows {
            let fk_name = row.get::<&str, _>(0).unwrap_or_default().to_string();
            let col = row.get::<&str, _>(1).unwrap_or_default().to_string();
            let ref_col = row.get::<&str, _>(4).unwrap_or_default().to_string();

            match fks.last_mut() {
                Some(last) if last.name == fk_name => {
                    last.columns.push(col);
                    last.referenced_columns.push(ref_col);
                }
                _ => fks.push(ForeignKey {
                    name: fk_name,
                    columns: vec![col],
                    referenced_schema: row.get::<&str, _>(2).unwrap_or_default().to_string(),
                    referenced_table: row.get::<&str, _>(3).unwrap_or_default().to_string(),
                    referenced_columns: vec![ref_col],
                    on_delete: row.get::<&str, _>(5).unwrap_or_default().to_string(),
                    on_update: row.get::<&str, _>(6).unwrap_or_default().to_string(),
                }),
            }
        }
        Ok(fks)
    }

    async fn load_indexes(&self, schema: &str, name: &str) -> Result<Vec<Index>> {
        let sql = r#"
            SELECT idx.name, col.name, idx.is_unique, idx.type_desc
            FROM sys.indexes idx
            INNER JOIN sys.index_columns ic
                ON idx.object_id = ic.object_id AND idx.index_id = ic.index_id
            INNER JOIN sys.columns col
                ON ic.object_id = col.object_id AND ic.column_id = col.column_id
            INNER JOIN sys.tables t ON idx.object_id = t.object_id
            INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE idx.is_primary_key = 0 AND idx.type > 0
                AND s.name = @P1 AND t.name = @P2
            ORDER BY idx.name, ic.key_ordinal
        "#;

        let rows = self.catalog_query(sql, schema, name).await?;
        let mut indexes: Vec<Index> = Vec::new();
        for row in rows {
            let idx_name = row.get::<&str, _>(0).unwrap_or_default().to_string();
            let col = row.get::<&str, _>(1).unwrap_or_default().to_string();

            match indexes.last_mut() {
                Some(last) if last.name == idx_name => last.columns.push(col),
                _ => indexes.push(Index {
                    name: idx_name,
                    columns: vec![col],
                    is_unique: row.get::<bool, _>(2).unwrap_or(false),
                    is_clustered: row.get::<&str, _>(3) == Some("CLUSTERED"),
                }),
            }
        }
        Ok(indexes)
    }

    /// Stream all rows in order and hash their textual form with MD5.
    ///
    /// Self-consistent only; the digest is not comparable to the target's
    /// composite-row hash, which the validator accounts for.
    async fn checksum_fallback(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        order_by: &str,
    ) -> Result<String> {
        let mut hasher = Md5::new();
        let mut offset = 0i64;

        loop {
            let rows = self
                .read_batch(schema, name, columns, order_by, offset, CHECKSUM_FALLBACK_BATCH)
                .await?;
            if rows.is_empty() {
                break;
            }
            offset += rows.len() as i64;

            for row in &rows {
                let line: Vec<String> = row
                    .iter()
                    .map(|v| v.to_text().unwrap_or_else(|| "NULL".into()))
                    .collect();
                hasher.update(line.join("|"));
                hasher.update(b"\n");
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl SourceReader for MssqlSource {
    async fn list_tables(&self) -> Result<Vec<Table>> {
        let sql = r#"
            SELECT s.name, t.name, CAST(SUM(p.rows) AS BIGINT)
            FROM sys.tables t
            INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
            INNER JOIN sys.partitions p
                ON t.object_id = p.object_id AND p.index_id IN (0, 1)
            WHERE t.type = 'U'
            GROUP BY s.name, t.name
            ORDER BY s.name, t.name
        "#;

        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let rows = client
            .simple_query(sql)
            .await
            .map_err(|e| MigrateError::SchemaIntrospection(format!("listing tables: {}", e)))?
            .into_first_result()
            .await
            .map_err(|e| MigrateError::SchemaIntrospection(format!("listing tables: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| Table {
                schema: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                name: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                row_count: row.get::<i64, _>(2).unwrap_or(0),
                ..Default::default()
            })
            .collect())
    }

    async fn describe_table(&self, schema: &str, name: &str) -> Result<Table> {
        let mut table = Table {
            schema: schema.to_string(),
            name: name.to_string(),
            ..Default::default()
        };

        table.columns = self.load_columns(schema, name).await.map_err(|e| {
            MigrateError::SchemaIntrospection(format!("columns of {}.{}: {}", schema, name, e))
        })?;
        table.primary_key = self.load_primary_key(schema, name).await.map_err(|e| {
            MigrateError::SchemaIntrospection(format!("primary key of {}.{}: {}", schema, name, e))
        })?;
        for col in &mut table.columns {
            col.is_primary_key = table.primary_key.contains(&col.name);
        }
        table.foreign_keys = self.load_foreign_keys(schema, name).await.map_err(|e| {
            MigrateError::SchemaIntrospection(format!("foreign keys of {}.{}: {}", schema, name, e))
        })?;
        table.indexes = self.load_indexes(schema, name).await.map_err(|e| {
            MigrateError::SchemaIntrospection(format!("indexes of {}.{}: {}", schema, name, e))
        })?;

        // A count failure is non-fatal; -1 marks the total as unknown
        let count_sql = format!(
            "SELECT COUNT_BIG(*) FROM {}.{}",
            quote_ident(schema),
            quote_ident(name)
        );
        table.row_count = match self.query_single_i64(&count_sql).await {
            Ok(Some(n)) => n,
            Ok(None) => -1,
            Err(e) => {
                warn!("Row count failed for {}.{}: {}", schema, name, e);
                -1
            }
        };

        debug!(
            "Described {} ({} columns, {} rows)",
            table.full_name(),
            table.columns.len(),
            table.row_count
        );
        Ok(table)
    }

    async fn list_objects(&self, kind: SqlObjectKind) -> Result<Vec<SqlObject>> {
        let sql = match kind {
            SqlObjectKind::View => {
                r#"
                SELECT s.name, v.name, m.definition
                FROM sys.views v
                INNER JOIN sys.schemas s ON v.schema_id = s.schema_id
                INNER JOIN sys.sql_modules m ON v.object_id = m.object_id
                ORDER BY s.name, v.name
            "#
            }
            SqlObjectKind::Procedure => {
                r#"
                SELECT s.name, p.name, m.definition
                FROM sys.procedures p
                INNER JOIN sys.schemas s ON p.schema_id = s.schema_id
                INNER JOIN sys.sql_modules m ON p.object_id = m.object_id
                ORDER BY s.name, p.name
            "#
            }
            SqlObjectKind::Function => {
                r#"
                SELECT s.name, o.name, m.definition
                FROM sys.objects o
                INNER JOIN sys.schemas s ON o.schema_id = s.schema_id
                INNER JOIN sys.sql_modules m ON o.object_id = m.object_id
                WHERE o.type IN ('FN', 'IF', 'TF')
                ORDER BY s.name, o.name
            "#
            }
            SqlObjectKind::Trigger => {
                r#"
                SELECT s.name, tr.name, m.definition
                FROM sys.triggers tr
                INNER JOIN sys.sql_modules m ON tr.object_id = m.object_id
                INNER JOIN sys.tables t ON tr.parent_id = t.object_id
                INNER JOIN sys.schemas s ON t.schema_id = s.schema_id
                WHERE tr.type = 'TR'
                ORDER BY s.name, tr.name
            "#
            }
        };

        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let rows = client
            .simple_query(sql)
            .await
            .map_err(|e| {
                MigrateError::SchemaIntrospection(format!(
                    "listing {}s: {}",
                    kind.noun().to_lowercase(),
                    e
                ))
            })?
            .into_first_result()
            .await
            .map_err(|e| {
                MigrateError::SchemaIntrospection(format!(
                    "listing {}s: {}",
                    kind.noun().to_lowercase(),
                    e
                ))
            })?;

        Ok(rows
            .iter()
            .map(|row| SqlObject {
                schema: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                name: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                kind,
                definition: row.get::<&str, _>(2).map(str::to_string),
            })
            .collect())
    }

    async fn read_batch(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        order_by: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let sql = format!(
            "SELECT {} FROM {}.{} ORDER BY {} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            col_list.join(", "),
            quote_ident(schema),
            quote_ident(name),
            quote_ident(order_by),
            offset,
            limit
        );
        let table = format!("{}.{}", schema, name);

        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let rows = client
            .simple_query(&sql)
            .await
            .map_err(|e| MigrateError::batch_read(&table, offset, e))?
            .into_first_result()
            .await
            .map_err(|e| MigrateError::batch_read(&table, offset, e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                values.push(convert_row_value(row, idx, &column.data_type));
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn count_rows(&self, schema: &str, name: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT_BIG(*) FROM {}.{}",
            quote_ident(schema),
            quote_ident(name)
        );
        Ok(self.query_single_i64(&sql).await?.unwrap_or(0))
    }

    async fn table_checksum(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        order_by: &str,
    ) -> Result<SourceChecksum> {
        // Per-row MD5 over the concatenated textual values, aggregated in
        // order, SHA-256 over the aggregate. Mirrors the target's shape.
        let col_list: Vec<String> = columns
            .iter()
            .map(|c| format!("ISNULL(CAST({} AS NVARCHAR(MAX)), '')", quote_ident(&c.name)))
            .collect();
        let sql = format!(
            "SELECT HASHBYTES('SHA2_256', STRING_AGG(LOWER(CONVERT(VARCHAR(32), \
             HASHBYTES('MD5', CONCAT({})), 2)), ',') WITHIN GROUP (ORDER BY {})) \
             FROM {}.{}",
            col_list.join(", '+', "),
            quote_ident(order_by),
            quote_ident(schema),
            quote_ident(name)
        );

        let aggregated = {
            let mut guard = self.lock_client().await?;
            let client = guard.as_mut().expect("checked by lock_client");
            let result = match client.simple_query(&sql).await {
                Ok(stream) => match stream.into_row().await {
                    Ok(row) => Ok(row.and_then(|r| r.get::<&[u8], _>(0).map(hex::encode))),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            result
        };

        match aggregated {
            Ok(Some(digest)) => Ok(SourceChecksum {
                digest,
                fallback: false,
            }),
            Ok(None) => Ok(SourceChecksum {
                digest: String::new(),
                fallback: false,
            }),
            Err(e) => {
                // STRING_AGG/HASHBYTES may be unavailable on older servers
                debug!(
                    "Aggregated checksum unavailable for {}.{} ({}); streaming fallback",
                    schema, name, e
                );
                let digest = self
                    .checksum_fallback(schema, name, columns, order_by)
                    .await?;
                Ok(SourceChecksum {
                    digest,
                    fallback: true,
                })
            }
        }
    }

    async fn sample_keys(
        &self,
        schema: &str,
        name: &str,
        key_columns: &[Column],
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let col_list: Vec<String> = key_columns.iter().map(|c| quote_ident(&c.name)).collect();
        let sql = format!(
            "SELECT TOP {} {} FROM {}.{} ORDER BY {}",
            limit,
            col_list.join(", "),
            quote_ident(schema),
            quote_ident(name),
            col_list[0]
        );

        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let rows = client.simple_query(&sql).await?.into_first_result().await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(key_columns.len());
            for (idx, column) in key_columns.iter().enumerate() {
                values.push(convert_row_value(row, idx, &column.data_type));
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn fetch_row(
        &self,
        schema: &str,
        name: &str,
        columns: &[Column],
        key_columns: &[Column],
        key: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>> {
        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let where_parts: Vec<String> = key_columns
            .iter()
            .zip(key)
            .map(|(c, v)| format!("{} = {}", quote_ident(&c.name), v.to_mssql_literal()))
            .collect();
        let sql = format!(
            "SELECT {} FROM {}.{} WHERE {}",
            col_list.join(", "),
            quote_ident(schema),
            quote_ident(name),
            where_parts.join(" AND ")
        );

        let mut guard = self.lock_client().await?;
        let client = guard.as_mut().expect("checked by lock_client");
        let row = client.simple_query(&sql).await?.into_row().await?;
        Ok(row.map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, column)| convert_row_value(&row, idx, &column.data_type))
                .collect()
        }))
    }

    async fn close(&self) {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            debug!("Closed MSSQL source connection");
        }
    }
}

/// Quote an MSSQL identifier, doubling embedded closing brackets.
fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Convert one cell from a TDS row into a [`SqlValue`] using the declared
/// column type.
fn convert_row_value(row: &Row, idx: usize, data_type: &str) -> SqlValue {
    match data_type.to_lowercase().as_str() {
        "bit" => row
            .get::<bool, _>(idx)
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "tinyint" => row
            .get::<u8, _>(idx)
            .map(|v| SqlValue::I16(v as i16))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "smallint" => row
            .get::<i16, _>(idx)
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int" => row
            .get::<i32, _>(idx)
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "bigint" => row
            .get::<i64, _>(idx)
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "real" => row
            .get::<f32, _>(idx)
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float" => row
            .get::<f64, _>(idx)
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "uniqueidentifier" => row
            .get::<Uuid, _>(idx)
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "datetime" | "datetime2" | "smalldatetime" => row
            .get::<chrono::NaiveDateTime, _>(idx)
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "datetimeoffset" => row
            .get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|dt| SqlValue::DateTimeOffset(dt.fixed_offset()))
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .get::<chrono::NaiveDate, _>(idx)
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .get::<chrono::NaiveTime, _>(idx)
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => row
            .get::<&[u8], _>(idx)
            .map(|v| SqlValue::Bytes(v.to_vec()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        "decimal" | "numeric" | "money" | "smallmoney" => row
            .get::<rust_decimal::Decimal, _>(idx)
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        _ => row
            .get::<&str, _>(idx)
            .map(|s| SqlValue::Text(s.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    }
}
