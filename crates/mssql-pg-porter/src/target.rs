//! Target writer abstraction and the PostgreSQL implementation.
//!
//! [`PgTarget`] holds a deadpool connection pool for the duration of a run
//! and streams rows through the binary COPY protocol.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::Timelike;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::SinkExt;
use rustls::ClientConfig;
use tokio_postgres::config::SslMode;
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::config::ConnectionTestResult;
use crate::convert::quote_ident;
use crate::error::{MigrateError, Result};
use crate::value::{SqlNullType, SqlValue};

/// Writes schema and data to the target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Create a schema if it doesn't exist.
    async fn create_schema(&self, schema: &str) -> Result<()>;

    /// Execute a single DDL statement.
    async fn execute_ddl(&self, ddl: &str) -> Result<()>;

    /// Execute DDL statements inside one transaction, rolling back on the
    /// first failure.
    async fn execute_ddl_batch(&self, statements: &[String]) -> Result<()>;

    /// Stream rows into a table. Returns the number of rows written.
    async fn bulk_copy(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64>;

    /// Disable all triggers on a table.
    async fn disable_triggers(&self, schema: &str, table: &str) -> Result<()>;

    /// Re-enable all triggers on a table.
    async fn enable_triggers(&self, schema: &str, table: &str) -> Result<()>;

    /// Disable FK enforcement for this session (replication role).
    async fn disable_fk_checks(&self) -> Result<()>;

    /// Restore FK enforcement for this session.
    async fn enable_fk_checks(&self) -> Result<()>;

    /// Set a column's identity sequence to MAX(column), or 1 when empty.
    async fn sync_sequence(&self, schema: &str, table: &str, column: &str) -> Result<()>;

    /// Drop a table and its dependents if it exists.
    async fn drop_table_if_exists(&self, schema: &str, table: &str) -> Result<()>;

    /// Check whether a table exists.
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Exact row count.
    async fn row_count(&self, schema: &str, table: &str) -> Result<i64>;

    /// Table-level content checksum: per-row MD5 of the composite-row text,
    /// aggregated in `order_by` order, SHA-256 over the aggregate,
    /// hex-encoded. Empty tables yield the empty string.
    async fn table_checksum(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        order_by: &str,
    ) -> Result<String>;

    /// First `limit` rows in `order_by` order.
    async fn sample_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        order_by: &str,
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>>;

    /// Fetch a single row by key equality.
    async fn fetch_row(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        key: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>>;

    /// Release the connection pool.
    async fn close(&self);
}

/// PostgreSQL target writer over a deadpool connection pool.
pub struct PgTarget {
    pool: Pool,
}

impl PgTarget {
    /// Connect using a libpq-style connection string or URL, overriding the
    /// database when one is given.
    pub async fn connect(conn_str: &str, database: &str) -> Result<Self> {
        let mut pg_config = PgConfig::from_str(conn_str)?;
        if !database.is_empty() {
            pg_config.dbname(database);
        }
        pg_config.application_name("mssql-pg-porter");

        let pool = Self::build_pool(pg_config)?;

        // Fail fast when the server is unreachable
        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!("Connected to PostgreSQL target");
        Ok(Self { pool })
    }

    /// Test a connection string: server version plus the visible databases.
    pub async fn test(conn_str: &str) -> ConnectionTestResult {
        let pg_config = match PgConfig::from_str(conn_str) {
            Ok(c) => c,
            Err(e) => {
                return ConnectionTestResult::failure(format!("Invalid connection string: {}", e))
            }
        };

        let pool = match Self::build_pool(pg_config) {
            Ok(p) => p,
            Err(e) => return ConnectionTestResult::failure(e.to_string()),
        };
        let client = match pool.get().await {
            Ok(c) => c,
            Err(e) => return ConnectionTestResult::failure(format!("Failed to connect: {}", e)),
        };

        let server_version = match client.query_one("SELECT version()", &[]).await {
            Ok(row) => row.get::<_, String>(0),
            Err(e) => {
                return ConnectionTestResult::failure(format!(
                    "Failed to get server version: {}",
                    e
                ))
            }
        };

        let databases = match client
            .query(
                "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
                &[],
            )
            .await
        {
            Ok(rows) => rows.iter().map(|r| r.get::<_, String>(0)).collect(),
            Err(e) => {
                return ConnectionTestResult::failure(format!("Failed to list databases: {}", e))
            }
        };

        ConnectionTestResult {
            success: true,
            message: "Connection successful".into(),
            server_version,
            databases,
        }
    }

    fn build_pool(pg_config: PgConfig) -> Result<Pool> {
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match pg_config.get_ssl_mode() {
            SslMode::Disable => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr).max_size(4).build()
            }
            _ => {
                warn!("PostgreSQL TLS enabled without certificate verification");
                let tls_config = ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth();
                let connector = MakeRustlsConnect::new(tls_config);
                let mgr = Manager::from_config(pg_config, connector, mgr_config);
                Pool::builder(mgr).max_size(4).build()
            }
        };

        pool.map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting PostgreSQL connection"))
    }

    fn qualify(schema: &str, table: &str) -> String {
        format!("{}.{}", quote_ident(schema), quote_ident(table))
    }
}

#[async_trait]
impl TargetWriter for PgTarget {
    async fn create_schema(&self, schema: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
        client.execute(&sql, &[]).await?;
        debug!("Ensured schema '{}'", schema);
        Ok(())
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<()> {
        let client = self.client().await?;
        client.execute(ddl, &[]).await?;
        Ok(())
    }

    async fn execute_ddl_batch(&self, statements: &[String]) -> Result<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        for stmt in statements {
            tx.execute(stmt.as_str(), &[])
                .await
                .map_err(|e| MigrateError::ddl(stmt.clone(), e))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn bulk_copy(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let client = self.client().await?;
        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT BINARY)",
            Self::qualify(schema, table),
            col_list.join(", ")
        );

        let sink = client
            .copy_in::<_, bytes::Bytes>(&copy_sql)
            .await
            .map_err(|e| MigrateError::batch_write(table, format!("initiating COPY: {}", e)))?;
        tokio::pin!(sink);

        let buf = encode_copy_buffer(rows);
        sink.send(buf.freeze())
            .await
            .map_err(|e| MigrateError::batch_write(table, format!("sending COPY data: {}", e)))?;
        let written = sink
            .finish()
            .await
            .map_err(|e| MigrateError::batch_write(table, format!("finishing COPY: {}", e)))?;

        Ok(written)
    }

    async fn disable_triggers(&self, schema: &str, table: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "ALTER TABLE {} DISABLE TRIGGER ALL",
            Self::qualify(schema, table)
        );
        client.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn enable_triggers(&self, schema: &str, table: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "ALTER TABLE {} ENABLE TRIGGER ALL",
            Self::qualify(schema, table)
        );
        client.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn disable_fk_checks(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("SET session_replication_role = 'replica'", &[])
            .await?;
        Ok(())
    }

    async fn enable_fk_checks(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("SET session_replication_role = 'origin'", &[])
            .await?;
        Ok(())
    }

    async fn sync_sequence(&self, schema: &str, table: &str, column: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT setval(pg_get_serial_sequence('{}.{}', '{}'), \
             COALESCE((SELECT MAX({}) FROM {}), 1))",
            schema.replace('\'', "''"),
            table.replace('\'', "''"),
            column.replace('\'', "''"),
            quote_ident(column),
            Self::qualify(schema, table)
        );
        client.execute(&sql, &[]).await?;
        debug!("Synced sequence for {}.{}.{}", schema, table, column);
        Ok(())
    }

    async fn drop_table_if_exists(&self, schema: &str, table: &str) -> Result<()> {
        let client = self.client().await?;
        let sql = format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            Self::qualify(schema, table)
        );
        client.execute(&sql, &[]).await?;
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let sql = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
        "#;
        let row = client.query_one(sql, &[&schema, &table]).await?;
        Ok(row.get::<_, bool>(0))
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", Self::qualify(schema, table));
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, i64>(0))
    }

    async fn table_checksum(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        order_by: &str,
    ) -> Result<String> {
        let client = self.client().await?;
        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "SELECT COALESCE(ENCODE(SHA256(STRING_AGG(MD5(ROW({})::TEXT)::TEXT, \
             ',' ORDER BY {})::BYTEA), 'hex'), '')\nFROM {}",
            col_list.join(", "),
            quote_ident(order_by),
            Self::qualify(schema, table)
        );
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, String>(0))
    }

    async fn sample_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        order_by: &str,
        limit: i64,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let client = self.client().await?;
        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT {}",
            col_list.join(", "),
            Self::qualify(schema, table),
            quote_ident(order_by),
            limit
        );
        let rows = client.query(&sql, &[]).await?;
        rows.iter().map(convert_pg_row).collect()
    }

    async fn fetch_row(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        key: &[SqlValue],
    ) -> Result<Option<Vec<SqlValue>>> {
        let client = self.client().await?;
        let col_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let where_parts: Vec<String> = key_columns
            .iter()
            .zip(key)
            .map(|(c, v)| format!("{} = {}", quote_ident(c), v.to_pg_literal()))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            col_list.join(", "),
            Self::qualify(schema, table),
            where_parts.join(" AND ")
        );
        match client.query_opt(&sql, &[]).await? {
            Some(row) => Ok(Some(convert_pg_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        self.pool.close();
        debug!("Closed PostgreSQL target pool");
    }
}

/// Encode rows into a PostgreSQL binary COPY payload (header, tuples,
/// trailer).
fn encode_copy_buffer(rows: &[Vec<SqlValue>]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(rows.len() * 128 + 32);

    buf.put_slice(b"PGCOPY\n\xff\r\n\0");
    buf.put_i32(0); // flags
    buf.put_i32(0); // extension area length

    for row in rows {
        buf.put_i16(row.len() as i16);
        for value in row {
            write_binary_value(&mut buf, value);
        }
    }

    buf.put_i16(-1);
    buf
}

fn write_binary_value(buf: &mut BytesMut, value: &SqlValue) {
    match value {
        SqlValue::Null(_) => buf.put_i32(-1),
        SqlValue::Bool(v) => {
            buf.put_i32(1);
            buf.put_u8(u8::from(*v));
        }
        SqlValue::I16(v) => {
            buf.put_i32(2);
            buf.put_i16(*v);
        }
        SqlValue::I32(v) => {
            buf.put_i32(4);
            buf.put_i32(*v);
        }
        SqlValue::I64(v) => {
            buf.put_i32(8);
            buf.put_i64(*v);
        }
        SqlValue::F32(v) => {
            buf.put_i32(4);
            buf.put_f32(*v);
        }
        SqlValue::F64(v) => {
            buf.put_i32(8);
            buf.put_f64(*v);
        }
        SqlValue::Text(v) => {
            buf.put_i32(v.len() as i32);
            buf.put_slice(v.as_bytes());
        }
        SqlValue::Bytes(v) => {
            buf.put_i32(v.len() as i32);
            buf.put_slice(v);
        }
        SqlValue::Uuid(v) => {
            buf.put_i32(16);
            buf.put_slice(v.as_bytes());
        }
        SqlValue::Decimal(v) => encode_decimal_binary(buf, v),
        SqlValue::DateTime(v) => {
            buf.put_i32(8);
            buf.put_i64(micros_since_pg_epoch(v));
        }
        SqlValue::DateTimeOffset(v) => {
            buf.put_i32(8);
            buf.put_i64(micros_since_pg_epoch(&v.naive_utc()));
        }
        SqlValue::Date(v) => {
            let epoch = pg_epoch_date();
            buf.put_i32(4);
            buf.put_i32((*v - epoch).num_days() as i32);
        }
        SqlValue::Time(v) => {
            let micros =
                v.num_seconds_from_midnight() as i64 * 1_000_000 + (v.nanosecond() / 1000) as i64;
            buf.put_i32(8);
            buf.put_i64(micros);
        }
    }
}

fn pg_epoch_date() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid epoch date")
}

/// Microseconds since 2000-01-01, the PostgreSQL timestamp epoch.
fn micros_since_pg_epoch(dt: &chrono::NaiveDateTime) -> i64 {
    let epoch = pg_epoch_date().and_hms_opt(0, 0, 0).expect("valid epoch");
    (*dt - epoch).num_microseconds().unwrap_or(0)
}

/// Encode a Decimal into PostgreSQL binary NUMERIC format: ndigits,
/// weight, sign, dscale, then base-10000 digits.
fn encode_decimal_binary(buf: &mut BytesMut, d: &rust_decimal::Decimal) {
    const NUMERIC_POS: i16 = 0x0000;
    const NUMERIC_NEG: i16 = 0x4000;

    if d.is_zero() {
        buf.put_i32(8);
        buf.put_i16(0); // ndigits
        buf.put_i16(0); // weight
        buf.put_i16(NUMERIC_POS);
        buf.put_i16(d.scale() as i16);
        return;
    }

    let sign = if d.is_sign_negative() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };
    let dscale = d.scale() as i16;

    // Work from the string form so 0.01 groups as "0100", not "1"
    let abs_str = d.abs().to_string();
    let (int_part, frac_part) = match abs_str.find('.') {
        Some(dot) => (&abs_str[..dot], &abs_str[dot + 1..]),
        None => (abs_str.as_str(), ""),
    };

    // Integer part groups right-to-left from the decimal point
    let mut int_digits: Vec<i16> = Vec::new();
    let int_trimmed = int_part.trim_start_matches('0');
    if !int_trimmed.is_empty() {
        let padded_len = int_trimmed.len().div_ceil(4) * 4;
        let padded = format!("{:0>width$}", int_trimmed, width = padded_len);
        for chunk in padded.as_bytes().chunks(4) {
            let s = std::str::from_utf8(chunk).expect("digits are ascii");
            int_digits.push(s.parse::<i16>().expect("4 decimal digits"));
        }
    }

    // Fractional part groups left-to-right from the decimal point
    let mut frac_digits: Vec<i16> = Vec::new();
    if !frac_part.is_empty() {
        let padded_len = frac_part.len().div_ceil(4) * 4;
        let mut padded = frac_part.to_string();
        while padded.len() < padded_len {
            padded.push('0');
        }
        for chunk in padded.as_bytes().chunks(4) {
            let s = std::str::from_utf8(chunk).expect("digits are ascii");
            frac_digits.push(s.parse::<i16>().expect("4 decimal digits"));
        }
    }

    let weight = if !int_digits.is_empty() {
        int_digits.len() as i16 - 1
    } else {
        // All-fractional: count leading zero groups (0.0001 -> weight -1)
        let leading_zero_groups = frac_digits.iter().take_while(|&&d| d == 0).count() as i16;
        -(leading_zero_groups + 1)
    };

    let mut digits: Vec<i16> = int_digits;
    digits.extend(frac_digits);

    while digits.len() > 1 && *digits.last().expect("non-empty") == 0 {
        digits.pop();
    }
    while digits.len() > 1 && digits[0] == 0 {
        digits.remove(0);
    }

    let ndigits = digits.len() as i16;
    buf.put_i32(8 + i32::from(ndigits) * 2);
    buf.put_i16(ndigits);
    buf.put_i16(weight);
    buf.put_i16(sign);
    buf.put_i16(dscale);
    for digit in digits {
        buf.put_i16(digit);
    }
}

/// Convert a PostgreSQL row into [`SqlValue`]s using the column types the
/// server reported.
fn convert_pg_row(row: &tokio_postgres::Row) -> Result<Vec<SqlValue>> {
    use tokio_postgres::types::Type;

    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::Bool), SqlValue::Bool),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::I16), SqlValue::I16),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::I32), SqlValue::I32),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::I64), SqlValue::I64),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::F32), SqlValue::F32),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::F64), SqlValue::F64),
            Type::NUMERIC => row
                .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::Decimal), SqlValue::Decimal),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::Bytes), SqlValue::Bytes),
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::Uuid), SqlValue::Uuid),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::DateTime), SqlValue::DateTime),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::DateTimeOffset), |dt| {
                    SqlValue::DateTimeOffset(dt.fixed_offset())
                }),
            Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::Date), SqlValue::Date),
            Type::TIME => row
                .try_get::<_, Option<chrono::NaiveTime>>(idx)?
                .map_or(SqlValue::Null(SqlNullType::Time), SqlValue::Time),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .unwrap_or(None)
                .map_or(SqlValue::Null(SqlNullType::String), SqlValue::Text),
        };
        values.push(value);
    }
    Ok(values)
}

/// Accept any server certificate. sslmode=require semantics: the channel
/// is encrypted but the peer is not authenticated.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
