//! SQL value types for database-agnostic row transfer.
//!
//! Rows read from the source are materialized into [`SqlValue`] vectors,
//! streamed through the target's bulk-copy encoder, and rendered textually
//! for validation comparisons.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values so binary protocols can emit the right wire
/// format for the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// An owned SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with a type hint for wire encoding.
    Null(SqlNullType),

    /// Boolean (bit).
    Bool(bool),

    /// 16-bit signed integer (smallint, widened tinyint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real).
    F32(f32),

    /// 64-bit floating point (float).
    F64(f64),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID.
    Uuid(Uuid),

    /// Arbitrary-precision decimal.
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the type hint for this value.
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Canonical textual form used for validation comparison and the
    /// checksum fallback. Returns None for NULL.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null(_) => None,
            SqlValue::Bool(v) => Some(if *v { "true".into() } else { "false".into() }),
            SqlValue::I16(v) => Some(v.to_string()),
            SqlValue::I32(v) => Some(v.to_string()),
            SqlValue::I64(v) => Some(v.to_string()),
            SqlValue::F32(v) => Some(v.to_string()),
            SqlValue::F64(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
            SqlValue::Bytes(v) => Some(hex::encode(v)),
            SqlValue::Uuid(v) => Some(v.to_string()),
            SqlValue::Decimal(v) => Some(v.to_string()),
            SqlValue::DateTime(v) => Some(v.to_string()),
            SqlValue::DateTimeOffset(v) => Some(v.to_rfc3339()),
            SqlValue::Date(v) => Some(v.to_string()),
            SqlValue::Time(v) => Some(v.to_string()),
        }
    }

    /// Render as a PostgreSQL literal for key-equality lookups.
    ///
    /// Single quotes are doubled; the values involved are primary key
    /// tuples (integers, UUIDs, short identifiers), not untrusted input.
    #[must_use]
    pub fn to_pg_literal(&self) -> String {
        match self {
            SqlValue::Null(_) => "NULL".into(),
            SqlValue::Bool(v) => if *v { "TRUE".into() } else { "FALSE".into() },
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Text(v) => quote_str(v),
            SqlValue::Bytes(v) => format!("'\\x{}'", hex::encode(v)),
            SqlValue::Uuid(v) => format!("'{}'", v),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::DateTime(v) => format!("'{}'", v),
            SqlValue::DateTimeOffset(v) => format!("'{}'", v.to_rfc3339()),
            SqlValue::Date(v) => format!("'{}'", v),
            SqlValue::Time(v) => format!("'{}'", v),
        }
    }

    /// Render as an MSSQL literal for key-equality lookups.
    #[must_use]
    pub fn to_mssql_literal(&self) -> String {
        match self {
            SqlValue::Null(_) => "NULL".into(),
            SqlValue::Bool(v) => if *v { "1".into() } else { "0".into() },
            SqlValue::Text(v) => format!("N{}", quote_str(v)),
            SqlValue::Bytes(v) => format!("0x{}", hex::encode(v)),
            other => other.to_pg_literal(),
        }
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}
