//! Schema descriptors for tables, columns, indexes, constraints, and
//! programmable objects, as read from the source catalog.

use serde::{Deserialize, Serialize};

/// Table metadata.
///
/// `list_tables` populates only schema, name, and the approximate row count;
/// `describe_table` fills in everything else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Schema name.
    pub schema: String,

    /// Table name.
    pub name: String,

    /// Approximate row count. -1 when unknown.
    pub row_count: i64,

    /// Column definitions in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key column names in key order.
    pub primary_key: Vec<String>,

    /// Foreign key constraints.
    pub foreign_keys: Vec<ForeignKey>,

    /// Non-primary-key indexes.
    pub indexes: Vec<Index>,
}

impl Table {
    /// Get the fully qualified table name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Column that defines a stable read order: the first primary key column
    /// if one exists, else the first column. None for a column-less table.
    pub fn order_by_column(&self) -> Option<&str> {
        if let Some(pk) = self.primary_key.first() {
            return Some(pk.as_str());
        }
        self.columns.first().map(|c| c.name.as_str())
    }

    /// Identity columns, in ordinal order.
    pub fn identity_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_identity)
    }

    /// Column names, in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Column metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Source data type name (e.g. "int", "nvarchar", "datetime2").
    pub data_type: String,

    /// Maximum byte length for string/binary types. -1 for unbounded (MAX).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale (also carries fractional-second precision for time types).
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Whether the column is an identity column.
    pub is_identity: bool,

    /// Default expression text, as stored in the source catalog.
    pub default_value: Option<String>,

    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,
}

impl Column {
    /// Large-object and binary types that cannot be compared textually
    /// across engines. Excluded from checksum validation.
    pub fn is_lob(&self) -> bool {
        matches!(
            self.data_type.to_lowercase().as_str(),
            "image" | "varbinary" | "binary" | "text" | "ntext"
        )
    }
}

/// Foreign key metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,

    /// Local column names, in constraint order.
    pub columns: Vec<String>,

    /// Referenced schema name.
    pub referenced_schema: String,

    /// Referenced table name.
    pub referenced_table: String,

    /// Referenced column names, in constraint order.
    pub referenced_columns: Vec<String>,

    /// ON DELETE action token as reported by the source (e.g. "SET_NULL").
    pub on_delete: String,

    /// ON UPDATE action token as reported by the source.
    pub on_update: String,
}

/// Index metadata. Clustering is informational only on the target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Indexed column names, in key order.
    pub columns: Vec<String>,

    /// Whether the index enforces uniqueness.
    pub is_unique: bool,

    /// Whether the index is clustered on the source.
    pub is_clustered: bool,
}

/// Kind of programmable object enumerated for the advisory pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlObjectKind {
    View,
    Procedure,
    Function,
    Trigger,
}

impl SqlObjectKind {
    /// Human-readable noun used in advisory log messages.
    pub fn noun(&self) -> &'static str {
        match self {
            SqlObjectKind::View => "View",
            SqlObjectKind::Procedure => "Stored procedure",
            SqlObjectKind::Function => "Function",
            SqlObjectKind::Trigger => "Trigger",
        }
    }
}

/// A view, stored procedure, function, or trigger.
///
/// These are enumerated and surfaced for manual porting; their T-SQL bodies
/// are never translated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlObject {
    /// Schema name.
    pub schema: String,

    /// Object name.
    pub name: String,

    /// Object kind.
    pub kind: SqlObjectKind,

    /// T-SQL module definition, when available from the catalog.
    pub definition: Option<String>,
}

impl SqlObject {
    /// Fully qualified object name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}
