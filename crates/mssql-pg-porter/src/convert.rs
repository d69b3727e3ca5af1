//! MSSQL to PostgreSQL type mapping and DDL generation.
//!
//! [`TypeMapper`] is a pure transformation with a warnings side-channel:
//! lossy conversions append messages that the caller flushes to the log
//! after each table.

use crate::schema::{Column, ForeignKey, Index, Table};

/// Maps MSSQL schema artifacts to PostgreSQL DDL, accumulating warnings
/// for lossy conversions.
#[derive(Debug, Default)]
pub struct TypeMapper {
    warnings: Vec<String>,
}

impl TypeMapper {
    /// Create a new mapper with no accumulated warnings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated warnings since the last [`take_warnings`](Self::take_warnings).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Drain accumulated warnings.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Map a source column to its PostgreSQL type.
    pub fn map_type(&mut self, col: &Column) -> String {
        match col.data_type.to_lowercase().as_str() {
            "bigint" => serial_or(col, "BIGSERIAL", "BIGINT"),
            "int" => serial_or(col, "SERIAL", "INTEGER"),
            "smallint" => serial_or(col, "SMALLSERIAL", "SMALLINT"),
            // PostgreSQL has no TINYINT
            "tinyint" => serial_or(col, "SMALLSERIAL", "SMALLINT"),

            "bit" => "BOOLEAN".into(),

            "decimal" | "numeric" => {
                if col.precision > 0 {
                    format!("NUMERIC({},{})", col.precision, col.scale)
                } else {
                    "NUMERIC".into()
                }
            }
            "money" => "NUMERIC(19,4)".into(),
            "smallmoney" => "NUMERIC(10,4)".into(),

            "float" => {
                if col.precision <= 24 {
                    "REAL".into()
                } else {
                    "DOUBLE PRECISION".into()
                }
            }
            "real" => "REAL".into(),

            "date" => "DATE".into(),
            "time" => {
                if col.scale > 0 && col.scale <= 6 {
                    format!("TIME({})", col.scale)
                } else {
                    "TIME".into()
                }
            }
            "datetime" => "TIMESTAMP(3)".into(),
            "smalldatetime" => "TIMESTAMP(0)".into(),
            "datetime2" => {
                let mut precision = col.scale;
                if precision > 6 {
                    self.warn(format!(
                        "Column {}: datetime2({}) precision truncated to 6 (PostgreSQL max)",
                        col.name, precision
                    ));
                    precision = 6;
                }
                format!("TIMESTAMP({})", precision)
            }
            "datetimeoffset" => {
                let mut precision = col.scale;
                if precision > 6 {
                    self.warn(format!(
                        "Column {}: datetimeoffset({}) precision truncated to 6",
                        col.name, precision
                    ));
                    precision = 6;
                }
                format!("TIMESTAMPTZ({})", precision)
            }

            "char" => {
                if col.max_length > 0 {
                    format!("CHAR({})", col.max_length)
                } else {
                    "CHAR(1)".into()
                }
            }
            "varchar" => {
                if col.max_length == -1 {
                    "TEXT".into()
                } else if col.max_length > 0 {
                    format!("VARCHAR({})", col.max_length)
                } else {
                    "VARCHAR".into()
                }
            }
            "text" => "TEXT".into(),

            // Unicode types report byte lengths at 2 bytes per character
            "nchar" => {
                let length = col.max_length / 2;
                if length > 0 {
                    format!("CHAR({})", length)
                } else {
                    "CHAR(1)".into()
                }
            }
            "nvarchar" => {
                if col.max_length == -1 {
                    "TEXT".into()
                } else {
                    let length = col.max_length / 2;
                    if length > 0 {
                        format!("VARCHAR({})", length)
                    } else {
                        "VARCHAR".into()
                    }
                }
            }
            "ntext" => "TEXT".into(),

            "binary" | "varbinary" | "image" => "BYTEA".into(),

            "uniqueidentifier" => "UUID".into(),
            "xml" => "XML".into(),

            "sql_variant" => {
                self.warn(format!(
                    "Column {}: sql_variant converted to TEXT (lossy conversion)",
                    col.name
                ));
                "TEXT".into()
            }
            "hierarchyid" => {
                self.warn(format!(
                    "Column {}: hierarchyid converted to TEXT (custom handling may be needed)",
                    col.name
                ));
                "TEXT".into()
            }
            "geography" => {
                self.warn(format!(
                    "Column {}: geography type requires PostGIS extension",
                    col.name
                ));
                "GEOGRAPHY".into()
            }
            "geometry" => {
                self.warn(format!(
                    "Column {}: geometry type requires PostGIS extension",
                    col.name
                ));
                "GEOMETRY".into()
            }

            // MSSQL timestamp is a binary row version, not a point in time
            "timestamp" | "rowversion" => "BYTEA".into(),

            "sysname" => "VARCHAR(128)".into(),

            other => {
                self.warn(format!(
                    "Column {}: unknown type '{}' defaulting to TEXT",
                    col.name, other
                ));
                "TEXT".into()
            }
        }
    }

    /// Translate an MSSQL default expression to PostgreSQL syntax.
    ///
    /// Returns an empty string when the default should be dropped.
    pub fn map_default(&mut self, default_value: &str, data_type: &str) -> String {
        if default_value.is_empty() {
            return String::new();
        }

        // The source catalog wraps defaults in one or two layers of parens
        let stripped = strip_outer_parens(default_value);
        let lower = stripped.to_lowercase();

        match lower.as_str() {
            "getdate()" | "current_timestamp" | "sysdatetime()" => {
                return "CURRENT_TIMESTAMP".into();
            }
            "getutcdate()" | "sysutcdatetime()" => {
                return "CURRENT_TIMESTAMP AT TIME ZONE 'UTC'".into();
            }
            "newid()" | "newsequentialid()" => {
                return "gen_random_uuid()".into();
            }
            "null" => return "NULL".into(),
            _ => {}
        }

        if lower.starts_with("convert(") {
            self.warn(format!(
                "Default value '{}' uses CONVERT - may need manual conversion",
                stripped
            ));
            return String::new();
        }
        if lower.starts_with("cast(") {
            self.warn(format!(
                "Default value '{}' uses CAST - may need manual conversion",
                stripped
            ));
            return String::new();
        }

        if data_type.eq_ignore_ascii_case("bit") {
            if stripped == "1" || lower == "'1'" {
                return "TRUE".into();
            }
            if stripped == "0" || lower == "'0'" {
                return "FALSE".into();
            }
        }

        if stripped.parse::<f64>().is_ok() {
            return stripped.to_string();
        }

        // N'...' unicode literals lose the prefix
        if let Some(rest) = stripped.strip_prefix("N'") {
            return format!("'{}", rest);
        }

        stripped.to_string()
    }

    /// Generate a single column definition.
    pub fn column_ddl(&mut self, col: &Column) -> String {
        let mut parts = vec![quote_ident(&col.name)];

        let pg_type = self.map_type(col);
        let is_serial = pg_type.ends_with("SERIAL");
        parts.push(pg_type);

        // SERIAL types are implicitly NOT NULL and own their default
        if !col.is_nullable && !is_serial {
            parts.push("NOT NULL".into());
        }

        if let Some(default) = &col.default_value {
            if !is_serial {
                let mapped = self.map_default(default, &col.data_type);
                if !mapped.is_empty() {
                    parts.push("DEFAULT".into());
                    parts.push(mapped);
                }
            }
        }

        parts.join(" ")
    }

    /// Generate a CREATE TABLE statement, including the primary key
    /// constraint. Indexes and foreign keys are emitted separately.
    pub fn create_table_ddl(&mut self, table: &Table) -> String {
        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|col| format!("    {}", self.column_ddl(col)))
            .collect();

        if !table.primary_key.is_empty() {
            let pk_cols: Vec<String> =
                table.primary_key.iter().map(|c| quote_ident(c)).collect();
            defs.push(format!("    PRIMARY KEY ({})", pk_cols.join(", ")));
        }

        format!(
            "CREATE TABLE {}.{} (\n{}\n)",
            quote_ident(&table.schema),
            quote_ident(&table.name),
            defs.join(",\n")
        )
    }

    /// Generate a CREATE INDEX statement.
    pub fn index_ddl(&self, table: &Table, index: &Index) -> String {
        let cols: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {}.{} ({})",
            if index.is_unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            quote_ident(&table.schema),
            quote_ident(&table.name),
            cols.join(", ")
        )
    }

    /// Generate an ALTER TABLE ... ADD CONSTRAINT statement for a foreign key.
    pub fn foreign_key_ddl(&self, table: &Table, fk: &ForeignKey) -> String {
        let cols: Vec<String> = fk.columns.iter().map(|c| quote_ident(c)).collect();
        let ref_cols: Vec<String> = fk
            .referenced_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect();

        let mut ddl = format!(
            "ALTER TABLE {}.{} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}.{} ({})",
            quote_ident(&table.schema),
            quote_ident(&table.name),
            quote_ident(&fk.name),
            cols.join(", "),
            quote_ident(&fk.referenced_schema),
            quote_ident(&fk.referenced_table),
            ref_cols.join(", ")
        );

        if let Some(action) = referential_action(&fk.on_delete) {
            ddl.push_str(" ON DELETE ");
            ddl.push_str(&action);
        }
        if let Some(action) = referential_action(&fk.on_update) {
            ddl.push_str(" ON UPDATE ");
            ddl.push_str(&action);
        }

        ddl
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}

fn serial_or(col: &Column, serial: &str, plain: &str) -> String {
    if col.is_identity {
        serial.into()
    } else {
        plain.into()
    }
}

/// Translate a source referential-action token to target syntax.
///
/// Empty and NO_ACTION tokens are omitted; underscores become spaces
/// (SET_NULL -> SET NULL).
fn referential_action(token: &str) -> Option<String> {
    if token.is_empty() || token == "NO_ACTION" {
        return None;
    }
    Some(token.replace('_', " "))
}

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Strip matched outer parentheses. Only removes a layer when the opening
/// paren closes at the final character, so `(1)+(2)` is left alone.
fn strip_outer_parens(value: &str) -> &str {
    let mut s = value.trim();
    while s.len() >= 2 && s.starts_with('(') && s.ends_with(')') && parens_match(s) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

fn parens_match(s: &str) -> bool {
    let mut depth = 0i32;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth <= 0 {
                    return depth == 0 && i == s.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}
