//! Post-migration data validation: row counts, content checksums, and
//! sampled row-by-row comparison.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ValidationConfig;
use crate::error::{MigrateError, Result};
use crate::events::{EventSink, MigrationEvent};
use crate::schema::{Column, Table};
use crate::source::SourceReader;
use crate::target::TargetWriter;
use crate::value::SqlValue;

/// Number of mismatch details kept on a result after truncation.
const MAX_MISMATCH_DETAILS: usize = 10;

/// Overall outcome for one validated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Warning,
    Mismatch,
    Error,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Success => "success",
            ValidationStatus::Warning => "warning",
            ValidationStatus::Mismatch => "mismatch",
            ValidationStatus::Error => "error",
        }
    }
}

/// How a sampled row failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    SourceError,
    Missing,
    ValueDiff,
}

/// A per-column difference within a sampled row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDifference {
    pub column: String,
    pub source_value: String,
    pub target_value: String,
}

/// Details about one mismatched sample row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchDetail {
    /// Textual form of the primary key tuple.
    pub primary_key: Vec<String>,
    pub kind: MismatchKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_differences: Vec<ColumnDifference>,
}

/// Result of validating one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub table_name: String,
    pub row_count_match: bool,
    pub source_row_count: i64,
    pub target_row_count: i64,
    pub checksum_match: bool,
    pub source_checksum: String,
    pub target_checksum: String,
    /// The source checksum came from the client-side fallback, which is not
    /// byte-comparable to the target's composite-row hash.
    pub checksum_fallback: bool,
    pub sample_matches: usize,
    pub sample_mismatches: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatched_rows: Vec<MismatchDetail>,
    pub status: ValidationStatus,
    pub duration: String,
}

impl ValidationResult {
    fn new(table_name: String) -> Self {
        Self {
            table_name,
            // Match flags default to true so disabled checks never poison
            // the status derivation
            row_count_match: true,
            source_row_count: 0,
            target_row_count: 0,
            checksum_match: true,
            source_checksum: String::new(),
            target_checksum: String::new(),
            checksum_fallback: false,
            sample_matches: 0,
            sample_mismatches: 0,
            mismatched_rows: Vec::new(),
            status: ValidationStatus::Success,
            duration: String::new(),
        }
    }
}

/// Compares source and target tables after a migration.
pub struct Validator {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    events: Arc<dyn EventSink>,
}

impl Validator {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            target,
            events,
        }
    }

    /// Validate every selected table, emitting a progress event per table.
    /// Sub-check failures never abort the run.
    pub async fn run(&self, config: &ValidationConfig) -> Result<Vec<ValidationResult>> {
        let config = config.clone().normalized();

        let tables: Vec<Table> = self
            .source
            .list_tables()
            .await?
            .into_iter()
            .filter(|t| config.selects(&t.schema, &t.name))
            .collect();

        let mut results = Vec::with_capacity(tables.len());
        for table in &tables {
            let result = match self.validate_table(&config, table).await {
                Ok(result) => result,
                Err(e) => {
                    debug!("Validation errored for {}: {}", table.full_name(), e);
                    let mut result = ValidationResult::new(table.full_name());
                    result.status = ValidationStatus::Error;
                    result
                }
            };

            self.events.emit(MigrationEvent::ValidationProgress {
                table: table.full_name(),
                result: result.clone(),
            });
            results.push(result);
        }

        Ok(results)
    }

    async fn validate_table(
        &self,
        config: &ValidationConfig,
        table: &Table,
    ) -> Result<ValidationResult> {
        let started = Instant::now();
        let mut result = ValidationResult::new(table.full_name());
        let mut subcheck_failed = false;

        let details = self
            .source
            .describe_table(&table.schema, &table.name)
            .await?;

        if config.row_count_validation {
            if let Err(e) = self.check_row_count(table, &mut result).await {
                debug!("Row count check failed for {}: {}", table.full_name(), e);
                subcheck_failed = true;
            }
        }

        if config.checksum_validation {
            if let Err(e) = self.check_checksum(&details, &mut result).await {
                debug!("Checksum check failed for {}: {}", table.full_name(), e);
                subcheck_failed = true;
            }
        }

        if config.sample_comparison {
            if let Err(e) = self
                .check_samples(config.sample_size, &details, &mut result)
                .await
            {
                debug!("Sample check failed for {}: {}", table.full_name(), e);
                subcheck_failed = true;
            }
        }

        // A checksum mismatch in fallback mode is advisory only: the two
        // hash paths are not byte-comparable
        let hard_mismatch = !result.row_count_match
            || result.sample_mismatches > 0
            || (!result.checksum_match && !result.checksum_fallback);
        let soft_mismatch = !result.checksum_match && result.checksum_fallback;

        result.status = if hard_mismatch {
            ValidationStatus::Mismatch
        } else if subcheck_failed || soft_mismatch {
            ValidationStatus::Warning
        } else {
            ValidationStatus::Success
        };

        result.duration = format!("{:?}", started.elapsed());
        Ok(result)
    }

    async fn check_row_count(&self, table: &Table, result: &mut ValidationResult) -> Result<()> {
        result.source_row_count = self.source.count_rows(&table.schema, &table.name).await?;
        result.target_row_count = self.target.row_count(&table.schema, &table.name).await?;
        result.row_count_match = result.source_row_count == result.target_row_count;
        Ok(())
    }

    async fn check_checksum(&self, details: &Table, result: &mut ValidationResult) -> Result<()> {
        // LOB and binary columns are inherently hard to compare across
        // dialects and are excluded from the digest
        let columns: Vec<Column> = details
            .columns
            .iter()
            .filter(|c| !c.is_lob())
            .cloned()
            .collect();
        if columns.is_empty() {
            return Err(MigrateError::Validation(format!(
                "no comparable columns found in {}",
                details.full_name()
            )));
        }

        let order_by = columns
            .iter()
            .find(|c| c.is_primary_key)
            .unwrap_or(&columns[0])
            .name
            .clone();
        let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        let source = self
            .source
            .table_checksum(&details.schema, &details.name, &columns, &order_by)
            .await?;
        result.source_checksum = source.digest;
        result.checksum_fallback = source.fallback;

        result.target_checksum = self
            .target
            .table_checksum(&details.schema, &details.name, &column_names, &order_by)
            .await?;

        result.checksum_match = result.source_checksum == result.target_checksum;
        Ok(())
    }

    async fn check_samples(
        &self,
        sample_size: i64,
        details: &Table,
        result: &mut ValidationResult,
    ) -> Result<()> {
        if details.columns.is_empty() {
            return Err(MigrateError::Validation(format!(
                "{} has no columns to sample",
                details.full_name()
            )));
        }

        // Key by the primary key, or the first column when there is none
        let key_columns: Vec<Column> = if details.has_pk() {
            details
                .columns
                .iter()
                .filter(|c| c.is_primary_key)
                .cloned()
                .collect()
        } else {
            vec![details.columns[0].clone()]
        };

        let keys = self
            .source
            .sample_keys(&details.schema, &details.name, &key_columns, sample_size)
            .await?;

        let mut details_acc: Vec<MismatchDetail> = Vec::new();
        for key in &keys {
            match self.compare_row(details, &key_columns, key).await {
                None => result.sample_matches += 1,
                Some(detail) => {
                    result.sample_mismatches += 1;
                    details_acc.push(detail);
                }
            }
        }

        details_acc.truncate(MAX_MISMATCH_DETAILS);
        result.mismatched_rows = details_acc;
        Ok(())
    }

    /// Compare one sampled row. Returns None on match.
    async fn compare_row(
        &self,
        details: &Table,
        key_columns: &[Column],
        key: &[SqlValue],
    ) -> Option<MismatchDetail> {
        let key_text: Vec<String> = key
            .iter()
            .map(|v| v.to_text().unwrap_or_else(|| "NULL".into()))
            .collect();

        let source_row = match self
            .source
            .fetch_row(
                &details.schema,
                &details.name,
                &details.columns,
                key_columns,
                key,
            )
            .await
        {
            Ok(Some(row)) => row,
            _ => {
                return Some(MismatchDetail {
                    primary_key: key_text,
                    kind: MismatchKind::SourceError,
                    column_differences: Vec::new(),
                })
            }
        };

        let column_names: Vec<String> = details.columns.iter().map(|c| c.name.clone()).collect();
        let key_names: Vec<String> = key_columns.iter().map(|c| c.name.clone()).collect();
        let target_row = match self
            .target
            .fetch_row(
                &details.schema,
                &details.name,
                &column_names,
                &key_names,
                key,
            )
            .await
        {
            Ok(Some(row)) => row,
            _ => {
                return Some(MismatchDetail {
                    primary_key: key_text,
                    kind: MismatchKind::Missing,
                    column_differences: Vec::new(),
                })
            }
        };

        let mut diffs = Vec::new();
        for (idx, column) in details.columns.iter().enumerate() {
            let source_value = source_row.get(idx);
            let target_value = target_row.get(idx);
            let equal = match (source_value, target_value) {
                (Some(a), Some(b)) => values_equal(a, b),
                _ => false,
            };
            if !equal {
                diffs.push(ColumnDifference {
                    column: column.name.clone(),
                    source_value: render(source_value),
                    target_value: render(target_value),
                });
            }
        }

        if diffs.is_empty() {
            None
        } else {
            Some(MismatchDetail {
                primary_key: key_text,
                kind: MismatchKind::ValueDiff,
                column_differences: diffs,
            })
        }
    }
}

fn render(value: Option<&SqlValue>) -> String {
    value
        .and_then(|v| v.to_text())
        .unwrap_or_else(|| "NULL".into())
}

/// Textual value equality with NULL=NULL and boolean/0-1 cross-mapping.
pub fn values_equal(a: &SqlValue, b: &SqlValue) -> bool {
    match (a.to_text(), b.to_text()) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a == b {
                return true;
            }
            matches!(
                (a.as_str(), b.as_str()),
                ("true", "1") | ("1", "true") | ("false", "0") | ("0", "false")
            )
        }
        _ => false,
    }
}
