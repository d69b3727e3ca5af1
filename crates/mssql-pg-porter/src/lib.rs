//! # mssql-pg-porter
//!
//! Migration engine for moving a Microsoft SQL Server database to
//! PostgreSQL: schema (tables, columns, primary keys, indexes, foreign
//! keys), bulk row data over the COPY protocol, and a validation pass that
//! reconciles source and target by row counts, content checksums, and
//! sampled row-by-row comparison.
//!
//! A migration runs in four phases on a background task:
//!
//! 1. **Schema** - tables, columns, and secondary indexes
//! 2. **Data** - ordered, batched bulk loads with triggers suppressed
//! 3. **Foreign keys** - added only after all rows are in place
//! 4. **Programmable objects** - advisory warnings for views, procedures,
//!    functions, and triggers that need manual porting
//!
//! The run can be paused, resumed, and cancelled at cooperative
//! checkpoints; progress and log events stream out-of-band to the host.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mssql_pg_porter::{
//!     ChannelSink, MemoryStore, MigrationConfig, MigrationService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sink, mut events) = ChannelSink::new();
//!     let service = MigrationService::new(Arc::new(MemoryStore::new()), Arc::new(sink));
//!
//!     let config = MigrationConfig {
//!         source_connection_string: "Server=src;User Id=sa;Password=...".into(),
//!         target_connection_string: "host=tgt user=postgres".into(),
//!         source_database: "app".into(),
//!         target_database: "app".into(),
//!         ..Default::default()
//!     };
//!
//!     let migration_id = service.start_migration(config, "initial load").await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{}: {}", event.name(), serde_json::to_string(&event)?);
//!     }
//!     println!("started {migration_id}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod events;
pub mod schema;
pub mod service;
pub mod source;
pub mod state;
pub mod store;
pub mod target;
pub mod validate;
pub mod value;

// Re-exports for convenient access
pub use config::{
    ConnectionConfig, ConnectionKind, ConnectionTestResult, MigrationConfig, ValidationConfig,
};
pub use convert::TypeMapper;
pub use engine::MigrationEngine;
pub use error::{MigrateError, Result};
pub use events::{ChannelSink, EventSink, MigrationEvent, NullSink};
pub use schema::{Column, ForeignKey, Index, SqlObject, SqlObjectKind, Table};
pub use service::MigrationService;
pub use source::{MssqlSource, SourceChecksum, SourceReader};
pub use state::{MigrationState, MigrationStatus, TableState};
pub use store::{
    LogEntry, LogLevel, MemoryStore, MigrationRecord, MigrationTotals, Store, ValidationReport,
};
pub use target::{PgTarget, TargetWriter};
pub use validate::{
    ColumnDifference, MismatchDetail, MismatchKind, ValidationResult, ValidationStatus, Validator,
};
pub use value::{SqlNullType, SqlValue};
