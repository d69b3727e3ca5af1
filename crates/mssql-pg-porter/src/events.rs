//! Out-of-band events emitted to the host while a migration or
//! validation runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::store::LogLevel;
use crate::validate::ValidationResult;

/// An event destined for the host's event stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MigrationEvent {
    #[serde(rename_all = "camelCase")]
    Log {
        migration_id: String,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        migration_id: String,
        table: String,
        total_rows: i64,
        processed_rows: i64,
        percentage: f64,
    },
    #[serde(rename_all = "camelCase")]
    TableComplete {
        migration_id: String,
        table: String,
        rows_migrated: i64,
    },
    #[serde(rename_all = "camelCase")]
    Complete { migration_id: String },
    #[serde(rename_all = "camelCase")]
    Error { migration_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    ValidationProgress {
        table: String,
        result: ValidationResult,
    },
}

impl MigrationEvent {
    /// The host-facing event channel name.
    pub fn name(&self) -> &'static str {
        match self {
            MigrationEvent::Log { .. } => "migration:log",
            MigrationEvent::Progress { .. } => "migration:progress",
            MigrationEvent::TableComplete { .. } => "migration:table-complete",
            MigrationEvent::Complete { .. } => "migration:complete",
            MigrationEvent::Error { .. } => "migration:error",
            MigrationEvent::ValidationProgress { .. } => "validation:progress",
        }
    }
}

/// Receives events from the engine and validator.
///
/// Implementations must not block: the engine emits from its hot loop.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MigrationEvent);
}

/// Discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: MigrationEvent) {}
}

/// Forwards events into an unbounded channel for the host to drain.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MigrationEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver the host drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: MigrationEvent) {
        // A closed receiver means the host went away; events are best-effort.
        let _ = self.tx.send(event);
    }
}
