//! BatchedMigration entity model
//!
//! This module contains the SeaORM entity model for the batched_background_migrations
//! table, which holds the definition and progress of each registered migration.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::background_migration::state::MigrationStatus;

/// Batched background migration over a bounded key range of one table
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "batched_background_migrations")]
pub struct Model {
    /// Unique identifier for the migration (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Name under which the migration callback is registered
    pub job_class_name: String,

    /// Table the migration iterates over
    pub table_name: String,

    /// Range column, normally the primary key
    pub column_name: String,

    /// Opaque parameters handed to the callback on every batch
    #[sea_orm(column_type = "JsonBinary")]
    pub job_arguments: JsonValue,

    /// Inclusive lower bound of the range to cover
    pub min_value: i64,

    /// Inclusive upper bound of the range to cover
    pub max_value: i64,

    /// Rows per batch; adjusted by the batch optimizer
    pub batch_size: i64,

    /// Rows per chunk inside a batch
    pub sub_batch_size: i64,

    /// Ceiling for adaptive batch growth
    pub max_batch_size: i64,

    /// Sleep between sub-batches, in milliseconds
    pub pause_ms: i64,

    /// Minimum wall-clock gap between batch executions
    pub interval_seconds: i64,

    /// Highest key already processed; starts at `min_value - 1`
    pub cursor: i64,

    /// Estimated number of rows, for progress reporting
    pub total_tuple_count: Option<i64>,

    /// Lifecycle status (active, paused, finished, failed)
    pub status: String,

    /// Database (connection pool) that owns the migrated table
    pub database_identifier: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// When the most recent batch was started
    pub last_batch_started_at: Option<DateTimeWithTimeZone>,

    /// When the most recent batch finished, successfully or not
    pub last_batch_finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::migration_batch::Entity")]
    MigrationBatch,
}

impl Related<super::migration_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MigrationBatch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed lifecycle status. Unknown values are treated as paused so they are never scheduled.
    pub fn status(&self) -> MigrationStatus {
        self.status.parse().unwrap_or(MigrationStatus::Paused)
    }

    /// Whether every key in the range has been processed.
    pub fn is_range_exhausted(&self) -> bool {
        self.cursor >= self.max_value
    }

    /// Whether more than `interval_seconds` plus `variance` passed since the last batch started.
    ///
    /// A migration that never ran is always due.
    pub fn interval_elapsed(&self, now: DateTimeWithTimeZone, variance: chrono::Duration) -> bool {
        match self.last_batch_started_at {
            None => true,
            Some(started_at) => {
                now - started_at > chrono::Duration::seconds(self.interval_seconds) + variance
            }
        }
    }

    /// Completion percentage derived from the cursor, in `0.0..=100.0`.
    pub fn progress(&self) -> f64 {
        if self.min_value > self.max_value {
            return 100.0;
        }
        let total = (self.max_value - self.min_value + 1) as f64;
        let done = (self.cursor - self.min_value + 1).clamp(0, self.max_value - self.min_value + 1);
        (done as f64 / total * 100.0).clamp(0.0, 100.0)
    }
}
