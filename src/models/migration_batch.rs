//! MigrationBatch entity model
//!
//! This module contains the SeaORM entity model for the
//! batched_background_migration_batches table: one row per executed slice of
//! a batched background migration.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::batched_migration::Entity as BatchedMigration;
use crate::background_migration::state::BatchStatus;

/// One executed slice of a batched background migration
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "batched_background_migration_batches")]
pub struct Model {
    /// Unique identifier for the batch (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning migration
    pub batched_background_migration_id: Uuid,

    /// Inclusive lower bound of this slice
    pub min_value: i64,

    /// Inclusive upper bound of this slice
    pub max_value: i64,

    /// Batch size in effect when the slice was planned
    pub batch_size: i64,

    pub sub_batch_size: i64,

    pub pause_ms: i64,

    /// Current status (pending, running, succeeded, failed)
    pub status: String,

    /// Number of times this slice was started
    pub attempts: i32,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Observed duration divided by the migration interval
    pub time_efficiency: Option<f64>,

    /// Structured error details of the last failed attempt
    #[sea_orm(column_type = "JsonBinary")]
    pub error: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "BatchedMigration",
        from = "Column::BatchedBackgroundMigrationId",
        to = "super::batched_migration::Column::Id"
    )]
    BatchedMigration,
}

impl Related<BatchedMigration> for Entity {
    fn to() -> RelationDef {
        Relation::BatchedMigration.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn status(&self) -> Option<BatchStatus> {
        self.status.parse().ok()
    }
}
