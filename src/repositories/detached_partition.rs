//! # DetachedPartition Repository
//!
//! Bookkeeping for partitions that were detached and await their drop.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use crate::error::PartitionError;
use crate::models::detached_partition::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct DetachedPartitionRepository {
    db: DatabaseConnection,
}

fn db_err(context: &str, err: DbErr) -> PartitionError {
    tracing::error!(error = %err, "{context}");
    PartitionError::Database(err)
}

impl DetachedPartitionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Records a detached partition; re-recording the same partition keeps the first entry.
    pub async fn record(
        &self,
        parent_table: &str,
        partition_name: &str,
        drop_after: DateTime<FixedOffset>,
    ) -> Result<Model, PartitionError> {
        if let Some(existing) = Entity::find()
            .filter(Column::PartitionName.eq(partition_name))
            .one(&self.db)
            .await
            .map_err(|e| db_err("Failed to look up detached partition", e))?
        {
            return Ok(existing);
        }

        ActiveModel {
            id: Set(Uuid::new_v4()),
            parent_table: Set(parent_table.to_string()),
            partition_name: Set(partition_name.to_string()),
            drop_after: Set(drop_after),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await
        .map_err(|e| db_err("Failed to record detached partition", e))
    }

    /// Detached partitions whose `drop_after` has passed, oldest first.
    pub async fn due(&self, now: DateTime<FixedOffset>) -> Result<Vec<Model>, PartitionError> {
        Entity::find()
            .filter(Column::DropAfter.lte(now))
            .order_by_asc(Column::DropAfter)
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to load detached partitions due for drop", e))
    }

    pub async fn list(&self) -> Result<Vec<Model>, PartitionError> {
        Entity::find()
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to list detached partitions", e))
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), PartitionError> {
        Entity::delete_by_id(id)
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to remove detached partition record", e))?;
        Ok(())
    }
}
