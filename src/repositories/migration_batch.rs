//! # MigrationBatch Repository
//!
//! Persistence of individual batches. Status changes are compare-and-swap
//! updates so concurrent workers never both own a batch.

use chrono::{DateTime, FixedOffset};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, QueryTrait, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::background_migration::planner::BatchRange;
use crate::background_migration::state::BatchStatus;
use crate::error::{MigrationError, is_unique_violation};
use crate::models::batched_migration;
use crate::models::migration_batch::{ActiveModel, Column, Entity, Model};

/// Result of trying to take ownership of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Model),
    /// Another worker holds a running batch of the same migration, or took this one.
    RaceLost,
}

/// Repository for migration batch database operations
#[derive(Debug, Clone)]
pub struct MigrationBatchRepository {
    db: DatabaseConnection,
}

fn db_err(context: &str, err: DbErr) -> MigrationError {
    tracing::error!(error = %err, "{context}");
    MigrationError::Database(err)
}

impl MigrationBatchRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts a `pending` batch for `range` using the migration's current tuning.
    pub async fn create_pending(
        &self,
        migration: &batched_migration::Model,
        range: BatchRange,
        now: DateTime<FixedOffset>,
    ) -> Result<Model, MigrationError> {
        let batch = ActiveModel {
            id: Set(Uuid::new_v4()),
            batched_background_migration_id: Set(migration.id),
            min_value: Set(range.min_value),
            max_value: Set(range.max_value),
            batch_size: Set(migration.batch_size),
            sub_batch_size: Set(migration.sub_batch_size),
            pause_ms: Set(migration.pause_ms),
            status: Set(BatchStatus::Pending.as_str().to_string()),
            attempts: Set(0),
            started_at: Set(None),
            finished_at: Set(None),
            time_efficiency: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        batch
            .insert(&self.db)
            .await
            .map_err(|e| db_err("Failed to create pending batch", e))
    }

    /// Moves a batch from `from` to `running`, counting the attempt.
    ///
    /// Only succeeds when no other batch of the same migration is running and
    /// the batch still starts right after the migration cursor. The partial
    /// unique index backs the first condition up under concurrent claims.
    pub async fn claim(
        &self,
        batch: &Model,
        from: BatchStatus,
        now: DateTime<FixedOffset>,
    ) -> Result<ClaimOutcome, MigrationError> {
        let migration_id = batch.batched_background_migration_id;
        let running = Entity::find()
            .select_only()
            .column(Column::BatchedBackgroundMigrationId)
            .filter(Column::Status.eq(BatchStatus::Running.as_str()))
            .filter(Column::BatchedBackgroundMigrationId.eq(migration_id))
            .into_query();
        let at_cursor = batched_migration::Entity::find()
            .select_only()
            .column(batched_migration::Column::Id)
            .filter(batched_migration::Column::Id.eq(migration_id))
            .filter(batched_migration::Column::Cursor.eq(batch.min_value - 1))
            .into_query();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Running.as_str()))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::FinishedAt, Expr::value(Option::<DateTime<FixedOffset>>::None))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(batch.id))
            .filter(Column::Status.eq(from.as_str()))
            .filter(Column::BatchedBackgroundMigrationId.not_in_subquery(running))
            .filter(Column::BatchedBackgroundMigrationId.in_subquery(at_cursor))
            .exec(&self.db)
            .await;

        match result {
            Ok(res) if res.rows_affected == 1 => {
                let claimed = Entity::find_by_id(batch.id)
                    .one(&self.db)
                    .await
                    .map_err(|e| db_err("Failed to reload claimed batch", e))?
                    .ok_or_else(|| {
                        MigrationError::Database(DbErr::RecordNotFound(batch.id.to_string()))
                    })?;
                Ok(ClaimOutcome::Claimed(claimed))
            }
            Ok(_) => Ok(ClaimOutcome::RaceLost),
            Err(err) if is_unique_violation(&err) => Ok(ClaimOutcome::RaceLost),
            Err(err) => Err(db_err("Failed to claim batch", err)),
        }
    }

    /// Deletes a batch that is still `pending`. Returns whether a row was removed.
    pub async fn discard_pending(&self, batch_id: Uuid) -> Result<bool, MigrationError> {
        let result = Entity::delete_many()
            .filter(Column::Id.eq(batch_id))
            .filter(Column::Status.eq(BatchStatus::Pending.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to discard pending batch", e))?;
        Ok(result.rows_affected == 1)
    }

    /// Marks a running batch succeeded and advances the migration cursor to its end.
    ///
    /// Both writes happen in one transaction. Returns `false` without writing
    /// anything when this attempt no longer owns the batch or the cursor moved.
    pub async fn record_success(
        &self,
        batch: &Model,
        time_efficiency: Option<f64>,
        now: DateTime<FixedOffset>,
    ) -> Result<bool, MigrationError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| db_err("Failed to begin batch completion", e))?;

        let updated = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Succeeded.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::TimeEfficiency, Expr::value(time_efficiency))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(batch.id))
            .filter(Column::Status.eq(BatchStatus::Running.as_str()))
            .filter(Column::Attempts.eq(batch.attempts))
            .exec(&txn)
            .await
            .map_err(|e| db_err("Failed to mark batch succeeded", e))?;

        if updated.rows_affected != 1 {
            txn.rollback()
                .await
                .map_err(|e| db_err("Failed to roll back batch completion", e))?;
            return Ok(false);
        }

        let advanced = batched_migration::Entity::update_many()
            .col_expr(batched_migration::Column::Cursor, Expr::value(batch.max_value))
            .col_expr(batched_migration::Column::LastBatchFinishedAt, Expr::value(now))
            .col_expr(batched_migration::Column::UpdatedAt, Expr::value(now))
            .filter(batched_migration::Column::Id.eq(batch.batched_background_migration_id))
            .filter(batched_migration::Column::Cursor.eq(batch.min_value - 1))
            .exec(&txn)
            .await
            .map_err(|e| db_err("Failed to advance migration cursor", e))?;

        if advanced.rows_affected != 1 {
            txn.rollback()
                .await
                .map_err(|e| db_err("Failed to roll back batch completion", e))?;
            return Ok(false);
        }

        txn.commit()
            .await
            .map_err(|e| db_err("Failed to commit batch completion", e))?;
        Ok(true)
    }

    /// Marks a running batch failed with structured error details.
    ///
    /// Returns `false` without writing anything when this attempt no longer
    /// owns the batch.
    pub async fn record_failure(
        &self,
        batch: &Model,
        error: JsonValue,
        now: DateTime<FixedOffset>,
    ) -> Result<bool, MigrationError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| db_err("Failed to begin batch failure", e))?;

        let updated = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::Error, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(batch.id))
            .filter(Column::Status.eq(BatchStatus::Running.as_str()))
            .filter(Column::Attempts.eq(batch.attempts))
            .exec(&txn)
            .await
            .map_err(|e| db_err("Failed to mark batch failed", e))?;

        if updated.rows_affected != 1 {
            txn.rollback()
                .await
                .map_err(|e| db_err("Failed to roll back batch failure", e))?;
            return Ok(false);
        }

        batched_migration::Entity::update_many()
            .col_expr(batched_migration::Column::LastBatchFinishedAt, Expr::value(now))
            .col_expr(batched_migration::Column::UpdatedAt, Expr::value(now))
            .filter(batched_migration::Column::Id.eq(batch.batched_background_migration_id))
            .exec(&txn)
            .await
            .map_err(|e| db_err("Failed to record batch finish time", e))?;

        txn.commit()
            .await
            .map_err(|e| db_err("Failed to commit batch failure", e))?;
        Ok(true)
    }

    /// Releases a batch whose range was already committed by another worker.
    ///
    /// The batch is marked failed with a `superseded` error so it stops
    /// blocking claims. Returns whether this attempt still owned it.
    pub async fn mark_superseded(
        &self,
        batch: &Model,
        now: DateTime<FixedOffset>,
    ) -> Result<bool, MigrationError> {
        let error = serde_json::json!({
            "kind": "superseded",
            "message": "range was already committed by another worker",
            "attempt": batch.attempts,
        });

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::Error, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(batch.id))
            .filter(Column::Status.eq(BatchStatus::Running.as_str()))
            .filter(Column::Attempts.eq(batch.attempts))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to release superseded batch", e))?;

        Ok(result.rows_affected == 1)
    }

    /// Most recent batch of a migration by range position.
    pub async fn last_batch(&self, migration_id: Uuid) -> Result<Option<Model>, MigrationError> {
        Entity::find()
            .filter(Column::BatchedBackgroundMigrationId.eq(migration_id))
            .order_by_desc(Column::MinValue)
            .order_by_desc(Column::CreatedAt)
            .one(&self.db)
            .await
            .map_err(|e| db_err("Failed to load last batch", e))
    }

    /// Fails `running` batches started before `started_before`, returning how many were reaped.
    pub async fn reap_stuck(
        &self,
        migration_id: Uuid,
        started_before: DateTime<FixedOffset>,
        now: DateTime<FixedOffset>,
    ) -> Result<u64, MigrationError> {
        let error = serde_json::json!({
            "kind": "stuck",
            "message": "batch exceeded the stuck batch timeout",
        });

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::Error, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::BatchedBackgroundMigrationId.eq(migration_id))
            .filter(Column::Status.eq(BatchStatus::Running.as_str()))
            .filter(Column::StartedAt.lt(started_before))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to reap stuck batches", e))?;

        Ok(result.rows_affected)
    }

    /// Time efficiencies of the latest succeeded batches, most recent first.
    pub async fn recent_efficiencies(
        &self,
        migration_id: Uuid,
        window: usize,
    ) -> Result<Vec<f64>, MigrationError> {
        let batches = Entity::find()
            .filter(Column::BatchedBackgroundMigrationId.eq(migration_id))
            .filter(Column::Status.eq(BatchStatus::Succeeded.as_str()))
            .filter(Column::TimeEfficiency.is_not_null())
            .order_by_desc(Column::MaxValue)
            .limit(window as u64)
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to load batch efficiencies", e))?;

        Ok(batches
            .into_iter()
            .filter_map(|batch| batch.time_efficiency)
            .collect())
    }

    /// All batches of a migration ordered by range.
    pub async fn list_for_migration(&self, migration_id: Uuid) -> Result<Vec<Model>, MigrationError> {
        Entity::find()
            .filter(Column::BatchedBackgroundMigrationId.eq(migration_id))
            .order_by_asc(Column::MinValue)
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to list batches", e))
    }

    /// Gives failed batches a fresh attempt budget after an operator resume.
    pub async fn reset_failed_attempts(&self, migration_id: Uuid) -> Result<u64, MigrationError> {
        let result = Entity::update_many()
            .col_expr(Column::Attempts, Expr::value(0))
            .filter(Column::BatchedBackgroundMigrationId.eq(migration_id))
            .filter(Column::Status.eq(BatchStatus::Failed.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to reset batch attempts", e))?;
        Ok(result.rows_affected)
    }
}
