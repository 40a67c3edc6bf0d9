//! # BatchedMigration Repository
//!
//! Registration, lookup and state transitions of batched background
//! migrations on one database. State changes are compare-and-swap updates
//! keyed on the status that was read, so a concurrent change is detected
//! instead of overwritten.

use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use crate::background_migration::job::JobRegistry;
use crate::background_migration::planner::{ensure_identifiers, estimate_row_count, max_key_value};
use crate::background_migration::state::{MigrationEvent, MigrationStatus, next_status};
use crate::error::{MigrationError, StateError};
use crate::models::batched_migration::{ActiveModel, Column, Entity, Model};
use crate::repositories::MigrationBatchRepository;

pub const DEFAULT_BATCH_SIZE: i64 = 1_000;
pub const DEFAULT_SUB_BATCH_SIZE: i64 = 100;
pub const DEFAULT_MAX_BATCH_SIZE: i64 = 2_000_000;
pub const DEFAULT_PAUSE_MS: i64 = 100;
pub const DEFAULT_INTERVAL_SECONDS: i64 = 120; // 2 minutes
pub const DEFAULT_MIN_VALUE: i64 = 1;

/// Parameters of a migration to register.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMigration {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: JsonValue,
    pub min_value: i64,
    /// Derived from the current maximum key when `None`
    pub max_value: Option<i64>,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub max_batch_size: Option<i64>,
    pub pause_ms: i64,
    pub interval_seconds: i64,
    pub database_identifier: String,
}

impl QueueMigration {
    pub fn new(job_class_name: &str, table_name: &str, column_name: &str) -> Self {
        Self {
            job_class_name: job_class_name.to_string(),
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
            job_arguments: JsonValue::Array(Vec::new()),
            min_value: DEFAULT_MIN_VALUE,
            max_value: None,
            batch_size: DEFAULT_BATCH_SIZE,
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
            max_batch_size: None,
            pause_ms: DEFAULT_PAUSE_MS,
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            database_identifier: "main".to_string(),
        }
    }

    fn validate(&self, jobs: &JobRegistry) -> Result<(), MigrationError> {
        if !jobs.contains(&self.job_class_name) {
            return Err(MigrationError::UnknownJobClass {
                name: self.job_class_name.clone(),
            });
        }
        ensure_identifiers(&self.table_name, &self.column_name)?;

        if self.batch_size <= 0 {
            return Err(MigrationError::configuration("batch_size must be positive"));
        }
        if self.sub_batch_size <= 0 || self.sub_batch_size > self.batch_size {
            return Err(MigrationError::configuration(format!(
                "sub_batch_size must be between 1 and batch_size ({}), got {}",
                self.batch_size, self.sub_batch_size
            )));
        }
        if let Some(max_batch_size) = self.max_batch_size {
            if max_batch_size < self.batch_size {
                return Err(MigrationError::configuration(format!(
                    "max_batch_size ({max_batch_size}) cannot be smaller than batch_size ({})",
                    self.batch_size
                )));
            }
        }
        if self.pause_ms < 0 {
            return Err(MigrationError::configuration("pause_ms cannot be negative"));
        }
        if self.interval_seconds <= 0 {
            return Err(MigrationError::configuration("interval_seconds must be positive"));
        }
        Ok(())
    }
}

/// Repository for batched migration database operations
#[derive(Debug, Clone)]
pub struct BatchedMigrationRepository {
    db: DatabaseConnection,
}

fn db_err(context: &str, err: DbErr) -> MigrationError {
    tracing::error!(error = %err, "{context}");
    MigrationError::Database(err)
}

impl BatchedMigrationRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Registers a migration, or returns the identical one already registered.
    pub async fn queue(
        &self,
        request: QueueMigration,
        jobs: &JobRegistry,
    ) -> Result<Model, MigrationError> {
        request.validate(jobs)?;

        let existing = Entity::find()
            .filter(Column::JobClassName.eq(request.job_class_name.as_str()))
            .filter(Column::TableName.eq(request.table_name.as_str()))
            .filter(Column::ColumnName.eq(request.column_name.as_str()))
            .filter(Column::DatabaseIdentifier.eq(request.database_identifier.as_str()))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to look up existing migrations", e))?
            .into_iter()
            .find(|migration| migration.job_arguments == request.job_arguments);

        if let Some(existing) = existing {
            info!(
                migration_id = %existing.id,
                job_class_name = %existing.job_class_name,
                "Batched migration already registered"
            );
            return Ok(existing);
        }

        let max_value = match request.max_value {
            Some(max_value) => max_value,
            None => max_key_value(&self.db, &request.table_name, &request.column_name)
                .await
                .map_err(|e| db_err("Failed to derive migration max value", e))?
                .unwrap_or(request.min_value - 1),
        };
        let total_tuple_count = estimate_row_count(&self.db, &request.table_name)
            .await
            .map_err(|e| db_err("Failed to estimate table size", e))?;

        let now = Utc::now().fixed_offset();
        let migration = ActiveModel {
            id: Set(Uuid::new_v4()),
            job_class_name: Set(request.job_class_name),
            table_name: Set(request.table_name),
            column_name: Set(request.column_name),
            job_arguments: Set(request.job_arguments),
            min_value: Set(request.min_value),
            max_value: Set(max_value),
            batch_size: Set(request.batch_size),
            sub_batch_size: Set(request.sub_batch_size),
            max_batch_size: Set(request
                .max_batch_size
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE.max(request.batch_size))),
            pause_ms: Set(request.pause_ms),
            interval_seconds: Set(request.interval_seconds),
            cursor: Set(request.min_value - 1),
            total_tuple_count: Set(Some(total_tuple_count)),
            status: Set(MigrationStatus::Active.as_str().to_string()),
            database_identifier: Set(request.database_identifier),
            created_at: Set(now),
            updated_at: Set(now),
            last_batch_started_at: Set(None),
            last_batch_finished_at: Set(None),
        };

        let migration = migration
            .insert(&self.db)
            .await
            .map_err(|e| db_err("Failed to register batched migration", e))?;

        info!(
            migration_id = %migration.id,
            job_class_name = %migration.job_class_name,
            table_name = %migration.table_name,
            min_value = migration.min_value,
            max_value = migration.max_value,
            "Batched migration queued"
        );

        Ok(migration)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, MigrationError> {
        Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|e| db_err("Failed to find batched migration", e))
    }

    /// Like [`find_by_id`](Self::find_by_id) but missing rows are an error.
    pub async fn get(&self, id: Uuid) -> Result<Model, MigrationError> {
        self.find_by_id(id)
            .await?
            .ok_or(MigrationError::NotFound { id })
    }

    /// Migrations of a database (all databases when `None`), oldest first.
    pub async fn list(&self, database_identifier: Option<&str>) -> Result<Vec<Model>, MigrationError> {
        let mut query = Entity::find()
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id);
        if let Some(database_identifier) = database_identifier {
            query = query.filter(Column::DatabaseIdentifier.eq(database_identifier));
        }
        query
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to list batched migrations", e))
    }

    /// Earliest-created active migration registered under any of
    /// `database_identifiers` whose interval elapsed.
    pub async fn find_executable(
        &self,
        database_identifiers: &[&str],
        now: DateTime<FixedOffset>,
    ) -> Result<Option<Model>, MigrationError> {
        let candidates = Entity::find()
            .filter(Column::DatabaseIdentifier.is_in(database_identifiers.iter().copied()))
            .filter(Column::Status.eq(MigrationStatus::Active.as_str()))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
            .map_err(|e| db_err("Failed to find executable migrations", e))?;

        Ok(candidates
            .into_iter()
            .find(|migration| migration.interval_elapsed(now, chrono::Duration::zero())))
    }

    /// Applies `event`, failing without side effects when it is illegal or lost a race.
    pub async fn transition(&self, id: Uuid, event: MigrationEvent) -> Result<Model, MigrationError> {
        let migration = self.get(id).await?;
        let from = migration.status();
        let to = next_status(from, event)?;
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(migration.status.as_str()))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to transition batched migration", e))?;

        if result.rows_affected != 1 {
            return Err(StateError::Conflict { id }.into());
        }

        if from == MigrationStatus::Failed && event == MigrationEvent::Resume {
            MigrationBatchRepository::new(self.db.clone())
                .reset_failed_attempts(id)
                .await?;
        }

        info!(
            migration_id = %id,
            from = %from,
            to = %to,
            event = %event,
            "Batched migration transitioned"
        );

        self.get(id).await
    }

    /// Records that a batch of `id` just started.
    pub async fn record_batch_started(
        &self,
        id: Uuid,
        now: DateTime<FixedOffset>,
    ) -> Result<(), MigrationError> {
        Entity::update_many()
            .col_expr(Column::LastBatchStartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to record batch start", e))?;
        Ok(())
    }

    pub async fn update_batch_size(&self, id: Uuid, batch_size: i64) -> Result<(), MigrationError> {
        Entity::update_many()
            .col_expr(Column::BatchSize, Expr::value(batch_size))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(|e| db_err("Failed to update batch size", e))?;
        Ok(())
    }
}
