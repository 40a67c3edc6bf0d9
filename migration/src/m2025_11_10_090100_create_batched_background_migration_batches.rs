//! Migration to create the batched_background_migration_batches table.
//!
//! One row per executed slice of a batched background migration, tracking the
//! key range, attempt count, timing and error details of that slice.

use sea_orm_migration::prelude::*;

use crate::m2025_11_10_090000_create_batched_background_migrations::BatchedBackgroundMigrations;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BatchedBackgroundMigrationBatches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(
                            BatchedBackgroundMigrationBatches::BatchedBackgroundMigrationId,
                        )
                        .uuid()
                        .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::MinValue)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::MaxValue)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::BatchSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::SubBatchSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::PauseMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::TimeEfficiency)
                            .double()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::Error)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrationBatches::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_bbm_batches_migration_id")
                            .from(
                                BatchedBackgroundMigrationBatches::Table,
                                BatchedBackgroundMigrationBatches::BatchedBackgroundMigrationId,
                            )
                            .to(
                                BatchedBackgroundMigrations::Table,
                                BatchedBackgroundMigrations::Id,
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bbm_batches_migration_min_value")
                    .table(BatchedBackgroundMigrationBatches::Table)
                    .col(BatchedBackgroundMigrationBatches::BatchedBackgroundMigrationId)
                    .col(BatchedBackgroundMigrationBatches::MinValue)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bbm_batches_migration_status")
                    .table(BatchedBackgroundMigrationBatches::Table)
                    .col(BatchedBackgroundMigrationBatches::BatchedBackgroundMigrationId)
                    .col(BatchedBackgroundMigrationBatches::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_bbm_batches_migration_min_value")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_bbm_batches_migration_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(BatchedBackgroundMigrationBatches::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum BatchedBackgroundMigrationBatches {
    Table,
    Id,
    BatchedBackgroundMigrationId,
    MinValue,
    MaxValue,
    BatchSize,
    SubBatchSize,
    PauseMs,
    Status,
    Attempts,
    StartedAt,
    FinishedAt,
    TimeEfficiency,
    Error,
    CreatedAt,
    UpdatedAt,
}
