//! Migration to create the batched_background_migrations table.
//!
//! Each row describes one long-running data migration over a bounded key range
//! of a single table, together with its tuning parameters and progress cursor.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BatchedBackgroundMigrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::JobClassName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::TableName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::ColumnName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::JobArguments)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::MinValue)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::MaxValue)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::BatchSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::SubBatchSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::MaxBatchSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::PauseMs)
                            .big_integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::IntervalSeconds)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::Cursor)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::TotalTupleCount)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::DatabaseIdentifier)
                            .text()
                            .not_null()
                            .default("main"),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::LastBatchStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BatchedBackgroundMigrations::LastBatchFinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Lookup path for find_executable: active migrations of one database, oldest first
        manager
            .create_index(
                Index::create()
                    .name("idx_bbm_database_status_created")
                    .table(BatchedBackgroundMigrations::Table)
                    .col(BatchedBackgroundMigrations::DatabaseIdentifier)
                    .col(BatchedBackgroundMigrations::Status)
                    .col(BatchedBackgroundMigrations::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bbm_job_class_table_column")
                    .table(BatchedBackgroundMigrations::Table)
                    .col(BatchedBackgroundMigrations::JobClassName)
                    .col(BatchedBackgroundMigrations::TableName)
                    .col(BatchedBackgroundMigrations::ColumnName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_bbm_database_status_created").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_bbm_job_class_table_column").to_owned())
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(BatchedBackgroundMigrations::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum BatchedBackgroundMigrations {
    Table,
    Id,
    JobClassName,
    TableName,
    ColumnName,
    JobArguments,
    MinValue,
    MaxValue,
    BatchSize,
    SubBatchSize,
    MaxBatchSize,
    PauseMs,
    IntervalSeconds,
    Cursor,
    TotalTupleCount,
    Status,
    DatabaseIdentifier,
    CreatedAt,
    UpdatedAt,
    LastBatchStartedAt,
    LastBatchFinishedAt,
}
