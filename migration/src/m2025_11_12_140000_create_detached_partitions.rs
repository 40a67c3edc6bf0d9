//! Migration to create the detached_partitions table.
//!
//! Partitions detached by the lifecycle manager are recorded here with the
//! earliest time they may be dropped, so the physical drop happens later and
//! outside the detach step.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DetachedPartitions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DetachedPartitions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(DetachedPartitions::ParentTable)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DetachedPartitions::PartitionName)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DetachedPartitions::DropAfter)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DetachedPartitions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_detached_partitions_partition_name")
                    .table(DetachedPartitions::Table)
                    .col(DetachedPartitions::PartitionName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_detached_partitions_partition_name")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DetachedPartitions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DetachedPartitions {
    Table,
    Id,
    ParentTable,
    PartitionName,
    DropAfter,
    CreatedAt,
}
