//! DetachedPartition entity model
//!
//! Partitions detached by the lifecycle manager, waiting to be dropped.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "detached_partitions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Partitioned table the partition was detached from
    pub parent_table: String,

    /// Name of the detached partition table
    #[sea_orm(unique)]
    pub partition_name: String,

    /// Earliest time the partition may be dropped
    pub drop_after: DateTimeWithTimeZone,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
