//! # Data Models
//!
//! SeaORM entities for the tracking tables every managed database carries.

pub mod batched_migration;
pub mod detached_partition;
pub mod migration_batch;

pub use batched_migration::Entity as BatchedMigration;
pub use detached_partition::Entity as DetachedPartition;
pub use migration_batch::Entity as MigrationBatch;
