//! # Repository Layer
//!
//! Repositories wrap SeaORM access to the tracking tables of one database.

pub mod batched_migration;
pub mod detached_partition;
pub mod migration_batch;

pub use batched_migration::{BatchedMigrationRepository, QueueMigration};
pub use detached_partition::DetachedPartitionRepository;
pub use migration_batch::{ClaimOutcome, MigrationBatchRepository};
