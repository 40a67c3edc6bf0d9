//! Database migrations for the batched background migration tracking schema.
//!
//! Applied once per configured database; every database tracks its own
//! migrations, batches and detached partitions.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_090000_create_batched_background_migrations;
mod m2025_11_10_090100_create_batched_background_migration_batches;
mod m2025_11_10_090200_add_single_running_batch_guard;
mod m2025_11_12_140000_create_detached_partitions;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_090000_create_batched_background_migrations::Migration),
            Box::new(m2025_11_10_090100_create_batched_background_migration_batches::Migration),
            Box::new(m2025_11_10_090200_add_single_running_batch_guard::Migration),
            Box::new(m2025_11_12_140000_create_detached_partitions::Migration),
        ]
    }
}
