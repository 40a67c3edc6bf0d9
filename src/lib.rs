//! # Batched Background Migrations
//!
//! Runs large data migrations in small key-range batches on a schedule and
//! maintains the partitions of append-heavy tables.

pub mod background_migration;
pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod partitioning;
pub mod repositories;
pub mod switches;
pub mod telemetry;
pub use migration;
