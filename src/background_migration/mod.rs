//! # Batched Background Migrations
//!
//! Large data changes broken into small key-range batches that are executed
//! over time. Components:
//!
//! - [`state`]: lifecycle statuses and the transition function
//! - [`planner`]: next key range from the cursor
//! - [`job`]: callbacks and the registry that resolves them by name
//! - [`optimizer`]: adaptive batch sizing
//! - [`runner`]: executes one batch and persists the outcome
//! - [`scheduler`]: periodic ticks per database
//! - [`copy_column`]: built-in column backfill job

pub mod copy_column;
pub mod job;
pub mod optimizer;
pub mod planner;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use copy_column::{COPY_COLUMN_JOB, CopyColumnJob};
pub use job::{BatchContext, BatchedMigrationJob, JobRegistry};
pub use planner::{BatchRange, PlannedBatch, plan_next};
pub use runner::{BatchResult, BatchRunner};
pub use scheduler::{ExecutionScheduler, TickOutcome};
pub use state::{BatchStatus, MigrationEvent, MigrationStatus, next_status};
