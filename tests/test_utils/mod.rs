//! Test utilities for database testing.
//!
//! In-memory SQLite databases with the tracking schema applied, a fixture
//! table and a few callback doubles.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use batched_migrations::background_migration::{BatchContext, BatchedMigrationJob, JobRegistry};
use batched_migrations::config::RunnerConfig;
use batched_migrations::error::JobError;
use batched_migrations::models::batched_migration;
use batched_migrations::repositories::{BatchedMigrationRepository, QueueMigration};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use tokio::sync::Notify;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Creates `items(id, body, body_copy)` holding ids `1..=rows`.
pub async fn create_items_table(db: &DatabaseConnection, rows: i64) -> Result<()> {
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "CREATE TABLE items (id INTEGER PRIMARY KEY, body TEXT, body_copy TEXT)".to_string(),
    ))
    .await?;

    for id in 1..=rows {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            format!("INSERT INTO items (id, body) VALUES ({id}, 'row {id}')"),
        ))
        .await?;
    }
    Ok(())
}

pub async fn count_where(db: &DatabaseConnection, condition: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            format!("SELECT COUNT(*) AS n FROM items WHERE {condition}"),
        ))
        .await?
        .ok_or_else(|| anyhow::anyhow!("count returned no row"))?;
    Ok(row.try_get::<i64>("", "n")?)
}

/// Runner settings with a fixed batch size.
pub fn runner_config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.optimizer.enabled = false;
    config
}

pub async fn queue_items_migration(
    db: &DatabaseConnection,
    jobs: &JobRegistry,
    job_class_name: &str,
    batch_size: i64,
) -> Result<batched_migration::Model> {
    let mut request = QueueMigration::new(job_class_name, "items", "id");
    request.batch_size = batch_size;
    request.sub_batch_size = batch_size.min(50);
    request.pause_ms = 0;
    Ok(BatchedMigrationRepository::new(db.clone())
        .queue(request, jobs)
        .await?)
}

/// Records every range it is asked to process.
#[derive(Clone, Default)]
pub struct RecordingJob {
    pub ranges: Arc<Mutex<Vec<(i64, i64)>>>,
}

impl RecordingJob {
    pub fn ranges(&self) -> Vec<(i64, i64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchedMigrationJob for RecordingJob {
    async fn perform(&self, ctx: BatchContext<'_>) -> Result<(), JobError> {
        self.ranges
            .lock()
            .unwrap()
            .push((ctx.min_value, ctx.max_value));
        Ok(())
    }
}

/// Always fails.
pub struct FailingJob;

#[async_trait]
impl BatchedMigrationJob for FailingJob {
    async fn perform(&self, _ctx: BatchContext<'_>) -> Result<(), JobError> {
        Err(JobError::failed("deadlock detected"))
    }
}

/// Signals `started` and then blocks until `release` is notified.
#[derive(Clone, Default)]
pub struct GatedJob {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl BatchedMigrationJob for GatedJob {
    async fn perform(&self, _ctx: BatchContext<'_>) -> Result<(), JobError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}
