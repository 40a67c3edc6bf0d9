//! Migration callbacks and the registry that resolves them by name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::debug;

use super::planner::nth_key_at_or_after;
use crate::error::{JobError, MigrationError};
use crate::models::batched_migration;

/// Everything a callback receives for one batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchContext<'a> {
    /// Connection of the database that owns the migrated table
    pub connection: &'a DatabaseConnection,
    pub table_name: &'a str,
    pub column_name: &'a str,
    pub job_arguments: &'a JsonValue,
    /// Inclusive lower key bound
    pub min_value: i64,
    /// Inclusive upper key bound
    pub max_value: i64,
    pub sub_batch_size: i64,
    pub pause_ms: u64,
}

impl<'a> BatchContext<'a> {
    pub fn new(
        connection: &'a DatabaseConnection,
        migration: &'a batched_migration::Model,
        min_value: i64,
        max_value: i64,
    ) -> Self {
        Self {
            connection,
            table_name: &migration.table_name,
            column_name: &migration.column_name,
            job_arguments: &migration.job_arguments,
            min_value,
            max_value,
            sub_batch_size: migration.sub_batch_size,
            pause_ms: migration.pause_ms.max(0) as u64,
        }
    }

    /// Deserializes the job arguments into `T`.
    pub fn arguments<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job_arguments.clone())
            .map_err(|err| JobError::invalid_arguments(err.to_string()))
    }

    /// Splits the batch into chunks of at most `sub_batch_size` existing keys.
    ///
    /// `f` receives the inclusive bounds of each chunk; `pause_ms` is slept
    /// between chunks. Returns the number of chunks processed.
    pub async fn each_sub_batch<F, Fut>(&self, mut f: F) -> Result<usize, JobError>
    where
        F: FnMut(i64, i64) -> Fut,
        Fut: Future<Output = Result<(), JobError>>,
    {
        let mut start = self.min_value;
        let mut chunks = 0;

        while start <= self.max_value {
            let end = nth_key_at_or_after(
                self.connection,
                self.table_name,
                self.column_name,
                start,
                self.max_value,
                self.sub_batch_size,
            )
            .await?
            .unwrap_or(self.max_value);

            if chunks > 0 && self.pause_ms > 0 {
                sleep(Duration::from_millis(self.pause_ms)).await;
            }

            debug!(start, end, "Processing sub-batch");
            f(start, end).await?;
            chunks += 1;

            if end >= self.max_value {
                break;
            }
            start = end + 1;
        }

        Ok(chunks)
    }
}

/// A data migration applied one key range at a time.
///
/// Implementations must be idempotent and only touch rows inside
/// `[ctx.min_value, ctx.max_value]`: a failed range is retried as a whole.
#[async_trait]
pub trait BatchedMigrationJob: Send + Sync {
    async fn perform(&self, ctx: BatchContext<'_>) -> Result<(), JobError>;
}

/// Callbacks keyed by job class name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn BatchedMigrationJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job` under `name`, replacing any previous registration.
    pub fn register<J>(&mut self, name: impl Into<String>, job: J) -> &mut Self
    where
        J: BatchedMigrationJob + 'static,
    {
        self.jobs.insert(name.into(), Arc::new(job));
        self
    }

    pub fn with<J>(mut self, name: impl Into<String>, job: J) -> Self
    where
        J: BatchedMigrationJob + 'static,
    {
        self.register(name, job);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn BatchedMigrationJob>, MigrationError> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownJobClass {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{ConnectionTrait, Database, Statement};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Noop;

    #[async_trait]
    impl BatchedMigrationJob for Noop {
        async fn perform(&self, _ctx: BatchContext<'_>) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn migration(sub_batch_size: i64) -> batched_migration::Model {
        let now = Utc::now().fixed_offset();
        batched_migration::Model {
            id: Uuid::new_v4(),
            job_class_name: "Noop".to_string(),
            table_name: "items".to_string(),
            column_name: "id".to_string(),
            job_arguments: serde_json::json!({ "column": "body" }),
            min_value: 1,
            max_value: 100,
            batch_size: 50,
            sub_batch_size,
            max_batch_size: 100,
            pause_ms: 0,
            interval_seconds: 60,
            cursor: 0,
            total_tuple_count: None,
            status: "active".to_string(),
            database_identifier: "main".to_string(),
            created_at: now,
            updated_at: now,
            last_batch_started_at: None,
            last_batch_finished_at: None,
        }
    }

    #[test]
    fn unknown_job_class_is_a_configuration_error() {
        let registry = JobRegistry::new().with("Noop", Noop);
        assert!(registry.contains("Noop"));
        assert!(registry.resolve("Noop").is_ok());

        let err = registry.resolve("Missing").err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn sub_batches_cover_the_range_in_order() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.execute(Statement::from_string(
            db.get_database_backend(),
            "CREATE TABLE items (id INTEGER PRIMARY KEY)".to_string(),
        ))
        .await
        .unwrap();
        for id in [1, 2, 3, 10, 11, 40] {
            db.execute(Statement::from_string(
                db.get_database_backend(),
                format!("INSERT INTO items (id) VALUES ({id})"),
            ))
            .await
            .unwrap();
        }

        let model = migration(2);
        let ctx = BatchContext::new(&db, &model, 1, 50);
        let seen = Mutex::new(Vec::new());

        let chunks = ctx
            .each_sub_batch(|lo, hi| {
                seen.lock().unwrap().push((lo, hi));
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(chunks, 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, 2), (3, 10), (11, 40), (41, 50)]
        );
    }

    #[test]
    fn arguments_deserialize_into_typed_struct() {
        #[derive(serde::Deserialize)]
        struct Args {
            column: String,
        }

        let model = migration(10);
        let db = DatabaseConnection::Disconnected;
        let ctx = BatchContext::new(&db, &model, 1, 10);

        let args: Args = ctx.arguments().unwrap();
        assert_eq!(args.column, "body");
        assert!(ctx.arguments::<Vec<i64>>().is_err());
    }
}
