//! Batch Runner
//!
//! Executes exactly one batch of a migration: plans (or picks up the range
//! to retry), claims it with a compare-and-swap, awaits the callback on the
//! migration's own database connection and records the outcome.
//!
//! No transaction is held while the callback runs. Callbacks are idempotent
//! and range-scoped, so a crash mid-batch is repaired by re-running the
//! same range.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, Utc};
use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::job::{BatchContext, JobRegistry};
use super::optimizer::optimized_batch_size;
use super::planner::{PlannedBatch, plan_next};
use super::state::{BatchStatus, MigrationEvent, MigrationStatus};
use crate::backoff::BackoffPolicy;
use crate::config::RunnerConfig;
use crate::error::{MigrationError, StateError};
use crate::models::{batched_migration, migration_batch};
use crate::repositories::{BatchedMigrationRepository, ClaimOutcome, MigrationBatchRepository};

/// How many times finalize waits out a batch running elsewhere before giving up.
const FINALIZE_MAX_CONTENDED_WAITS: u32 = 10;

/// Outcome of one [`BatchRunner::run`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    /// The range was exhausted and the migration is now finished.
    Finished,
    Succeeded {
        batch: migration_batch::Model,
        /// The batch reached `max_value` and the migration was marked finished.
        migration_finished: bool,
    },
    Failed {
        batch: migration_batch::Model,
        error: String,
        /// The failure threshold was reached and the migration was marked failed.
        migration_failed: bool,
    },
    /// Another worker owns the migration's running batch.
    RaceLost,
    /// The migration was not active when the runner looked at it.
    NotActive { status: MigrationStatus },
}

enum Acquired {
    Batch(migration_batch::Model),
    Done,
    RaceLost,
}

/// Runs batches of migrations that live on one database.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    db: DatabaseConnection,
    jobs: Arc<JobRegistry>,
    config: RunnerConfig,
    migrations: BatchedMigrationRepository,
    batches: MigrationBatchRepository,
}

impl BatchRunner {
    pub fn new(db: DatabaseConnection, jobs: Arc<JobRegistry>, config: RunnerConfig) -> Self {
        Self {
            migrations: BatchedMigrationRepository::new(db.clone()),
            batches: MigrationBatchRepository::new(db.clone()),
            db,
            jobs,
            config,
        }
    }

    /// Executes the next batch of `migration`.
    ///
    /// Callback failures are reported through [`BatchResult::Failed`]; only
    /// database and configuration problems are returned as errors.
    #[instrument(skip(self, migration), fields(migration_id = %migration.id, job_class_name = %migration.job_class_name))]
    pub async fn run(&self, migration: &batched_migration::Model) -> Result<BatchResult, MigrationError> {
        let now = Utc::now().fixed_offset();
        self.reap_stuck_batches(migration.id, now).await?;

        let migration = self.migrations.get(migration.id).await?;
        let status = migration.status();
        if status != MigrationStatus::Active {
            debug!(status = %status, "Migration is not active; skipping");
            return Ok(BatchResult::NotActive { status });
        }
        let job = self.jobs.resolve(&migration.job_class_name)?;

        let batch = match self.acquire_batch(&migration, now).await? {
            Acquired::Batch(batch) => batch,
            Acquired::Done => return self.finish(&migration).await,
            Acquired::RaceLost => {
                debug!("Another worker owns the running batch");
                return Ok(BatchResult::RaceLost);
            }
        };
        self.migrations.record_batch_started(migration.id, now).await?;

        info!(
            batch_id = %batch.id,
            min_value = batch.min_value,
            max_value = batch.max_value,
            attempt = batch.attempts,
            "Starting batch"
        );

        let started = Instant::now();
        let ctx = BatchContext::new(&self.db, &migration, batch.min_value, batch.max_value);
        let outcome = job.perform(ctx).await;
        let elapsed = started.elapsed();

        let labels = vec![
            ("job_class_name", migration.job_class_name.clone()),
            ("table_name", migration.table_name.clone()),
        ];
        histogram!("batched_migration_batch_duration_seconds", &labels).record(elapsed.as_secs_f64());

        match outcome {
            Ok(()) => self.handle_success(&migration, batch, elapsed).await,
            Err(err) => {
                let message = err.to_string();
                let details = serde_json::json!({
                    "kind": err.kind(),
                    "message": message,
                    "attempt": batch.attempts,
                    "duration_ms": elapsed.as_millis() as u64,
                });
                self.handle_failure(&migration, batch, message, details).await
            }
        }
    }

    /// Runs the remaining batches inline, ignoring the interval, until the migration is terminal.
    #[instrument(skip(self))]
    pub async fn finalize(&self, migration_id: Uuid) -> Result<batched_migration::Model, MigrationError> {
        let backoff = BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10), 0.1);
        let mut contended_waits = 0;

        loop {
            let migration = self.migrations.get(migration_id).await?;
            match migration.status() {
                MigrationStatus::Finished | MigrationStatus::Failed => return Ok(migration),
                MigrationStatus::Paused => {
                    return Err(StateError::IllegalTransition {
                        from: MigrationStatus::Paused,
                        event: MigrationEvent::MarkFinished,
                    }
                    .into());
                }
                MigrationStatus::Active => {}
            }

            match self.run(&migration).await? {
                BatchResult::RaceLost => {
                    if contended_waits >= FINALIZE_MAX_CONTENDED_WAITS {
                        return Err(MigrationError::Contended { id: migration_id });
                    }
                    let delay = backoff.next_delay_with_jitter(contended_waits, &mut rand::thread_rng());
                    contended_waits += 1;
                    debug!(?delay, "Batch running elsewhere; waiting before finalizing further");
                    sleep(delay).await;
                }
                _ => contended_waits = 0,
            }
        }
    }

    /// Picks the range to execute: a pending or failed batch at the cursor is
    /// retried as is, otherwise a new range is planned.
    async fn acquire_batch(
        &self,
        migration: &batched_migration::Model,
        now: DateTime<FixedOffset>,
    ) -> Result<Acquired, MigrationError> {
        if let Some(last) = self.batches.last_batch(migration.id).await? {
            match last.status() {
                Some(BatchStatus::Running) => return Ok(Acquired::RaceLost),
                Some(status @ (BatchStatus::Pending | BatchStatus::Failed))
                    if last.min_value == migration.cursor + 1 =>
                {
                    return match self.batches.claim(&last, status, now).await? {
                        ClaimOutcome::Claimed(batch) => Ok(Acquired::Batch(batch)),
                        ClaimOutcome::RaceLost => Ok(Acquired::RaceLost),
                    };
                }
                _ => {}
            }
        }

        let range = match plan_next(&self.db, migration).await? {
            PlannedBatch::Done => return Ok(Acquired::Done),
            PlannedBatch::Range(range) => range,
        };

        let pending = self.batches.create_pending(migration, range, now).await?;
        match self.batches.claim(&pending, BatchStatus::Pending, now).await? {
            ClaimOutcome::Claimed(batch) => Ok(Acquired::Batch(batch)),
            ClaimOutcome::RaceLost => {
                self.batches.discard_pending(pending.id).await?;
                Ok(Acquired::RaceLost)
            }
        }
    }

    async fn handle_success(
        &self,
        migration: &batched_migration::Model,
        batch: migration_batch::Model,
        elapsed: Duration,
    ) -> Result<BatchResult, MigrationError> {
        let time_efficiency = (migration.interval_seconds > 0)
            .then(|| elapsed.as_secs_f64() / migration.interval_seconds as f64);
        let finished_at = Utc::now().fixed_offset();

        if !self
            .batches
            .record_success(&batch, time_efficiency, finished_at)
            .await?
        {
            if self.batches.mark_superseded(&batch, finished_at).await? {
                warn!(batch_id = %batch.id, "Range was committed elsewhere; batch released");
            } else {
                warn!(batch_id = %batch.id, "Batch was taken over while running; result discarded");
            }
            return Ok(BatchResult::RaceLost);
        }

        let labels = vec![
            ("job_class_name", migration.job_class_name.clone()),
            ("outcome", "succeeded".to_string()),
        ];
        counter!("batched_migration_batches_total", &labels).increment(1);
        histogram!(
            "batched_migration_batch_range_size",
            "job_class_name" => migration.job_class_name.clone()
        )
        .record((batch.max_value - batch.min_value + 1) as f64);

        info!(
            batch_id = %batch.id,
            min_value = batch.min_value,
            max_value = batch.max_value,
            elapsed_ms = elapsed.as_millis() as u64,
            time_efficiency = ?time_efficiency,
            "Batch succeeded"
        );

        self.adjust_batch_size(migration).await?;

        let mut progressed = migration.clone();
        progressed.cursor = batch.max_value;
        gauge!("batched_migration_progress_percent", "migration_id" => migration.id.to_string())
            .set(progressed.progress());

        let migration_finished = if progressed.is_range_exhausted() {
            matches!(self.finish(&progressed).await?, BatchResult::Finished)
        } else {
            false
        };

        let mut batch = batch;
        batch.status = BatchStatus::Succeeded.as_str().to_string();
        batch.finished_at = Some(finished_at);
        batch.time_efficiency = time_efficiency;

        Ok(BatchResult::Succeeded {
            batch,
            migration_finished,
        })
    }

    async fn handle_failure(
        &self,
        migration: &batched_migration::Model,
        batch: migration_batch::Model,
        message: String,
        details: serde_json::Value,
    ) -> Result<BatchResult, MigrationError> {
        let finished_at = Utc::now().fixed_offset();
        if !self
            .batches
            .record_failure(&batch, details.clone(), finished_at)
            .await?
        {
            warn!(batch_id = %batch.id, error = %message, "Batch was taken over while running; failure discarded");
            return Ok(BatchResult::RaceLost);
        }

        let labels = vec![
            ("job_class_name", migration.job_class_name.clone()),
            ("outcome", "failed".to_string()),
        ];
        counter!("batched_migration_batches_total", &labels).increment(1);

        warn!(
            batch_id = %batch.id,
            min_value = batch.min_value,
            max_value = batch.max_value,
            attempt = batch.attempts,
            error = %message,
            "Batch failed"
        );

        let mut migration_failed = false;
        if batch.attempts.max(0) as u32 >= self.config.max_attempts {
            match self
                .migrations
                .transition(migration.id, MigrationEvent::MarkFailed)
                .await
            {
                Ok(_) => {
                    migration_failed = true;
                    counter!(
                        "batched_migration_failures_total",
                        "job_class_name" => migration.job_class_name.clone()
                    )
                    .increment(1);
                    error!(
                        migration_id = %migration.id,
                        job_class_name = %migration.job_class_name,
                        table_name = %migration.table_name,
                        column_name = %migration.column_name,
                        min_value = batch.min_value,
                        max_value = batch.max_value,
                        attempts = batch.attempts,
                        error = %message,
                        "Batched migration failed; operator intervention required"
                    );
                }
                Err(MigrationError::State(err)) => {
                    warn!(error = %err, "Could not mark migration failed");
                }
                Err(err) => return Err(err),
            }
        }

        let mut batch = batch;
        batch.status = BatchStatus::Failed.as_str().to_string();
        batch.finished_at = Some(finished_at);
        batch.error = Some(details);

        Ok(BatchResult::Failed {
            batch,
            error: message,
            migration_failed,
        })
    }

    async fn finish(&self, migration: &batched_migration::Model) -> Result<BatchResult, MigrationError> {
        match self
            .migrations
            .transition(migration.id, MigrationEvent::MarkFinished)
            .await
        {
            Ok(finished) => {
                info!(
                    migration_id = %finished.id,
                    job_class_name = %finished.job_class_name,
                    "Batched migration finished"
                );
                gauge!("batched_migration_progress_percent", "migration_id" => finished.id.to_string())
                    .set(100.0);
                Ok(BatchResult::Finished)
            }
            Err(MigrationError::State(err)) => {
                warn!(error = %err, "Could not mark migration finished");
                let status = self.migrations.get(migration.id).await?.status();
                Ok(BatchResult::NotActive { status })
            }
            Err(err) => Err(err),
        }
    }

    async fn adjust_batch_size(&self, migration: &batched_migration::Model) -> Result<(), MigrationError> {
        let optimizer = &self.config.optimizer;
        if !optimizer.enabled {
            return Ok(());
        }

        let efficiencies = self
            .batches
            .recent_efficiencies(migration.id, optimizer.window)
            .await?;
        let next = optimized_batch_size(
            migration.batch_size,
            &efficiencies,
            migration.sub_batch_size,
            migration.max_batch_size,
            optimizer,
        );

        if next != migration.batch_size {
            info!(
                from = migration.batch_size,
                to = next,
                "Adjusting batch size"
            );
            self.migrations.update_batch_size(migration.id, next).await?;
        }
        Ok(())
    }

    async fn reap_stuck_batches(
        &self,
        migration_id: Uuid,
        now: DateTime<FixedOffset>,
    ) -> Result<(), MigrationError> {
        let timeout = chrono::Duration::seconds(self.config.stuck_batch_timeout_seconds as i64);
        let reaped = self
            .batches
            .reap_stuck(migration_id, now - timeout, now)
            .await?;
        if reaped > 0 {
            counter!("batched_migration_stuck_batches_total").increment(reaped);
            warn!(reaped, "Marked stuck batches as failed");
        }
        Ok(())
    }
}
