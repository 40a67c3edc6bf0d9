//! # Execution Scheduler
//!
//! Periodic entry point of batched background migrations. Each tick looks at
//! one database, picks the earliest executable migration and hands it to the
//! [`BatchRunner`]. The scheduler itself never changes migration state.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::job::JobRegistry;
use super::runner::{BatchResult, BatchRunner};
use crate::config::{AppConfig, SchedulerConfig};
use crate::db::DatabaseRouter;
use crate::error::MigrationError;
use crate::repositories::BatchedMigrationRepository;
use crate::switches::{OperationalSwitches, Switch};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The scheduling kill switch is off.
    Disabled,
    /// The database is physically shared with another identifier, whose ticks run its migrations.
    SharedDatabase { shares_with: String },
    NoExecutableMigration,
    /// The candidate's interval plus jitter has not elapsed yet.
    IntervalNotElapsed { migration_id: Uuid },
    Executed { migration_id: Uuid, result: BatchResult },
}

/// Background scheduler for batched migrations across all configured databases.
#[derive(Debug, Clone)]
pub struct ExecutionScheduler {
    config: Arc<AppConfig>,
    router: Arc<DatabaseRouter>,
    jobs: Arc<JobRegistry>,
    switches: Arc<OperationalSwitches>,
}

impl ExecutionScheduler {
    pub fn new(
        config: Arc<AppConfig>,
        router: Arc<DatabaseRouter>,
        jobs: Arc<JobRegistry>,
        switches: Arc<OperationalSwitches>,
    ) -> Self {
        Self {
            config,
            router,
            jobs,
            switches,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), MigrationError> {
        info!("Starting batched migration scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.scheduler.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Batched migration scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    let databases: Vec<String> = self.router.names().map(str::to_string).collect();
                    for database in databases {
                        match self.tick(&database).await {
                            Ok(outcome) => debug!(database = %database, ?outcome, "Scheduler tick completed"),
                            Err(err) => error!(database = %database, error = %err, "Scheduler tick failed"),
                        }
                    }
                    histogram!("batched_migration_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Batched migration scheduler stopped");
        Ok(())
    }

    /// Executes at most one batch on `database_identifier`.
    pub async fn tick(&self, database_identifier: &str) -> Result<TickOutcome, MigrationError> {
        let jitter = sample_variance_jitter(&self.config.scheduler);
        self.tick_at(database_identifier, Utc::now().fixed_offset(), jitter)
            .await
    }

    /// [`tick`](Self::tick) with an explicit clock and interval jitter.
    #[instrument(skip(self), fields(database = %database_identifier))]
    pub async fn tick_at(
        &self,
        database_identifier: &str,
        now: DateTime<FixedOffset>,
        jitter: chrono::Duration,
    ) -> Result<TickOutcome, MigrationError> {
        if !self
            .switches
            .is_enabled(Switch::ExecuteBatchedMigrationsOnSchedule)
        {
            debug!("Scheduled execution disabled");
            return Ok(TickOutcome::Disabled);
        }

        let connection = self.router.connection(database_identifier)?;
        if let Some(owner) = self.router.shares_storage_with(database_identifier) {
            debug!(shares_with = owner, "Database shares storage; skipping");
            return Ok(TickOutcome::SharedDatabase {
                shares_with: owner.to_string(),
            });
        }

        // Identifiers sharing this storage register their migrations here too.
        let identifiers = self.router.identifiers_sharing(database_identifier);
        let migrations = BatchedMigrationRepository::new(connection.clone());
        let Some(migration) = migrations
            .find_executable(&identifiers, now)
            .await?
        else {
            return Ok(TickOutcome::NoExecutableMigration);
        };

        if !migration.interval_elapsed(now, jitter) {
            debug!(migration_id = %migration.id, "Interval with variance not elapsed");
            return Ok(TickOutcome::IntervalNotElapsed {
                migration_id: migration.id,
            });
        }

        let runner = BatchRunner::new(
            connection.clone(),
            self.jobs.clone(),
            self.config.runner.clone(),
        );
        let result = runner.run(&migration).await?;

        counter!(
            "batched_migration_scheduler_ticks_total",
            "database" => database_identifier.to_string()
        )
        .increment(1);

        Ok(TickOutcome::Executed {
            migration_id: migration.id,
            result,
        })
    }
}

fn sample_variance_jitter(config: &SchedulerConfig) -> chrono::Duration {
    let mut rng = rand::thread_rng();
    compute_variance_jitter(config, &mut rng)
}

/// Random extra delay in `[0, interval_variance_seconds]`, millisecond granularity.
fn compute_variance_jitter<R: Rng + ?Sized>(config: &SchedulerConfig, rng: &mut R) -> chrono::Duration {
    let max_ms = config.interval_variance_seconds.saturating_mul(1_000) as i64;
    if max_ms <= 0 {
        return chrono::Duration::zero();
    }
    chrono::Duration::milliseconds(rng.gen_range(0..=max_ms))
}
