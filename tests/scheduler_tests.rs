//! Execution scheduler ticks against an in-memory SQLite database.

mod test_utils;

use std::sync::Arc;

use batched_migrations::background_migration::{
    BatchResult, ExecutionScheduler, JobRegistry, TickOutcome,
};
use batched_migrations::config::{AppConfig, DatabaseConfig};
use batched_migrations::db::DatabaseRouter;
use batched_migrations::error::MigrationError;
use batched_migrations::repositories::{
    BatchedMigrationRepository, MigrationBatchRepository, QueueMigration,
};
use batched_migrations::switches::{OperationalSwitches, Switch};
use chrono::{Duration, Utc};
use sea_orm::DatabaseConnection;
use test_utils::{
    GatedJob, RecordingJob, create_items_table, queue_items_migration, runner_config,
    setup_test_db,
};
use tokio_util::sync::CancellationToken;

fn app_config() -> Arc<AppConfig> {
    let mut config = AppConfig::default();
    config.runner = runner_config();
    Arc::new(config)
}

fn scheduler(
    router: DatabaseRouter,
    jobs: Arc<JobRegistry>,
    switches: Arc<OperationalSwitches>,
) -> ExecutionScheduler {
    ExecutionScheduler::new(app_config(), Arc::new(router), jobs, switches)
}

async fn fixture() -> anyhow::Result<(DatabaseConnection, RecordingJob, Arc<JobRegistry>)> {
    let db = setup_test_db().await?;
    create_items_table(&db, 250).await?;
    let job = RecordingJob::default();
    let jobs = Arc::new(
        JobRegistry::new()
            .with("Recording", job.clone())
            .with("Second", RecordingJob::default()),
    );
    Ok((db, job, jobs))
}

#[tokio::test]
async fn kill_switch_disables_execution() -> anyhow::Result<()> {
    let (db, job, jobs) = fixture().await?;
    queue_items_migration(&db, &jobs, "Recording", 100).await?;

    let switches = Arc::new(OperationalSwitches::default());
    switches.set(Switch::ExecuteBatchedMigrationsOnSchedule, false);
    let scheduler = scheduler(DatabaseRouter::single("main", db), jobs, switches.clone());

    let outcome = scheduler
        .tick_at("main", Utc::now().fixed_offset(), Duration::zero())
        .await?;
    assert_eq!(outcome, TickOutcome::Disabled);
    assert!(job.ranges().is_empty());

    switches.set(Switch::ExecuteBatchedMigrationsOnSchedule, true);
    let outcome = scheduler
        .tick_at("main", Utc::now().fixed_offset(), Duration::zero())
        .await?;
    assert!(matches!(outcome, TickOutcome::Executed { .. }));
    Ok(())
}

#[tokio::test]
async fn interval_and_variance_gate_the_next_batch() -> anyhow::Result<()> {
    let (db, job, jobs) = fixture().await?;
    let migration = queue_items_migration(&db, &jobs, "Recording", 100).await?;
    let scheduler = scheduler(
        DatabaseRouter::single("main", db),
        jobs,
        Arc::new(OperationalSwitches::default()),
    );

    let now = Utc::now().fixed_offset();
    match scheduler.tick_at("main", now, Duration::zero()).await? {
        TickOutcome::Executed {
            migration_id,
            result: BatchResult::Succeeded { .. },
        } => assert_eq!(migration_id, migration.id),
        other => panic!("unexpected outcome {other:?}"),
    }

    let outcome = scheduler
        .tick_at("main", now + Duration::seconds(1), Duration::zero())
        .await?;
    assert_eq!(outcome, TickOutcome::NoExecutableMigration);

    let outcome = scheduler
        .tick_at("main", now + Duration::seconds(122), Duration::seconds(5))
        .await?;
    assert_eq!(
        outcome,
        TickOutcome::IntervalNotElapsed {
            migration_id: migration.id
        }
    );

    let outcome = scheduler
        .tick_at("main", now + Duration::seconds(126), Duration::zero())
        .await?;
    assert!(matches!(outcome, TickOutcome::Executed { .. }));
    assert_eq!(job.ranges(), vec![(1, 100), (101, 200)]);
    Ok(())
}

#[tokio::test]
async fn earliest_created_migration_runs_first() -> anyhow::Result<()> {
    let (db, _job, jobs) = fixture().await?;
    let first = queue_items_migration(&db, &jobs, "Recording", 100).await?;
    queue_items_migration(&db, &jobs, "Second", 100).await?;

    let scheduler = scheduler(
        DatabaseRouter::single("main", db),
        jobs,
        Arc::new(OperationalSwitches::default()),
    );
    match scheduler
        .tick_at("main", Utc::now().fixed_offset(), Duration::zero())
        .await?
    {
        TickOutcome::Executed { migration_id, .. } => assert_eq!(migration_id, first.id),
        other => panic!("unexpected outcome {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn shared_database_is_skipped() -> anyhow::Result<()> {
    let (db, job, jobs) = fixture().await?;
    queue_items_migration(&db, &jobs, "Recording", 100).await?;

    let database = |name: &str| DatabaseConfig {
        name: name.to_string(),
        url: "postgres://db.internal:5432/app".to_string(),
        share_with: None,
    };
    let router =
        DatabaseRouter::from_connections([(database("main"), db.clone()), (database("ci"), db)]);
    let scheduler = scheduler(router, jobs, Arc::new(OperationalSwitches::default()));

    let outcome = scheduler
        .tick_at("ci", Utc::now().fixed_offset(), Duration::zero())
        .await?;
    assert_eq!(
        outcome,
        TickOutcome::SharedDatabase {
            shares_with: "main".to_string()
        }
    );
    assert!(job.ranges().is_empty());
    Ok(())
}

#[tokio::test]
async fn owner_tick_runs_migrations_of_shared_identifiers() -> anyhow::Result<()> {
    let (db, job, jobs) = fixture().await?;
    let mut request = QueueMigration::new("Recording", "items", "id");
    request.batch_size = 100;
    request.sub_batch_size = 50;
    request.pause_ms = 0;
    request.database_identifier = "ci".to_string();
    let migration = BatchedMigrationRepository::new(db.clone())
        .queue(request, &jobs)
        .await?;

    let database = |name: &str| DatabaseConfig {
        name: name.to_string(),
        url: "postgres://db.internal:5432/app".to_string(),
        share_with: None,
    };
    let router =
        DatabaseRouter::from_connections([(database("main"), db.clone()), (database("ci"), db)]);
    let scheduler = scheduler(router, jobs, Arc::new(OperationalSwitches::default()));
    let now = Utc::now().fixed_offset();

    assert_eq!(
        scheduler.tick_at("ci", now, Duration::zero()).await?,
        TickOutcome::SharedDatabase {
            shares_with: "main".to_string()
        }
    );
    match scheduler.tick_at("main", now, Duration::zero()).await? {
        TickOutcome::Executed {
            migration_id,
            result: BatchResult::Succeeded { .. },
        } => assert_eq!(migration_id, migration.id),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(job.ranges(), vec![(1, 100)]);
    Ok(())
}

#[tokio::test]
async fn overlapping_ticks_run_a_single_batch() -> anyhow::Result<()> {
    let db = setup_test_db().await?;
    create_items_table(&db, 250).await?;
    let job = GatedJob::default();
    let jobs = Arc::new(JobRegistry::new().with("Gated", job.clone()));
    let migration = queue_items_migration(&db, &jobs, "Gated", 100).await?;

    let scheduler = scheduler(
        DatabaseRouter::single("main", db.clone()),
        jobs,
        Arc::new(OperationalSwitches::default()),
    );
    let now = Utc::now().fixed_offset();

    let in_flight = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.tick_at("main", now, Duration::zero()).await })
    };
    job.started.notified().await;

    // Same second: the batch just started, so the interval has not elapsed.
    assert_eq!(
        scheduler.tick_at("main", now, Duration::zero()).await?,
        TickOutcome::NoExecutableMigration
    );

    // Interval elapsed while the first batch is still running.
    match scheduler
        .tick_at("main", now + Duration::seconds(300), Duration::zero())
        .await?
    {
        TickOutcome::Executed {
            result: BatchResult::RaceLost,
            ..
        } => {}
        other => panic!("unexpected outcome {other:?}"),
    }

    job.release.notify_one();
    match in_flight.await?? {
        TickOutcome::Executed {
            result: BatchResult::Succeeded { batch, .. },
            ..
        } => assert_eq!((batch.min_value, batch.max_value), (1, 100)),
        other => panic!("unexpected outcome {other:?}"),
    }

    let batches = MigrationBatchRepository::new(db)
        .list_for_migration(migration.id)
        .await?;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, "succeeded");
    Ok(())
}

#[tokio::test]
async fn unknown_database_is_an_error() -> anyhow::Result<()> {
    let (db, _job, jobs) = fixture().await?;
    let scheduler = scheduler(
        DatabaseRouter::single("main", db),
        jobs,
        Arc::new(OperationalSwitches::default()),
    );

    let err = scheduler
        .tick_at("ci", Utc::now().fixed_offset(), Duration::zero())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::UnknownDatabase { ref name } if name == "ci"));
    Ok(())
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() -> anyhow::Result<()> {
    let (db, _job, jobs) = fixture().await?;
    let scheduler = scheduler(
        DatabaseRouter::single("main", db),
        jobs,
        Arc::new(OperationalSwitches::default()),
    );

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    scheduler.run(shutdown).await?;
    Ok(())
}
