//! # bgm
//!
//! Command-line entry point: runs the migration scheduler and partition
//! maintenance, applies the tracking schema, and exposes operator commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use batched_migrations::{
    background_migration::{
        BatchRunner, COPY_COLUMN_JOB, CopyColumnJob, ExecutionScheduler, JobRegistry,
        MigrationEvent,
    },
    config::{AppConfig, ConfigLoader},
    db::DatabaseRouter,
    migration::{Migrator, MigratorTrait},
    partitioning::PartitionMaintenance,
    repositories::{BatchedMigrationRepository, QueueMigration},
    switches::OperationalSwitches,
    telemetry,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "bgm", version, about = "Batched background migrations and partition maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler and partition maintenance until Ctrl-C
    Run,
    /// Apply the tracking schema on every configured database
    Migrate,
    /// Register a batched migration
    Queue {
        job_class_name: String,
        table_name: String,
        column_name: String,
        /// Job arguments as JSON
        #[arg(long, default_value = "[]")]
        arguments: String,
        #[arg(long, default_value = "main")]
        database: String,
        #[arg(long)]
        batch_size: Option<i64>,
        #[arg(long)]
        sub_batch_size: Option<i64>,
        #[arg(long)]
        interval_seconds: Option<i64>,
    },
    /// List registered migrations and their progress
    Status {
        #[arg(long)]
        database: Option<String>,
    },
    Pause {
        id: Uuid,
        #[arg(long, default_value = "main")]
        database: String,
    },
    Resume {
        id: Uuid,
        #[arg(long, default_value = "main")]
        database: String,
    },
    /// Run the remaining batches of a migration inline
    Finalize {
        id: Uuid,
        #[arg(long, default_value = "main")]
        database: String,
    },
}

fn job_registry() -> JobRegistry {
    JobRegistry::new().with(COPY_COLUMN_JOB, CopyColumnJob)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let router = DatabaseRouter::connect(&config)
        .await
        .context("connecting to databases")?;
    let jobs = Arc::new(job_registry());

    match cli.command {
        Command::Run => run(Arc::new(config), Arc::new(router), jobs).await,
        Command::Migrate => {
            for handle in router.handles() {
                Migrator::up(&handle.connection, None)
                    .await
                    .with_context(|| format!("applying schema on '{}'", handle.name))?;
                info!(database = %handle.name, "Schema up to date");
            }
            Ok(())
        }
        Command::Queue {
            job_class_name,
            table_name,
            column_name,
            arguments,
            database,
            batch_size,
            sub_batch_size,
            interval_seconds,
        } => {
            let mut request = QueueMigration::new(&job_class_name, &table_name, &column_name);
            request.job_arguments =
                serde_json::from_str(&arguments).context("parsing job arguments")?;
            request.database_identifier = database.clone();
            if let Some(batch_size) = batch_size {
                request.batch_size = batch_size;
            }
            if let Some(sub_batch_size) = sub_batch_size {
                request.sub_batch_size = sub_batch_size;
            }
            if let Some(interval_seconds) = interval_seconds {
                request.interval_seconds = interval_seconds;
            }

            let repository = BatchedMigrationRepository::new(router.connection(&database)?.clone());
            let migration = repository.queue(request, &jobs).await?;
            println!("{}", migration.id);
            Ok(())
        }
        Command::Status { database } => {
            let names: Vec<String> = match database {
                Some(database) => vec![database],
                None => router.names().map(str::to_string).collect(),
            };
            for name in names {
                let repository = BatchedMigrationRepository::new(router.connection(&name)?.clone());
                for migration in repository.list(Some(&name)).await? {
                    println!(
                        "{}\t{}\t{}\t{}.{}\t{:>6.2}%\tbatch_size={}",
                        migration.id,
                        name,
                        migration.status,
                        migration.table_name,
                        migration.column_name,
                        migration.progress(),
                        migration.batch_size
                    );
                }
            }
            Ok(())
        }
        Command::Pause { id, database } => {
            transition(&router, &database, id, MigrationEvent::Pause).await
        }
        Command::Resume { id, database } => {
            transition(&router, &database, id, MigrationEvent::Resume).await
        }
        Command::Finalize { id, database } => {
            let runner = BatchRunner::new(
                router.connection(&database)?.clone(),
                jobs,
                config.runner.clone(),
            );
            let migration = runner.finalize(id).await?;
            println!("{}\t{}", migration.id, migration.status);
            Ok(())
        }
    }
}

async fn transition(
    router: &DatabaseRouter,
    database: &str,
    id: Uuid,
    event: MigrationEvent,
) -> Result<()> {
    let repository = BatchedMigrationRepository::new(router.connection(database)?.clone());
    let migration = repository.transition(id, event).await?;
    println!("{}\t{}", migration.id, migration.status);
    Ok(())
}

async fn run(config: Arc<AppConfig>, router: Arc<DatabaseRouter>, jobs: Arc<JobRegistry>) -> Result<()> {
    let switches = Arc::new(OperationalSwitches::from_config(&config));
    let shutdown = CancellationToken::new();

    let scheduler = ExecutionScheduler::new(
        config.clone(),
        router.clone(),
        jobs,
        switches.clone(),
    );
    let maintenance = PartitionMaintenance::new(config.clone(), router.clone(), switches)
        .context("loading partitioned table declarations")?;

    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let maintenance_task = tokio::spawn(maintenance.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    match scheduler_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "Scheduler stopped with an error"),
        Err(err) => error!(error = %err, "Scheduler task panicked"),
    }
    if let Err(err) = maintenance_task.await {
        error!(error = %err, "Partition maintenance task panicked");
    }
    Ok(())
}
