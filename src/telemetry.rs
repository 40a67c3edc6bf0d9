//! Global tracing subscriber setup and metric descriptions.
//!
//! sqlx and sea-orm still emit through the `log` facade, so their query and
//! pool records are bridged into the same subscriber as the scheduler and
//! partition manager spans.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the subscriber once per process; later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        // Test binaries may have bridged sqlx logging already.
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: sqlx/sea-orm log bridge not installed: {}. Query logs will be missing.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: bgm tracing subscriber not installed: {}. Keeping the existing one.",
            err
        );
    }

    describe_metrics();
    Ok(())
}

/// Registers descriptions for every metric the service emits.
pub fn describe_metrics() {
    describe_histogram!(
        "batched_migration_batch_duration_seconds",
        Unit::Seconds,
        "Wall time of one batch callback"
    );
    describe_histogram!(
        "batched_migration_batch_range_size",
        Unit::Count,
        "Keys covered by one batch range"
    );
    describe_counter!(
        "batched_migration_batches_total",
        "Batches executed, labelled by outcome"
    );
    describe_counter!(
        "batched_migration_failures_total",
        "Migrations that reached the failed status"
    );
    describe_counter!(
        "batched_migration_stuck_batches_total",
        "Running batches reclaimed after the stuck timeout"
    );
    describe_gauge!(
        "batched_migration_progress_percent",
        Unit::Percent,
        "Share of the key range already processed"
    );
    describe_histogram!(
        "batched_migration_scheduler_tick_duration_ms",
        Unit::Milliseconds,
        "Duration of one scheduler pass over all databases"
    );
    describe_counter!(
        "batched_migration_scheduler_ticks_total",
        "Scheduler ticks that executed a batch"
    );
    describe_counter!("partitions_created_total", "Partitions created by sync");
    describe_counter!("partitions_detached_total", "Partitions detached by sync");
    describe_counter!(
        "partitions_dropped_total",
        "Detached partitions dropped after retention"
    );
    describe_counter!(
        "partitions_rejected_total",
        "Partitions rejected by attach validation"
    );
}
