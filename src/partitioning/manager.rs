//! # Partition Manager
//!
//! Applies strategy plans through a catalog. A sync creates what is missing
//! and detaches what is retired; detached partitions are recorded and dropped
//! by a later [`PartitionManager::drop_detached`] pass once their retention
//! elapsed. Failures on one partition are logged and retried on the next
//! sync without stopping the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ConnectionTrait, DatabaseBackend};
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::catalog::PartitionCatalog;
use super::postgres::PostgresPartitionCatalog;
use super::{PartitionBounds, PartitionContext, PartitionSpec, PartitionedTable, StrategyKind};
use crate::config::{AppConfig, ConfigError};
use crate::db::DatabaseRouter;
use crate::error::PartitionError;
use crate::repositories::DetachedPartitionRepository;
use crate::switches::{OperationalSwitches, Switch};

/// Partitions touched by one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub detached: Vec<String>,
    /// Rejected by attach validation
    pub rejected: Vec<String>,
    /// DDL failed; retried on the next sync
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PartitionManager {
    catalog: Arc<dyn PartitionCatalog>,
    detached: Option<DetachedPartitionRepository>,
    detached_retention: chrono::Duration,
}

impl PartitionManager {
    pub fn new(
        catalog: Arc<dyn PartitionCatalog>,
        detached: Option<DetachedPartitionRepository>,
        detached_retention: chrono::Duration,
    ) -> Self {
        Self {
            catalog,
            detached,
            detached_retention,
        }
    }

    /// Creates missing partitions, then detaches retired ones. Nothing is dropped here.
    #[instrument(skip(self, table), fields(table = %table.name))]
    pub async fn sync(
        &self,
        table: &PartitionedTable,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, PartitionError> {
        let existing = self.catalog.list_partitions(table).await?;
        let high_water = match table.strategy.kind() {
            StrategyKind::SlidingList => self.catalog.max_key_value(table).await?,
            StrategyKind::Monthly => None,
        };
        let context = PartitionContext { now, high_water };

        let mut report = SyncReport::default();

        for spec in table.missing_partitions(&existing, &context) {
            match self.attach(table, &spec).await {
                Ok(true) => {
                    info!(partition = %spec.name, "Created partition");
                    counter!("partitions_created_total", "table" => table.name.clone())
                        .increment(1);
                    report.created.push(spec.name);
                }
                Ok(false) => debug!(partition = %spec.name, "Partition already exists"),
                Err(err @ (PartitionError::ScopeMismatch { .. }
                | PartitionError::IncompatibleBounds { .. })) => {
                    warn!(partition = %spec.name, error = %err, "Partition rejected");
                    report.rejected.push(spec.name);
                }
                Err(err) => {
                    error!(partition = %spec.name, error = %err, "Failed to create partition");
                    report.failed.push(spec.name);
                }
            }
        }

        let attached = self.catalog.list_partitions(table).await?;
        for spec in table.partitions_to_retire(&attached, &context) {
            match self.detach(table, &spec, now).await {
                Ok(true) => report.detached.push(spec.name),
                Ok(false) => debug!(partition = %spec.name, "Partition already detached"),
                Err(err) => {
                    error!(partition = %spec.name, error = %err, "Failed to detach partition");
                    report.failed.push(spec.name);
                }
            }
        }

        Ok(report)
    }

    /// Validates `spec` against `table` and creates it. Returns false when it already existed.
    pub async fn attach(
        &self,
        table: &PartitionedTable,
        spec: &PartitionSpec,
    ) -> Result<bool, PartitionError> {
        if spec.scope != table.scope {
            counter!("partitions_rejected_total", "table" => table.name.clone()).increment(1);
            return Err(PartitionError::ScopeMismatch {
                table: table.name.clone(),
                partition: spec.name.clone(),
                expected: table.scope.clone(),
                actual: spec.scope.clone(),
            });
        }

        let incompatible = || PartitionError::IncompatibleBounds {
            table: table.name.clone(),
            partition: spec.name.clone(),
        };
        if !table.strategy.accepts(&spec.bounds) {
            return Err(incompatible());
        }

        let existing = self.catalog.list_partitions(table).await?;
        if existing.iter().any(|p| p.name == spec.name) {
            return Ok(false);
        }
        if existing.iter().any(|p| conflicts(&p.bounds, &spec.bounds)) {
            return Err(incompatible());
        }

        self.catalog.create_partition(table, spec).await
    }

    async fn detach(
        &self,
        table: &PartitionedTable,
        spec: &PartitionSpec,
        now: DateTime<Utc>,
    ) -> Result<bool, PartitionError> {
        if !self.catalog.detach_partition(table, &spec.name).await? {
            return Ok(false);
        }

        info!(partition = %spec.name, "Detached partition");
        counter!("partitions_detached_total", "table" => table.name.clone()).increment(1);

        if let Some(repository) = &self.detached {
            let drop_after = (now + self.detached_retention).fixed_offset();
            repository.record(&table.name, &spec.name, drop_after).await?;
        }
        Ok(true)
    }

    /// Drops detached partitions whose retention elapsed and returns their names.
    pub async fn drop_detached(&self, now: DateTime<Utc>) -> Result<Vec<String>, PartitionError> {
        let Some(repository) = &self.detached else {
            return Ok(Vec::new());
        };

        let mut dropped = Vec::new();
        for record in repository.due(now.fixed_offset()).await? {
            match self.catalog.drop_partition(&record.partition_name).await {
                Ok(existed) => {
                    repository.remove(record.id).await?;
                    if existed {
                        info!(partition = %record.partition_name, "Dropped detached partition");
                        counter!("partitions_dropped_total", "table" => record.parent_table.clone())
                            .increment(1);
                        dropped.push(record.partition_name);
                    }
                }
                Err(err) => error!(
                    partition = %record.partition_name,
                    error = %err,
                    "Failed to drop detached partition"
                ),
            }
        }
        Ok(dropped)
    }
}

/// Whether a new partition with `candidate` bounds would collide with `existing`.
fn conflicts(existing: &PartitionBounds, candidate: &PartitionBounds) -> bool {
    match (existing, candidate) {
        (PartitionBounds::Default, PartitionBounds::Default) => true,
        (
            PartitionBounds::TimeRange { from: a, to: b },
            PartitionBounds::TimeRange { from: c, to: d },
        ) => a < d && c < b,
        (
            PartitionBounds::IdRange { from: a, to: b },
            PartitionBounds::IdRange { from: c, to: d },
        ) => a < d && c < b,
        _ => false,
    }
}

/// Periodic partition sync over every declared table.
#[derive(Debug)]
pub struct PartitionMaintenance {
    config: Arc<AppConfig>,
    router: Arc<DatabaseRouter>,
    switches: Arc<OperationalSwitches>,
    tables: Vec<PartitionedTable>,
    catalogs: HashMap<String, Arc<dyn PartitionCatalog>>,
}

impl PartitionMaintenance {
    /// Builds the maintenance loop with native catalogs for every PostgreSQL database.
    pub fn new(
        config: Arc<AppConfig>,
        router: Arc<DatabaseRouter>,
        switches: Arc<OperationalSwitches>,
    ) -> Result<Self, ConfigError> {
        let tables = config
            .partitioning
            .tables
            .iter()
            .map(PartitionedTable::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        let catalogs = router
            .handles()
            .filter(|handle| handle.connection.get_database_backend() == DatabaseBackend::Postgres)
            .map(|handle| {
                let catalog: Arc<dyn PartitionCatalog> =
                    Arc::new(PostgresPartitionCatalog::new(handle.connection.clone()));
                (handle.name.clone(), catalog)
            })
            .collect();

        Ok(Self {
            config,
            router,
            switches,
            tables,
            catalogs,
        })
    }

    /// Replaces the catalog used for `database`.
    pub fn with_catalog(mut self, database: &str, catalog: Arc<dyn PartitionCatalog>) -> Self {
        self.catalogs.insert(database.to_string(), catalog);
        self
    }

    pub fn tables(&self) -> &[PartitionedTable] {
        &self.tables
    }

    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(tables = self.tables.len(), "Starting partition maintenance");
        let interval = TokioDuration::from_secs(self.config.partitioning.sync_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Partition maintenance shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    self.sync_all(Utc::now()).await;
                }
            }
        }

        info!("Partition maintenance stopped");
    }

    /// Syncs every table and drops detached partitions past retention.
    pub async fn sync_all(&self, now: DateTime<Utc>) -> HashMap<String, SyncReport> {
        let mut reports = HashMap::new();
        if !self.switches.is_enabled(Switch::PartitionManagerSync) {
            debug!("Partition sync disabled");
            return reports;
        }

        let mut managers: HashMap<&str, PartitionManager> = HashMap::new();
        for table in &self.tables {
            let Some(manager) = self.manager_for(&table.database) else {
                debug!(table = %table.name, database = %table.database, "No partition catalog for database");
                continue;
            };
            match manager.sync(table, now).await {
                Ok(report) => {
                    reports.insert(table.name.clone(), report);
                }
                Err(err) => error!(table = %table.name, error = %err, "Partition sync failed"),
            }
            managers.entry(table.database.as_str()).or_insert(manager);
        }

        for (database, manager) in managers {
            if let Err(err) = manager.drop_detached(now).await {
                error!(database = %database, error = %err, "Dropping detached partitions failed");
            }
        }
        reports
    }

    fn manager_for(&self, database: &str) -> Option<PartitionManager> {
        let catalog = self.catalogs.get(database)?.clone();
        let connection = match self.router.connection(database) {
            Ok(connection) => connection.clone(),
            Err(err) => {
                error!(database = %database, error = %err, "Partition table refers to an unknown database");
                return None;
            }
        };
        let retention = chrono::Duration::seconds(
            i64::try_from(self.config.partitioning.detached_retention_seconds).unwrap_or(i64::MAX),
        );
        Some(PartitionManager::new(
            catalog,
            Some(DetachedPartitionRepository::new(connection)),
            retention,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn overlapping_ranges_conflict() {
        let a = PartitionBounds::IdRange { from: 1, to: 101 };
        assert!(conflicts(&a, &PartitionBounds::IdRange { from: 100, to: 200 }));
        assert!(!conflicts(&a, &PartitionBounds::IdRange { from: 101, to: 201 }));
        assert!(conflicts(&PartitionBounds::Default, &PartitionBounds::Default));
        assert!(!conflicts(&a, &PartitionBounds::Default));
    }

    #[test]
    fn adjacent_months_do_not_conflict() {
        let date = |m| NaiveDate::from_ymd_opt(2024, m, 1).unwrap();
        let november = PartitionBounds::TimeRange {
            from: date(11),
            to: date(12),
        };
        let october = PartitionBounds::TimeRange {
            from: date(10),
            to: date(11),
        };
        assert!(!conflicts(&november, &october));
        assert!(conflicts(&november, &november));
    }
}
