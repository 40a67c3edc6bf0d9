//! # Partition Catalog
//!
//! The seam between partition planning and the database. The manager only
//! talks to a [`PartitionCatalog`]; [`PostgresPartitionCatalog`] issues native
//! DDL, while [`InMemoryPartitionCatalog`] backs tests and dry runs.
//!
//! [`PostgresPartitionCatalog`]: super::postgres::PostgresPartitionCatalog

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{PartitionSpec, PartitionedTable};
use crate::error::PartitionError;

#[async_trait]
pub trait PartitionCatalog: Send + Sync + std::fmt::Debug {
    /// Partitions currently attached to `table`.
    async fn list_partitions(
        &self,
        table: &PartitionedTable,
    ) -> Result<Vec<PartitionSpec>, PartitionError>;

    /// Creates and attaches `spec`. Returns false when it already existed.
    async fn create_partition(
        &self,
        table: &PartitionedTable,
        spec: &PartitionSpec,
    ) -> Result<bool, PartitionError>;

    /// Detaches `partition` from `table`, keeping its data. Returns false when it was not attached.
    async fn detach_partition(
        &self,
        table: &PartitionedTable,
        partition: &str,
    ) -> Result<bool, PartitionError>;

    /// Drops a previously detached partition. Returns false when it no longer exists.
    async fn drop_partition(&self, partition: &str) -> Result<bool, PartitionError>;

    /// Largest partitioning key stored in `table`.
    async fn max_key_value(&self, table: &PartitionedTable) -> Result<Option<i64>, PartitionError>;
}

#[derive(Debug, Default)]
struct CatalogState {
    attached: HashMap<String, Vec<PartitionSpec>>,
    detached: HashMap<String, PartitionSpec>,
    dropped: Vec<String>,
    max_keys: HashMap<String, i64>,
    failing: HashSet<String>,
}

/// Catalog kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPartitionCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryPartitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_max_key_value(&self, table: &str, value: i64) {
        self.state().max_keys.insert(table.to_string(), value);
    }

    /// Makes every DDL statement touching `partition` fail until cleared.
    pub fn fail_on(&self, partition: &str) {
        self.state().failing.insert(partition.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    pub fn attached(&self, table: &str) -> Vec<PartitionSpec> {
        self.state().attached.get(table).cloned().unwrap_or_default()
    }

    pub fn detached(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().detached.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn dropped(&self) -> Vec<String> {
        self.state().dropped.clone()
    }
}

fn injected_failure(partition: &str) -> PartitionError {
    PartitionError::Database(sea_orm::DbErr::Custom(format!(
        "injected failure for partition '{partition}'"
    )))
}

#[async_trait]
impl PartitionCatalog for InMemoryPartitionCatalog {
    async fn list_partitions(
        &self,
        table: &PartitionedTable,
    ) -> Result<Vec<PartitionSpec>, PartitionError> {
        Ok(self.attached(&table.name))
    }

    async fn create_partition(
        &self,
        table: &PartitionedTable,
        spec: &PartitionSpec,
    ) -> Result<bool, PartitionError> {
        let mut state = self.state();
        if state.failing.contains(&spec.name) {
            return Err(injected_failure(&spec.name));
        }
        let partitions = state.attached.entry(table.name.clone()).or_default();
        if partitions.iter().any(|p| p.name == spec.name) {
            return Ok(false);
        }
        partitions.push(spec.clone());
        Ok(true)
    }

    async fn detach_partition(
        &self,
        table: &PartitionedTable,
        partition: &str,
    ) -> Result<bool, PartitionError> {
        let mut state = self.state();
        if state.failing.contains(partition) {
            return Err(injected_failure(partition));
        }
        let Some(partitions) = state.attached.get_mut(&table.name) else {
            return Ok(false);
        };
        let Some(index) = partitions.iter().position(|p| p.name == partition) else {
            return Ok(false);
        };
        let spec = partitions.remove(index);
        state.detached.insert(spec.name.clone(), spec);
        Ok(true)
    }

    async fn drop_partition(&self, partition: &str) -> Result<bool, PartitionError> {
        let mut state = self.state();
        if state.failing.contains(partition) {
            return Err(injected_failure(partition));
        }
        if state.detached.remove(partition).is_none() {
            return Ok(false);
        }
        state.dropped.push(partition.to_string());
        Ok(true)
    }

    async fn max_key_value(&self, table: &PartitionedTable) -> Result<Option<i64>, PartitionError> {
        Ok(self.state().max_keys.get(&table.name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::{PartitionBounds, PartitioningStrategy, SlidingListStrategy};

    fn table() -> PartitionedTable {
        PartitionedTable {
            name: "job_logs".to_string(),
            database: "main".to_string(),
            partitioning_key: "partition_id".to_string(),
            strategy: PartitioningStrategy::SlidingList(
                SlidingListStrategy::new(1, 100, 10, 4).unwrap(),
            ),
            scope: None,
        }
    }

    fn range(n: i64) -> PartitionSpec {
        PartitionSpec::new(
            format!("job_logs_{n}"),
            PartitionBounds::IdRange {
                from: 1 + (n - 1) * 100,
                to: 1 + n * 100,
            },
            None,
        )
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let catalog = InMemoryPartitionCatalog::new();
        assert!(catalog.create_partition(&table(), &range(1)).await.unwrap());
        assert!(!catalog.create_partition(&table(), &range(1)).await.unwrap());
        assert_eq!(catalog.list_partitions(&table()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn detach_then_drop() {
        let catalog = InMemoryPartitionCatalog::new();
        catalog.create_partition(&table(), &range(1)).await.unwrap();

        assert!(!catalog.drop_partition("job_logs_1").await.unwrap());
        assert!(catalog.detach_partition(&table(), "job_logs_1").await.unwrap());
        assert!(catalog.list_partitions(&table()).await.unwrap().is_empty());
        assert_eq!(catalog.detached(), vec!["job_logs_1".to_string()]);

        assert!(catalog.drop_partition("job_logs_1").await.unwrap());
        assert_eq!(catalog.dropped(), vec!["job_logs_1".to_string()]);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let catalog = InMemoryPartitionCatalog::new();
        catalog.fail_on("job_logs_1");
        assert!(catalog.create_partition(&table(), &range(1)).await.is_err());

        catalog.clear_failures();
        assert!(catalog.create_partition(&table(), &range(1)).await.unwrap());
    }
}
