//! # Partition Lifecycle
//!
//! Keeps append-heavy tables natively partitioned: future partitions are
//! created ahead of need and old ones are detached, then dropped after a
//! retention period.
//!
//! Strategies are pure: given the attached partitions and the current time
//! (or key high-water mark) they compute what is missing and what should be
//! retired. The [`manager::PartitionManager`] applies that plan through a
//! [`catalog::PartitionCatalog`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::{ConfigError, PartitionedTableConfig};

pub mod catalog;
pub mod manager;
pub mod monthly;
pub mod postgres;
pub mod sliding_list;

pub use catalog::{InMemoryPartitionCatalog, PartitionCatalog};
pub use manager::{PartitionMaintenance, PartitionManager, SyncReport};
pub use monthly::MonthlyStrategy;
pub use postgres::PostgresPartitionCatalog;
pub use sliding_list::SlidingListStrategy;

/// Value range a partition accepts. Range bounds are `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionBounds {
    TimeRange { from: NaiveDate, to: NaiveDate },
    IdRange { from: i64, to: i64 },
    /// Catch-all partition for values outside every range
    Default,
}

impl PartitionBounds {
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

/// A partition of a partitioned table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    pub bounds: PartitionBounds,
    /// Scope key value the partition belongs to, if the table is scoped
    pub scope: Option<String>,
}

impl PartitionSpec {
    pub fn new(name: impl Into<String>, bounds: PartitionBounds, scope: Option<String>) -> Self {
        Self {
            name: name.into(),
            bounds,
            scope,
        }
    }
}

/// Inputs a strategy decides on besides the attached partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionContext {
    pub now: DateTime<Utc>,
    /// Largest partitioning key currently stored, for key-range strategies
    pub high_water: Option<i64>,
}

/// Names of the supported strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Monthly,
    SlidingList,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::SlidingList => "sliding_list",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "monthly" => Ok(Self::Monthly),
            "sliding_list" => Ok(Self::SlidingList),
            other => Err(ConfigError::UnknownPartitioningStrategy {
                name: other.to_string(),
            }),
        }
    }
}

/// A configured partitioning strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitioningStrategy {
    Monthly(MonthlyStrategy),
    SlidingList(SlidingListStrategy),
}

impl PartitioningStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Monthly(_) => StrategyKind::Monthly,
            Self::SlidingList(_) => StrategyKind::SlidingList,
        }
    }

    /// Partitions that should exist but are not attached.
    pub fn missing_partitions(
        &self,
        table: &PartitionedTable,
        existing: &[PartitionSpec],
        context: &PartitionContext,
    ) -> Vec<PartitionSpec> {
        match self {
            Self::Monthly(strategy) => strategy.missing_partitions(table, existing, context.now),
            Self::SlidingList(strategy) => {
                strategy.missing_partitions(table, existing, context.high_water)
            }
        }
    }

    /// Attached partitions that should be detached, oldest first.
    pub fn partitions_to_retire(
        &self,
        existing: &[PartitionSpec],
        context: &PartitionContext,
    ) -> Vec<PartitionSpec> {
        match self {
            Self::Monthly(strategy) => strategy.partitions_to_retire(existing, context.now),
            Self::SlidingList(strategy) => strategy.partitions_to_retire(existing),
        }
    }

    /// Whether `bounds` is a shape this strategy manages.
    pub fn accepts(&self, bounds: &PartitionBounds) -> bool {
        match (self, bounds) {
            (Self::Monthly(_), PartitionBounds::TimeRange { from, to }) => from < to,
            (Self::SlidingList(_), PartitionBounds::IdRange { from, to }) => from < to,
            (Self::SlidingList(_), PartitionBounds::Default) => true,
            _ => false,
        }
    }
}

/// Static declaration of a partitioned table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedTable {
    pub name: String,
    /// Database identifier owning the table
    pub database: String,
    pub partitioning_key: String,
    pub strategy: PartitioningStrategy,
    /// Scope key value every partition must carry, if any
    pub scope: Option<String>,
}

impl PartitionedTable {
    /// Builds the declaration from configuration, validating strategy name and parameters.
    pub fn from_config(config: &PartitionedTableConfig) -> Result<Self, ConfigError> {
        for identifier in [&config.table, &config.partitioning_key] {
            if !crate::db::is_valid_identifier(identifier) {
                return Err(ConfigError::InvalidIdentifier {
                    value: identifier.clone(),
                });
            }
        }

        let strategy = match config.strategy.parse::<StrategyKind>()? {
            StrategyKind::Monthly => PartitioningStrategy::Monthly(MonthlyStrategy::new(
                config.lead_months.unwrap_or(monthly::DEFAULT_LEAD_MONTHS),
                config.retain_months,
            )?),
            StrategyKind::SlidingList => {
                PartitioningStrategy::SlidingList(SlidingListStrategy::new(
                    config.first_value.unwrap_or(sliding_list::DEFAULT_FIRST_VALUE),
                    config
                        .partition_size
                        .unwrap_or(sliding_list::DEFAULT_PARTITION_SIZE),
                    config
                        .next_partition_threshold
                        .unwrap_or(sliding_list::DEFAULT_NEXT_PARTITION_THRESHOLD),
                    config
                        .max_partitions
                        .unwrap_or(sliding_list::DEFAULT_MAX_PARTITIONS),
                )?)
            }
        };

        Ok(Self {
            name: config.table.clone(),
            database: config.database.clone(),
            partitioning_key: config.partitioning_key.clone(),
            strategy,
            scope: config.scope.clone(),
        })
    }

    pub fn missing_partitions(
        &self,
        existing: &[PartitionSpec],
        context: &PartitionContext,
    ) -> Vec<PartitionSpec> {
        self.strategy.missing_partitions(self, existing, context)
    }

    pub fn partitions_to_retire(
        &self,
        existing: &[PartitionSpec],
        context: &PartitionContext,
    ) -> Vec<PartitionSpec> {
        self.strategy.partitions_to_retire(existing, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_config(strategy: &str) -> PartitionedTableConfig {
        PartitionedTableConfig {
            table: "audit_events".to_string(),
            database: "main".to_string(),
            partitioning_key: "created_at".to_string(),
            strategy: strategy.to_string(),
            lead_months: None,
            retain_months: Some(12),
            first_value: None,
            partition_size: None,
            next_partition_threshold: None,
            max_partitions: None,
            scope: None,
        }
    }

    #[test]
    fn strategy_is_selected_by_name() {
        let table = PartitionedTable::from_config(&table_config("monthly")).unwrap();
        assert_eq!(table.strategy.kind(), StrategyKind::Monthly);

        let table = PartitionedTable::from_config(&table_config("sliding_list")).unwrap();
        assert_eq!(table.strategy.kind(), StrategyKind::SlidingList);
    }

    #[test]
    fn unknown_strategy_is_a_configuration_error() {
        let err = PartitionedTable::from_config(&table_config("weekly")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownPartitioningStrategy { ref name } if name == "weekly"
        ));
    }

    #[test]
    fn invalid_table_name_is_rejected() {
        let mut config = table_config("monthly");
        config.table = "audit events".to_string();
        assert!(matches!(
            PartitionedTable::from_config(&config),
            Err(ConfigError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn bounds_must_match_strategy_shape() {
        let monthly = PartitionedTable::from_config(&table_config("monthly")).unwrap();
        let sliding = PartitionedTable::from_config(&table_config("sliding_list")).unwrap();

        assert!(!monthly.strategy.accepts(&PartitionBounds::Default));
        assert!(sliding.strategy.accepts(&PartitionBounds::Default));
        assert!(!sliding.strategy.accepts(&PartitionBounds::IdRange { from: 10, to: 10 }));
    }
}
