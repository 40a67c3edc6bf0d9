//! Fixed-width integer key ranges that slide forward as keys grow.
//!
//! Range partitions are named `<table>_<n>` (1-based) and a single
//! `<table>_default` partition catches keys outside every range. A new range
//! is opened once the high-water key gets within `next_partition_threshold`
//! of the open range's end; the oldest ranges are retired so that at most
//! `max_partitions` partitions, default included, stay attached.

use super::{PartitionBounds, PartitionSpec, PartitionedTable};
use crate::config::ConfigError;

pub const DEFAULT_FIRST_VALUE: i64 = 1;
pub const DEFAULT_PARTITION_SIZE: i64 = 1_000_000;
pub const DEFAULT_NEXT_PARTITION_THRESHOLD: i64 = 100_000;
pub const DEFAULT_MAX_PARTITIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingListStrategy {
    pub first_value: i64,
    pub partition_size: i64,
    pub next_partition_threshold: i64,
    pub max_partitions: usize,
}

impl SlidingListStrategy {
    pub fn new(
        first_value: i64,
        partition_size: i64,
        next_partition_threshold: i64,
        max_partitions: usize,
    ) -> Result<Self, ConfigError> {
        if partition_size <= 0 {
            return Err(invalid("partition_size", "must be positive"));
        }
        if next_partition_threshold < 0 || next_partition_threshold >= partition_size {
            return Err(invalid(
                "next_partition_threshold",
                "must be between 0 and partition_size",
            ));
        }
        if max_partitions < 2 {
            return Err(invalid(
                "max_partitions",
                "must allow the default partition and at least one range",
            ));
        }
        Ok(Self {
            first_value,
            partition_size,
            next_partition_threshold,
            max_partitions,
        })
    }

    pub fn missing_partitions(
        &self,
        table: &PartitionedTable,
        existing: &[PartitionSpec],
        high_water: Option<i64>,
    ) -> Vec<PartitionSpec> {
        let mut missing = Vec::new();

        if !existing.iter().any(|p| p.bounds.is_default()) {
            missing.push(PartitionSpec::new(
                format!("{}_default", table.name),
                PartitionBounds::Default,
                table.scope.clone(),
            ));
        }

        let open_end = existing
            .iter()
            .filter_map(|p| match p.bounds {
                PartitionBounds::IdRange { to, .. } => Some(to),
                _ => None,
            })
            .max();

        let next_from = match open_end {
            None => Some(self.first_value),
            Some(to) => high_water
                .filter(|high_water| *high_water >= to - self.next_partition_threshold)
                .map(|_| to),
        };

        if let Some(from) = next_from {
            missing.push(self.range_partition(table, from));
        }
        missing
    }

    /// Oldest ranges beyond `max_partitions`; the open range and the default are never retired.
    pub fn partitions_to_retire(&self, existing: &[PartitionSpec]) -> Vec<PartitionSpec> {
        let mut ranges: Vec<&PartitionSpec> = existing
            .iter()
            .filter(|p| matches!(p.bounds, PartitionBounds::IdRange { .. }))
            .collect();
        ranges.sort_by_key(|p| match p.bounds {
            PartitionBounds::IdRange { from, .. } => from,
            _ => i64::MIN,
        });

        let defaults = existing.iter().filter(|p| p.bounds.is_default()).count();
        let excess = (ranges.len() + defaults).saturating_sub(self.max_partitions);
        let retirable = excess.min(ranges.len().saturating_sub(1));

        ranges.into_iter().take(retirable).cloned().collect()
    }

    fn range_partition(&self, table: &PartitionedTable, from: i64) -> PartitionSpec {
        let index = (from - self.first_value).div_euclid(self.partition_size) + 1;
        PartitionSpec::new(
            format!("{}_{}", table.name, index),
            PartitionBounds::IdRange {
                from,
                to: from + self.partition_size,
            },
            table.scope.clone(),
        )
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidPartitionParameter {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::PartitioningStrategy;

    fn strategy() -> SlidingListStrategy {
        SlidingListStrategy::new(1, 100, 20, 4).unwrap()
    }

    fn table() -> PartitionedTable {
        PartitionedTable {
            name: "job_logs".to_string(),
            database: "main".to_string(),
            partitioning_key: "partition_id".to_string(),
            strategy: PartitioningStrategy::SlidingList(strategy()),
            scope: None,
        }
    }

    #[test]
    fn empty_table_gets_default_and_first_range() {
        let missing = strategy().missing_partitions(&table(), &[], None);
        assert_eq!(
            missing,
            vec![
                PartitionSpec::new("job_logs_default", PartitionBounds::Default, None),
                PartitionSpec::new(
                    "job_logs_1",
                    PartitionBounds::IdRange { from: 1, to: 101 },
                    None
                ),
            ]
        );
    }

    #[test]
    fn next_range_opens_within_threshold() {
        let strategy = strategy();
        let existing = strategy.missing_partitions(&table(), &[], None);

        assert!(strategy
            .missing_partitions(&table(), &existing, Some(80))
            .is_empty());

        let missing = strategy.missing_partitions(&table(), &existing, Some(81));
        assert_eq!(
            missing,
            vec![PartitionSpec::new(
                "job_logs_2",
                PartitionBounds::IdRange { from: 101, to: 201 },
                None
            )]
        );
    }

    #[test]
    fn oldest_ranges_retire_beyond_max_partitions() {
        let strategy = strategy();
        let mut existing = vec![PartitionSpec::new(
            "job_logs_default",
            PartitionBounds::Default,
            None,
        )];
        for n in 0..5 {
            existing.push(PartitionSpec::new(
                format!("job_logs_{}", n + 1),
                PartitionBounds::IdRange {
                    from: 1 + n * 100,
                    to: 101 + n * 100,
                },
                None,
            ));
        }

        let retired: Vec<String> = strategy
            .partitions_to_retire(&existing)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(retired, vec!["job_logs_1", "job_logs_2"]);
    }

    #[test]
    fn parameters_are_validated() {
        assert!(SlidingListStrategy::new(1, 0, 0, 4).is_err());
        assert!(SlidingListStrategy::new(1, 100, 100, 4).is_err());
        assert!(SlidingListStrategy::new(1, 100, 10, 1).is_err());
    }
}
