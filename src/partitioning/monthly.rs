//! Calendar-month range partitions.
//!
//! Partitions are named `<table>_<YYYYMM>` and cover `[first day of month,
//! first day of next month)`.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};

use super::{PartitionBounds, PartitionSpec, PartitionedTable};
use crate::config::ConfigError;

pub const DEFAULT_LEAD_MONTHS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthlyStrategy {
    /// Future months kept attached beyond the current one
    pub lead_months: u32,
    /// Months of past data kept attached, unlimited when `None`
    pub retain_months: Option<u32>,
}

impl MonthlyStrategy {
    pub fn new(lead_months: u32, retain_months: Option<u32>) -> Result<Self, ConfigError> {
        if lead_months < 1 {
            return Err(ConfigError::InvalidPartitionParameter {
                field: "lead_months".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if retain_months == Some(0) {
            return Err(ConfigError::InvalidPartitionParameter {
                field: "retain_months".to_string(),
                message: "must be at least 1 when set".to_string(),
            });
        }
        Ok(Self {
            lead_months,
            retain_months,
        })
    }

    /// Months from the current one through `lead_months` ahead that no attached range covers.
    pub fn missing_partitions(
        &self,
        table: &PartitionedTable,
        existing: &[PartitionSpec],
        now: DateTime<Utc>,
    ) -> Vec<PartitionSpec> {
        let current = month_start(now.date_naive());

        (0..=self.lead_months)
            .filter_map(|offset| current.checked_add_months(Months::new(offset)))
            .filter_map(|from| Some((from, from.checked_add_months(Months::new(1))?)))
            .filter(|(from, to)| !existing.iter().any(|p| overlaps(&p.bounds, *from, *to)))
            .map(|(from, to)| {
                PartitionSpec::new(
                    partition_name(&table.name, from),
                    PartitionBounds::TimeRange { from, to },
                    table.scope.clone(),
                )
            })
            .collect()
    }

    /// Attached months that ended at or before the retention cutoff.
    pub fn partitions_to_retire(
        &self,
        existing: &[PartitionSpec],
        now: DateTime<Utc>,
    ) -> Vec<PartitionSpec> {
        let Some(retain) = self.retain_months else {
            return Vec::new();
        };
        let Some(cutoff) = month_start(now.date_naive()).checked_sub_months(Months::new(retain))
        else {
            return Vec::new();
        };

        let mut retired: Vec<PartitionSpec> = existing
            .iter()
            .filter(|p| matches!(p.bounds, PartitionBounds::TimeRange { to, .. } if to <= cutoff))
            .cloned()
            .collect();
        retired.sort_by_key(|p| match p.bounds {
            PartitionBounds::TimeRange { from, .. } => Some(from),
            _ => None,
        });
        retired
    }
}

pub fn partition_name(table: &str, month: NaiveDate) -> String {
    format!("{table}_{:04}{:02}", month.year(), month.month())
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn overlaps(bounds: &PartitionBounds, from: NaiveDate, to: NaiveDate) -> bool {
    match bounds {
        PartitionBounds::TimeRange {
            from: existing_from,
            to: existing_to,
        } => *existing_from < to && from < *existing_to,
        _ => false,
    }
}
