//! Native PostgreSQL partition catalog.
//!
//! Attached partitions are read from `pg_inherits` with their bound
//! expressions rendered by `pg_get_expr`. A partition's scope is stored as a
//! `scope:<value>` table comment.

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::{debug, warn};

use super::catalog::PartitionCatalog;
use super::{PartitionBounds, PartitionSpec, PartitionedTable, StrategyKind};
use crate::background_migration::planner;
use crate::db::is_valid_identifier;
use crate::error::PartitionError;

const SCOPE_COMMENT_PREFIX: &str = "scope:";

const LIST_PARTITIONS_SQL: &str = r#"
SELECT child.relname AS name,
       pg_get_expr(child.relpartbound, child.oid) AS bound,
       obj_description(child.oid, 'pg_class') AS comment
FROM pg_inherits
JOIN pg_class parent ON pg_inherits.inhparent = parent.oid
JOIN pg_class child ON pg_inherits.inhrelid = child.oid
JOIN pg_namespace ns ON parent.relnamespace = ns.oid
WHERE parent.relname = $1 AND ns.nspname = current_schema()
ORDER BY child.relname
"#;

const IS_ATTACHED_SQL: &str = r#"
SELECT 1 AS attached
FROM pg_inherits
JOIN pg_class parent ON pg_inherits.inhparent = parent.oid
JOIN pg_class child ON pg_inherits.inhrelid = child.oid
JOIN pg_namespace ns ON parent.relnamespace = ns.oid
WHERE parent.relname = $1 AND child.relname = $2 AND ns.nspname = current_schema()
"#;

const TABLE_EXISTS_SQL: &str = r#"
SELECT 1 AS present
FROM pg_class
JOIN pg_namespace ns ON pg_class.relnamespace = ns.oid
WHERE pg_class.relname = $1 AND ns.nspname = current_schema()
"#;

#[derive(Debug, Clone)]
pub struct PostgresPartitionCatalog {
    db: DatabaseConnection,
}

impl PostgresPartitionCatalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn exists(&self, sql: &str, values: Vec<sea_orm::Value>) -> Result<bool, PartitionError> {
        let statement = Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, values);
        Ok(self.db.query_one(statement).await?.is_some())
    }
}

fn ensure_identifier(value: &str) -> Result<(), PartitionError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(PartitionError::InvalidIdentifier {
            value: value.to_string(),
        })
    }
}

fn bound_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^FOR VALUES FROM \('?([^')]+)'?\) TO \('?([^')]+)'?\)$")
            .expect("partition bound regex is valid")
    })
}

/// Parses a `pg_get_expr` partition bound for a table managed by `kind`.
pub fn parse_bound(
    partition: &str,
    bound: &str,
    kind: StrategyKind,
) -> Result<PartitionBounds, PartitionError> {
    let unparseable = || PartitionError::UnparseableBound {
        partition: partition.to_string(),
        bound: bound.to_string(),
    };

    let bound = bound.trim();
    if bound == "DEFAULT" {
        return Ok(PartitionBounds::Default);
    }

    let captures = bound_regex().captures(bound).ok_or_else(unparseable)?;
    let (from, to) = (&captures[1], &captures[2]);

    match kind {
        StrategyKind::Monthly => {
            let date = |value: &str| {
                value
                    .get(..10)
                    .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
            };
            match (date(from), date(to)) {
                (Some(from), Some(to)) => Ok(PartitionBounds::TimeRange { from, to }),
                _ => Err(unparseable()),
            }
        }
        StrategyKind::SlidingList => match (from.parse::<i64>(), to.parse::<i64>()) {
            (Ok(from), Ok(to)) => Ok(PartitionBounds::IdRange { from, to }),
            _ => Err(unparseable()),
        },
    }
}

/// `FOR VALUES ...` clause of `CREATE TABLE ... PARTITION OF`.
pub fn bound_clause(bounds: &PartitionBounds) -> String {
    match bounds {
        PartitionBounds::TimeRange { from, to } => format!(
            "FOR VALUES FROM ('{}') TO ('{}')",
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        ),
        PartitionBounds::IdRange { from, to } => format!("FOR VALUES FROM ({from}) TO ({to})"),
        PartitionBounds::Default => "DEFAULT".to_string(),
    }
}

fn scope_from_comment(comment: Option<String>) -> Option<String> {
    comment.and_then(|c| c.strip_prefix(SCOPE_COMMENT_PREFIX).map(str::to_string))
}

#[async_trait]
impl PartitionCatalog for PostgresPartitionCatalog {
    async fn list_partitions(
        &self,
        table: &PartitionedTable,
    ) -> Result<Vec<PartitionSpec>, PartitionError> {
        ensure_identifier(&table.name)?;
        let statement = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            LIST_PARTITIONS_SQL,
            [table.name.clone().into()],
        );
        let rows = self.db.query_all(statement).await?;

        let kind = table.strategy.kind();
        let mut partitions = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("", "name")?;
            let bound: String = row.try_get("", "bound")?;
            let comment: Option<String> = row.try_get("", "comment")?;

            match parse_bound(&name, &bound, kind) {
                Ok(bounds) => {
                    partitions.push(PartitionSpec::new(name, bounds, scope_from_comment(comment)))
                }
                Err(err) => warn!(table = %table.name, error = %err, "Ignoring unmanaged partition"),
            }
        }
        Ok(partitions)
    }

    async fn create_partition(
        &self,
        table: &PartitionedTable,
        spec: &PartitionSpec,
    ) -> Result<bool, PartitionError> {
        ensure_identifier(&table.name)?;
        ensure_identifier(&spec.name)?;

        if self
            .exists(TABLE_EXISTS_SQL, vec![spec.name.clone().into()])
            .await?
        {
            return Ok(false);
        }

        let create = format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" PARTITION OF "{}" {}"#,
            spec.name,
            table.name,
            bound_clause(&spec.bounds)
        );
        debug!(sql = %create, "Creating partition");
        self.db.execute_unprepared(&create).await?;

        if let Some(scope) = &spec.scope {
            let comment = format!(
                r#"COMMENT ON TABLE "{}" IS '{}{}'"#,
                spec.name,
                SCOPE_COMMENT_PREFIX,
                scope.replace('\'', "''")
            );
            self.db.execute_unprepared(&comment).await?;
        }
        Ok(true)
    }

    async fn detach_partition(
        &self,
        table: &PartitionedTable,
        partition: &str,
    ) -> Result<bool, PartitionError> {
        ensure_identifier(&table.name)?;
        ensure_identifier(partition)?;

        if !self
            .exists(
                IS_ATTACHED_SQL,
                vec![table.name.clone().into(), partition.to_string().into()],
            )
            .await?
        {
            return Ok(false);
        }

        let detach = format!(
            r#"ALTER TABLE "{}" DETACH PARTITION "{}""#,
            table.name, partition
        );
        self.db.execute_unprepared(&detach).await?;
        Ok(true)
    }

    async fn drop_partition(&self, partition: &str) -> Result<bool, PartitionError> {
        ensure_identifier(partition)?;

        if !self
            .exists(TABLE_EXISTS_SQL, vec![partition.to_string().into()])
            .await?
        {
            return Ok(false);
        }

        self.db
            .execute_unprepared(&format!(r#"DROP TABLE IF EXISTS "{partition}""#))
            .await?;
        Ok(true)
    }

    async fn max_key_value(&self, table: &PartitionedTable) -> Result<Option<i64>, PartitionError> {
        if table.strategy.kind() != StrategyKind::SlidingList {
            return Ok(None);
        }
        ensure_identifier(&table.name)?;
        ensure_identifier(&table.partitioning_key)?;
        Ok(planner::max_key_value(&self.db, &table.name, &table.partitioning_key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_range_bounds() {
        let bounds = parse_bound(
            "audit_events_202401",
            "FOR VALUES FROM ('2024-01-01 00:00:00+00') TO ('2024-02-01 00:00:00+00')",
            StrategyKind::Monthly,
        )
        .unwrap();
        assert_eq!(
            bounds,
            PartitionBounds::TimeRange {
                from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            }
        );
    }

    #[test]
    fn parses_integer_and_default_bounds() {
        assert_eq!(
            parse_bound("job_logs_1", "FOR VALUES FROM (1) TO (101)", StrategyKind::SlidingList)
                .unwrap(),
            PartitionBounds::IdRange { from: 1, to: 101 }
        );
        assert_eq!(
            parse_bound("job_logs_default", "DEFAULT", StrategyKind::SlidingList).unwrap(),
            PartitionBounds::Default
        );
    }

    #[test]
    fn unbounded_ranges_are_unparseable() {
        let err = parse_bound(
            "job_logs_0",
            "FOR VALUES FROM (MINVALUE) TO (1)",
            StrategyKind::SlidingList,
        )
        .unwrap_err();
        assert!(matches!(err, PartitionError::UnparseableBound { .. }));
    }

    #[test]
    fn bound_clause_renders_native_syntax() {
        let bounds = PartitionBounds::TimeRange {
            from: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        };
        assert_eq!(
            bound_clause(&bounds),
            "FOR VALUES FROM ('2024-12-01') TO ('2025-01-01')"
        );
        assert_eq!(bound_clause(&PartitionBounds::Default), "DEFAULT");
    }

    #[test]
    fn scope_is_read_from_comment() {
        assert_eq!(
            scope_from_comment(Some("scope:tenant_7".to_string())),
            Some("tenant_7".to_string())
        );
        assert_eq!(scope_from_comment(Some("archived".to_string())), None);
        assert_eq!(scope_from_comment(None), None);
    }
}
