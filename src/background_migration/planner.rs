//! Batch planning over the key column of the migrated table.
//!
//! Batches are bounded by *existing* keys rather than arithmetic steps, so a
//! sparse key space still yields batches of roughly `batch_size` rows.

use sea_orm::sea_query::{Alias, Expr, Func, Order, Query};
use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement};

use crate::db::is_valid_identifier;
use crate::error::MigrationError;
use crate::models::batched_migration;

/// Inclusive key range of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub min_value: i64,
    pub max_value: i64,
}

/// Outcome of planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedBatch {
    Range(BatchRange),
    /// The cursor reached `max_value`; nothing is left to plan.
    Done,
}

/// Plans the next range of `migration` without modifying anything.
///
/// The range starts right after the cursor and ends at the
/// `batch_size`-th existing key, or at `max_value` when fewer rows remain.
pub async fn plan_next<C: ConnectionTrait>(
    db: &C,
    migration: &batched_migration::Model,
) -> Result<PlannedBatch, MigrationError> {
    if migration.is_range_exhausted() {
        return Ok(PlannedBatch::Done);
    }
    ensure_identifiers(&migration.table_name, &migration.column_name)?;

    let start = migration.cursor.saturating_add(1).max(migration.min_value);
    let end = nth_key_at_or_after(
        db,
        &migration.table_name,
        &migration.column_name,
        start,
        migration.max_value,
        migration.batch_size,
    )
    .await?
    .unwrap_or(migration.max_value);

    Ok(PlannedBatch::Range(BatchRange {
        min_value: start,
        max_value: end.min(migration.max_value),
    }))
}

/// Rejects table or column names that are not plain identifiers.
pub fn ensure_identifiers(table: &str, column: &str) -> Result<(), MigrationError> {
    for value in [table, column] {
        if !is_valid_identifier(value) {
            return Err(MigrationError::configuration(format!(
                "'{value}' is not a valid identifier"
            )));
        }
    }
    Ok(())
}

/// Returns the `n`-th key of `column` within `[start, max]`, in key order.
///
/// `None` when fewer than `n` keys exist in that range.
pub async fn nth_key_at_or_after<C: ConnectionTrait>(
    db: &C,
    table: &str,
    column: &str,
    start: i64,
    max: i64,
    n: i64,
) -> Result<Option<i64>, DbErr> {
    let offset = (n.max(1) - 1) as u64;
    let query = Query::select()
        .expr_as(
            Func::cast_as(Expr::col(Alias::new(column)), Alias::new("BIGINT")),
            Alias::new("key_value"),
        )
        .from(Alias::new(table))
        .and_where(Expr::col(Alias::new(column)).gte(start))
        .and_where(Expr::col(Alias::new(column)).lte(max))
        .order_by(Alias::new(column), Order::Asc)
        .limit(1)
        .offset(offset)
        .to_owned();

    let statement = db.get_database_backend().build(&query);
    match db.query_one(statement).await? {
        Some(row) => Ok(Some(row.try_get::<i64>("", "key_value")?)),
        None => Ok(None),
    }
}

/// Largest key of `column`, or `None` for an empty table.
pub async fn max_key_value<C: ConnectionTrait>(
    db: &C,
    table: &str,
    column: &str,
) -> Result<Option<i64>, DbErr> {
    let query = Query::select()
        .expr_as(
            Func::cast_as(Func::max(Expr::col(Alias::new(column))), Alias::new("BIGINT")),
            Alias::new("key_value"),
        )
        .from(Alias::new(table))
        .to_owned();

    let statement = db.get_database_backend().build(&query);
    match db.query_one(statement).await? {
        Some(row) => row.try_get::<Option<i64>>("", "key_value"),
        None => Ok(None),
    }
}

/// Number of rows of `table`, used as the tuple count estimate.
pub async fn count_rows<C: ConnectionTrait>(db: &C, table: &str) -> Result<i64, DbErr> {
    let query = Query::select()
        .expr_as(Func::count(Expr::col(sea_orm::sea_query::Asterisk)), Alias::new("row_count"))
        .from(Alias::new(table))
        .to_owned();

    let statement = db.get_database_backend().build(&query);
    match db.query_one(statement).await? {
        Some(row) => row.try_get::<i64>("", "row_count"),
        None => Ok(0),
    }
}

/// Row count estimate of `table`.
///
/// Postgres answers from planner statistics; other backends count rows.
pub async fn estimate_row_count<C: ConnectionTrait>(db: &C, table: &str) -> Result<i64, DbErr> {
    if db.get_database_backend() != DatabaseBackend::Postgres {
        return count_rows(db, table).await;
    }

    let statement = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT GREATEST(reltuples, 0)::bigint AS estimate FROM pg_class WHERE relname = $1",
        [table.into()],
    );
    match db.query_one(statement).await? {
        Some(row) => row.try_get::<i64>("", "estimate"),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sea_orm::{Database, DatabaseConnection};
    use uuid::Uuid;

    async fn table_with_keys(keys: &[i64]) -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.execute(Statement::from_string(
            db.get_database_backend(),
            "CREATE TABLE items (id INTEGER PRIMARY KEY, body TEXT)".to_string(),
        ))
        .await
        .unwrap();
        for key in keys {
            db.execute(Statement::from_string(
                db.get_database_backend(),
                format!("INSERT INTO items (id, body) VALUES ({key}, 'x')"),
            ))
            .await
            .unwrap();
        }
        db
    }

    fn migration(min_value: i64, max_value: i64, cursor: i64, batch_size: i64) -> batched_migration::Model {
        let now = Utc::now().fixed_offset();
        batched_migration::Model {
            id: Uuid::new_v4(),
            job_class_name: "CopyColumn".to_string(),
            table_name: "items".to_string(),
            column_name: "id".to_string(),
            job_arguments: serde_json::json!({}),
            min_value,
            max_value,
            batch_size,
            sub_batch_size: 10,
            max_batch_size: 1000,
            pause_ms: 0,
            interval_seconds: 120,
            cursor,
            total_tuple_count: None,
            status: "active".to_string(),
            database_identifier: "main".to_string(),
            created_at: now,
            updated_at: now,
            last_batch_started_at: None,
            last_batch_finished_at: None,
        }
    }

    #[tokio::test]
    async fn dense_keys_produce_full_batches() {
        let keys: Vec<i64> = (1..=250).collect();
        let db = table_with_keys(&keys).await;

        let plan = plan_next(&db, &migration(1, 250, 0, 100)).await.unwrap();
        assert_eq!(
            plan,
            PlannedBatch::Range(BatchRange { min_value: 1, max_value: 100 })
        );

        let plan = plan_next(&db, &migration(1, 250, 200, 100)).await.unwrap();
        assert_eq!(
            plan,
            PlannedBatch::Range(BatchRange { min_value: 201, max_value: 250 })
        );
    }

    #[tokio::test]
    async fn sparse_keys_stretch_the_range() {
        let db = table_with_keys(&[1, 5, 10, 50, 51, 300]).await;

        let plan = plan_next(&db, &migration(1, 400, 0, 3)).await.unwrap();
        assert_eq!(
            plan,
            PlannedBatch::Range(BatchRange { min_value: 1, max_value: 10 })
        );

        let plan = plan_next(&db, &migration(1, 400, 51, 3)).await.unwrap();
        assert_eq!(
            plan,
            PlannedBatch::Range(BatchRange { min_value: 52, max_value: 400 })
        );
    }

    #[tokio::test]
    async fn exhausted_cursor_is_done() {
        let db = table_with_keys(&[1, 2, 3]).await;
        assert_eq!(
            plan_next(&db, &migration(1, 3, 3, 100)).await.unwrap(),
            PlannedBatch::Done
        );
        assert_eq!(
            plan_next(&db, &migration(10, 5, 9, 100)).await.unwrap(),
            PlannedBatch::Done
        );
    }

    #[tokio::test]
    async fn invalid_identifiers_are_rejected() {
        let db = table_with_keys(&[]).await;
        let mut bad = migration(1, 10, 0, 5);
        bad.table_name = "items; DROP TABLE items".to_string();

        let err = plan_next(&db, &bad).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn max_key_and_count_follow_table_contents() {
        let db = table_with_keys(&[3, 9, 27]).await;
        assert_eq!(max_key_value(&db, "items", "id").await.unwrap(), Some(27));
        assert_eq!(count_rows(&db, "items").await.unwrap(), 3);
        assert_eq!(estimate_row_count(&db, "items").await.unwrap(), 3);

        let empty = table_with_keys(&[]).await;
        assert_eq!(max_key_value(&empty, "items", "id").await.unwrap(), None);
    }
}
