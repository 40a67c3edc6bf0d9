//! Built-in job that copies one column into another where the target is still NULL.
//!
//! Arguments: `{"source_column": "...", "target_column": "..."}`. Rows that
//! already have a target value are skipped, so re-running a range is a no-op.

use async_trait::async_trait;
use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Alias, Expr, Query};
use serde::Deserialize;

use super::job::{BatchContext, BatchedMigrationJob};
use crate::db::is_valid_identifier;
use crate::error::JobError;

pub const COPY_COLUMN_JOB: &str = "CopyColumn";

#[derive(Debug, Deserialize)]
struct CopyColumnArguments {
    source_column: String,
    target_column: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CopyColumnJob;

#[async_trait]
impl BatchedMigrationJob for CopyColumnJob {
    async fn perform(&self, ctx: BatchContext<'_>) -> Result<(), JobError> {
        let args: CopyColumnArguments = ctx.arguments()?;
        for column in [&args.source_column, &args.target_column] {
            if !is_valid_identifier(column) {
                return Err(JobError::invalid_arguments(format!(
                    "'{column}' is not a valid column name"
                )));
            }
        }

        let connection = ctx.connection;
        ctx.each_sub_batch(|start, end| {
            let update = Query::update()
                .table(Alias::new(ctx.table_name))
                .value(
                    Alias::new(&args.target_column),
                    Expr::col(Alias::new(&args.source_column)),
                )
                .and_where(Expr::col(Alias::new(ctx.column_name)).between(start, end))
                .and_where(Expr::col(Alias::new(&args.target_column)).is_null())
                .to_owned();
            let statement = connection.get_database_backend().build(&update);
            async move {
                connection.execute(statement).await?;
                Ok(())
            }
        })
        .await?;

        Ok(())
    }
}
