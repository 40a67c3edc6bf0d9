//! # Error Handling
//!
//! Error types shared by the migration scheduler and the partition lifecycle
//! manager. Only configuration errors are meant to reach callers of the
//! background loops; everything else is recorded and retried.

use thiserror::Error;
use uuid::Uuid;

use crate::background_migration::state::{MigrationEvent, MigrationStatus};

/// Illegal or lost state transitions of a batched migration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cannot {event} a migration that is {from}")]
    IllegalTransition {
        from: MigrationStatus,
        event: MigrationEvent,
    },
    #[error("migration {id} changed status concurrently; transition discarded")]
    Conflict { id: Uuid },
}

/// Errors raised by the migration registry, planner, runner and scheduler.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("invalid migration configuration: {message}")]
    Configuration { message: String },
    #[error("no migration job registered under '{name}'")]
    UnknownJobClass { name: String },
    #[error("unknown database '{name}'")]
    UnknownDatabase { name: String },
    #[error("batched migration {id} not found")]
    NotFound { id: Uuid },
    #[error("batched migration {id} kept running elsewhere while finalizing")]
    Contended { id: Uuid },
}

impl MigrationError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is a setup problem rather than a runtime failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::UnknownJobClass { .. } | Self::UnknownDatabase { .. }
        )
    }
}

/// Errors returned by migration callbacks.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("invalid job arguments: {message}")]
    InvalidArguments { message: String },
    #[error("{message}")]
    Failed { message: String },
}

impl JobError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn invalid_arguments<S: Into<String>>(message: S) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    /// Short machine-readable classification stored with failed batches.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Errors raised while maintaining partitions.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error(
        "partition '{partition}' declares scope {actual:?} but its parent '{table}' is scoped to {expected:?}"
    )]
    ScopeMismatch {
        table: String,
        partition: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("partition '{partition}' bounds do not fit the strategy of '{table}'")]
    IncompatibleBounds { table: String, partition: String },
    #[error("could not parse partition bound '{bound}' of '{partition}'")]
    UnparseableBound { partition: String, bound: String },
    #[error("invalid identifier '{value}'")]
    InvalidIdentifier { value: String },
}

/// Returns true when the database rejected a write because of a unique index.
///
/// The single-running-batch guard relies on this to detect a lost race.
pub fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    match db_error.code() {
        Some(code) => {
            let code_str = code.as_ref();
            code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_transition_message_names_status_and_event() {
        let err = StateError::IllegalTransition {
            from: MigrationStatus::Finished,
            event: MigrationEvent::Resume,
        };
        assert_eq!(err.to_string(), "cannot resume a migration that is finished");
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(MigrationError::configuration("batch_size must be positive").is_configuration());
        assert!(
            MigrationError::UnknownJobClass {
                name: "Missing".to_string()
            }
            .is_configuration()
        );
        assert!(!MigrationError::NotFound { id: Uuid::nil() }.is_configuration());
    }

    #[test]
    fn non_sqlx_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sea_orm::DbErr::RecordNotUpdated));
        assert!(!is_unique_violation(&sea_orm::DbErr::Custom(
            "duplicate".to_string()
        )));
    }
}
