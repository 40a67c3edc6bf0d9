//! Database connection and pool management.
//!
//! Every configured database gets its own SeaORM pool, keyed by its
//! identifier. The [`DatabaseRouter`] hands out the pool of a given
//! identifier and knows which identifiers share one physical database.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use tokio::time::sleep;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::config::{AppConfig, DatabaseConfig};
use crate::error::MigrationError;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database '{name}': {source}")]
    ConnectionFailed {
        name: String,
        #[source]
        source: sea_orm::DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// Initializes the connection pool of one configured database.
///
/// Transient connection failures are retried with exponential backoff.
///
/// ```no_run
/// use batched_migrations::{config::AppConfig, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = AppConfig::default();
///     let databases = config.database_configs();
///     let db = init_pool(&databases[0], &config).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(database: &DatabaseConfig, cfg: &AppConfig) -> Result<DatabaseConnection> {
    if database.url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: format!("database URL of '{}' cannot be empty", database.name),
        }
        .into());
    }

    let mut opt = ConnectOptions::new(&database.url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600)) // 10 minutes
        .max_lifetime(Duration::from_secs(1800)) // 30 minutes
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let backoff = BackoffPolicy::default();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!(
                    "Connected to database '{}' (attempt {})",
                    database.name,
                    attempt
                );
                return Ok(conn);
            }
            Err(e) if attempt >= MAX_CONNECT_ATTEMPTS => {
                log::error!(
                    "Failed to connect to database '{}' after {} attempts: {}",
                    database.name,
                    attempt,
                    e
                );
                return Err(DatabaseError::ConnectionFailed {
                    name: database.name.clone(),
                    source: e,
                }
                .into());
            }
            Err(e) => {
                let delay = backoff.next_delay_with_jitter(attempt - 1, &mut rand::thread_rng());
                log::warn!(
                    "Connection attempt {} to database '{}' failed: {}, retrying in {:?}",
                    attempt,
                    database.name,
                    e,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}

/// Health check for a database connection.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    use sea_orm::Statement;

    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());

    db.query_one(stmt)
        .await
        .context("Database health check failed")?;

    Ok(())
}

/// Whether `value` is safe to interpolate as a table or column name.
pub fn is_valid_identifier(value: &str) -> bool {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    let pattern = IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("identifier pattern is valid")
    });
    pattern.is_match(value)
}

/// Physical location of a database, ignoring credentials and options.
///
/// In-memory SQLite URLs have no shared location and yield `None`.
pub fn storage_target(url: &str) -> Option<String> {
    if url.contains(":memory:") || url.contains("mode=memory") {
        return None;
    }
    let parsed = Url::parse(url).ok()?;
    let scheme = match parsed.scheme() {
        "postgresql" => "postgres",
        other => other,
    };
    let host = parsed.host_str().unwrap_or("").to_ascii_lowercase();
    let port = parsed.port_or_known_default().or(match scheme {
        "postgres" => Some(5432),
        _ => None,
    });
    let path = parsed.path().trim_end_matches('/');
    Some(match port {
        Some(port) => format!("{scheme}://{host}:{port}{path}"),
        None => format!("{scheme}://{host}{path}"),
    })
}

/// Pool of one configured database.
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    pub name: String,
    pub connection: DatabaseConnection,
    share_with: Option<String>,
    target: Option<String>,
}

/// Connection pools keyed by database identifier, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct DatabaseRouter {
    databases: Vec<DatabaseHandle>,
}

impl DatabaseRouter {
    /// Connects to every configured database.
    pub async fn connect(cfg: &AppConfig) -> Result<Self> {
        let mut router = Self::default();
        for database in cfg.database_configs() {
            let connection = init_pool(&database, cfg).await?;
            router.insert(&database, connection);
        }
        Ok(router)
    }

    /// Builds a router from already opened connections.
    pub fn from_connections<I>(connections: I) -> Self
    where
        I: IntoIterator<Item = (DatabaseConfig, DatabaseConnection)>,
    {
        let mut router = Self::default();
        for (database, connection) in connections {
            router.insert(&database, connection);
        }
        router
    }

    /// Router over a single database named `name`.
    pub fn single(name: &str, connection: DatabaseConnection) -> Self {
        Self::from_connections([(
            DatabaseConfig {
                name: name.to_string(),
                url: String::new(),
                share_with: None,
            },
            connection,
        )])
    }

    fn insert(&mut self, database: &DatabaseConfig, connection: DatabaseConnection) {
        self.databases.retain(|handle| handle.name != database.name);
        self.databases.push(DatabaseHandle {
            name: database.name.clone(),
            connection,
            share_with: database.share_with.clone(),
            target: storage_target(&database.url),
        });
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.iter().map(|handle| handle.name.as_str())
    }

    pub fn handles(&self) -> impl Iterator<Item = &DatabaseHandle> {
        self.databases.iter()
    }

    /// Connection pool of `name`.
    pub fn connection(&self, name: &str) -> Result<&DatabaseConnection, MigrationError> {
        self.databases
            .iter()
            .find(|handle| handle.name == name)
            .map(|handle| &handle.connection)
            .ok_or_else(|| MigrationError::UnknownDatabase {
                name: name.to_string(),
            })
    }

    /// The identifier that owns the physical database `name` points at, when it is not `name` itself.
    ///
    /// An explicit `share_with` wins. Otherwise the first earlier-configured
    /// database with the same storage target is the owner.
    pub fn shares_storage_with(&self, name: &str) -> Option<&str> {
        let position = self.databases.iter().position(|handle| handle.name == name)?;
        let handle = &self.databases[position];

        if let Some(owner) = handle.share_with.as_deref() {
            if owner != name && self.databases.iter().any(|other| other.name == owner) {
                return Some(owner);
            }
        }

        let target = handle.target.as_ref()?;
        self.databases[..position]
            .iter()
            .find(|other| other.target.as_ref() == Some(target))
            .map(|other| other.name.as_str())
    }

    /// `owner` plus every identifier whose storage it owns, in configuration order.
    pub fn identifiers_sharing(&self, owner: &str) -> Vec<&str> {
        self.names()
            .filter(|name| *name == owner || self.shares_storage_with(name) == Some(owner))
            .collect()
    }
}
