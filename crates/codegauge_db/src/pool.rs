//! Database pool creation.
//!
//! Compile-time database selection via feature flags. Concrete pool types
//! (not `sqlx::AnyPool`) so `#[derive(FromRow)]` works with chrono types.
//!
//! - `postgres` feature: uses `PgPool`
//! - `sqlite` feature (default): uses `SqlitePool`
//!
//! If both features are enabled, `sqlite` takes priority.

use thiserror::Error;
use tracing::info;

/// Database pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}

/// Database pool type alias.
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbPool = sqlx::PgPool;

#[cfg(feature = "sqlite")]
pub type DbPool = sqlx::SqlitePool;

/// Database row type for queries.
#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
pub type DbRow = sqlx::postgres::PgRow;

#[cfg(feature = "sqlite")]
pub type DbRow = sqlx::sqlite::SqliteRow;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// Create SQLite configuration backed by a file.
    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            max_connections: 5,
        }
    }

    /// Create in-memory SQLite configuration (for testing).
    #[cfg(feature = "sqlite")]
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    /// Create configuration from a URL.
    pub fn from_url(url: impl Into<String>) -> Result<Self, PoolError> {
        let url = url.into();
        if !url.starts_with("sqlite:") && !url.starts_with("postgres:") {
            return Err(PoolError::InvalidUrl(url));
        }
        Ok(Self {
            url,
            max_connections: 5,
        })
    }

    /// Set maximum connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a database pool from configuration.
///
/// SQLite pools run WAL mode with NORMAL sync and enforce foreign keys on
/// every connection (cascade deletes rely on it).
pub async fn create_pool(config: DbConfig) -> Result<DbPool, PoolError> {
    #[cfg(feature = "sqlite")]
    {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|_| PoolError::InvalidUrl(config.url.clone()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!("Connected to SQLite database");
        return Ok(pool);
    }

    #[cfg(all(feature = "postgres", not(feature = "sqlite")))]
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");
        return Ok(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sqlite")]
    async fn test_sqlite_pool() {
        let config = DbConfig::sqlite_memory();
        let pool = create_pool(config).await;
        assert!(pool.is_ok());
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(DbConfig::from_url("mysql://nope").is_err());
        assert!(DbConfig::from_url("sqlite::memory:").is_ok());
    }
}
