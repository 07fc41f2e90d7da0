//! Connection pool for the user directory
//!
//! `SqlxPool` wraps either a SQLite or a MySQL pool. Repositories match on
//! `driver()` and borrow the concrete pool through `sqlite()` or `mysql()`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions},
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DatabaseConfig, DatabaseDriver};

const SQLITE_MAX_CONNECTIONS: u32 = 8;
const MYSQL_MAX_CONNECTIONS: u32 = 30;

/// How long a SQLite writer waits on a locked database
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a caller waits for a free pooled connection
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const SQLITE_MEMORY_URL: &str = "sqlite::memory:";

/// Database access shared by migrations and repositories
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Run a statement that returns no rows, yielding the affected row count
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Round-trip to the database
    async fn ping(&self) -> Result<()>;

    /// Close every pooled connection
    async fn close(&self);

    fn driver(&self) -> DatabaseDriver;

    /// The SQLite pool, or an error for any other driver
    fn sqlite(&self) -> Result<&SqlitePool>;

    /// The MySQL pool, or an error for any other driver
    fn mysql(&self) -> Result<&MySqlPool>;
}

pub type DynDatabasePool = Arc<dyn DatabasePool>;

/// A sqlx pool for one of the supported drivers
#[derive(Debug, Clone)]
pub enum SqlxPool {
    Sqlite(SqlitePool),
    Mysql(MySqlPool),
}

impl SqlxPool {
    /// Connect a SQLite pool. `:memory:` and `sqlite::memory:` give an
    /// in-memory database shared by the pool; anything else is a file path,
    /// optionally prefixed with `sqlite:`, whose parent directory is created.
    pub async fn connect_sqlite(url: &str) -> Result<Self> {
        let options = if url == ":memory:" || url == SQLITE_MEMORY_URL {
            SqliteConnectOptions::from_str(SQLITE_MEMORY_URL)?
        } else {
            let path = Path::new(url.strip_prefix("sqlite:").unwrap_or(url));
            ensure_parent_dir(path)?;
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(SQLITE_MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options.busy_timeout(SQLITE_BUSY_TIMEOUT))
            .await
            .with_context(|| format!("Failed to open SQLite user directory at {}", url))?;

        Ok(SqlxPool::Sqlite(pool))
    }

    /// Connect a MySQL pool. The `mysql://` scheme is optional.
    pub async fn connect_mysql(url: &str) -> Result<Self> {
        let url = if url.starts_with("mysql://") {
            url.to_string()
        } else {
            format!("mysql://{}", url)
        };
        let options = MySqlConnectOptions::from_str(&url)
            .context("Invalid MySQL connection URL")?
            .charset("utf8mb4");

        let pool = MySqlPoolOptions::new()
            .max_connections(MYSQL_MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to connect to MySQL user directory")?;

        Ok(SqlxPool::Mysql(pool))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display())),
        _ => Ok(()),
    }
}

#[async_trait]
impl DatabasePool for SqlxPool {
    async fn execute(&self, statement: &str) -> Result<u64> {
        let affected = match self {
            SqlxPool::Sqlite(pool) => sqlx::query(statement).execute(pool).await?.rows_affected(),
            SqlxPool::Mysql(pool) => sqlx::query(statement).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    async fn ping(&self) -> Result<()> {
        match self {
            SqlxPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
            SqlxPool::Mysql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(drop),
        }
        .context("Database ping failed")
    }

    async fn close(&self) {
        match self {
            SqlxPool::Sqlite(pool) => pool.close().await,
            SqlxPool::Mysql(pool) => pool.close().await,
        }
    }

    fn driver(&self) -> DatabaseDriver {
        match self {
            SqlxPool::Sqlite(_) => DatabaseDriver::Sqlite,
            SqlxPool::Mysql(_) => DatabaseDriver::Mysql,
        }
    }

    fn sqlite(&self) -> Result<&SqlitePool> {
        match self {
            SqlxPool::Sqlite(pool) => Ok(pool),
            SqlxPool::Mysql(_) => anyhow::bail!("User directory is on MySQL, not SQLite"),
        }
    }

    fn mysql(&self) -> Result<&MySqlPool> {
        match self {
            SqlxPool::Mysql(pool) => Ok(pool),
            SqlxPool::Sqlite(_) => anyhow::bail!("User directory is on SQLite, not MySQL"),
        }
    }
}

/// Open the pool named by `config`
pub async fn create_pool(config: &DatabaseConfig) -> Result<DynDatabasePool> {
    let pool = match config.driver {
        DatabaseDriver::Sqlite => SqlxPool::connect_sqlite(&config.url).await?,
        DatabaseDriver::Mysql => SqlxPool::connect_mysql(&config.url).await?,
    };
    Ok(Arc::new(pool))
}

/// In-memory SQLite pool for tests
pub async fn create_test_pool() -> Result<DynDatabasePool> {
    Ok(Arc::new(SqlxPool::connect_sqlite(SQLITE_MEMORY_URL).await?))
}
