//! Database layer
//!
//! Persistence for the user directory. Supports:
//! - SQLite (default, for single-binary deployment)
//! - MySQL (for larger deployments)
//!
//! The driver is selected from configuration. The rest of the crate talks to
//! the `DatabasePool` trait and never to a concrete backend.
//!
//! # Usage
//!
//! ```ignore
//! use chat_identity::config::DatabaseConfig;
//! use chat_identity::db::{create_pool, migrations};
//! use chat_identity::db::repositories::SqlxUserRepository;
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//!
//! let users = SqlxUserRepository::boxed(pool.clone());
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, SqlxPool,
};
