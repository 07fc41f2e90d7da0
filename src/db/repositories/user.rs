//! User repository
//!
//! Database operations for the user directory.
//!
//! This module provides:
//! - `UserRepository` trait defining the interface for user data access
//! - `SqlxUserRepository` implementing the trait for SQLite and MySQL
//!
//! Lookups only ever see live rows. Removal is a soft delete.

use crate::config::DatabaseDriver;
use crate::context::{ContextError, RequestContext};
use crate::db::DynDatabasePool;
use crate::models::{ContactInfo, PermissionRef, Status, User, UserStatus};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;

const USER_COLUMNS: &str = "user_id, user_name, password_hash, email, phone, mobile, status, \
     activation_code, status_updated_at, permissions, created_at, updated_at, deleted_at, schema_version";

/// User directory errors
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// A live user already holds the user name or email
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No live user matches
    #[error("User not found")]
    NotFound,

    /// The request deadline passed
    #[error("User directory operation timed out")]
    Timeout,

    /// The request was cancelled
    #[error("User directory operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("User directory error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ContextError> for DirectoryError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::DeadlineExceeded => DirectoryError::Timeout,
            ContextError::Cancelled => DirectoryError::Cancelled,
        }
    }
}

type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a new user. Fails with `Conflict` if a live user has the same
    /// user name or email.
    async fn save(&self, ctx: &RequestContext, user: &User) -> DirectoryResult<User>;

    /// Get a live user by user name
    async fn find_by_user_name(&self, ctx: &RequestContext, user_name: &str) -> DirectoryResult<User>;

    /// Get a live user by user ID
    async fn find_by_user_id(&self, ctx: &RequestContext, user_id: &str) -> DirectoryResult<User>;

    /// Get a live user by contact info. The first non-empty field of email,
    /// mobile and phone is used.
    async fn find_by_contact(&self, ctx: &RequestContext, contact: &ContactInfo) -> DirectoryResult<User>;

    /// Soft-delete a user, returning the updated record
    async fn remove(&self, ctx: &RequestContext, user: &User) -> DirectoryResult<User>;

    /// Check that the database is reachable
    async fn ping(&self, ctx: &RequestContext) -> DirectoryResult<()>;
}

/// Which column a single-user lookup matches on
#[derive(Debug, Clone, Copy)]
enum Lookup {
    UserId,
    UserName,
    Email,
    Mobile,
    Phone,
}

impl Lookup {
    fn column(self) -> &'static str {
        match self {
            Lookup::UserId => "user_id",
            Lookup::UserName => "user_name",
            Lookup::Email => "email",
            Lookup::Mobile => "mobile",
            Lookup::Phone => "phone",
        }
    }
}

/// Pick the lookup for a contact query: email, then mobile, then phone
fn contact_lookup(contact: &ContactInfo) -> Option<(Lookup, &str)> {
    let email = contact.email.trim();
    if !email.is_empty() {
        return Some((Lookup::Email, email));
    }
    if let Some(mobile) = contact.mobile.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        return Some((Lookup::Mobile, mobile));
    }
    if let Some(phone) = contact.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        return Some((Lookup::Phone, phone));
    }
    None
}

/// SQLx-based user repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxUserRepository {
    pool: DynDatabasePool,
}

impl SqlxUserRepository {
    /// Create a new SQLx user repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn UserRepository> {
        Arc::new(Self::new(pool))
    }

    async fn find_one(&self, lookup: Lookup, value: &str) -> DirectoryResult<User> {
        let user = match self.pool.driver() {
            DatabaseDriver::Sqlite => find_live_user_sqlite(self.pool.sqlite()?, lookup, value).await?,
            DatabaseDriver::Mysql => find_live_user_mysql(self.pool.mysql()?, lookup, value).await?,
        };
        user.ok_or(DirectoryError::NotFound)
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn save(&self, ctx: &RequestContext, user: &User) -> DirectoryResult<User> {
        ctx.run(async {
            match self.pool.driver() {
                DatabaseDriver::Sqlite => save_user_sqlite(self.pool.sqlite()?, user).await,
                DatabaseDriver::Mysql => save_user_mysql(self.pool.mysql()?, user).await,
            }
        })
        .await
    }

    async fn find_by_user_name(&self, ctx: &RequestContext, user_name: &str) -> DirectoryResult<User> {
        ctx.run(self.find_one(Lookup::UserName, user_name)).await
    }

    async fn find_by_user_id(&self, ctx: &RequestContext, user_id: &str) -> DirectoryResult<User> {
        ctx.run(self.find_one(Lookup::UserId, user_id)).await
    }

    async fn find_by_contact(&self, ctx: &RequestContext, contact: &ContactInfo) -> DirectoryResult<User> {
        let (lookup, value) = contact_lookup(contact).ok_or(DirectoryError::NotFound)?;
        ctx.run(self.find_one(lookup, value)).await
    }

    async fn remove(&self, ctx: &RequestContext, user: &User) -> DirectoryResult<User> {
        let now = Utc::now();
        let mut removed = user.clone();
        removed.status.status = Status::Inactive;
        removed.status.updated_at = now;
        removed.updated_at = now;
        removed.deleted_at = Some(now);

        let affected = ctx
            .run(async {
                match self.pool.driver() {
                    DatabaseDriver::Sqlite => soft_delete_user_sqlite(self.pool.sqlite()?, &removed).await,
                    DatabaseDriver::Mysql => soft_delete_user_mysql(self.pool.mysql()?, &removed).await,
                }
            })
            .await?;

        if affected == 0 {
            return Err(DirectoryError::NotFound);
        }
        Ok(removed)
    }

    async fn ping(&self, ctx: &RequestContext) -> DirectoryResult<()> {
        ctx.run(async { self.pool.ping().await.map_err(DirectoryError::from) })
            .await
    }
}

/// Map an insert failure, turning unique-index violations into `Conflict`
fn insert_error(e: sqlx::Error) -> DirectoryError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return DirectoryError::Conflict("user name or email already exists".to_string());
        }
    }
    DirectoryError::Internal(anyhow::Error::new(e).context("Failed to insert user"))
}

/// Conflict message for a live row that clashes with `user`
fn duplicate_reason(user: &User, existing_user_name: &str) -> String {
    if existing_user_name == user.user_name {
        "user name already exists".to_string()
    } else {
        "email already registered".to_string()
    }
}

fn encode_permissions(permissions: &[PermissionRef]) -> DirectoryResult<String> {
    serde_json::to_string(permissions)
        .context("Failed to encode permissions")
        .map_err(DirectoryError::from)
}

fn decode_permissions(raw: &str) -> anyhow::Result<Vec<PermissionRef>> {
    serde_json::from_str(raw).with_context(|| format!("Invalid permissions in database: {}", raw))
}

fn parse_status(raw: &str) -> anyhow::Result<Status> {
    Status::from_str(raw).with_context(|| format!("Invalid status in database: {}", raw))
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn save_user_sqlite(pool: &SqlitePool, user: &User) -> DirectoryResult<User> {
    let existing = sqlx::query(
        "SELECT user_name FROM users WHERE deleted_at IS NULL AND (user_name = ? OR email = ?) LIMIT 1",
    )
    .bind(&user.user_name)
    .bind(&user.contact_info.email)
    .fetch_optional(pool)
    .await
    .context("Failed to check for duplicate user")?;

    if let Some(row) = existing {
        let existing_user_name: String = row.try_get("user_name").context("Failed to read user name")?;
        return Err(DirectoryError::Conflict(duplicate_reason(user, &existing_user_name)));
    }

    let permissions = encode_permissions(&user.permissions)?;
    let sql = format!(
        "INSERT INTO users ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        USER_COLUMNS
    );

    sqlx::query(&sql)
        .bind(&user.user_id)
        .bind(&user.user_name)
        .bind(&user.password_hash)
        .bind(&user.contact_info.email)
        .bind(&user.contact_info.phone)
        .bind(&user.contact_info.mobile)
        .bind(user.status.status.to_string())
        .bind(&user.status.activation_code)
        .bind(user.status.updated_at)
        .bind(&permissions)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .bind(user.schema_version)
        .execute(pool)
        .await
        .map_err(insert_error)?;

    Ok(user.clone())
}

async fn find_live_user_sqlite(
    pool: &SqlitePool,
    lookup: Lookup,
    value: &str,
) -> anyhow::Result<Option<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE {} = ? AND deleted_at IS NULL LIMIT 1",
        USER_COLUMNS,
        lookup.column()
    );

    let row = sqlx::query(&sql)
        .bind(value)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to get user by {}", lookup.column()))?;

    row.as_ref().map(row_to_user_sqlite).transpose()
}

async fn soft_delete_user_sqlite(pool: &SqlitePool, user: &User) -> DirectoryResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET status = ?, status_updated_at = ?, updated_at = ?, deleted_at = ?
        WHERE user_id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(user.status.status.to_string())
    .bind(user.status.updated_at)
    .bind(user.updated_at)
    .bind(user.deleted_at)
    .bind(&user.user_id)
    .execute(pool)
    .await
    .context("Failed to remove user")?;

    Ok(result.rows_affected())
}

fn row_to_user_sqlite(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<User> {
    let status: String = row.try_get("status")?;
    let permissions: String = row.try_get("permissions")?;
    let deleted_at: Option<DateTime<Utc>> = row.try_get("deleted_at")?;

    Ok(User {
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        password_hash: row.try_get("password_hash")?,
        contact_info: ContactInfo {
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            mobile: row.try_get("mobile")?,
        },
        status: UserStatus {
            status: parse_status(&status)?,
            activation_code: row.try_get("activation_code")?,
            updated_at: row.try_get("status_updated_at")?,
        },
        permissions: decode_permissions(&permissions)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at,
        schema_version: row.try_get("schema_version")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn save_user_mysql(pool: &MySqlPool, user: &User) -> DirectoryResult<User> {
    let existing = sqlx::query(
        "SELECT user_name FROM users WHERE deleted_at IS NULL AND (user_name = ? OR email = ?) LIMIT 1",
    )
    .bind(&user.user_name)
    .bind(&user.contact_info.email)
    .fetch_optional(pool)
    .await
    .context("Failed to check for duplicate user")?;

    if let Some(row) = existing {
        let existing_user_name: String = row.try_get("user_name").context("Failed to read user name")?;
        return Err(DirectoryError::Conflict(duplicate_reason(user, &existing_user_name)));
    }

    let permissions = encode_permissions(&user.permissions)?;
    let sql = format!(
        "INSERT INTO users ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        USER_COLUMNS
    );

    sqlx::query(&sql)
        .bind(&user.user_id)
        .bind(&user.user_name)
        .bind(&user.password_hash)
        .bind(&user.contact_info.email)
        .bind(&user.contact_info.phone)
        .bind(&user.contact_info.mobile)
        .bind(user.status.status.to_string())
        .bind(&user.status.activation_code)
        .bind(user.status.updated_at)
        .bind(&permissions)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .bind(user.schema_version)
        .execute(pool)
        .await
        .map_err(insert_error)?;

    Ok(user.clone())
}

async fn find_live_user_mysql(
    pool: &MySqlPool,
    lookup: Lookup,
    value: &str,
) -> anyhow::Result<Option<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE {} = ? AND deleted_at IS NULL LIMIT 1",
        USER_COLUMNS,
        lookup.column()
    );

    let row = sqlx::query(&sql)
        .bind(value)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to get user by {}", lookup.column()))?;

    row.as_ref().map(row_to_user_mysql).transpose()
}

async fn soft_delete_user_mysql(pool: &MySqlPool, user: &User) -> DirectoryResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET status = ?, status_updated_at = ?, updated_at = ?, deleted_at = ?
        WHERE user_id = ? AND deleted_at IS NULL
        "#,
    )
    .bind(user.status.status.to_string())
    .bind(user.status.updated_at)
    .bind(user.updated_at)
    .bind(user.deleted_at)
    .bind(&user.user_id)
    .execute(pool)
    .await
    .context("Failed to remove user")?;

    Ok(result.rows_affected())
}

fn row_to_user_mysql(row: &sqlx::mysql::MySqlRow) -> anyhow::Result<User> {
    let status: String = row.try_get("status")?;
    let permissions: String = row.try_get("permissions")?;
    let deleted_at: Option<DateTime<Utc>> = row.try_get("deleted_at")?;

    Ok(User {
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        password_hash: row.try_get("password_hash")?,
        contact_info: ContactInfo {
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            mobile: row.try_get("mobile")?,
        },
        status: UserStatus {
            status: parse_status(&status)?,
            activation_code: row.try_get("activation_code")?,
            updated_at: row.try_get("status_updated_at")?,
        },
        permissions: decode_permissions(&permissions)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at,
        schema_version: row.try_get("schema_version")?,
    })
}
