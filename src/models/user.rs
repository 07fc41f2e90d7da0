//! User model
//!
//! Identity records kept by the user directory. A user is never hard-deleted:
//! removal stamps `deleted_at` and flips the status to inactive, which frees
//! the user name and email for reuse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current schema version written with every new record
pub const USER_SCHEMA_VERSION: i32 = 1;

/// Placeholder written over the password hash before a record leaves the service
pub const REDACTED_PASSWORD: &str = "[redacted]";

/// User entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Opaque unique identifier
    pub user_id: String,
    /// User name (unique among live users)
    pub user_name: String,
    /// Password hash (argon2, PHC string)
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// Contact information
    pub contact_info: ContactInfo,
    /// Account status
    pub status: UserStatus,
    /// Ordered permission references
    #[serde(default)]
    pub permissions: Vec<PermissionRef>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Soft-deletion timestamp
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Schema version tag
    pub schema_version: i32,
}

impl User {
    /// Check if the user has been soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Check if the user may sign in
    pub fn is_active(&self) -> bool {
        !self.is_deleted() && self.status.status == Status::Active
    }

    /// Replace the password hash with a placeholder
    pub fn redacted(mut self) -> Self {
        self.password_hash = REDACTED_PASSWORD.to_string();
        self
    }
}

/// Contact information. Email is required; phone and mobile are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
}

impl ContactInfo {
    /// Create contact info with only an email address
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            phone: None,
            mobile: None,
        }
    }

    /// True when no field carries a usable value
    pub fn is_empty(&self) -> bool {
        self.email.trim().is_empty()
            && self.phone.as_deref().map_or(true, |p| p.trim().is_empty())
            && self.mobile.as_deref().map_or(true, |m| m.trim().is_empty())
    }
}

/// Status sub-record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub status: Status,
    #[serde(default)]
    pub activation_code: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UserStatus {
    /// An active status stamped at `now`
    pub fn active(now: DateTime<Utc>) -> Self {
        Self {
            status: Status::Active,
            activation_code: None,
            updated_at: now,
        }
    }
}

/// Account state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Active,
    Inactive,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Active => write!(f, "active"),
            Status::Inactive => write!(f, "inactive"),
        }
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Status::Active),
            "inactive" => Ok(Status::Inactive),
            _ => Err(anyhow::anyhow!("Invalid user status: {}", s)),
        }
    }
}

/// Reference to a permission held by a user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionRef(pub String);

impl From<&str> for PermissionRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Input for registering a new user (before password hashing)
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub user_name: String,
    /// Plaintext password (will be hashed)
    pub password: String,
    pub contact_info: ContactInfo,
    /// Initial status (defaults to active)
    pub status: Option<UserStatus>,
    pub permissions: Vec<PermissionRef>,
}

impl NewUser {
    /// Create a registration input with the required fields
    pub fn new(
        user_name: impl Into<String>,
        password: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            contact_info: ContactInfo::with_email(email),
            status: None,
            permissions: Vec::new(),
        }
    }
}

/// Login credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_name: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
        }
    }
}
