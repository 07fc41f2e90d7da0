//! Data models
//!
//! This module contains the entities shared by the identity core:
//! - User identity records and their status/contact sub-records
//! - Token pairs issued to authenticated users
//! - Inputs for registration and login

mod token;
mod user;

pub use token::TokenDetail;
pub use user::{
    ContactInfo, Credentials, NewUser, PermissionRef, Status, User, UserStatus,
    REDACTED_PASSWORD, USER_SCHEMA_VERSION,
};
