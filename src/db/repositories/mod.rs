//! Database repositories
//!
//! Repository pattern implementations for database access.

pub mod user;

pub use user::{DirectoryError, SqlxUserRepository, UserRepository};
