//! Password hashing module
//!
//! This module provides password hashing and verification using Argon2id.
//!
//! # Security
//!
//! - Argon2id, version 0x13
//! - Fixed work factor: m = 19456 KiB, t = 2, p = 1
//! - Random salt for each password hash
//! - Output is a self-describing PHC string

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use once_cell::sync::Lazy;

/// Memory cost in KiB
pub const MEMORY_COST_KIB: u32 = 19 * 1024;
/// Number of passes
pub const TIME_COST: u32 = 2;
/// Degree of parallelism
pub const PARALLELISM: u32 = 1;

/// Error returned when a password cannot be hashed
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The hasher rejected its parameters
    #[error("Invalid hashing parameters: {0}")]
    Params(String),

    /// Hashing itself failed
    #[error("Failed to hash password: {0}")]
    Hash(String),
}

/// Verified against when the user name is unknown, so the caller pays the
/// same hashing cost whether or not the user exists.
static DUMMY_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("chat-identity-dummy-password").ok());

fn hasher() -> Result<Argon2<'static>, HashError> {
    let params = Params::new(MEMORY_COST_KIB, TIME_COST, PARALLELISM, None)
        .map_err(|e| HashError::Params(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password using Argon2id.
///
/// # Returns
///
/// The password hash as a PHC string (algorithm, parameters, salt and hash)
///
/// # Example
///
/// ```ignore
/// use chat_identity::services::password::hash_password;
///
/// let hash = hash_password("my_secure_password")?;
/// assert!(hash.starts_with("$argon2id$"));
/// ```
pub fn hash_password(password: &str) -> Result<String, HashError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = hasher()?;

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| HashError::Hash(e.to_string()))?;

    Ok(password_hash.to_string())
}

/// Verify a password against a stored hash.
///
/// Returns `false` on mismatch and on a stored hash that cannot be parsed.
/// The parameters embedded in the stored hash are used for verification.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "Stored password hash is not a valid PHC string");
            return false;
        }
    };

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => true,
        Err(argon2::password_hash::Error::Password) => false,
        Err(e) => {
            tracing::warn!(error = %e, "Password verification failed");
            false
        }
    }
}

/// Burn one verification against a fixed hash. Always returns `false`.
pub fn verify_dummy(password: &str) -> bool {
    if let Some(hash) = DUMMY_HASH.as_deref() {
        let _ = verify_password(password, hash);
    }
    false
}
