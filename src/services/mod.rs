//! Services layer - Business logic
//!
//! - `password`: Argon2id credential hashing
//! - `token`: signing and verification of the access/refresh token pair
//! - `identity`: the identity operations built on the directory and the
//!   session store

pub mod identity;
pub mod password;
pub mod token;

pub use identity::{ErrorKind, IdentityError, IdentityService};
pub use password::{hash_password, verify_password};
pub use token::{TokenAuthority, TokenError};
