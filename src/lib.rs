//! chat-identity - Identity and session authority for a chat application
//!
//! This library registers user accounts, authenticates credentials and issues,
//! validates and rotates short-lived bearer tokens backed by a revocable
//! session store.

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod models;
pub mod services;
