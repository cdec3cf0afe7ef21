//! Data layer module
//!
//! Handles membership registry persistence:
//! - SQLite database operations
//! - Registry models

mod database;
mod models;

pub use database::Database;
pub use models::*;
