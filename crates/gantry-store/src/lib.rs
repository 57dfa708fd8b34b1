//! SQLite persistence for assistants, threads, and runs.
//!
//! Repos expose plain serializable rows; callers never touch storage
//! internals. All state lives in one database file (or in memory for tests).

mod database;
mod error;
mod row_helpers;
mod schema;

pub mod assistants;
pub mod runs;
pub mod threads;

pub use database::Database;
pub use error::StoreError;
