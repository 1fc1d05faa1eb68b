//! Persistence layer: `SQLite` store for sessions and tasks.

pub mod db;
pub mod migration;
pub mod retention;
pub mod schema;
pub mod session_store;

pub use session_store::SessionStore;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
