//! SQLite lease store.
//!
//! Participants coordinate through one database file; SQLite's file locking
//! serializes their statements.

mod store;

pub use store::SqliteStore;
