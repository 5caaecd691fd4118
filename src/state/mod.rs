//! Runtime State Module
//!
//! SQLite-backed persistent state for the runtime.
//! The database IS the runtime's memory.

mod database;
mod schema;

pub use database::{Database, TurnOutcome};
pub use schema::{CREATE_TABLES, MIGRATION_V2, SCHEMA_VERSION};
