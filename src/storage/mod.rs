//! Graph store: SQLite-backed records for conversations, turns, alternatives,
//! and working-memory snapshots

pub mod connection;
pub mod migrations;
pub mod queries;

pub use connection::Storage;
