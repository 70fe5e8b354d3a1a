//! Persistence layer: libSQL-backed dedup fingerprints and per-source progress.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{DedupStore, ProgressStore};
