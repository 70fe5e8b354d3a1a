//! Store traits used by the dispatch pipeline.
//!
//! Both are implemented by [`LibSqlBackend`](crate::store::LibSqlBackend);
//! the split keeps the pipeline honest about which state it touches.

use async_trait::async_trait;

use crate::error::DatabaseError;

/// Fingerprints of content that has already been delivered.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether the key has been recorded.
    async fn contains(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Record a key. Re-adding an existing key refreshes its timestamp.
    async fn add(&self, key: &str) -> Result<(), DatabaseError>;

    /// Delete keys recorded more than `older_than_days` ago.
    /// Returns the number of keys removed.
    async fn prune(&self, older_than_days: u32) -> Result<usize, DatabaseError>;
}

/// Per-source high-water mark of handled message ids.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Last handled message id for the source, 0 if none.
    async fn get(&self, source: i64) -> Result<i64, DatabaseError>;

    /// Raise the mark to `message_id`. Never lowers it.
    async fn set(&self, source: i64, message_id: i64) -> Result<(), DatabaseError>;
}
