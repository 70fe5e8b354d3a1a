//! libSQL backend for the dedup and progress stores.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{DedupStore, ProgressStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Canonical timestamp format. Fixed width so text comparison orders
/// correctly.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ── Dedup ───────────────────────────────────────────────────────────

#[async_trait]
impl DedupStore for LibSqlBackend {
    async fn contains(&self, key: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM dedup_hashes WHERE hash = ?1 LIMIT 1",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dedup contains: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("dedup contains: {e}")))?;
        Ok(row.is_some())
    }

    async fn add(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO dedup_hashes (hash, created_at) VALUES (?1, ?2)
                 ON CONFLICT(hash) DO UPDATE SET created_at = excluded.created_at",
                params![key, timestamp(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dedup add: {e}")))?;
        debug!(key, "Fingerprint recorded");
        Ok(())
    }

    async fn prune(&self, older_than_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
        let count = self
            .conn()
            .execute(
                "DELETE FROM dedup_hashes WHERE created_at < ?1",
                params![timestamp(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dedup prune: {e}")))?;

        if count > 0 {
            info!(count, older_than_days, "Pruned old fingerprints");
        }
        Ok(count as usize)
    }
}

// ── Progress ────────────────────────────────────────────────────────

#[async_trait]
impl ProgressStore for LibSqlBackend {
    async fn get(&self, source: i64) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id FROM forward_progress WHERE channel_id = ?1",
                params![source],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("progress get: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("progress get: {e}")))?
        {
            Some(row) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("progress get: {e}"))),
            None => Ok(0),
        }
    }

    async fn set(&self, source: i64, message_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO forward_progress (channel_id, message_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(channel_id) DO UPDATE SET
                    message_id = MAX(message_id, excluded.message_id),
                    updated_at = excluded.updated_at",
                params![source, message_id, timestamp(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("progress set: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Dedup tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn dedup_add_then_contains() {
        let db = test_db().await;
        assert!(!db.contains("photo:abc").await.unwrap());
        db.add("photo:abc").await.unwrap();
        assert!(db.contains("photo:abc").await.unwrap());
        assert!(!db.contains("photo:other").await.unwrap());
    }

    #[tokio::test]
    async fn dedup_add_is_idempotent() {
        let db = test_db().await;
        db.add("doc:x:10").await.unwrap();
        db.add("doc:x:10").await.unwrap();

        let mut rows = db
            .conn()
            .query("SELECT COUNT(*) FROM dedup_hashes", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn dedup_prune_removes_only_old_keys() {
        let db = test_db().await;
        db.add("fresh").await.unwrap();
        let old = timestamp(Utc::now() - chrono::Duration::days(45));
        db.conn()
            .execute(
                "INSERT INTO dedup_hashes (hash, created_at) VALUES ('stale', ?1)",
                params![old],
            )
            .await
            .unwrap();

        let removed = db.prune(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(db.contains("fresh").await.unwrap());
        assert!(!db.contains("stale").await.unwrap());
    }

    #[tokio::test]
    async fn dedup_readd_refreshes_timestamp() {
        let db = test_db().await;
        let old = timestamp(Utc::now() - chrono::Duration::days(45));
        db.conn()
            .execute(
                "INSERT INTO dedup_hashes (hash, created_at) VALUES ('again', ?1)",
                params![old],
            )
            .await
            .unwrap();
        db.add("again").await.unwrap();

        assert_eq!(db.prune(30).await.unwrap(), 0);
        assert!(db.contains("again").await.unwrap());
    }

    // ── Progress tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn progress_defaults_to_zero() {
        let db = test_db().await;
        assert_eq!(ProgressStore::get(&db, -100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let db = test_db().await;
        db.set(-100, 10).await.unwrap();
        db.set(-100, 7).await.unwrap();
        assert_eq!(ProgressStore::get(&db, -100).await.unwrap(), 10);

        db.set(-100, 12).await.unwrap();
        assert_eq!(ProgressStore::get(&db, -100).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn progress_is_per_source() {
        let db = test_db().await;
        db.set(-1, 5).await.unwrap();
        db.set(-2, 9).await.unwrap();
        assert_eq!(ProgressStore::get(&db, -1).await.unwrap(), 5);
        assert_eq!(ProgressStore::get(&db, -2).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.set(-100, 42).await.unwrap();
            db.add("text:abc").await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(ProgressStore::get(&db, -100).await.unwrap(), 42);
        assert!(db.contains("text:abc").await.unwrap());
    }
}
