//! `CacheMetadataStore`: a schema-versioned SQLite table mapping cache
//! fingerprints to response metadata.
//!
//! Grounded on the SQLite-backed `HttpCacheDatabase` this system's design
//! lineage uses for its metadata table, and on the `rusqlite` usage
//! pattern found repeatedly elsewhere in this crate's ecosystem for
//! exactly this role (WAL journaling, `busy_timeout`, `INSERT OR
//! REPLACE`).

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Current on-disk schema version. Bumping this recreates the table on
/// next open (see [`CacheMetadataStore::open`]).
const SCHEMA_VERSION: i64 = 1;

/// A single persisted metadata row (§3 `CacheMetadata` / §6 column list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub key: String,
    pub url: String,
    pub method: String,
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body_size: u64,
    pub sent_request_at_epoch: i64,
    pub received_response_at_epoch: i64,
    pub created_at_epoch: i64,
    pub last_accessed_at_epoch: i64,
}

/// The durable fingerprint → metadata mapping.
pub struct CacheMetadataStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl CacheMetadataStore {
    /// Open (creating if absent) the metadata store at `path`. If the
    /// existing file is unreadable or carries a different schema
    /// version, it is dropped and recreated transparently (self-healing,
    /// §4.1) rather than returning an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = match Self::open_connection(&path) {
            Ok(conn) => conn,
            Err(_) => {
                let _ = std::fs::remove_file(&path);
                Self::open_connection(&path)?
            }
        };
        Ok(CacheMetadataStore { path, conn: Mutex::new(conn) })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != SCHEMA_VERSION {
            conn.execute("DROP TABLE IF EXISTS cache_metadata", [])?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_metadata (
                key TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                method TEXT NOT NULL,
                status INTEGER NOT NULL,
                reason TEXT NOT NULL,
                headers TEXT NOT NULL,
                body_size INTEGER NOT NULL,
                sent_request_at_epoch INTEGER NOT NULL,
                received_response_at_epoch INTEGER NOT NULL,
                created_at_epoch INTEGER NOT NULL,
                last_accessed_at_epoch INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(conn)
    }

    /// Drop and recreate the table from scratch, used by `ResponseCache`
    /// when a read indicates corruption beyond what `open` can detect up
    /// front (e.g. a malformed row).
    pub fn recreate(&self) -> Result<()> {
        let conn = Connection::open(&self.path).or_else(|_| {
            let _ = std::fs::remove_file(&self.path);
            Self::open_connection(&self.path)
        })?;
        conn.execute("DROP TABLE IF EXISTS cache_metadata", [])?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        conn.execute(
            "CREATE TABLE cache_metadata (
                key TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                method TEXT NOT NULL,
                status INTEGER NOT NULL,
                reason TEXT NOT NULL,
                headers TEXT NOT NULL,
                body_size INTEGER NOT NULL,
                sent_request_at_epoch INTEGER NOT NULL,
                received_response_at_epoch INTEGER NOT NULL,
                created_at_epoch INTEGER NOT NULL,
                last_accessed_at_epoch INTEGER NOT NULL
            )",
            [],
        )?;
        *self.conn.lock() = conn;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<MetadataRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT key, url, method, status, reason, headers, body_size,
                    sent_request_at_epoch, received_response_at_epoch,
                    created_at_epoch, last_accessed_at_epoch
             FROM cache_metadata WHERE key = ?1",
        )?;
        let row = stmt
            .query_row(params![key], Self::row_to_record)
            .optional()?;
        Ok(row)
    }

    pub fn upsert(&self, record: &MetadataRecord) -> Result<()> {
        let headers_json = serde_json::to_string(&record.headers)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cache_metadata
                (key, url, method, status, reason, headers, body_size,
                 sent_request_at_epoch, received_response_at_epoch,
                 created_at_epoch, last_accessed_at_epoch)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.key,
                record.url,
                record.method,
                record.status,
                record.reason,
                headers_json,
                record.body_size as i64,
                record.sent_request_at_epoch,
                record.received_response_at_epoch,
                record.created_at_epoch,
                record.last_accessed_at_epoch,
            ],
        )?;
        Ok(())
    }

    /// Bump `last_accessed_at_epoch` for `key` without touching any other
    /// column (used by `lookup` on a cache hit).
    pub fn touch_last_accessed(&self, key: &str, epoch: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE cache_metadata SET last_accessed_at_epoch = ?1 WHERE key = ?2",
            params![epoch, key],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache_metadata WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn truncate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM cache_metadata", [])?;
        Ok(())
    }

    /// All records, oldest-last-accessed first, for LRU index rebuild on
    /// startup.
    pub fn enumerate(&self) -> Result<Vec<MetadataRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT key, url, method, status, reason, headers, body_size,
                    sent_request_at_epoch, received_response_at_epoch,
                    created_at_epoch, last_accessed_at_epoch
             FROM cache_metadata ORDER BY last_accessed_at_epoch ASC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetadataRecord> {
        let headers_json: String = row.get(5)?;
        let headers: HashMap<String, String> = serde_json::from_str(&headers_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e)))?;
        Ok(MetadataRecord {
            key: row.get(0)?,
            url: row.get(1)?,
            method: row.get(2)?,
            status: row.get(3)?,
            reason: row.get(4)?,
            headers,
            body_size: row.get::<_, i64>(6)? as u64,
            sent_request_at_epoch: row.get(7)?,
            received_response_at_epoch: row.get(8)?,
            created_at_epoch: row.get(9)?,
            last_accessed_at_epoch: row.get(10)?,
        })
    }
}

/// Classify a metadata-store error as corruption worth a full recreate,
/// vs. a transient failure that should propagate as `CacheIo`.
pub fn looks_like_corruption(err: &Error) -> bool {
    matches!(
        err,
        Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            )
    ) || matches!(err, Error::SerdeJson(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(key: &str) -> MetadataRecord {
        MetadataRecord {
            key: key.to_string(),
            url: "http://h/p".to_string(),
            method: "GET".to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers: HashMap::new(),
            body_size: 15,
            sent_request_at_epoch: 1,
            received_response_at_epoch: 2,
            created_at_epoch: 2,
            last_accessed_at_epoch: 2,
        }
    }

    #[test]
    fn upsert_then_get_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = CacheMetadataStore::open(dir.path().join("cache_metadata.db")).unwrap();
        store.upsert(&record("k1")).unwrap();
        let got = store.get("k1").unwrap().unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.body_size, 15);
    }

    #[test]
    fn get_missing_key_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CacheMetadataStore::open(dir.path().join("cache_metadata.db")).unwrap();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CacheMetadataStore::open(dir.path().join("cache_metadata.db")).unwrap();
        store.upsert(&record("k1")).unwrap();
        store.delete("k1").unwrap();
        store.delete("k1").unwrap();
        assert!(store.get("k1").unwrap().is_none());
    }

    #[test]
    fn corrupted_database_file_self_heals_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache_metadata.db");
        {
            let store = CacheMetadataStore::open(&path).unwrap();
            store.upsert(&record("k1")).unwrap();
            store.upsert(&record("k2")).unwrap();
        }
        std::fs::write(&path, b"not a sqlite database, just garbage bytes").unwrap();

        let store = CacheMetadataStore::open(&path).unwrap();
        assert!(store.get("k1").unwrap().is_none());
        assert!(store.get("k2").unwrap().is_none());
        store.upsert(&record("k3")).unwrap();
        assert!(store.get("k3").unwrap().is_some());
    }

    #[test]
    fn enumerate_orders_by_last_accessed_ascending() {
        let dir = TempDir::new().unwrap();
        let store = CacheMetadataStore::open(dir.path().join("cache_metadata.db")).unwrap();
        let mut r1 = record("k1");
        r1.last_accessed_at_epoch = 10;
        let mut r2 = record("k2");
        r2.last_accessed_at_epoch = 5;
        store.upsert(&r1).unwrap();
        store.upsert(&r2).unwrap();
        let all = store.enumerate().unwrap();
        assert_eq!(all[0].key, "k2");
        assert_eq!(all[1].key, "k1");
    }
}
