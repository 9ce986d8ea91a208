//! SQLite-backed response table.
//!
//! Unlike the key/value backends this store is queryable: rows carry the
//! request hash, class hash, dates and flags as columns, and bulk eviction
//! uses the `expiry_date` index.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::stats::StoreStats;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS rewind_cache (
        token         TEXT NOT NULL,
        class_hash    TEXT NOT NULL,
        class_name    TEXT NOT NULL,
        cache_date    INTEGER NOT NULL,
        expiry_date   INTEGER NOT NULL,
        data          BLOB NOT NULL,
        is_compressed INTEGER NOT NULL,
        is_encrypted  INTEGER NOT NULL,
        PRIMARY KEY (token, class_hash)
    );
    CREATE INDEX IF NOT EXISTS idx_expiry ON rewind_cache(expiry_date);
"#;

const SELECT_COLUMNS: &str = "token, class_hash, class_name, cache_date, expiry_date, data, is_compressed, is_encrypted";

/// One persisted response. Dates are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub token: String,
    pub class_hash: String,
    pub class_name: String,
    pub cache_date: i64,
    pub expiry_date: i64,
    pub data: Vec<u8>,
    pub is_compressed: bool,
    pub is_encrypted: bool,
}

impl CacheRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get(0)?,
            class_hash: row.get(1)?,
            class_name: row.get(2)?,
            cache_date: row.get(3)?,
            expiry_date: row.get(4)?,
            data: row.get(5)?,
            is_compressed: row.get(6)?,
            is_encrypted: row.get(7)?,
        })
    }
}

/// SQLite response store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    stats: StoreStats,
}

impl SqliteStore {
    /// Open (or create) a database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Config` if `path` names a directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(StorageError::Config(format!(
                "SQLite path {:?} is a directory",
                path
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            stats: StoreStats::new(),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            stats: StoreStats::new(),
        })
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Insert or replace the row for `(token, class_hash)` in one statement.
    #[instrument(skip(self, row), fields(token = %row.token, size = row.data.len()))]
    pub async fn upsert(&self, row: &CacheRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO rewind_cache
            (token, class_hash, class_name, cache_date, expiry_date, data, is_compressed, is_encrypted)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                &row.token,
                &row.class_hash,
                &row.class_name,
                row.cache_date,
                row.expiry_date,
                &row.data,
                row.is_compressed,
                row.is_encrypted
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn find(&self, token: &str, class_hash: &str) -> Result<Option<CacheRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM rewind_cache WHERE token = ? AND class_hash = ?",
                    SELECT_COLUMNS
                ),
                params![token, class_hash],
                CacheRow::from_row,
            )
            .optional()?;

        match row {
            Some(_) => {
                self.stats.hit();
                metrics::counter!("rewind_store_hits_total", "backend" => "sqlite").increment(1);
            }
            None => {
                self.stats.miss();
                metrics::counter!("rewind_store_misses_total", "backend" => "sqlite").increment(1);
            }
        }
        Ok(row)
    }

    /// Mark a row as already expired (expiry pulled back to its cache date)
    /// without touching its payload.
    #[instrument(skip(self))]
    pub async fn expire(&self, token: &str, class_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"
            UPDATE rewind_cache SET expiry_date = cache_date
            WHERE token = ? AND class_hash = ? AND expiry_date > cache_date
            "#,
            params![token, class_hash],
        )?;
        Ok(updated > 0)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, token: &str, class_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM rewind_cache WHERE token = ? AND class_hash = ?",
            params![token, class_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Delete rows, optionally restricted to one class and/or to rows
    /// expiring at or before `expired_at`.
    #[instrument(skip(self))]
    pub async fn delete_matching(
        &self,
        class_hash: Option<&str>,
        expired_at: Option<i64>,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            r#"
            DELETE FROM rewind_cache
            WHERE (?1 IS NULL OR class_hash = ?1)
              AND (?2 IS NULL OR expiry_date <= ?2)
            "#,
            params![class_hash, expired_at],
        )?;
        debug!("Deleted {} rows", deleted);
        Ok(deleted)
    }

    /// Bulk-evict every row that is stale at `now`.
    pub async fn evict_expired(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM rewind_cache WHERE expiry_date <= ?",
            params![now],
        )?;
        for _ in 0..deleted {
            self.stats.evict();
        }
        metrics::counter!("rewind_store_evictions_total", "backend" => "sqlite")
            .increment(deleted as u64);
        Ok(deleted)
    }

    /// Keep at most `max_entries` rows, deleting the oldest by cache date.
    pub async fn evict_oldest(&self, max_entries: usize) -> Result<usize> {
        let conn = self.conn.lock().await;

        let current_count: usize =
            conn.query_row("SELECT COUNT(*) FROM rewind_cache", [], |row| row.get(0))?;

        if current_count <= max_entries {
            return Ok(0);
        }

        let to_delete = current_count - max_entries;
        conn.execute(
            r#"
            DELETE FROM rewind_cache WHERE rowid IN (
                SELECT rowid FROM rewind_cache
                ORDER BY cache_date ASC
                LIMIT ?
            )
            "#,
            params![to_delete as i64],
        )?;

        for _ in 0..to_delete {
            self.stats.evict();
        }
        Ok(to_delete)
    }

    /// Every stored row.
    pub async fn rows(&self) -> Result<Vec<CacheRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rewind_cache ORDER BY cache_date ASC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], CacheRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: usize =
            conn.query_row("SELECT COUNT(*) FROM rewind_cache", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("hits", &self.stats.hits())
            .field("misses", &self.stats.misses())
            .finish()
    }
}
