//! Persistent per-path record storage

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use syncmd_chunker::ContentHash;
use tracing::{debug, info};

use crate::conflict::{Conflict, ConflictEntry};
use crate::errors::{IndexError, Result};
use crate::record::FileRecord;
use crate::schema::{SCHEMA, SCHEMA_VERSION};

const MANIFEST_SEQUENCE_KEY: &str = "manifest_sequence";

/// Key-value style record storage, keyed by relative path.
///
/// Every mutation touches a single row, so it is atomic per path.
pub trait RecordStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<FileRecord>>;

    /// Insert or replace the record for `record.path`
    fn put(&self, record: &FileRecord) -> Result<()>;

    /// Remove a record entirely; returns whether it existed
    fn delete(&self, path: &str) -> Result<bool>;

    /// All records, ordered by path
    fn scan(&self) -> Result<Vec<FileRecord>>;

    /// Live records whose content hash equals `hash`
    fn find_by_hash(&self, hash: &ContentHash) -> Result<Vec<FileRecord>>;

    /// Bump and return the manifest sequence number
    fn next_manifest_sequence(&self) -> Result<u64>;

    /// Last issued manifest sequence number
    fn current_manifest_sequence(&self) -> Result<u64>;

    /// Drop tombstones last modified before `older_than`
    fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Persist a conflict; returns its id, or `None` if it was already recorded
    fn put_conflict(&self, conflict: &Conflict) -> Result<Option<i64>>;

    fn list_conflicts(&self, include_acknowledged: bool) -> Result<Vec<ConflictEntry>>;

    fn acknowledge_conflict(&self, id: i64) -> Result<bool>;
}

/// SQLite-backed [`RecordStore`]
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create a database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        let version: Option<u32> = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();

        match version {
            None => {
                info!("Initializing new record store schema");
                conn.execute_batch(SCHEMA)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v != SCHEMA_VERSION => {
                return Err(IndexError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    actual: v,
                });
            }
            _ => {
                debug!("Record store schema up to date (version {})", SCHEMA_VERSION);
            }
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| IndexError::LockPoisoned)
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
        let content_hash: String = row.get(1)?;
        let lineage: Option<String> = row.get(8)?;
        let ancestors: String = row.get(9)?;

        Ok(FileRecord {
            path: row.get(0)?,
            content_hash: parse_hash(1, &content_hash)?,
            size: row.get::<_, i64>(2)? as u64,
            created_at: parse_time(3, &row.get::<_, String>(3)?)?,
            modified_at: parse_time(4, &row.get::<_, String>(4)?)?,
            logical_version: row.get::<_, i64>(5)? as u64,
            device_id: row.get(6)?,
            deleted: row.get(7)?,
            lineage: lineage.map(|h| parse_hash(8, &h)).transpose()?,
            ancestors: serde_json::from_str(&ancestors).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
            })?,
        })
    }

    fn read_counter(conn: &Connection, key: &str) -> Result<u64> {
        let value: Option<i64> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value.unwrap_or(0) as u64)
    }
}

const RECORD_COLUMNS: &str = "path, content_hash, size, created_at, modified_at, \
     logical_version, device_id, deleted, lineage, ancestors";

impl RecordStore for SqliteRecordStore {
    fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM file_records WHERE path = ?1", RECORD_COLUMNS),
                params![path],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &FileRecord) -> Result<()> {
        if record.path.is_empty() {
            return Err(IndexError::InvalidRecord("empty path".to_string()));
        }
        let ancestors = serde_json::to_string(&record.ancestors)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO file_records
                (path, content_hash, size, created_at, modified_at,
                 logical_version, device_id, deleted, lineage, ancestors)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                created_at = excluded.created_at,
                modified_at = excluded.modified_at,
                logical_version = excluded.logical_version,
                device_id = excluded.device_id,
                deleted = excluded.deleted,
                lineage = excluded.lineage,
                ancestors = excluded.ancestors
            "#,
            params![
                record.path,
                record.content_hash.to_hex(),
                record.size as i64,
                record.created_at.to_rfc3339(),
                record.modified_at.to_rfc3339(),
                record.logical_version as i64,
                record.device_id,
                record.deleted,
                record.lineage.map(|h| h.to_hex()),
                ancestors,
            ],
        )?;
        debug!(
            "Stored record {} v{} ({})",
            record.path,
            record.logical_version,
            record.content_hash.short()
        );
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM file_records WHERE path = ?1", params![path])?;
        Ok(n > 0)
    }

    fn scan(&self) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_records ORDER BY path",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn find_by_hash(&self, hash: &ContentHash) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_records WHERE content_hash = ?1 AND deleted = 0 ORDER BY path",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![hash.to_hex()], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn next_manifest_sequence(&self) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let next = Self::read_counter(&tx, MANIFEST_SEQUENCE_KEY)? + 1;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![MANIFEST_SEQUENCE_KEY, next as i64],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn current_manifest_sequence(&self) -> Result<u64> {
        let conn = self.conn()?;
        Self::read_counter(&conn, MANIFEST_SEQUENCE_KEY)
    }

    fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
        // Compare parsed timestamps rather than rfc3339 text, offsets may differ
        let candidates: Vec<FileRecord> = self
            .scan()?
            .into_iter()
            .filter(|r| r.deleted && r.modified_at < older_than)
            .collect();

        let conn = self.conn()?;
        let mut purged = 0;
        for record in &candidates {
            purged += conn.execute(
                "DELETE FROM file_records WHERE path = ?1 AND deleted = 1",
                params![record.path],
            )?;
        }
        if purged > 0 {
            info!("Purged {} tombstones older than {}", purged, older_than);
        }
        Ok(purged)
    }

    fn put_conflict(&self, conflict: &Conflict) -> Result<Option<i64>> {
        let payload = serde_json::to_string(conflict)?;
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO conflicts
                (path, copy_path, winner_hash, loser_hash, reason, payload, detected_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                conflict.path,
                conflict.copy_path,
                conflict.winner.content_hash.to_hex(),
                conflict.loser.content_hash.to_hex(),
                conflict.reason.to_string(),
                payload,
                conflict.detected_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        info!(
            "Recorded conflict on {} ({}), copy at {}",
            conflict.path, conflict.reason, conflict.copy_path
        );
        Ok(Some(conn.last_insert_rowid()))
    }

    fn list_conflicts(&self, include_acknowledged: bool) -> Result<Vec<ConflictEntry>> {
        let conn = self.conn()?;
        let sql = if include_acknowledged {
            "SELECT id, payload, acknowledged FROM conflicts ORDER BY id"
        } else {
            "SELECT id, payload, acknowledged FROM conflicts WHERE acknowledged = 0 ORDER BY id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, payload, acknowledged)| {
                Ok(ConflictEntry {
                    id,
                    conflict: serde_json::from_str(&payload)?,
                    acknowledged,
                })
            })
            .collect()
    }

    fn acknowledge_conflict(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE conflicts SET acknowledged = 1, acknowledged_at = ?2 WHERE id = ?1 AND acknowledged = 0",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }
}

fn parse_hash(idx: usize, hex: &str) -> rusqlite::Result<ContentHash> {
    ContentHash::from_hex(hex).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
