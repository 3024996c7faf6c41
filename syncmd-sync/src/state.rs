//! Persistent peer state and round history

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::errors::{Result, SyncError};
use crate::registry::{PeerRecord, Reachability};
use crate::round::RoundReport;

/// One finished or failed round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundHistoryEntry {
    pub peer_device: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub applied: u64,
    pub conflicts: u64,
    pub error: Option<String>,
}

impl RoundHistoryEntry {
    pub fn from_report(report: &RoundReport) -> Self {
        Self {
            peer_device: report.peer_device.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            success: true,
            applied: report.applied() as u64,
            conflicts: report.conflicts as u64,
            error: None,
        }
    }

    pub fn failed(peer_device: &str, started_at: DateTime<Utc>, error: &SyncError) -> Self {
        Self {
            peer_device: peer_device.to_string(),
            started_at,
            finished_at: Utc::now(),
            success: false,
            applied: 0,
            conflicts: 0,
            error: Some(error.to_string()),
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS peers (
    device_id TEXT PRIMARY KEY,
    address TEXT NOT NULL,
    last_manifest_sequence INTEGER,
    last_seen TEXT,
    reachability TEXT NOT NULL,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS round_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_device TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    success BOOLEAN NOT NULL DEFAULT 0,
    applied INTEGER NOT NULL DEFAULT 0,
    conflicts INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_round_history_peer ON round_history(peer_device, started_at DESC);
"#;

/// SQLite store behind the replica registry
pub struct PeerStateDatabase {
    conn: Mutex<Connection>,
}

impl PeerStateDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        info!("Peer state database initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, "peer state lock poisoned")))
    }

    pub fn upsert_peer(&self, peer: &PeerRecord) -> Result<()> {
        let reachability = serde_json::to_string(&peer.reachability)?;
        self.conn()?.execute(
            r#"
            INSERT INTO peers
                (device_id, address, last_manifest_sequence, last_seen,
                 reachability, consecutive_failures, next_attempt_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)
            ON CONFLICT(device_id) DO UPDATE SET
                address = excluded.address,
                last_manifest_sequence = excluded.last_manifest_sequence,
                last_seen = excluded.last_seen,
                reachability = excluded.reachability,
                consecutive_failures = excluded.consecutive_failures,
                next_attempt_at = excluded.next_attempt_at,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                peer.device_id,
                peer.address,
                peer.last_manifest_sequence.map(|s| s as i64),
                peer.last_seen.map(|dt| dt.to_rfc3339()),
                reachability,
                peer.consecutive_failures,
                peer.next_attempt_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        debug!("Saved peer state for {}", peer.device_id);
        Ok(())
    }

    pub fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT device_id, address, last_manifest_sequence, last_seen,
                   reachability, consecutive_failures, next_attempt_at
            FROM peers
            ORDER BY device_id
            "#,
        )?;
        let rows = stmt.query_map([], row_to_peer)?;
        let mut peers = Vec::new();
        for row in rows {
            peers.push(row?);
        }
        Ok(peers)
    }

    pub fn record_round(&self, entry: &RoundHistoryEntry) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO round_history
                (peer_device, started_at, finished_at, success, applied, conflicts, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry.peer_device,
                entry.started_at.to_rfc3339(),
                entry.finished_at.to_rfc3339(),
                entry.success,
                entry.applied as i64,
                entry.conflicts as i64,
                entry.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent rounds first
    pub fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT peer_device, started_at, finished_at, success, applied, conflicts, error_message
            FROM round_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RoundHistoryEntry {
                peer_device: row.get(0)?,
                started_at: parse_time(row, 1)?,
                finished_at: parse_time(row, 2)?,
                success: row.get(3)?,
                applied: row.get::<_, i64>(4)? as u64,
                conflicts: row.get::<_, i64>(5)? as u64,
                error: row.get(6)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    let reachability: String = row.get(4)?;
    Ok(PeerRecord {
        device_id: row.get(0)?,
        address: row.get(1)?,
        last_manifest_sequence: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
        last_seen: parse_optional_time(row, 3)?,
        reachability: serde_json::from_str(&reachability).unwrap_or(Reachability::Unknown),
        consecutive_failures: row.get(5)?,
        next_attempt_at: parse_optional_time(row, 6)?,
    })
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => parse_time(row, idx).map(Some),
        None => Ok(None),
    }
}
