/// Database schema version
pub const SCHEMA_VERSION: u32 = 1;

/// SQL schema for the record store
pub const SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- One row per path: the latest known record
CREATE TABLE IF NOT EXISTS file_records (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    logical_version INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    lineage TEXT,
    ancestors TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_file_records_hash ON file_records(content_hash);
CREATE INDEX IF NOT EXISTS idx_file_records_tombstones ON file_records(modified_at) WHERE deleted = 1;

-- Counters such as the manifest sequence
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

-- Conflicts kept until the owner acknowledges them
CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    copy_path TEXT NOT NULL,
    winner_hash TEXT NOT NULL,
    loser_hash TEXT NOT NULL,
    reason TEXT NOT NULL,
    payload TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    acknowledged_at TEXT,
    UNIQUE(path, winner_hash, loser_hash)
);

CREATE INDEX IF NOT EXISTS idx_conflicts_open ON conflicts(acknowledged) WHERE acknowledged = 0;
"#;
