//! SQLite connection setup and schema bootstrap.
//!
//! Every request opens its own connection; nothing is cached in process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA foreign_keys=ON;
";

const CORE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS config (
        name  TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS api_keys (
        id           INTEGER PRIMARY KEY,
        key          TEXT NOT NULL UNIQUE,
        label        TEXT,
        enabled      INTEGER NOT NULL DEFAULT 1,
        role         TEXT NOT NULL DEFAULT 'write',
        created_at   INTEGER NOT NULL,
        last_used_at INTEGER,
        last_ip      TEXT
    );

    CREATE TABLE IF NOT EXISTS ip_allow (
        id         INTEGER PRIMARY KEY,
        cidr       TEXT NOT NULL UNIQUE,
        enabled    INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS ip_deny (
        id         INTEGER PRIMARY KEY,
        cidr       TEXT NOT NULL UNIQUE,
        enabled    INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS karing (
        id           INTEGER PRIMARY KEY,
        content      TEXT,
        is_file      INTEGER NOT NULL DEFAULT 0,
        filename     TEXT,
        mime         TEXT,
        content_blob BLOB,
        created_at   INTEGER,
        updated_at   INTEGER,
        revision     INTEGER NOT NULL DEFAULT 0,
        is_active    INTEGER NOT NULL DEFAULT 0,
        CHECK (is_active IN (0, 1)),
        CHECK (
            (is_active = 0 AND content IS NULL AND content_blob IS NULL
                AND filename IS NULL AND mime IS NULL)
            OR (is_active = 1 AND is_file = 0 AND content IS NOT NULL
                AND content_blob IS NULL AND filename IS NULL AND mime IS NULL)
            OR (is_active = 1 AND is_file = 1 AND content IS NULL
                AND content_blob IS NOT NULL AND filename IS NOT NULL AND mime IS NOT NULL)
        )
    );

    CREATE INDEX IF NOT EXISTS idx_karing_created_at_desc ON karing(created_at DESC, id DESC);
    CREATE INDEX IF NOT EXISTS idx_karing_is_file_created ON karing(is_file, created_at DESC, id DESC);
    CREATE INDEX IF NOT EXISTS idx_karing_filename ON karing(filename);
    CREATE INDEX IF NOT EXISTS idx_karing_mime ON karing(mime);

    CREATE TABLE IF NOT EXISTS overwrite_log (
        id                  INTEGER PRIMARY KEY,
        replaced_rowid      INTEGER NOT NULL,
        at                  INTEGER NOT NULL,
        by_api_key_id       INTEGER,
        from_ip             TEXT,
        action              TEXT,
        fields              TEXT,
        text_excerpt_before TEXT,
        text_hash_before    TEXT,
        text_hash_after     TEXT,
        text_len_before     INTEGER,
        text_len_after      INTEGER,
        file_hash_before    TEXT,
        file_hash_after     TEXT,
        file_len_before     INTEGER,
        file_len_after      INTEGER,
        mime_before         TEXT,
        mime_after          TEXT,
        filename_before     TEXT,
        filename_after      TEXT,
        content_before      TEXT,
        text_patch          TEXT,
        FOREIGN KEY (by_api_key_id) REFERENCES api_keys(id)
            ON UPDATE CASCADE ON DELETE SET NULL
    );
    CREATE INDEX IF NOT EXISTS idx_overwrite_at ON overwrite_log(at DESC);
";

const FTS_SCHEMA: &str = "
    CREATE VIRTUAL TABLE IF NOT EXISTS karing_fts
        USING fts5(content, content='karing', content_rowid='id');

    CREATE TRIGGER IF NOT EXISTS karing_ai
    AFTER INSERT ON karing
    WHEN NEW.is_active = 1 AND NEW.is_file = 0
    BEGIN
        INSERT INTO karing_fts(rowid, content) VALUES (NEW.id, NEW.content);
    END;

    CREATE TRIGGER IF NOT EXISTS karing_au
    AFTER UPDATE OF content, is_active, is_file ON karing
    BEGIN
        INSERT INTO karing_fts(karing_fts, rowid, content)
            SELECT 'delete', OLD.id, OLD.content WHERE OLD.is_active = 1 AND OLD.is_file = 0;
        INSERT INTO karing_fts(rowid, content)
            SELECT NEW.id, NEW.content WHERE NEW.is_active = 1 AND NEW.is_file = 0;
    END;

    CREATE TRIGGER IF NOT EXISTS karing_ad
    AFTER DELETE ON karing
    WHEN OLD.is_active = 1 AND OLD.is_file = 0
    BEGIN
        INSERT INTO karing_fts(karing_fts, rowid, content) VALUES ('delete', OLD.id, OLD.content);
    END;
";

const DROP_FTS: &str = "
    DROP TRIGGER IF EXISTS karing_ai;
    DROP TRIGGER IF EXISTS karing_au;
    DROP TRIGGER IF EXISTS karing_ad;
    DROP TABLE IF EXISTS karing_fts;
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    Conflict { message: String },
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("invalid search query: {reason}")]
    QueryInvalid { reason: String },
    #[error("full-text search unavailable")]
    SearchUnavailable,
    #[error("failed to open database '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {message}")]
    Task { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaReport {
    pub fts_available: bool,
}

pub fn open(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(PRAGMAS)?;
    Ok(conn)
}

/// Creates the database file and every table, index and trigger, idempotently.
pub fn init_schema(path: &Path, fts_enabled: bool) -> Result<SchemaReport, StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = open(path)?;
    conn.execute_batch(CORE_SCHEMA)?;

    if !fts_enabled {
        conn.execute_batch(DROP_FTS)?;
        return Ok(SchemaReport {
            fts_available: false,
        });
    }

    let existed = fts_available(&conn)?;
    match conn.execute_batch(FTS_SCHEMA) {
        Ok(()) => {
            if !existed {
                conn.execute_batch("INSERT INTO karing_fts(karing_fts) VALUES ('rebuild');")?;
            }
            Ok(SchemaReport {
                fts_available: true,
            })
        }
        Err(error) => {
            tracing::warn!(reason = %error, "fts5 unavailable; search falls back to substring match");
            Ok(SchemaReport {
                fts_available: false,
            })
        }
    }
}

pub fn fts_available(conn: &Connection) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='karing_fts'",
            [],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn list_tables(path: &Path) -> Result<Vec<TableInfo>, StoreError> {
    let conn = open(path)?;
    let mut stmt =
        conn.prepare("SELECT name, sql FROM sqlite_master WHERE type='table' ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(TableInfo {
            name: row.get(0)?,
            sql: row.get(1)?,
        })
    })?;
    let tables = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(tables)
}
