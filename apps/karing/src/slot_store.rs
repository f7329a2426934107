//! Bounded slot storage over the `karing` table.
//!
//! Writes run in one `BEGIN IMMEDIATE` transaction each: slot selection,
//! payload write, overwrite audit and the trim pass commit together, so the
//! active count never exceeds the limit once a write returns.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use serde_json::json;

use crate::clock::SharedClock;
use crate::cursor::Cursor;
use crate::db::{self, StoreError};
use crate::search_query::{build_fts_query, like_pattern};
use crate::slot_filter::{PagePosition, SlotFilter};
use crate::text_audit::{EXCERPT_BYTES, MAX_PATCH_BYTES, sha256_hex, simple_diff, utf8_prefix};

const RECORD_COLUMNS: &str = "k.id, k.is_active, k.is_file, k.content, k.filename, k.mime, \
     length(k.content_blob), k.created_at, k.updated_at, k.revision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPayload {
    Text(String),
    File(FileUpload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotBody {
    Text {
        content: String,
    },
    File {
        filename: String,
        mime: String,
        size: i64,
    },
    /// Tombstoned slot; only visible to administrative listings.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub id: i64,
    pub body: SlotBody,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub revision: i64,
    pub is_active: bool,
}

impl SlotRecord {
    pub fn is_file(&self) -> bool {
        matches!(self.body, SlotBody::File { .. })
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// Partial file replacement; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePatch {
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub data: Option<Vec<u8>>,
}

/// Who asked for a replacement, recorded in `overwrite_log`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverwriteActor {
    pub api_key_id: Option<i64>,
    pub from_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEngine {
    Fts,
    Like,
}

impl SearchEngine {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fts => "fts",
            Self::Like => "like",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub records: Vec<SlotRecord>,
    pub total: u64,
    pub engine: SearchEngine,
}

#[derive(Debug, Clone)]
pub struct SlotStore {
    db_path: PathBuf,
    limit: u32,
    search_fallback: bool,
    clock: SharedClock,
}

/// Row state captured before a replacement, for the audit entry.
struct SlotSnapshot {
    is_active: bool,
    is_file: bool,
    content: Option<String>,
    filename: Option<String>,
    mime: Option<String>,
    blob: Option<Vec<u8>>,
}

impl SlotStore {
    pub fn new(db_path: impl Into<PathBuf>, limit: u32, clock: SharedClock) -> Self {
        Self {
            db_path: db_path.into(),
            limit: limit.max(1),
            search_fallback: true,
            clock,
        }
    }

    #[must_use]
    pub fn with_search_fallback(mut self, enabled: bool) -> Self {
        self.search_fallback = enabled;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        db::open(&self.db_path)
    }

    pub fn insert_text(&self, content: &str) -> Result<i64, StoreError> {
        self.allocate(&SlotPayload::Text(content.to_string()))
    }

    pub fn insert_file(&self, upload: FileUpload) -> Result<i64, StoreError> {
        self.allocate(&SlotPayload::File(upload))
    }

    /// Places `payload` in a free slot, a new row, or the oldest active slot.
    pub fn allocate(&self, payload: &SlotPayload) -> Result<i64, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = self.clock.now();
        let active = count_where(&tx, &SlotFilter::default())?;

        let target = if active < u64::from(self.limit) {
            tx.query_row(
                "SELECT id FROM karing WHERE is_active = 0 ORDER BY id ASC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        } else {
            tx.query_row(
                "SELECT id FROM karing WHERE is_active = 1 ORDER BY created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        };
        let overwrote = target.is_some() && active >= u64::from(self.limit);
        let id = match target {
            Some(id) => id,
            None => {
                tx.execute("INSERT INTO karing(is_active, revision) VALUES (0, 0)", [])?;
                tx.last_insert_rowid()
            }
        };

        match payload {
            SlotPayload::Text(content) => {
                tx.execute(
                    "UPDATE karing SET content = ?1, is_file = 0, filename = NULL, mime = NULL, \
                     content_blob = NULL, created_at = ?2, updated_at = NULL, revision = 0, \
                     is_active = 1 WHERE id = ?3",
                    params![content, now, id],
                )?;
            }
            SlotPayload::File(upload) => {
                tx.execute(
                    "UPDATE karing SET content = NULL, is_file = 1, filename = ?1, mime = ?2, \
                     content_blob = ?3, created_at = ?4, updated_at = NULL, revision = 0, \
                     is_active = 1 WHERE id = ?5",
                    params![upload.filename, upload.mime, upload.data, now, id],
                )?;
            }
        }
        trim_to_limit(&tx, self.limit)?;
        tx.commit()?;
        tracing::debug!(slot_id = id, overwrote, "slot allocated");
        Ok(id)
    }

    pub fn get_by_id(&self, id: i64) -> Result<SlotRecord, StoreError> {
        let conn = self.connect()?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM karing k WHERE k.id = ?1 AND k.is_active = 1");
        conn.query_row(&sql, params![id], record_from_row)
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn get_file_blob(&self, id: i64) -> Result<FileBlob, StoreError> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT filename, mime, content_blob FROM karing \
             WHERE id = ?1 AND is_active = 1 AND is_file = 1",
            params![id],
            |row| {
                Ok(FileBlob {
                    filename: row.get(0)?,
                    mime: row.get(1)?,
                    data: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or(StoreError::NotFound)
    }

    pub fn latest_id(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.connect()?;
        let id = conn
            .query_row(
                "SELECT id FROM karing WHERE is_active = 1 ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn list_latest(&self, limit: u32) -> Result<Vec<SlotRecord>, StoreError> {
        self.list_filtered(limit, &SlotFilter::default(), PagePosition::default())
    }

    pub fn list_filtered(
        &self,
        limit: u32,
        filter: &SlotFilter,
        position: PagePosition,
    ) -> Result<Vec<SlotRecord>, StoreError> {
        let conn = self.connect()?;
        let (cursor, offset) = split_position(position);
        let predicate = filter.predicate_after(cursor);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM karing k{} ORDER BY {} LIMIT ? OFFSET ?",
            predicate.where_sql(),
            filter.order.order_by()
        );
        let mut values = predicate.into_params();
        values.push(Value::Integer(i64::from(limit)));
        values.push(Value::Integer(offset));
        query_records(&conn, &sql, values)
    }

    pub fn count_active(&self) -> Result<u64, StoreError> {
        self.count_filtered(&SlotFilter::default())
    }

    pub fn count_filtered(&self, filter: &SlotFilter) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        count_where(&conn, filter)
    }

    /// Full text replacement. Re-activates a tombstoned slot.
    pub fn update_text(
        &self,
        id: i64,
        content: &str,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        self.replace(id, &SlotPayload::Text(content.to_string()), actor)
    }

    /// Full file replacement. Re-activates a tombstoned slot.
    pub fn update_file(
        &self,
        id: i64,
        upload: FileUpload,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        self.replace(id, &SlotPayload::File(upload), actor)
    }

    /// Replaces the text of an active text slot; `None` keeps the current text.
    pub fn patch_text(
        &self,
        id: i64,
        content: Option<&str>,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let snapshot = load_snapshot(&tx, id)?.ok_or_else(|| patch_conflict(id))?;
        if !snapshot.is_active || snapshot.is_file {
            return Err(patch_conflict(id));
        }
        let content = match content {
            Some(content) => content.to_string(),
            None => snapshot.content.clone().unwrap_or_default(),
        };
        self.replace_in(&tx, id, &snapshot, &SlotPayload::Text(content), actor)?;
        tx.commit()?;
        Ok(())
    }

    /// Replaces the supplied fields of an active file slot.
    pub fn patch_file(
        &self,
        id: i64,
        patch: FilePatch,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let snapshot = load_snapshot(&tx, id)?.ok_or_else(|| patch_conflict(id))?;
        if !snapshot.is_active || !snapshot.is_file {
            return Err(patch_conflict(id));
        }
        let upload = FileUpload {
            filename: patch
                .filename
                .or_else(|| snapshot.filename.clone())
                .unwrap_or_default(),
            mime: patch
                .mime
                .or_else(|| snapshot.mime.clone())
                .unwrap_or_default(),
            data: patch
                .data
                .or_else(|| snapshot.blob.clone())
                .unwrap_or_default(),
        };
        self.replace_in(&tx, id, &snapshot, &SlotPayload::File(upload), actor)?;
        tx.commit()?;
        Ok(())
    }

    /// Tombstones an active slot, clearing every payload field.
    pub fn logical_delete(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE karing SET is_active = 0, content = NULL, content_blob = NULL, \
             filename = NULL, mime = NULL WHERE id = ?1 AND is_active = 1",
            params![id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Re-applies the most recent text captured before an overwrite of `id`.
    pub fn restore_latest_snapshot(
        &self,
        id: i64,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let content: Option<String> = tx
            .query_row(
                "SELECT content_before FROM overwrite_log \
                 WHERE replaced_rowid = ?1 AND content_before IS NOT NULL \
                 ORDER BY at DESC, id DESC LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(content) = content else {
            return Err(StoreError::Conflict {
                message: format!("no snapshot recorded for slot {id}"),
            });
        };
        let snapshot = load_snapshot(&tx, id)?.ok_or(StoreError::NotFound)?;
        self.replace_in(&tx, id, &snapshot, &SlotPayload::Text(content), actor)?;
        tx.commit()?;
        Ok(())
    }

    /// Active text matching `query`, through the full-text index when present.
    ///
    /// The query is validated with the full-text grammar on both engines so a
    /// malformed query fails the same way whichever engine answers.
    pub fn search(
        &self,
        query: &str,
        limit: u32,
        filter: &SlotFilter,
        position: PagePosition,
    ) -> Result<SearchOutcome, StoreError> {
        let expression = build_fts_query(query).map_err(|error| StoreError::QueryInvalid {
            reason: error.reason().to_string(),
        })?;
        let conn = self.connect()?;
        let engine = if db::fts_available(&conn)? {
            SearchEngine::Fts
        } else if self.search_fallback {
            SearchEngine::Like
        } else {
            return Err(StoreError::SearchUnavailable);
        };

        if filter.is_file == Some(true) {
            return Ok(SearchOutcome {
                records: Vec::new(),
                total: 0,
                engine,
            });
        }
        let text_only = SlotFilter {
            include_inactive: false,
            is_file: Some(false),
            ..filter.clone()
        };

        let (from, match_clause, match_value) = match engine {
            SearchEngine::Fts => (
                "karing_fts f JOIN karing k ON k.id = f.rowid",
                "karing_fts MATCH ?",
                expression,
            ),
            SearchEngine::Like => ("karing k", "k.content LIKE ? ESCAPE '\\'", like_pattern(query)),
        };

        let count_predicate = text_only.predicate();
        let count_sql = format!(
            "SELECT COUNT(*) FROM {from}{} AND {match_clause}",
            count_predicate.where_sql()
        );
        let mut count_values = count_predicate.into_params();
        count_values.push(Value::Text(match_value.clone()));
        let total: i64 = conn
            .query_row(&count_sql, params_from_iter(count_values.iter()), |row| {
                row.get(0)
            })
            .map_err(map_match_error)?;

        let (cursor, offset) = split_position(position);
        let predicate = text_only.predicate_after(cursor);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {from}{} AND {match_clause} ORDER BY {} LIMIT ? OFFSET ?",
            predicate.where_sql(),
            qualified_order(&text_only)
        );
        let mut values = predicate.into_params();
        values.push(Value::Text(match_value));
        values.push(Value::Integer(i64::from(limit)));
        values.push(Value::Integer(offset));
        let records = query_records(&conn, &sql, values).map_err(|error| match error {
            StoreError::Sqlite(error) => map_match_error(error),
            other => other,
        })?;

        Ok(SearchOutcome {
            records,
            total: u64::try_from(total).unwrap_or_default(),
            engine,
        })
    }

    fn replace(
        &self,
        id: i64,
        payload: &SlotPayload,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let snapshot = load_snapshot(&tx, id)?.ok_or(StoreError::NotFound)?;
        self.replace_in(&tx, id, &snapshot, payload, actor)?;
        tx.commit()?;
        Ok(())
    }

    fn replace_in(
        &self,
        tx: &Transaction<'_>,
        id: i64,
        before: &SlotSnapshot,
        payload: &SlotPayload,
        actor: &OverwriteActor,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        // A re-activated slot is a fresh population for rotation purposes.
        let changed = match payload {
            SlotPayload::Text(content) => tx.execute(
                "UPDATE karing SET content = ?1, is_file = 0, filename = NULL, mime = NULL, \
                 content_blob = NULL, updated_at = ?2, revision = revision + 1, \
                 created_at = CASE WHEN is_active = 1 THEN created_at ELSE ?2 END, \
                 is_active = 1 WHERE id = ?3",
                params![content, now, id],
            )?,
            SlotPayload::File(upload) => tx.execute(
                "UPDATE karing SET content = NULL, is_file = 1, filename = ?1, mime = ?2, \
                 content_blob = ?3, updated_at = ?4, revision = revision + 1, \
                 created_at = CASE WHEN is_active = 1 THEN created_at ELSE ?4 END, \
                 is_active = 1 WHERE id = ?5",
                params![upload.filename, upload.mime, upload.data, now, id],
            )?,
        };
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        write_audit(tx, id, now, before, payload, actor)?;
        let trimmed = trim_to_limit(tx, self.limit)?;
        if trimmed > 0 {
            tracing::info!(slot_id = id, trimmed, "re-activation trimmed oldest slots");
        }
        Ok(())
    }
}

fn patch_conflict(id: i64) -> StoreError {
    StoreError::Conflict {
        message: format!("slot {id} is not an active slot of the patched kind"),
    }
}

fn split_position(position: PagePosition) -> (Option<Cursor>, i64) {
    match position {
        PagePosition::Offset(offset) => (None, i64::try_from(offset).unwrap_or(i64::MAX)),
        PagePosition::After(cursor) => (Some(cursor), 0),
    }
}

fn qualified_order(filter: &SlotFilter) -> String {
    filter
        .order
        .order_by()
        .split(", ")
        .map(|term| format!("k.{term}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_match_error(error: rusqlite::Error) -> StoreError {
    let message = error.to_string();
    if message.contains("fts5") || message.contains("MATCH") {
        StoreError::QueryInvalid { reason: message }
    } else {
        StoreError::Sqlite(error)
    }
}

fn count_where(conn: &Connection, filter: &SlotFilter) -> Result<u64, StoreError> {
    let predicate = filter.predicate();
    let sql = format!("SELECT COUNT(*) FROM karing k{}", predicate.where_sql());
    let count: i64 = conn.query_row(&sql, params_from_iter(predicate.params().iter()), |row| {
        row.get(0)
    })?;
    Ok(u64::try_from(count).unwrap_or_default())
}

fn query_records(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<SlotRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), record_from_row)?;
    let records = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SlotRecord> {
    let is_active: bool = row.get(1)?;
    let is_file: bool = row.get(2)?;
    let body = match (is_active, is_file) {
        (false, _) => SlotBody::Empty,
        (true, false) => SlotBody::Text {
            content: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        },
        (true, true) => SlotBody::File {
            filename: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            mime: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            size: row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
        },
    };
    Ok(SlotRecord {
        id: row.get(0)?,
        body,
        created_at: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
        updated_at: row.get(8)?,
        revision: row.get(9)?,
        is_active,
    })
}

fn load_snapshot(conn: &Connection, id: i64) -> Result<Option<SlotSnapshot>, StoreError> {
    let snapshot = conn
        .query_row(
            "SELECT is_active, is_file, content, filename, mime, content_blob FROM karing WHERE id = ?1",
            params![id],
            |row| {
                Ok(SlotSnapshot {
                    is_active: row.get(0)?,
                    is_file: row.get(1)?,
                    content: row.get(2)?,
                    filename: row.get(3)?,
                    mime: row.get(4)?,
                    blob: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(snapshot)
}

/// Deactivates the oldest active slots beyond `limit`, clearing their payload.
fn trim_to_limit(conn: &Connection, limit: u32) -> Result<usize, StoreError> {
    let trimmed = conn.execute(
        "UPDATE karing SET is_active = 0, content = NULL, content_blob = NULL, \
         filename = NULL, mime = NULL \
         WHERE id IN (SELECT id FROM karing WHERE is_active = 1 \
                      ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?1)",
        params![i64::from(limit)],
    )?;
    Ok(trimmed)
}

fn write_audit(
    tx: &Transaction<'_>,
    id: i64,
    at: i64,
    before: &SlotSnapshot,
    after: &SlotPayload,
    actor: &OverwriteActor,
) -> Result<(), StoreError> {
    let fields = match after {
        SlotPayload::Text(_) => json!(["content"]),
        SlotPayload::File(_) => json!(["content_blob", "mime", "filename"]),
    };

    let text_before = before
        .content
        .as_deref()
        .filter(|_| before.is_active && !before.is_file);
    let blob_before = before
        .blob
        .as_deref()
        .filter(|_| before.is_active && before.is_file);
    let (text_after, file_after) = match after {
        SlotPayload::Text(content) => (Some(content.as_str()), None),
        SlotPayload::File(upload) => (None, Some(upload)),
    };
    let text_patch = match (text_before, text_after) {
        (Some(old), Some(new)) => Some(simple_diff(old, new, MAX_PATCH_BYTES)),
        _ => None,
    };

    tx.execute(
        "INSERT INTO overwrite_log(replaced_rowid, at, by_api_key_id, from_ip, action, fields, \
         text_excerpt_before, text_hash_before, text_hash_after, text_len_before, text_len_after, \
         file_hash_before, file_hash_after, file_len_before, file_len_after, \
         mime_before, mime_after, filename_before, filename_after, content_before, text_patch) \
         VALUES (?1, ?2, ?3, ?4, 'update', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                 ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            id,
            at,
            actor.api_key_id,
            actor.from_ip,
            fields.to_string(),
            text_before.map(|text| utf8_prefix(text, EXCERPT_BYTES)),
            text_before.map(|text| sha256_hex(text.as_bytes())),
            text_after.map(|text| sha256_hex(text.as_bytes())),
            text_before.map(|text| text.len() as i64),
            text_after.map(|text| text.len() as i64),
            blob_before.map(sha256_hex),
            file_after.map(|upload| sha256_hex(&upload.data)),
            blob_before.map(|blob| blob.len() as i64),
            file_after.map(|upload| upload.data.len() as i64),
            before.mime.as_deref().filter(|_| before.is_active),
            file_after.map(|upload| upload.mime.as_str()),
            before.filename.as_deref().filter(|_| before.is_active),
            file_after.map(|upload| upload.filename.as_str()),
            text_before,
            text_patch,
        ],
    )?;
    Ok(())
}
