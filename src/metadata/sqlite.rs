//! SQLite-backed metadata store.
//!
//! Grounded on the teacher's `metadata/sqlite.rs`: a single `Connection`
//! behind a `Mutex` (so the store is `Send + Sync` without pooling),
//! `apply_pragmas`/idempotent `CREATE TABLE IF NOT EXISTS` schema
//! bootstrap on open, and multi-step procedures expressed as
//! `unchecked_transaction()` blocks that either all commit or all roll
//! back. The prepared-statement surface itself is new (a different
//! table shape for a different domain), but the connection-handling
//! idiom is carried over unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use base64::Engine;
use md5::Digest as Md5Digest;
use rusqlite::{params, Connection, OptionalExtension};

use crate::blob::BlobId;
use crate::errors::{EngineError, EngineResult};
use crate::model::{
    BlobRef, Checksums, CustomMetadata, DigestAlgorithm, HttpMetadata, ObjectRow, PartRow,
    UploadRow, UploadState,
};
use crate::validator::{self, OnlyIf};

use super::store::{ListInclude, ListObjectEntry, ListOptions, ListPage, MetadataStore, SelectedPart};

/// Metadata store backed by a single SQLite database file (or
/// `:memory:`) — one per bucket, per SPEC_FULL.md §6.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

fn internal<T>(r: rusqlite::Result<T>) -> EngineResult<T> {
    r.map_err(|e| EngineError::Internal(e.into()))
}

impl SqliteMetadataStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("metadata mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA case_sensitive_like = TRUE;
            ",
        )?;
        Ok(())
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("metadata mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS objects (
                key             TEXT PRIMARY KEY,
                version         TEXT NOT NULL,
                size            INTEGER NOT NULL,
                etag            TEXT NOT NULL,
                uploaded_ms     INTEGER NOT NULL,
                checksums       TEXT NOT NULL DEFAULT '{}',
                http_metadata   TEXT NOT NULL DEFAULT '{}',
                custom_metadata TEXT NOT NULL DEFAULT '{}',
                blob_id         TEXT
            );

            CREATE TABLE IF NOT EXISTS multipart_uploads (
                upload_id       TEXT PRIMARY KEY,
                key             TEXT NOT NULL,
                http_metadata   TEXT NOT NULL DEFAULT '{}',
                custom_metadata TEXT NOT NULL DEFAULT '{}',
                state           TEXT NOT NULL,
                created_ms      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_uploads_key ON multipart_uploads(key);
            CREATE INDEX IF NOT EXISTS idx_uploads_state_created
                ON multipart_uploads(state, created_ms);

            CREATE TABLE IF NOT EXISTS multipart_parts (
                upload_id     TEXT NOT NULL,
                part_number   INTEGER NOT NULL,
                blob_id       TEXT NOT NULL,
                size          INTEGER NOT NULL,
                etag          TEXT NOT NULL,
                checksum_md5  TEXT NOT NULL,
                object_key    TEXT,
                PRIMARY KEY (upload_id, part_number)
            );
            CREATE INDEX IF NOT EXISTS idx_parts_object_key ON multipart_parts(object_key);
            ",
        )?;
        Ok(())
    }

    // ── row <-> SQL mapping ────────────────────────────────────────

    fn row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<ObjectRow> {
        let checksums_json: String = row.get(5)?;
        let http_json: String = row.get(6)?;
        let custom_json: String = row.get(7)?;
        let blob_id: Option<String> = row.get(8)?;
        Ok(ObjectRow {
            key: row.get(0)?,
            version: row.get(1)?,
            size: row.get::<_, i64>(2)? as u64,
            etag: row.get(3)?,
            uploaded_ms: row.get(4)?,
            checksums: checksums_from_json(&checksums_json),
            http_metadata: metadata_from_json(&http_json),
            custom_metadata: metadata_from_json(&custom_json),
            blob_ref: match blob_id {
                Some(id) => BlobRef::Single(
                    BlobId::parse(&id)
                        .unwrap_or_else(|| panic!("corrupt blob id in objects row: {id}")),
                ),
                None => BlobRef::Multipart,
            },
        })
    }

    fn part_row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<PartRow> {
        let blob_id_str: String = row.get(2)?;
        Ok(PartRow {
            upload_id: row.get(0)?,
            part_number: row.get::<_, i64>(1)? as u32,
            blob_id: BlobId::parse(&blob_id_str)
                .unwrap_or_else(|| panic!("corrupt blob id in part row: {blob_id_str}")),
            size: row.get::<_, i64>(3)? as u64,
            etag: row.get(4)?,
            checksum_md5: row.get(5)?,
            object_key: row.get(6)?,
        })
    }

    fn upload_row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<UploadRow> {
        let http_json: String = row.get(2)?;
        let custom_json: String = row.get(3)?;
        let state_str: String = row.get(4)?;
        Ok(UploadRow {
            upload_id: row.get(0)?,
            key: row.get(1)?,
            http_metadata: metadata_from_json(&http_json),
            custom_metadata: metadata_from_json(&custom_json),
            state: UploadState::parse(&state_str)
                .unwrap_or_else(|| panic!("corrupt upload state: {state_str}")),
            created_ms: row.get(5)?,
        })
    }

    fn query_object(
        conn: &Connection,
        key: &str,
    ) -> rusqlite::Result<Option<ObjectRow>> {
        conn.query_row(
            "SELECT key, version, size, etag, uploaded_ms, checksums, http_metadata, custom_metadata, blob_id
             FROM objects WHERE key = ?1",
            params![key],
            Self::row_from_sql,
        )
        .optional()
    }

    fn query_part_blob_ids_for_object(
        conn: &Connection,
        key: &str,
    ) -> rusqlite::Result<Vec<BlobId>> {
        let mut stmt =
            conn.prepare("SELECT blob_id FROM multipart_parts WHERE object_key = ?1")?;
        let ids = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids
            .into_iter()
            .filter_map(|s| BlobId::parse(&s))
            .collect())
    }

    fn query_parts_for_object(
        conn: &Connection,
        key: &str,
    ) -> rusqlite::Result<Vec<PartRow>> {
        let mut stmt = conn.prepare(
            "SELECT upload_id, part_number, blob_id, size, etag, checksum_md5, object_key
             FROM multipart_parts WHERE object_key = ?1 ORDER BY part_number ASC",
        )?;
        stmt.query_map(params![key], Self::part_row_from_sql)?
            .collect::<Result<Vec<_>, _>>()
    }

    fn query_part(
        conn: &Connection,
        upload_id: &str,
        part_number: u32,
    ) -> rusqlite::Result<Option<PartRow>> {
        conn.query_row(
            "SELECT upload_id, part_number, blob_id, size, etag, checksum_md5, object_key
             FROM multipart_parts WHERE upload_id = ?1 AND part_number = ?2",
            params![upload_id, part_number],
            Self::part_row_from_sql,
        )
        .optional()
    }

    fn query_all_parts_for_upload(
        conn: &Connection,
        upload_id: &str,
    ) -> rusqlite::Result<Vec<PartRow>> {
        let mut stmt = conn.prepare(
            "SELECT upload_id, part_number, blob_id, size, etag, checksum_md5, object_key
             FROM multipart_parts WHERE upload_id = ?1 ORDER BY part_number ASC",
        )?;
        stmt.query_map(params![upload_id], Self::part_row_from_sql)?
            .collect::<Result<Vec<_>, _>>()
    }

    fn query_upload(
        conn: &Connection,
        upload_id: &str,
    ) -> rusqlite::Result<Option<UploadRow>> {
        conn.query_row(
            "SELECT upload_id, key, http_metadata, custom_metadata, state, created_ms
             FROM multipart_uploads WHERE upload_id = ?1",
            params![upload_id],
            Self::upload_row_from_sql,
        )
        .optional()
    }

    fn upsert_object(conn: &Connection, row: &ObjectRow) -> rusqlite::Result<()> {
        let blob_id_col = match &row.blob_ref {
            BlobRef::Single(id) => Some(id.as_str().to_string()),
            BlobRef::Multipart => None,
        };
        conn.execute(
            "INSERT OR REPLACE INTO objects
                (key, version, size, etag, uploaded_ms, checksums, http_metadata, custom_metadata, blob_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.key,
                row.version,
                row.size as i64,
                row.etag,
                row.uploaded_ms,
                checksums_to_json(&row.checksums),
                metadata_to_json(&row.http_metadata),
                metadata_to_json(&row.custom_metadata),
                blob_id_col,
            ],
        )?;
        Ok(())
    }
}

fn checksums_to_json(c: &Checksums) -> String {
    let map: HashMap<&str, &str> = c.iter().map(|(a, h)| (a.as_str(), h.as_str())).collect();
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

fn checksums_from_json(s: &str) -> Checksums {
    let map: HashMap<String, String> = serde_json::from_str(s).unwrap_or_default();
    map.into_iter()
        .filter_map(|(k, v)| DigestAlgorithm::parse(&k).map(|a| (a, v)))
        .collect()
}

fn metadata_to_json(m: &HashMap<String, String>) -> String {
    serde_json::to_string(m).unwrap_or_else(|_| "{}".to_string())
}

fn metadata_from_json(s: &str) -> HttpMetadata {
    serde_json::from_str(s).unwrap_or_default()
}

/// Escape `\`, `_`, `%` for a `LIKE ... ESCAPE '\'` prefix match — the
/// schema recommendation in SPEC_FULL.md §6.
fn escape_like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if c == '\\' || c == '_' || c == '%' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn resolve_start_after(opts: &ListOptions) -> anyhow::Result<Option<String>> {
    let from_cursor = match &opts.cursor {
        Some(c) => {
            let bytes = base64::engine::general_purpose::STANDARD.decode(c)?;
            Some(String::from_utf8(bytes)?)
        }
        None => None,
    };
    Ok([from_cursor, opts.start_after.clone()]
        .into_iter()
        .flatten()
        .max())
}

enum Group {
    Prefix(String),
    Object(ObjectRow),
}

/// Group `rows` (already the final returned page, post-truncation) by
/// `delimitedPrefixOrKey` per §4.6.1, preserving ascending order.
fn group_by_delimiter(rows: Vec<ObjectRow>, prefix: &str, delimiter: &str) -> Vec<Group> {
    let prefix_len = prefix.len();
    let mut order: Vec<String> = Vec::new();
    let mut map: HashMap<String, Group> = HashMap::new();

    for row in rows {
        let tail = if row.key.len() >= prefix_len {
            &row.key[prefix_len..]
        } else {
            ""
        };
        if let Some(pos) = tail.find(delimiter) {
            let end = prefix_len + pos + delimiter.len();
            let group_prefix = row.key[..end].to_string();
            let group_key = format!("dlp:{group_prefix}");
            if !map.contains_key(&group_key) {
                order.push(group_key.clone());
            }
            map.insert(group_key, Group::Prefix(group_prefix));
        } else {
            let group_key = format!("key:{}", row.key);
            order.push(group_key.clone());
            map.insert(group_key, Group::Object(row));
        }
    }

    order
        .into_iter()
        .map(|k| map.remove(&k).expect("group key present"))
        .collect()
}

fn mask_meta(row: &ObjectRow, include: ListInclude) -> crate::model::ObjectMeta {
    let mut meta = row.to_meta();
    if !include.http_metadata {
        meta.http_metadata = HttpMetadata::new();
    }
    if !include.custom_metadata {
        meta.custom_metadata = CustomMetadata::new();
    }
    meta
}

impl MetadataStore for SqliteMetadataStore {
    fn get_by_key(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRow>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            Ok(Self::query_object(&conn, &key)?)
        })
    }

    fn get_parts_by_key(
        &self,
        key: &str,
    ) -> Pin<
        Box<dyn Future<Output = anyhow::Result<Option<(ObjectRow, Vec<PartRow>)>>> + Send + '_>,
    > {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let Some(row) = Self::query_object(&conn, &key)? else {
                return Ok(None);
            };
            let parts = if row.is_multipart() {
                Self::query_parts_for_object(&conn, &key)?
            } else {
                Vec::new()
            };
            Ok(Some((row, parts)))
        })
    }

    fn put(
        &self,
        row: ObjectRow,
        precondition: Option<OnlyIf>,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Vec<BlobId>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let tx = internal(conn.unchecked_transaction())?;

            let current = internal(Self::query_object(&tx, &row.key))?;
            let current_meta = current.as_ref().map(|r| r.to_meta());
            validator::evaluate_condition(current_meta.as_ref(), precondition.as_ref())?;

            let mut orphaned = Vec::new();
            if let Some(old) = &current {
                match &old.blob_ref {
                    BlobRef::Single(id) => orphaned.push(id.clone()),
                    BlobRef::Multipart => {
                        orphaned.extend(internal(Self::query_part_blob_ids_for_object(
                            &tx, &old.key,
                        ))?);
                        internal(tx.execute(
                            "DELETE FROM multipart_parts WHERE object_key = ?1",
                            params![old.key],
                        ))?;
                    }
                }
            }

            internal(Self::upsert_object(&tx, &row))?;
            internal(tx.commit())?;
            Ok(orphaned)
        })
    }

    fn delete_by_keys(
        &self,
        keys: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BlobId>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            let mut orphaned = Vec::new();
            for key in &keys {
                if let Some(row) = Self::query_object(&tx, key)? {
                    match row.blob_ref {
                        BlobRef::Single(id) => orphaned.push(id),
                        BlobRef::Multipart => {
                            orphaned.extend(Self::query_part_blob_ids_for_object(&tx, key)?);
                            tx.execute(
                                "DELETE FROM multipart_parts WHERE object_key = ?1",
                                params![key],
                            )?;
                        }
                    }
                    tx.execute("DELETE FROM objects WHERE key = ?1", params![key])?;
                }
            }
            tx.commit()?;
            Ok(orphaned)
        })
    }

    fn list(
        &self,
        opts: ListOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListPage>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let start_after = resolve_start_after(&opts)?.unwrap_or_default();
            let like_pattern = format!("{}%", escape_like_prefix(&opts.prefix));
            let effective_limit = opts.limit.max(1);
            let query_limit = effective_limit as i64 + 1;

            let mut stmt = conn.prepare(
                "SELECT key, version, size, etag, uploaded_ms, checksums, http_metadata, custom_metadata, blob_id
                 FROM objects WHERE key LIKE ?1 ESCAPE '\\' AND key > ?2 ORDER BY key ASC LIMIT ?3",
            )?;
            let mut rows: Vec<ObjectRow> = stmt
                .query_map(params![like_pattern, start_after, query_limit], Self::row_from_sql)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut truncated = false;
            let mut cursor = None;
            if rows.len() as u32 == effective_limit + 1 {
                rows.pop();
                truncated = true;
                if let Some(last) = rows.last() {
                    cursor = Some(
                        base64::engine::general_purpose::STANDARD.encode(last.key.as_bytes()),
                    );
                }
            }

            let mut objects = Vec::new();
            let mut delimited_prefixes = Vec::new();

            match opts.delimiter.as_deref().filter(|d| !d.is_empty()) {
                None => {
                    for row in &rows {
                        objects.push(ListObjectEntry {
                            meta: mask_meta(row, opts.include),
                        });
                    }
                }
                Some(delimiter) => {
                    for group in group_by_delimiter(rows, &opts.prefix, delimiter) {
                        match group {
                            Group::Prefix(p) => delimited_prefixes.push(p),
                            Group::Object(row) => objects.push(ListObjectEntry {
                                meta: mask_meta(&row, opts.include),
                            }),
                        }
                    }
                }
            }

            Ok(ListPage {
                objects,
                delimited_prefixes,
                truncated,
                cursor,
            })
        })
    }

    fn create_multipart_upload(
        &self,
        upload_id: String,
        key: String,
        http_metadata: HttpMetadata,
        custom_metadata: CustomMetadata,
        created_ms: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            conn.execute(
                "INSERT INTO multipart_uploads
                    (upload_id, key, http_metadata, custom_metadata, state, created_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    upload_id,
                    key,
                    metadata_to_json(&http_metadata),
                    metadata_to_json(&custom_metadata),
                    UploadState::InProgress.as_str(),
                    created_ms,
                ],
            )?;
            Ok(())
        })
    }

    fn put_part(
        &self,
        upload_id: String,
        part: PartRow,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Option<BlobId>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let tx = internal(conn.unchecked_transaction())?;

            let upload = internal(Self::query_upload(&tx, &upload_id))?;
            match upload {
                Some(u) if u.state == UploadState::InProgress => {}
                _ => return Err(EngineError::NoSuchUpload),
            }

            let previous: Option<String> = internal(
                tx.query_row(
                    "SELECT blob_id FROM multipart_parts WHERE upload_id = ?1 AND part_number = ?2",
                    params![upload_id, part.part_number],
                    |row| row.get(0),
                )
                .optional(),
            )?;

            internal(tx.execute(
                "INSERT OR REPLACE INTO multipart_parts
                    (upload_id, part_number, blob_id, size, etag, checksum_md5, object_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                params![
                    upload_id,
                    part.part_number,
                    part.blob_id.as_str(),
                    part.size as i64,
                    part.etag,
                    part.checksum_md5,
                ],
            ))?;
            internal(tx.commit())?;
            Ok(previous.and_then(|s| BlobId::parse(&s)))
        })
    }

    fn complete_multipart_upload(
        &self,
        key: String,
        upload_id: String,
        selected: Vec<SelectedPart>,
        min_part_size: u64,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = EngineResult<(ObjectRow, Vec<BlobId>)>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let tx = internal(conn.unchecked_transaction())?;

            let upload = internal(Self::query_upload(&tx, &upload_id))?
                .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("no such upload row")))?;
            if upload.state != UploadState::InProgress {
                return Err(EngineError::NoSuchUpload);
            }

            let mut seen_numbers = std::collections::HashSet::new();
            for p in &selected {
                if !seen_numbers.insert(p.part_number) {
                    return Err(EngineError::Internal(anyhow::anyhow!(
                        "duplicate part number {} in completion request",
                        p.part_number
                    )));
                }
            }

            let mut selected_rows = Vec::with_capacity(selected.len());
            for sp in &selected {
                let row = internal(Self::query_part(&tx, &upload_id, sp.part_number))?;
                match row {
                    Some(r) if r.etag == sp.etag => selected_rows.push(r),
                    _ => return Err(EngineError::InvalidPart),
                }
            }

            if selected_rows.len() > 1 {
                for r in &selected_rows[..selected_rows.len() - 1] {
                    if r.size < min_part_size {
                        return Err(EngineError::EntityTooSmall);
                    }
                }
            }

            let mut sorted = selected_rows.clone();
            sorted.sort_by_key(|r| r.part_number);
            if sorted.len() > 1 {
                let uniform_size = sorted[0].size;
                if uniform_size < min_part_size {
                    return Err(EngineError::BadUpload);
                }
                for r in &sorted[..sorted.len() - 1] {
                    if r.size != uniform_size {
                        return Err(EngineError::BadUpload);
                    }
                }
                if sorted.last().unwrap().size > uniform_size {
                    return Err(EngineError::BadUpload);
                }
            }

            let mut to_delete = Vec::new();
            if let Some(old) = internal(Self::query_object(&tx, &key))? {
                match old.blob_ref {
                    BlobRef::Single(id) => to_delete.push(id),
                    BlobRef::Multipart => {
                        to_delete.extend(internal(Self::query_part_blob_ids_for_object(
                            &tx, &key,
                        ))?);
                        internal(tx.execute(
                            "DELETE FROM multipart_parts WHERE object_key = ?1",
                            params![key],
                        ))?;
                    }
                }
            }

            let mut concat = Vec::with_capacity(sorted.len() * 16);
            for r in &sorted {
                let bytes = hex::decode(&r.checksum_md5)
                    .map_err(|e| EngineError::Internal(e.into()))?;
                concat.extend_from_slice(&bytes);
            }
            let mut hasher = md5::Md5::new();
            hasher.update(&concat);
            let composite = hasher.finalize();
            let etag = format!("{}-{}", hex::encode(composite), sorted.len());
            let total_size: u64 = sorted.iter().map(|r| r.size).sum();

            let new_row = ObjectRow {
                key: key.clone(),
                version: crate::model::generate_version(),
                size: total_size,
                etag,
                uploaded_ms: now_ms,
                checksums: Checksums::new(),
                http_metadata: upload.http_metadata.clone(),
                custom_metadata: upload.custom_metadata.clone(),
                blob_ref: BlobRef::Multipart,
            };
            internal(Self::upsert_object(&tx, &new_row))?;

            for sp in &selected {
                internal(tx.execute(
                    "UPDATE multipart_parts SET object_key = ?1 WHERE upload_id = ?2 AND part_number = ?3",
                    params![key, upload_id, sp.part_number],
                ))?;
            }

            let selected_numbers: std::collections::HashSet<u32> =
                selected.iter().map(|p| p.part_number).collect();
            let all_parts = internal(Self::query_all_parts_for_upload(&tx, &upload_id))?;
            for part in all_parts {
                if !selected_numbers.contains(&part.part_number) {
                    to_delete.push(part.blob_id.clone());
                    internal(tx.execute(
                        "DELETE FROM multipart_parts WHERE upload_id = ?1 AND part_number = ?2",
                        params![upload_id, part.part_number],
                    ))?;
                }
            }

            internal(tx.execute(
                "UPDATE multipart_uploads SET state = ?1 WHERE upload_id = ?2",
                params![UploadState::Completed.as_str(), upload_id],
            ))?;

            internal(tx.commit())?;
            Ok((new_row, to_delete))
        })
    }

    fn abort_multipart_upload(
        &self,
        key: String,
        upload_id: String,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Vec<BlobId>>> + Send + '_>> {
        let _ = &key;
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let tx = internal(conn.unchecked_transaction())?;

            let upload = internal(Self::query_upload(&tx, &upload_id))?
                .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("no such upload row")))?;

            if upload.state != UploadState::InProgress {
                internal(tx.commit())?;
                return Ok(Vec::new());
            }

            let parts = internal(Self::query_all_parts_for_upload(&tx, &upload_id))?;
            let blob_ids = parts.into_iter().map(|p| p.blob_id).collect();

            internal(tx.execute(
                "DELETE FROM multipart_parts WHERE upload_id = ?1",
                params![upload_id],
            ))?;
            internal(tx.execute(
                "UPDATE multipart_uploads SET state = ?1 WHERE upload_id = ?2",
                params![UploadState::Aborted.as_str(), upload_id],
            ))?;
            internal(tx.commit())?;
            Ok(blob_ids)
        })
    }

    fn get_upload(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadRow>>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            Ok(Self::query_upload(&conn, &upload_id)?)
        })
    }

    fn reap_stale_uploads(
        &self,
        max_age_ms: i64,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BlobId>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("metadata mutex poisoned");
            let tx = conn.unchecked_transaction()?;
            let cutoff = now_ms - max_age_ms;

            let stale_ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT upload_id FROM multipart_uploads WHERE state = ?1 AND created_ms < ?2",
                )?;
                stmt.query_map(params![UploadState::InProgress.as_str(), cutoff], |row| {
                    row.get(0)
                })?
                .collect::<Result<Vec<_>, _>>()?
            };

            let mut blob_ids = Vec::new();
            for upload_id in &stale_ids {
                let parts = Self::query_all_parts_for_upload(&tx, upload_id)?;
                blob_ids.extend(parts.into_iter().map(|p| p.blob_id));
                tx.execute(
                    "DELETE FROM multipart_parts WHERE upload_id = ?1",
                    params![upload_id],
                )?;
                tx.execute(
                    "UPDATE multipart_uploads SET state = ?1 WHERE upload_id = ?2",
                    params![UploadState::Aborted.as_str(), upload_id],
                )?;
            }

            tx.commit()?;
            Ok(blob_ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_part_etag;

    fn sample_row(key: &str) -> ObjectRow {
        ObjectRow {
            key: key.to_string(),
            version: crate::model::generate_version(),
            size: 5,
            etag: "abc".to_string(),
            uploaded_ms: 1000,
            checksums: Checksums::new(),
            http_metadata: HttpMetadata::new(),
            custom_metadata: CustomMetadata::new(),
            blob_ref: BlobRef::Single(crate::blob::generate_blob_id()),
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let row = sample_row("k");
        store.put(row.clone(), None).await.unwrap();
        let fetched = store.get_by_key("k").await.unwrap().unwrap();
        assert_eq!(fetched.key, "k");
        assert_eq!(fetched.size, 5);
    }

    #[tokio::test]
    async fn put_replace_returns_old_blob_for_deletion() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let row1 = sample_row("k");
        let old_blob = match &row1.blob_ref {
            BlobRef::Single(id) => id.clone(),
            _ => unreachable!(),
        };
        store.put(row1, None).await.unwrap();

        let row2 = sample_row("k");
        let orphaned = store.put(row2, None).await.unwrap();
        assert_eq!(orphaned, vec![old_blob]);
    }

    #[tokio::test]
    async fn delete_by_keys_returns_blob_ids() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let row = sample_row("k");
        let blob = match &row.blob_ref {
            BlobRef::Single(id) => id.clone(),
            _ => unreachable!(),
        };
        store.put(row, None).await.unwrap();
        let orphaned = store.delete_by_keys(vec!["k".to_string()]).await.unwrap();
        assert_eq!(orphaned, vec![blob]);
        assert!(store.get_by_key("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_with_delimiter_groups_keys() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        for key in ["a/1", "a/2", "b", "c/x/1", "c/x/2"] {
            store.put(sample_row(key), None).await.unwrap();
        }
        let page = store
            .list(ListOptions {
                prefix: String::new(),
                start_after: None,
                cursor: None,
                limit: 1000,
                delimiter: Some("/".to_string()),
                include: ListInclude::default(),
            })
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].meta.key, "b");
        assert_eq!(page.delimited_prefixes, vec!["a/", "c/"]);
        assert!(!page.truncated);
    }

    #[tokio::test]
    async fn multipart_lifecycle_complete_and_abort_idempotent() {
        let store = SqliteMetadataStore::in_memory().unwrap();
        let upload_id = "uid".to_string();
        store
            .create_multipart_upload(
                upload_id.clone(),
                "big".to_string(),
                HttpMetadata::new(),
                CustomMetadata::new(),
                0,
            )
            .await
            .unwrap();

        for (n, size) in [(1u32, 60u64), (2, 60), (3, 60)] {
            let etag = generate_part_etag();
            store
                .put_part(
                    upload_id.clone(),
                    PartRow {
                        upload_id: upload_id.clone(),
                        part_number: n,
                        blob_id: crate::blob::generate_blob_id(),
                        size,
                        etag,
                        checksum_md5: hex::encode([n as u8; 16]),
                        object_key: None,
                    },
                )
                .await
                .unwrap();
        }

        let parts = all_parts_for_upload_test(&store, &upload_id).await;
        let selected: Vec<SelectedPart> = parts
            .iter()
            .map(|p| SelectedPart {
                part_number: p.part_number,
                etag: p.etag.clone(),
            })
            .collect();

        let (row, to_delete) = store
            .complete_multipart_upload("big".to_string(), upload_id.clone(), selected, 50, 2000)
            .await
            .unwrap();
        assert_eq!(row.size, 180);
        assert!(to_delete.is_empty());

        let no_op = store
            .abort_multipart_upload("big".to_string(), upload_id.clone())
            .await
            .unwrap();
        assert!(no_op.is_empty());

        let fetched = store.get_by_key("big").await.unwrap().unwrap();
        assert_eq!(fetched.size, 180);
    }

    async fn all_parts_for_upload_test(store: &SqliteMetadataStore, upload_id: &str) -> Vec<PartRow> {
        let conn = store.conn.lock().unwrap();
        SqliteMetadataStore::query_all_parts_for_upload(&conn, upload_id).unwrap()
    }
}
