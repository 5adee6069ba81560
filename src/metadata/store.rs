//! Metadata Store contract (C2) — trait shape grounded on the teacher's
//! `metadata/store.rs`, narrowed to the transactional procedures
//! SPEC_FULL.md §4.2 calls for.

use std::future::Future;
use std::pin::Pin;

use crate::blob::BlobId;
use crate::errors::EngineResult;
use crate::model::{CustomMetadata, HttpMetadata, ObjectRow, PartRow, UploadRow};
use crate::validator::OnlyIf;

/// One part selected by `completeMultipartUpload`, in caller-supplied
/// (not yet re-sorted) order.
#[derive(Debug, Clone)]
pub struct SelectedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Subset of metadata columns a `list` call should populate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListInclude {
    pub http_metadata: bool,
    pub custom_metadata: bool,
}

impl ListInclude {
    pub fn is_empty(&self) -> bool {
        !self.http_metadata && !self.custom_metadata
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    pub start_after: Option<String>,
    pub cursor: Option<String>,
    /// Already-validated effective limit (see `validator::validate_limit`
    /// and the `min(limit, 100)` rule applied when `include` is set).
    pub limit: u32,
    pub delimiter: Option<String>,
    pub include: ListInclude,
}

/// An object entry in a list page.
#[derive(Debug, Clone)]
pub struct ListObjectEntry {
    pub meta: crate::model::ObjectMeta,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ListObjectEntry>,
    pub delimited_prefixes: Vec<String>,
    pub truncated: bool,
    pub cursor: Option<String>,
}

/// Transactional SQL-backed metadata store contract — §4.2. Every
/// method is tied to `&self`'s lifetime (not `'static`) since these
/// futures only ever drive a synchronous `rusqlite` call under a mutex
/// and complete within the call, mirroring the teacher's
/// `metadata/sqlite.rs` method shapes.
pub trait MetadataStore: Send + Sync + 'static {
    fn get_by_key(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRow>>> + Send + '_>>;

    /// Single transaction: if the row's blob reference is the multipart
    /// sentinel, also returns its ordered parts.
    fn get_parts_by_key(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<(ObjectRow, Vec<PartRow>)>>> + Send + '_>>;

    /// Inserts-or-replaces `row` after evaluating `precondition` against
    /// the current row; returns blob ids orphaned by the replacement.
    fn put(
        &self,
        row: ObjectRow,
        precondition: Option<OnlyIf>,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Vec<BlobId>>> + Send + '_>>;

    fn delete_by_keys(
        &self,
        keys: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BlobId>>> + Send + '_>>;

    fn list(
        &self,
        opts: ListOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ListPage>> + Send + '_>>;

    fn create_multipart_upload(
        &self,
        upload_id: String,
        key: String,
        http_metadata: HttpMetadata,
        custom_metadata: CustomMetadata,
        created_ms: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Asserts the upload exists and is in-progress (else `NoSuchUpload`);
    /// upserts on `(uploadId, partNumber)`; returns the previous part's
    /// blob id if one existed.
    fn put_part(
        &self,
        upload_id: String,
        part: PartRow,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Option<BlobId>>> + Send + '_>>;

    fn complete_multipart_upload(
        &self,
        key: String,
        upload_id: String,
        selected: Vec<SelectedPart>,
        min_part_size: u64,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = EngineResult<(ObjectRow, Vec<BlobId>)>> + Send + '_>>;

    /// Idempotent on already-finalised uploads (returns an empty
    /// to-delete list rather than erroring).
    fn abort_multipart_upload(
        &self,
        key: String,
        upload_id: String,
    ) -> Pin<Box<dyn Future<Output = EngineResult<Vec<BlobId>>> + Send + '_>>;

    /// Fetch an upload row by id, regardless of state. Used by the
    /// coordinator to distinguish `NoSuchUpload` from `InternalError`.
    fn get_upload(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UploadRow>>> + Send + '_>>;

    /// Maintenance routine: delete upload (and orphan their parts) rows
    /// still in-progress and older than `max_age_ms`. Returns the blob
    /// ids of orphaned parts, for the caller to background-delete.
    fn reap_stale_uploads(
        &self,
        max_age_ms: i64,
        now_ms: i64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<BlobId>>> + Send + '_>>;
}
