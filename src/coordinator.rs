//! Bucket Coordinator: the public operation surface. Owns the
//! invariants tying the Validator, Digesting Stream, Blob Store,
//! Metadata Store, and Multipart Assembler together, and issues
//! background blob deletions after metadata transactions commit.
//!
//! One method per public operation, validation run up front, metadata
//! mutated transactionally, storage side-effects (here: background
//! blob deletion) scheduled after the transaction commits rather than
//! inside it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::instrument;

use crate::assembler::{self, RefCounter};
use crate::blob::{BlobId, BlobStore, ByteRange, ByteStream};
use crate::config::EngineConfig;
use crate::digest;
use crate::errors::{EngineError, EngineResult};
use crate::metadata::{ListInclude, ListOptions, ListPage, MetadataStore, SelectedPart};
use crate::model::{
    self, BlobRef, CustomMetadata, DigestAlgorithm, HttpMetadata, ObjectMeta, ObjectRow, PartRow,
};
use crate::timers::Timers;
use crate::validator::{self, OnlyIf, RangeInput};

/// An inclusive-offset/length view of an object's bytes — distinct from
/// the Blob Store's inclusive `ByteRange` since a zero-length object has
/// no representable `[start,end]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRange {
    pub offset: u64,
    pub length: u64,
}

pub struct HeadResult {
    pub meta: ObjectMeta,
    pub range: SizeRange,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub only_if: Option<OnlyIf>,
    pub range: Option<RangeInput>,
}

pub struct GetResult {
    pub meta: ObjectMeta,
    pub range: SizeRange,
    pub body: ByteStream,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
    pub only_if: Option<OnlyIf>,
    /// Digests the caller expects, keyed by algorithm — verified against
    /// what the Digesting Stream actually computed.
    pub expected_digests: std::collections::BTreeMap<DigestAlgorithm, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: Option<String>,
    pub start_after: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub delimiter: Option<String>,
    pub include: ListInclude,
}

#[derive(Debug, Clone)]
pub struct UploadPartResult {
    pub etag: String,
}

/// Wires the five components together behind the operation surface
/// SPEC_FULL.md §4.6 describes. One instance per bucket.
pub struct BucketCoordinator {
    config: EngineConfig,
    blob_store: Arc<dyn BlobStore>,
    metadata_store: Arc<dyn MetadataStore>,
    ref_counter: Arc<RefCounter>,
    timers: Arc<dyn Timers>,
}

impl BucketCoordinator {
    pub fn new(
        config: EngineConfig,
        blob_store: Arc<dyn BlobStore>,
        metadata_store: Arc<dyn MetadataStore>,
        timers: Arc<dyn Timers>,
    ) -> Self {
        Self {
            config,
            blob_store,
            metadata_store,
            ref_counter: Arc::new(RefCounter::new()),
            timers,
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    pub async fn head(&self, key: &str) -> EngineResult<HeadResult> {
        validator::validate_key(key, self.config.limits.max_key_length)?;
        let row = self
            .metadata_store
            .get_by_key(key)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NoSuchKey {
                key: key.to_string(),
            })?;
        Ok(HeadResult {
            range: SizeRange {
                offset: 0,
                length: row.size,
            },
            meta: row.to_meta(),
        })
    }

    #[instrument(skip(self, opts), fields(key = %key))]
    pub async fn get(&self, key: &str, opts: GetOptions) -> EngineResult<GetResult> {
        validator::validate_key(key, self.config.limits.max_key_length)?;
        let (row, parts) = self
            .metadata_store
            .get_parts_by_key(key)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NoSuchKey {
                key: key.to_string(),
            })?;

        let meta = row.to_meta();
        if let Err(err) = validator::evaluate_condition(Some(&meta), opts.only_if.as_ref()) {
            tracing::debug!(key, "precondition failed on get");
            return Err(err);
        }

        let resolved = validator::resolve_range(opts.range, row.size)?;
        let (offset, length) = match resolved {
            Some(r) => (r.start, r.len()),
            None => (0, row.size),
        };

        let body: ByteStream = match &row.blob_ref {
            BlobRef::Single(blob_id) => self
                .blob_store
                .get(blob_id, resolved)
                .await
                .map_err(EngineError::Internal)?
                .ok_or_else(|| {
                    EngineError::Internal(anyhow::anyhow!(
                        "object {key} references missing blob {blob_id}"
                    ))
                })?,
            BlobRef::Multipart => {
                let part_list: Vec<(BlobId, u64)> =
                    parts.iter().map(|p| (p.blob_id.clone(), p.size)).collect();
                let range = resolved.unwrap_or(ByteRange {
                    start: 0,
                    end: row.size.saturating_sub(1),
                });
                assembler::assemble_range(
                    self.blob_store.clone(),
                    self.ref_counter.clone(),
                    part_list,
                    range,
                )
            }
        };

        Ok(GetResult {
            meta,
            range: SizeRange { offset, length },
            body,
        })
    }

    #[instrument(skip(self, stream, opts), fields(key = %key, size))]
    pub async fn put(
        &self,
        key: String,
        stream: ByteStream,
        size: u64,
        opts: PutOptions,
    ) -> EngineResult<ObjectMeta> {
        let mut algorithms = vec![DigestAlgorithm::Md5];
        for algo in opts.expected_digests.keys() {
            if !algorithms.contains(algo) {
                algorithms.push(*algo);
            }
        }
        let (tee, handle) = digest::tee_digest(stream, &algorithms);

        let blob_id = self
            .blob_store
            .put(tee)
            .await
            .map_err(EngineError::Internal)?;

        match self.finish_put(&key, blob_id.clone(), size, &handle, opts).await {
            Ok(meta) => Ok(meta),
            Err(err) => {
                tracing::debug!(key, error = %err, "put failed after blob write, scheduling cleanup");
                self.schedule_blob_delete(blob_id);
                Err(err)
            }
        }
    }

    async fn finish_put(
        &self,
        key: &str,
        blob_id: BlobId,
        size: u64,
        handle: &digest::DigestHandle,
        opts: PutOptions,
    ) -> EngineResult<ObjectMeta> {
        validator::validate_key(key, self.config.limits.max_key_length)?;
        validator::validate_size(size, self.config.limits.max_value_size)?;
        validator::validate_custom_metadata_size(
            &opts.custom_metadata,
            self.config.limits.max_custom_metadata_size,
        )?;

        let computed = handle
            .get()
            .expect("digest handle is populated once the blob store has fully drained the tee");
        let checksums = validator::validate_hash(computed, &opts.expected_digests)?;
        let etag = checksums
            .get(&DigestAlgorithm::Md5)
            .cloned()
            .expect("md5 is always requested for put");

        let row = ObjectRow {
            key: key.to_string(),
            version: model::generate_version(),
            size,
            etag,
            uploaded_ms: self.timers.now_ms(),
            checksums,
            http_metadata: opts.http_metadata,
            custom_metadata: opts.custom_metadata,
            blob_ref: BlobRef::Single(blob_id),
        };

        let orphaned = self.metadata_store.put(row.clone(), opts.only_if).await?;
        self.schedule_blob_deletes(orphaned);
        Ok(row.to_meta())
    }

    #[instrument(skip(self, keys))]
    pub async fn delete(&self, keys: Vec<String>) -> EngineResult<()> {
        for key in &keys {
            validator::validate_key(key, self.config.limits.max_key_length)?;
        }
        let orphaned = self
            .metadata_store
            .delete_by_keys(keys)
            .await
            .map_err(EngineError::Internal)?;
        self.schedule_blob_deletes(orphaned);
        Ok(())
    }

    #[instrument(skip(self, req))]
    pub async fn list(&self, req: ListRequest) -> EngineResult<ListPage> {
        let max = self.config.limits.max_list_limit;
        let validated = validator::validate_limit(req.limit, max)?;
        let mut effective = validated.unwrap_or(max);
        if !req.include.is_empty() {
            effective = effective.min(self.config.limits.max_list_limit_with_include);
        }

        let opts = ListOptions {
            prefix: req.prefix.unwrap_or_default(),
            start_after: req.start_after,
            cursor: req.cursor,
            limit: effective,
            delimiter: req.delimiter,
            include: req.include,
        };
        self.metadata_store.list(opts).await.map_err(EngineError::Internal)
    }

    #[instrument(skip(self, http_metadata, custom_metadata), fields(key = %key))]
    pub async fn create_multipart_upload(
        &self,
        key: String,
        http_metadata: HttpMetadata,
        custom_metadata: CustomMetadata,
    ) -> EngineResult<String> {
        validator::validate_key(&key, self.config.limits.max_key_length)?;
        validator::validate_custom_metadata_size(
            &custom_metadata,
            self.config.limits.max_custom_metadata_size,
        )?;
        let upload_id = model::generate_upload_id();
        self.metadata_store
            .create_multipart_upload(
                upload_id.clone(),
                key,
                http_metadata,
                custom_metadata,
                self.timers.now_ms(),
            )
            .await
            .map_err(EngineError::Internal)?;
        Ok(upload_id)
    }

    #[instrument(skip(self, stream), fields(key = %key, upload_id = %upload_id, part_number))]
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: String,
        part_number: u32,
        stream: ByteStream,
        size: u64,
    ) -> EngineResult<UploadPartResult> {
        validator::validate_key(key, self.config.limits.max_key_length)?;
        let (tee, handle) = digest::tee_digest(stream, &[DigestAlgorithm::Md5]);
        let blob_id = self
            .blob_store
            .put(tee)
            .await
            .map_err(EngineError::Internal)?;

        let etag = model::generate_part_etag();
        let computed = handle
            .get()
            .expect("digest handle is populated once the blob store has fully drained the tee");
        let checksum_md5 = hex::encode(
            computed
                .get(&DigestAlgorithm::Md5)
                .expect("md5 is always computed for uploadPart"),
        );

        let part = PartRow {
            upload_id: upload_id.clone(),
            part_number,
            blob_id: blob_id.clone(),
            size,
            etag: etag.clone(),
            checksum_md5,
            object_key: None,
        };

        match self.metadata_store.put_part(upload_id, part).await {
            Ok(previous) => {
                if let Some(prev_id) = previous {
                    self.schedule_blob_delete(prev_id);
                }
                Ok(UploadPartResult { etag })
            }
            Err(err) => {
                self.schedule_blob_delete(blob_id);
                Err(err)
            }
        }
    }

    #[instrument(skip(self, selected), fields(key = %key, upload_id = %upload_id))]
    pub async fn complete_multipart_upload(
        &self,
        key: String,
        upload_id: String,
        selected: Vec<SelectedPart>,
    ) -> EngineResult<ObjectMeta> {
        validator::validate_key(&key, self.config.limits.max_key_length)?;
        let now = self.timers.now_ms();
        let (row, to_delete) = self
            .metadata_store
            .complete_multipart_upload(
                key,
                upload_id,
                selected,
                self.config.limits.min_multipart_part_size,
                now,
            )
            .await?;
        self.schedule_blob_deletes(to_delete);
        Ok(row.to_meta())
    }

    #[instrument(skip(self), fields(key = %key, upload_id = %upload_id))]
    pub async fn abort_multipart_upload(&self, key: String, upload_id: String) -> EngineResult<()> {
        let to_delete = self
            .metadata_store
            .abort_multipart_upload(key, upload_id)
            .await?;
        self.schedule_blob_deletes(to_delete);
        Ok(())
    }

    /// Maintenance entry point for an external scheduler: delete upload
    /// rows (and orphan their parts) that have sat in-progress longer
    /// than `max_age_ms`.
    pub async fn reap_stale_uploads(&self, max_age_ms: i64) -> anyhow::Result<()> {
        let now = self.timers.now_ms();
        let orphaned = self
            .metadata_store
            .reap_stale_uploads(max_age_ms, now)
            .await?;
        self.schedule_blob_deletes(orphaned);
        Ok(())
    }

    fn schedule_blob_delete(&self, id: BlobId) {
        let blob_store = self.blob_store.clone();
        let ref_counter = self.ref_counter.clone();
        let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            ref_counter.wait_for_zero(&id).await;
            match blob_store.delete(&id).await {
                Ok(()) => tracing::trace!(blob_id = %id, "deleted orphaned blob"),
                Err(error) => {
                    tracing::warn!(blob_id = %id, %error, "failed to delete orphaned blob; accepted as storage slack")
                }
            }
        });
        self.timers.spawn_background(task);
    }

    fn schedule_blob_deletes(&self, ids: Vec<BlobId>) {
        for id in ids {
            self.schedule_blob_delete(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryBlobStore;
    use crate::metadata::SqliteMetadataStore;
    use crate::timers::system_timers;
    use bytes::Bytes;
    use tokio_stream::StreamExt;

    fn body_stream(bytes: &'static [u8]) -> ByteStream {
        Box::pin(tokio_stream::once(Ok(Bytes::from_static(bytes))))
    }

    fn coordinator(min_part_size: u64) -> BucketCoordinator {
        BucketCoordinator::new(
            EngineConfig::test_mode(min_part_size),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(SqliteMetadataStore::in_memory().unwrap()),
            system_timers(),
        )
    }

    async fn drain(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn simple_put_then_get_scenario() {
        let coord = coordinator(5 * 1024 * 1024);
        let meta = coord
            .put(
                "k".to_string(),
                body_stream(b"hello"),
                5,
                PutOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.etag, "5d41402abc4b2a76b9719d911017c592");

        let got = coord.get("k", GetOptions::default()).await.unwrap();
        assert_eq!(drain(got.body).await, b"hello");
        assert_eq!(got.range, SizeRange { offset: 0, length: 5 });
    }

    #[tokio::test]
    async fn conditional_put_failure_orphans_blob_in_background() {
        let coord = coordinator(5 * 1024 * 1024);
        let first = coord
            .put(
                "k".to_string(),
                body_stream(b"hello"),
                5,
                PutOptions::default(),
            )
            .await
            .unwrap();

        let result = coord
            .put(
                "k".to_string(),
                body_stream(b"world"),
                5,
                PutOptions {
                    only_if: Some(OnlyIf {
                        etag_does_not_match: Some(vec![validator::EtagMatcher::Strong(
                            first.etag.clone(),
                        )]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::PreconditionFailed { .. })));

        let still_there = coord.get("k", GetOptions::default()).await.unwrap();
        assert_eq!(drain(still_there.body).await, b"hello");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn multipart_concat_and_range_across_parts() {
        let coord = coordinator(5);
        let upload_id = coord
            .create_multipart_upload(
                "big".to_string(),
                HttpMetadata::new(),
                CustomMetadata::new(),
            )
            .await
            .unwrap();

        let mut selected = Vec::new();
        for (n, body) in [(1u32, &b"AAAAA"[..]), (2, &b"BBBBB"[..]), (3, &b"CCC"[..])] {
            let result = coord
                .upload_part(
                    "big",
                    upload_id.clone(),
                    n,
                    Box::pin(tokio_stream::once(Ok(Bytes::copy_from_slice(body)))),
                    body.len() as u64,
                )
                .await
                .unwrap();
            selected.push(SelectedPart {
                part_number: n,
                etag: result.etag,
            });
        }

        let meta = coord
            .complete_multipart_upload("big".to_string(), upload_id, selected)
            .await
            .unwrap();
        assert_eq!(meta.size, 13);
        assert_eq!(meta.etag.split('-').next_back(), Some("3"));

        let got = coord
            .get(
                "big",
                GetOptions {
                    range: Some(RangeInput::Structured {
                        offset: Some(3),
                        length: Some(7),
                        suffix: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(drain(got.body).await, b"AABBBBB");
    }

    #[tokio::test]
    async fn list_with_delimiter_scenario() {
        let coord = coordinator(5 * 1024 * 1024);
        for key in ["a/1", "a/2", "b", "c/x/1", "c/x/2"] {
            coord
                .put(
                    key.to_string(),
                    body_stream(b"x"),
                    1,
                    PutOptions::default(),
                )
                .await
                .unwrap();
        }

        let page = coord
            .list(ListRequest {
                delimiter: Some("/".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].meta.key, "b");
        assert_eq!(page.delimited_prefixes, vec!["a/".to_string(), "c/".to_string()]);
        assert!(!page.truncated);
    }

    #[tokio::test]
    async fn abort_after_complete_is_idempotent_no_op() {
        let coord = coordinator(5);
        let upload_id = coord
            .create_multipart_upload(
                "big".to_string(),
                HttpMetadata::new(),
                CustomMetadata::new(),
            )
            .await
            .unwrap();
        let result = coord
            .upload_part(
                "big",
                upload_id.clone(),
                1,
                Box::pin(tokio_stream::once(Ok(Bytes::from_static(b"AAAAA")))),
                5,
            )
            .await
            .unwrap();
        coord
            .complete_multipart_upload(
                "big".to_string(),
                upload_id.clone(),
                vec![SelectedPart {
                    part_number: 1,
                    etag: result.etag,
                }],
            )
            .await
            .unwrap();

        coord
            .abort_multipart_upload("big".to_string(), upload_id.clone())
            .await
            .unwrap();

        let meta = coord.head("big").await.unwrap();
        assert_eq!(meta.range.length, 5);
    }

    #[tokio::test]
    async fn key_too_long_is_rejected_and_blob_is_orphaned() {
        let coord = coordinator(5 * 1024 * 1024);
        let key = "a".repeat(1025);
        let result = coord
            .put(key, body_stream(b"x"), 1, PutOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::InvalidObjectName)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
