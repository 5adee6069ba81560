//! In-memory blob store backend.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use bytes::Bytes;
use tokio_stream::StreamExt;

use super::{
    render_multipart_byteranges, BlobId, BlobStore, ByteRange, ByteStream,
    MultipartByteRangesOptions,
};

/// Backend that keeps all blobs in a `HashMap` guarded by a `Mutex`.
/// Intended for tests and ephemeral deployments, not durability.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<BlobId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        mut stream: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobId>> + Send + '_>> {
        Box::pin(async move {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                buf.extend_from_slice(&chunk?);
            }
            let id = super::generate_blob_id();
            self.blobs
                .lock()
                .expect("blob map mutex poisoned")
                .insert(id.clone(), Bytes::from(buf));
            Ok(id)
        })
    }

    fn get(
        &self,
        id: &BlobId,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ByteStream>>> + Send + '_>> {
        let id = id.clone();
        Box::pin(async move {
            let data = {
                let map = self.blobs.lock().expect("blob map mutex poisoned");
                match map.get(&id) {
                    Some(b) => b.clone(),
                    None => return Ok(None),
                }
            };
            let slice = match range {
                Some(r) => {
                    let end = r.end.min(data.len().saturating_sub(1) as u64);
                    let start = r.start.min(end);
                    data.slice(start as usize..=end as usize)
                }
                None => data,
            };
            let stream: ByteStream = Box::pin(tokio_stream::once(Ok(slice)));
            Ok(Some(stream))
        })
    }

    fn get_multi_range(
        &self,
        id: &BlobId,
        ranges: &[ByteRange],
        opts: MultipartByteRangesOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ByteStream>>> + Send + '_>> {
        let id = id.clone();
        let ranges = ranges.to_vec();
        Box::pin(async move {
            let data = {
                let map = self.blobs.lock().expect("blob map mutex poisoned");
                match map.get(&id) {
                    Some(b) => b.clone(),
                    None => return Ok(None),
                }
            };
            let mut parts = Vec::with_capacity(ranges.len());
            for r in ranges {
                let end = r.end.min(data.len().saturating_sub(1) as u64);
                let start = r.start.min(end);
                parts.push((r, data.slice(start as usize..=end as usize)));
            }
            let body = render_multipart_byteranges(parts, &opts);
            let stream: ByteStream = Box::pin(tokio_stream::once(Ok(body)));
            Ok(Some(stream))
        })
    }

    fn size(
        &self,
        id: &BlobId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>> {
        let id = id.clone();
        Box::pin(async move {
            Ok(self
                .blobs
                .lock()
                .expect("blob map mutex poisoned")
                .get(&id)
                .map(|b| b.len() as u64))
        })
    }

    fn delete(
        &self,
        id: &BlobId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let id = id.clone();
        Box::pin(async move {
            self.blobs.lock().expect("blob map mutex poisoned").remove(&id);
            Ok(())
        })
    }
}
