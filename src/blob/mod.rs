//! Content-addressed, immutable blob storage.
//!
//! Blobs are reachable only by an unguessable id returned from `put`;
//! there is no listing operation. Two backends are provided: an
//! in-memory map for tests and small deployments, and a local-filesystem
//! backend that writes crash-only (temp file, fsync, atomic rename) and
//! marks finished files read-only.

pub mod local;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio_stream::Stream;

/// A pull-based byte stream; chunk boundaries are not meaningful.
pub type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Opaque, unguessable blob identifier: 32 random bytes followed by an
/// 8-byte big-endian monotonic counter, hex-encoded (80 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(String);

impl BlobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a previously issued id back from its hex form. Does not
    /// validate that the blob still exists.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 80 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(BlobId(s.to_ascii_lowercase()))
        } else {
            None
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static BLOB_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh blob id: 32 random bytes + an 8-byte monotonic
/// counter, hex-encoded.
pub fn generate_blob_id() -> BlobId {
    let mut buf = [0u8; 40];
    let random: [u8; 32] = rand::random();
    buf[..32].copy_from_slice(&random);
    let counter = BLOB_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    buf[32..].copy_from_slice(&counter.to_be_bytes());
    BlobId(hex::encode(buf))
}

/// Inclusive byte range, `[start, end]`, both 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Per-range header fields for a multipart/byteranges response, supplied
/// by the caller (the Blob Store does not know content types).
#[derive(Debug, Clone)]
pub struct MultipartByteRangesOptions {
    pub boundary: String,
    pub content_type: String,
    pub total_size: u64,
}

/// Content-addressed blob storage contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Drain `stream` into storage and return the new blob's id.
    fn put(
        &self,
        stream: ByteStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BlobId>> + Send + '_>>;

    /// Open a single-range (or whole-blob, if `range` is `None`) read
    /// stream. Returns `None` if the blob id is unknown. `range` is
    /// assumed already clamped to the blob's size by the caller.
    fn get(
        &self,
        id: &BlobId,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ByteStream>>> + Send + '_>>;

    /// Open a multipart/byteranges read stream covering several disjoint
    /// ranges of the same blob in one response body. Returns `None` if
    /// the blob id is unknown.
    fn get_multi_range(
        &self,
        id: &BlobId,
        ranges: &[ByteRange],
        opts: MultipartByteRangesOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ByteStream>>> + Send + '_>>;

    /// Return the blob's total size, or `None` if unknown.
    fn size(
        &self,
        id: &BlobId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>>;

    /// Delete a blob. Absent ids are a no-op.
    fn delete(
        &self,
        id: &BlobId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Render a multipart/byteranges body from an ordered set of per-range
/// byte chunks already read into memory. Shared by both backends so the
/// wire framing stays identical regardless of storage medium.
pub(crate) fn render_multipart_byteranges(
    parts: Vec<(ByteRange, Bytes)>,
    opts: &MultipartByteRangesOptions,
) -> Bytes {
    let mut out = Vec::new();
    for (range, chunk) in parts {
        out.extend_from_slice(b"--");
        out.extend_from_slice(opts.boundary.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(format!("Content-Type: {}\r\n", opts.content_type).as_bytes());
        out.extend_from_slice(
            format!(
                "Content-Range: bytes {}-{}/{}\r\n\r\n",
                range.start, range.end, opts.total_size
            )
            .as_bytes(),
        );
        out.extend_from_slice(&chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--");
    out.extend_from_slice(opts.boundary.as_bytes());
    out.extend_from_slice(b"--\r\n");
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ids_are_unique_and_well_formed() {
        let a = generate_blob_id();
        let b = generate_blob_id();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 80);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn blob_id_parse_roundtrip() {
        let id = generate_blob_id();
        let parsed = BlobId::parse(id.as_str()).unwrap();
        assert_eq!(id, parsed);
        assert!(BlobId::parse("not-hex").is_none());
        assert!(BlobId::parse("abcd").is_none());
    }
}
