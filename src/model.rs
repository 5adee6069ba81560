//! Shared domain types for objects, multipart uploads, and parts.
//!
//! These are the Rust shapes of §3's data model: plain structs moved
//! between the Metadata Store and the Bucket Coordinator, independent of
//! how any particular backend persists them.

use std::collections::BTreeMap;
use std::fmt;

use crate::blob::BlobId;

/// Recognized HTTP metadata fields, stored opaquely (never interpreted
/// by the engine — see SPEC_FULL.md §9's open question on `Expires`).
pub type HttpMetadata = BTreeMap<String, String>;

/// Arbitrary caller-supplied metadata.
pub type CustomMetadata = BTreeMap<String, String>;

/// Checksum algorithms the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 5] = [
        DigestAlgorithm::Md5,
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Some(DigestAlgorithm::Md5),
            "sha1" => Some(DigestAlgorithm::Sha1),
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha384" => Some(DigestAlgorithm::Sha384),
            "sha512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase hex digests keyed by algorithm.
pub type Checksums = BTreeMap<DigestAlgorithm, String>;

/// Where an object's bytes live: a single blob, or the multipart
/// sentinel (parts are looked up separately by `objectKey`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRef {
    Single(BlobId),
    Multipart,
}

/// An object row as persisted by the Metadata Store.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub key: String,
    pub version: String,
    pub size: u64,
    pub etag: String,
    pub uploaded_ms: i64,
    pub checksums: Checksums,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
    pub blob_ref: BlobRef,
}

impl ObjectRow {
    /// The externally visible metadata for this row — drops `blob_ref`,
    /// which is an internal storage detail no caller-facing result needs.
    pub fn to_meta(&self) -> ObjectMeta {
        ObjectMeta {
            key: self.key.clone(),
            version: self.version.clone(),
            size: self.size,
            etag: self.etag.clone(),
            uploaded_ms: self.uploaded_ms,
            checksums: self.checksums.clone(),
            http_metadata: self.http_metadata.clone(),
            custom_metadata: self.custom_metadata.clone(),
        }
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.blob_ref, BlobRef::Multipart)
    }
}

/// Object metadata as returned to callers of the Bucket Coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub key: String,
    pub version: String,
    pub size: u64,
    pub etag: String,
    pub uploaded_ms: i64,
    pub checksums: Checksums,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
}

/// A row in `multipart_parts`.
#[derive(Debug, Clone)]
pub struct PartRow {
    pub upload_id: String,
    pub part_number: u32,
    pub blob_id: BlobId,
    pub size: u64,
    pub etag: String,
    pub checksum_md5: String,
    pub object_key: Option<String>,
}

/// State of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    InProgress,
    Completed,
    Aborted,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::InProgress => "in_progress",
            UploadState::Completed => "completed",
            UploadState::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(UploadState::InProgress),
            "completed" => Some(UploadState::Completed),
            "aborted" => Some(UploadState::Aborted),
            _ => None,
        }
    }
}

/// A row in `multipart_uploads`.
#[derive(Debug, Clone)]
pub struct UploadRow {
    pub upload_id: String,
    pub key: String,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
    pub state: UploadState,
    pub created_ms: i64,
}

/// Generate a fresh object version: 16 random bytes, hex-encoded.
pub fn generate_version() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Generate a fresh multipart upload id: 128 random bytes, base64url
/// (no padding, matching the teacher's preference for URL-safe tokens).
pub fn generate_upload_id() -> String {
    use base64::Engine;
    let bytes: [u8; 128] = {
        let mut b = [0u8; 128];
        rand::Rng::fill(&mut rand::thread_rng(), &mut b);
        b
    };
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a random per-part opaque etag: 16 random bytes, hex-encoded.
pub fn generate_part_etag() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
