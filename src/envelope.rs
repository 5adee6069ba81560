//! Request/response envelope (§6): the wire shape the Bucket Coordinator
//! is fed from and renders back to, independent of whatever transport
//! (HTTP, a local socket, an in-process call) carries the bytes.
//!
//! Grounded on the teacher's `serialization` module for the
//! metadata-JSON-then-body framing idiom and on `handlers/object.rs` for
//! which fields each operation accepts; the `method`-discriminated
//! request shape and the `{message, v4code}` error body are this
//! engine's own translation of §6/§7 into `serde`.

use serde::{Deserialize, Serialize};

use crate::blob::ByteStream;
use crate::coordinator::{GetOptions, ListRequest, PutOptions, SizeRange};
use crate::errors::EngineError;
use crate::metadata::{ListInclude, SelectedPart};
use crate::model::{CustomMetadata, DigestAlgorithm, HttpMetadata, ObjectMeta};
use crate::validator::{EtagMatcher, OnlyIf, RangeInput};

/// Wire shape of an ETag matcher element (§4.7).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EtagMatcherDto {
    Strong { value: String },
    Weak { value: String },
    Wildcard,
}

impl From<EtagMatcherDto> for EtagMatcher {
    fn from(dto: EtagMatcherDto) -> Self {
        match dto {
            EtagMatcherDto::Strong { value } => EtagMatcher::Strong(value),
            EtagMatcherDto::Weak { value } => EtagMatcher::Weak(value),
            EtagMatcherDto::Wildcard => EtagMatcher::Wildcard,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlyIfDto {
    pub etag_matches: Option<Vec<EtagMatcherDto>>,
    pub etag_does_not_match: Option<Vec<EtagMatcherDto>>,
    pub uploaded_before: Option<i64>,
    pub uploaded_after: Option<i64>,
    #[serde(default)]
    pub seconds_granularity: bool,
}

impl From<OnlyIfDto> for OnlyIf {
    fn from(dto: OnlyIfDto) -> Self {
        OnlyIf {
            etag_matches: dto
                .etag_matches
                .map(|list| list.into_iter().map(Into::into).collect()),
            etag_does_not_match: dto
                .etag_does_not_match
                .map(|list| list.into_iter().map(Into::into).collect()),
            uploaded_before: dto.uploaded_before,
            uploaded_after: dto.uploaded_after,
            seconds_granularity: dto.seconds_granularity,
        }
    }
}

/// Wire shape of a structured range (§4.3); the alternative accepted
/// form is a raw HTTP `Range` header string, carried separately as
/// `rangeHeader` on `get`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeDto {
    pub offset: Option<u64>,
    pub length: Option<u64>,
    pub suffix: Option<u64>,
}

impl From<RangeDto> for RangeInput {
    fn from(dto: RangeDto) -> Self {
        RangeInput::Structured {
            offset: dto.offset,
            length: dto.length,
            suffix: dto.suffix,
        }
    }
}

fn range_input(range: Option<RangeDto>, range_header: Option<String>) -> Option<RangeInput> {
    range
        .map(RangeInput::from)
        .or_else(|| range_header.map(RangeInput::Header))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartSelectionDto {
    pub part: u32,
    pub etag: String,
}

/// A request method, discriminated by `method`, carrying exactly the
/// inputs §6's request-methods table lists for that operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Request {
    Head {
        object: String,
    },
    Get {
        object: String,
        #[serde(default)]
        only_if: Option<OnlyIfDto>,
        #[serde(default)]
        range: Option<RangeDto>,
        #[serde(default)]
        range_header: Option<String>,
    },
    List {
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        start_after: Option<String>,
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        delimiter: Option<String>,
        #[serde(default)]
        include: Option<Vec<String>>,
    },
    Put {
        object: String,
        #[serde(default)]
        http_metadata: Option<HttpMetadata>,
        #[serde(default)]
        custom_metadata: Option<CustomMetadata>,
        #[serde(default)]
        only_if: Option<OnlyIfDto>,
        #[serde(default)]
        md5: Option<String>,
        #[serde(default)]
        sha1: Option<String>,
        #[serde(default)]
        sha256: Option<String>,
        #[serde(default)]
        sha384: Option<String>,
        #[serde(default)]
        sha512: Option<String>,
    },
    Delete {
        #[serde(default)]
        object: Option<String>,
        #[serde(default)]
        objects: Option<Vec<String>>,
    },
    CreateMultipartUpload {
        object: String,
        #[serde(default)]
        http_metadata: Option<HttpMetadata>,
        #[serde(default)]
        custom_metadata: Option<CustomMetadata>,
    },
    UploadPart {
        object: String,
        upload_id: String,
        part_number: u32,
    },
    CompleteMultipartUpload {
        object: String,
        upload_id: String,
        parts: Vec<PartSelectionDto>,
    },
    AbortMultipartUpload {
        object: String,
        upload_id: String,
    },
}

impl Request {
    /// `object`/`objects` both absent, or an unrecognised method tag,
    /// is a caller bug rather than an engine fault — callers surface
    /// `EngineError::InvalidArgument` themselves before dispatch reaches
    /// the coordinator; this parses only the envelope shape.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

pub fn get_options(only_if: Option<OnlyIfDto>, range: Option<RangeDto>, range_header: Option<String>) -> GetOptions {
    GetOptions {
        only_if: only_if.map(Into::into),
        range: range_input(range, range_header),
    }
}

pub fn put_options(
    http_metadata: Option<HttpMetadata>,
    custom_metadata: Option<CustomMetadata>,
    only_if: Option<OnlyIfDto>,
    md5: Option<String>,
    sha1: Option<String>,
    sha256: Option<String>,
    sha384: Option<String>,
    sha512: Option<String>,
) -> PutOptions {
    let mut expected_digests = std::collections::BTreeMap::new();
    for (algo, value) in [
        (DigestAlgorithm::Md5, md5),
        (DigestAlgorithm::Sha1, sha1),
        (DigestAlgorithm::Sha256, sha256),
        (DigestAlgorithm::Sha384, sha384),
        (DigestAlgorithm::Sha512, sha512),
    ] {
        if let Some(v) = value {
            expected_digests.insert(algo, v);
        }
    }
    PutOptions {
        http_metadata: http_metadata.unwrap_or_default(),
        custom_metadata: custom_metadata.unwrap_or_default(),
        only_if: only_if.map(Into::into),
        expected_digests,
    }
}

pub fn list_request(
    prefix: Option<String>,
    start_after: Option<String>,
    cursor: Option<String>,
    limit: Option<u32>,
    delimiter: Option<String>,
    include: Option<Vec<String>>,
) -> ListRequest {
    let mut parsed = ListInclude::default();
    for field in include.into_iter().flatten() {
        match field.as_str() {
            "httpMetadata" => parsed.http_metadata = true,
            "customMetadata" => parsed.custom_metadata = true,
            _ => {}
        }
    }
    ListRequest {
        prefix,
        start_after,
        cursor,
        limit,
        delimiter,
        include: parsed,
    }
}

pub fn selected_parts(parts: Vec<PartSelectionDto>) -> Vec<SelectedPart> {
    parts
        .into_iter()
        .map(|p| SelectedPart {
            part_number: p.part,
            etag: p.etag,
        })
        .collect()
}

/// Serialisable view of `ObjectMeta` for response bodies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetaDto {
    pub key: String,
    pub version: String,
    pub size: u64,
    pub etag: String,
    pub uploaded: i64,
    pub checksums: std::collections::BTreeMap<String, String>,
    pub http_metadata: HttpMetadata,
    pub custom_metadata: CustomMetadata,
}

impl From<&ObjectMeta> for ObjectMetaDto {
    fn from(meta: &ObjectMeta) -> Self {
        ObjectMetaDto {
            key: meta.key.clone(),
            version: meta.version.clone(),
            size: meta.size,
            etag: meta.etag.clone(),
            uploaded: meta.uploaded_ms,
            checksums: meta
                .checksums
                .iter()
                .map(|(algo, hex)| (algo.as_str().to_string(), hex.clone()))
                .collect(),
            http_metadata: meta.http_metadata.clone(),
            custom_metadata: meta.custom_metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeRangeDto {
    pub offset: u64,
    pub length: u64,
}

impl From<SizeRange> for SizeRangeDto {
    fn from(r: SizeRange) -> Self {
        SizeRangeDto {
            offset: r.offset,
            length: r.length,
        }
    }
}

/// The `{message, v4code}` error shape §6/§7 specify, with the optional
/// attached object metadata `PreconditionFailed` carries from `get`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub v4code: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectMetaDto>,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        let object = match err {
            EngineError::PreconditionFailed { current } => {
                current.as_ref().map(|meta| ObjectMetaDto::from(meta.as_ref()))
            }
            _ => None,
        };
        ErrorBody {
            message: err.to_string(),
            v4code: err.v4_code(),
            object,
        }
    }
}

/// A response ready to be written to a transport: a known-length JSON
/// metadata prefix (whose length the caller re-advertises via the
/// `metadata-size-header` field) optionally followed by a body stream.
pub struct ResponseFrame {
    pub metadata_json: Vec<u8>,
    pub body: Option<ByteStream>,
}

impl ResponseFrame {
    pub fn metadata_size_header(&self) -> String {
        self.metadata_json.len().to_string()
    }

    pub fn ok(metadata: &impl Serialize, body: Option<ByteStream>) -> serde_json::Result<Self> {
        Ok(ResponseFrame {
            metadata_json: serde_json::to_vec(metadata)?,
            body,
        })
    }

    pub fn err(err: &EngineError) -> Self {
        let body = ErrorBody::from(err);
        ResponseFrame {
            metadata_json: serde_json::to_vec(&body)
                .unwrap_or_else(|_| b"{\"message\":\"internal error\",\"v4code\":10001}".to_vec()),
            body: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_with_structured_range() {
        let json = br#"{"method":"get","object":"k","range":{"offset":3,"length":7}}"#;
        let req = Request::from_json(json).unwrap();
        match req {
            Request::Get { object, range, .. } => {
                assert_eq!(object, "k");
                assert_eq!(range.unwrap().offset, Some(3));
            }
            _ => panic!("expected Get"),
        }
    }

    #[test]
    fn parses_complete_multipart_upload_request() {
        let json = br#"{"method":"completeMultipartUpload","object":"big","uploadId":"u1","parts":[{"part":1,"etag":"e1"}]}"#;
        let req = Request::from_json(json).unwrap();
        match req {
            Request::CompleteMultipartUpload {
                object,
                upload_id,
                parts,
            } => {
                assert_eq!(object, "big");
                assert_eq!(upload_id, "u1");
                assert_eq!(parts.len(), 1);
            }
            _ => panic!("expected CompleteMultipartUpload"),
        }
    }

    #[test]
    fn error_body_carries_precondition_object() {
        let meta = ObjectMeta {
            key: "k".to_string(),
            version: "v".to_string(),
            size: 1,
            etag: "e".to_string(),
            uploaded_ms: 0,
            checksums: Default::default(),
            http_metadata: Default::default(),
            custom_metadata: Default::default(),
        };
        let err = EngineError::PreconditionFailed {
            current: Some(Box::new(meta)),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.v4code, 10031);
        assert!(body.object.is_some());
    }
}
