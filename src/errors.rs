//! Engine error taxonomy.
//!
//! Every variant maps to a stable numeric code and an HTTP-style status,
//! mirroring the pair of accessors a caller needs to translate an engine
//! failure into whatever wire format the surrounding transport uses.

use thiserror::Error;

use crate::model::{DigestAlgorithm, ObjectMeta};

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unexpected internal fault (storage I/O, metadata transaction failure).
    #[error("internal error")]
    Internal(#[from] anyhow::Error),

    #[error("the specified key does not exist")]
    NoSuchKey { key: String },

    #[error("your proposed value exceeds the maximum allowed object size")]
    EntityTooLarge,

    #[error("your proposed upload is smaller than the minimum allowed part size")]
    EntityTooSmall,

    #[error("custom metadata exceeds the maximum allowed size")]
    MetadataTooLarge,

    #[error("the specified key is not valid")]
    InvalidObjectName,

    #[error("the specified value for maxKeys is not valid")]
    InvalidMaxKeys,

    #[error("the specified upload does not exist, or has already been completed or aborted")]
    NoSuchUpload,

    #[error("one or more of the specified parts could not be found or the etag did not match")]
    InvalidPart,

    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("at least one of the preconditions you specified did not hold")]
    PreconditionFailed { current: Option<Box<ObjectMeta>> },

    #[error("the {algorithm} digest you specified did not match what was received")]
    BadDigest {
        algorithm: DigestAlgorithm,
        provided: String,
        computed: String,
    },

    #[error("the requested range is not satisfiable")]
    InvalidRange,

    #[error("the completed upload's parts do not satisfy the uniform part size rule")]
    BadUpload,
}

impl EngineError {
    /// Stable numeric code, independent of any transport's status codes.
    pub fn v4_code(&self) -> u32 {
        match self {
            EngineError::Internal(_) => 10001,
            EngineError::NoSuchKey { .. } => 10007,
            EngineError::EntityTooLarge => 100100,
            EngineError::EntityTooSmall => 10011,
            EngineError::MetadataTooLarge => 10012,
            EngineError::InvalidObjectName => 10020,
            EngineError::InvalidMaxKeys => 10022,
            EngineError::NoSuchUpload => 10024,
            EngineError::InvalidPart => 10025,
            EngineError::InvalidArgument { .. } => 10029,
            EngineError::PreconditionFailed { .. } => 10031,
            EngineError::BadDigest { .. } => 10037,
            EngineError::InvalidRange => 10039,
            EngineError::BadUpload => 10048,
        }
    }

    /// HTTP-style status code. Kept as a plain integer since this crate has
    /// no HTTP framework dependency — request transport is external.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Internal(_) => 500,
            EngineError::NoSuchKey { .. } => 404,
            EngineError::EntityTooLarge => 400,
            EngineError::EntityTooSmall => 400,
            EngineError::MetadataTooLarge => 400,
            EngineError::InvalidObjectName => 400,
            EngineError::InvalidMaxKeys => 400,
            EngineError::NoSuchUpload => 400,
            EngineError::InvalidPart => 400,
            EngineError::InvalidArgument { .. } => 400,
            EngineError::PreconditionFailed { .. } => 412,
            EngineError::BadDigest { .. } => 400,
            EngineError::InvalidRange => 416,
            EngineError::BadUpload => 500,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
