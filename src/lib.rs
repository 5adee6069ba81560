//! Object Bucket Engine — a persistent, S3-compatible object store
//! supporting single-part puts, byte-range gets, conditional operations,
//! and resumable multipart uploads.
//!
//! Request transport, configuration loading, and logging subscriber
//! wiring are all external collaborators: this crate consumes an
//! already-parsed request envelope and emits a response envelope, given
//! injected storage backends and a `Timers` collaborator.

pub mod assembler;
pub mod blob;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod envelope;
pub mod errors;
pub mod metadata;
pub mod model;
pub mod timers;
pub mod validator;

pub use coordinator::BucketCoordinator;
pub use errors::{EngineError, EngineResult};
