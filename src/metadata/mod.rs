//! Metadata Store (C2): the transactional SQL-backed home for object
//! rows, multipart upload rows, and part rows.

pub mod sqlite;
pub mod store;

pub use store::{
    ListInclude, ListObjectEntry, ListOptions, ListPage, MetadataStore, SelectedPart,
};
pub use sqlite::SqliteMetadataStore;
