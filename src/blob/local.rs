//! Local filesystem blob store backend.
//!
//! Blobs are stored as flat files named by their id under a configurable
//! root directory. Writes follow the crash-only pattern: write to a temp
//! file under `.tmp/`, fsync, atomically rename into place, then chmod
//! read-only — matching the teacher's write path, minus the `StoredObject`
//! wrapper and S3-specific ETag framing, since blobs carry no content type.

use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use tokio_stream::StreamExt;

use super::{
    render_multipart_byteranges, BlobId, BlobStore, ByteRange, ByteStream,
    MultipartByteRangesOptions,
};

/// Backend that stores each blob as a single read-only file on disk.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &BlobId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn temp_path(&self) -> PathBuf {
        let token = hex::encode(rand::random::<[u8; 16]>());
        self.root.join(".tmp").join(format!("tmp-{token}"))
    }

    fn read_range_sync(path: &Path, range: Option<ByteRange>) -> anyhow::Result<Bytes> {
        let data = fs::read(path)?;
        Ok(match range {
            Some(r) => {
                let end = r.end.min(data.len().saturating_sub(1) as u64);
                let start = r.start.min(end);
                Bytes::from(data[start as usize..=end as usize].to_vec())
            }
            None => Bytes::from(data),
        })
    }
}

impl BlobStore for LocalBlobStore {
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
            let tmp_path = self.temp_path();
            let final_path = self.path_for(&id);

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
            drop(file);

            fs::rename(&tmp_path, &final_path)?;

            let mut perms = fs::metadata(&final_path)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&final_path, perms)?;

            Ok(id)
        })
    }

    fn get(
        &self,
        id: &BlobId,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ByteStream>>> + Send + '_>> {
        let path = self.path_for(id);
        Box::pin(async move {
            if !path.exists() {
                return Ok(None);
            }
            let chunk = Self::read_range_sync(&path, range)?;
            let stream: ByteStream = Box::pin(tokio_stream::once(Ok(chunk)));
            Ok(Some(stream))
        })
    }

    fn get_multi_range(
        &self,
        id: &BlobId,
        ranges: &[ByteRange],
        opts: MultipartByteRangesOptions,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ByteStream>>> + Send + '_>> {
        let path = self.path_for(id);
        let ranges = ranges.to_vec();
        Box::pin(async move {
            if !path.exists() {
                return Ok(None);
            }
            let mut parts = Vec::with_capacity(ranges.len());
            for r in ranges {
                let chunk = Self::read_range_sync(&path, Some(r))?;
                parts.push((r, chunk));
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
        let path = self.path_for(id);
        Box::pin(async move {
            match fs::metadata(&path) {
                Ok(meta) => Ok(Some(meta.len())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn delete(
        &self,
        id: &BlobId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.path_for(id);
        Box::pin(async move {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    // read-only files on some platforms refuse removal
                    // until writable; retry once after clearing the bit.
                    if let Ok(meta) = fs::metadata(&path) {
                        let mut perms = meta.permissions();
                        perms.set_readonly(false);
                        let _ = fs::set_permissions(&path, perms);
                        fs::remove_file(&path)?;
                        Ok(())
                    } else {
                        Err(e.into())
                    }
                }
            }
        })
    }
}
