//! Local-filesystem [`IoCapability`] implementation.
//!
//! Reference implementation used by tests, the local backend, and as
//! the destination side of `CopyOutputs` cache hits. Streams checksums
//! and writes a `<file>.md5` sidecar to amortize repeated lookups, per
//! the caveat in spec.md §4.A.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::{DirEntry, HashKind, IoCapability, IoError, MultipartConfig, PathHandle};

#[derive(Debug, Clone, Default)]
pub struct LocalIo;

impl LocalIo {
    fn as_path(handle: &PathHandle) -> PathBuf {
        PathBuf::from(handle.as_str().trim_start_matches("file://"))
    }

    fn wrap_io(path: &Path, source: std::io::Error) -> IoError {
        IoError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl IoCapability for LocalIo {
    async fn exists(&self, path: &PathHandle) -> Result<bool, IoError> {
        Ok(tokio::fs::metadata(Self::as_path(path)).await.is_ok())
    }

    async fn size(&self, path: &PathHandle) -> Result<u64, IoError> {
        let p = Self::as_path(path);
        let meta = tokio::fs::metadata(&p)
            .await
            .map_err(|e| Self::wrap_io(&p, e))?;
        Ok(meta.len())
    }

    async fn read_all(&self, path: &PathHandle) -> Result<Vec<u8>, IoError> {
        let p = Self::as_path(path);
        tokio::fs::read(&p).await.map_err(|e| Self::wrap_io(&p, e))
    }

    async fn write_all(&self, path: &PathHandle, bytes: &[u8]) -> Result<(), IoError> {
        let p = Self::as_path(path);
        if let Some(parent) = p.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::wrap_io(&p, e))?;
        }
        let mut file = tokio::fs::File::create(&p)
            .await
            .map_err(|e| Self::wrap_io(&p, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Self::wrap_io(&p, e))
    }

    async fn copy(
        &self,
        src: &PathHandle,
        dst: &PathHandle,
        multipart: MultipartConfig,
    ) -> Result<(), IoError> {
        let src_path = Self::as_path(src);
        let dst_path = Self::as_path(dst);
        let size = self.size(src).await.unwrap_or(0);
        // Local filesystem copies don't need real multipart upload, but
        // still respect the part-count ceiling so callers get the same
        // error whether the destination ends up local or remote.
        let _ = multipart.plan_parts(size)?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::wrap_io(&dst_path, e))?;
        }
        tokio::fs::copy(&src_path, &dst_path)
            .await
            .map_err(|e| Self::wrap_io(&src_path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &PathHandle) -> Result<(), IoError> {
        let p = Self::as_path(path);
        tokio::fs::remove_file(&p)
            .await
            .map_err(|e| Self::wrap_io(&p, e))
    }

    async fn checksum(&self, path: &PathHandle, kind: HashKind) -> Result<String, IoError> {
        let p = Self::as_path(path);
        if kind == HashKind::StoreRecordedDigest {
            // Local filesystem never records a digest out of band; fall
            // through to streaming, as §4.A requires.
        }
        let sidecar = p.with_extension(format!(
            "{}.md5",
            p.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));
        if let Ok(cached) = tokio::fs::read_to_string(&sidecar).await {
            return Ok(cached.trim().to_string());
        }
        let bytes = tokio::fs::read(&p).await.map_err(|e| Self::wrap_io(&p, e))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());
        let _ = tokio::fs::write(&sidecar, &digest).await;
        Ok(digest)
    }

    fn resolve(&self, base: &PathHandle, subpath: &str) -> PathHandle {
        let joined = Self::as_path(base).join(subpath);
        PathHandle::new(joined.to_string_lossy().to_string())
    }

    async fn list_dir(&self, path: &PathHandle) -> Result<Vec<DirEntry>, IoError> {
        let p = Self::as_path(path);
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&p)
            .await
            .map_err(|e| Self::wrap_io(&p, e))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Self::wrap_io(&p, e))?
        {
            let meta = entry.metadata().await.map_err(|e| Self::wrap_io(&p, e))?;
            entries.push(DirEntry {
                path: PathHandle::new(entry.path().to_string_lossy().to_string()),
                is_dir: meta.is_dir(),
                size: if meta.is_file() { Some(meta.len()) } else { None },
            });
        }
        Ok(entries)
    }
}
