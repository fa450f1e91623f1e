//! Path & IO Capability (spec.md §4.A)
//!
//! A uniform interface over local, object-store, and HTTP-backed paths.
//! Everything above this module (backends, the cache, localization and
//! delocalization) talks to storage only through [`IoCapability`].

mod local;

pub use local::LocalIo;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors surfaced by an [`IoCapability`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported scheme for path: {0}")]
    UnsupportedScheme(String),
    #[error("multipart copy of {path} needs {parts} parts, exceeding the 10000-part limit")]
    TooManyParts { path: String, parts: u64 },
}

/// Supported hash kinds for [`IoCapability::checksum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashKind {
    /// Streamed content digest.
    Md5,
    /// Digest already recorded by the backing store (e.g. an S3 ETag or
    /// GCS crc32c) — lookup is O(1), no bytes are read.
    StoreRecordedDigest,
}

/// A path handle. The scheme determines which [`IoCapability`] backend
/// serves it; the engine never branches on scheme itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathHandle(pub String);

impl PathHandle {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for `s3://`, `gs://`, `http(s)://`, … — anything that
    /// isn't a bare local filesystem path.
    pub fn is_remote_scheme(&self) -> bool {
        self.0.contains("://") && !self.0.starts_with("file://")
    }
}

/// Copy tuning parameters (spec.md §4.A).
#[derive(Debug, Clone, Copy)]
pub struct MultipartConfig {
    pub threshold_bytes: u64,
    pub min_part_bytes: u64,
    pub max_parts: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 5 * 1024 * 1024 * 1024, // 5 GiB
            min_part_bytes: 5 * 1024 * 1024,         // 5 MiB
            max_parts: 10_000,
        }
    }
}

impl MultipartConfig {
    /// Number of parts a copy of `size_bytes` would require, and whether
    /// that exceeds the configured limit.
    pub fn plan_parts(&self, size_bytes: u64) -> Result<u64, IoError> {
        if size_bytes <= self.threshold_bytes {
            return Ok(1);
        }
        let parts = size_bytes.div_ceil(self.min_part_bytes).max(1);
        if parts > self.max_parts {
            return Err(IoError::TooManyParts {
                path: String::new(),
                parts,
            });
        }
        Ok(parts)
    }
}

/// Directory listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: PathHandle,
    pub is_dir: bool,
    pub size: Option<u64>,
}

/// A uniform read/write/exists/copy/size/hash capability over
/// heterogeneous storages (spec.md §4.A).
#[async_trait]
pub trait IoCapability: Send + Sync + 'static {
    async fn exists(&self, path: &PathHandle) -> Result<bool, IoError>;

    async fn size(&self, path: &PathHandle) -> Result<u64, IoError>;

    async fn read_all(&self, path: &PathHandle) -> Result<Vec<u8>, IoError>;

    async fn write_all(&self, path: &PathHandle, bytes: &[u8]) -> Result<(), IoError>;

    /// Copy `src` to `dst`. Implementations must support cross-scheme
    /// copies (local↔object, object↔object) and honor `multipart` when
    /// the source exceeds its threshold.
    async fn copy(
        &self,
        src: &PathHandle,
        dst: &PathHandle,
        multipart: MultipartConfig,
    ) -> Result<(), IoError>;

    async fn delete(&self, path: &PathHandle) -> Result<(), IoError>;

    /// O(1) when the backing store records a content digest (§4.A);
    /// streams and hashes otherwise. Implementations that stream MAY
    /// cache the digest in a sibling `<file>.md5` — callers must treat
    /// that sidecar as not invalidated on overwrite.
    async fn checksum(&self, path: &PathHandle, kind: HashKind) -> Result<String, IoError>;

    fn resolve(&self, base: &PathHandle, subpath: &str) -> PathHandle;

    async fn list_dir(&self, path: &PathHandle) -> Result<Vec<DirEntry>, IoError>;

    /// Poll-until-exists convenience used by cache UseOriginal
    /// verification (§4.C) and timeout-classified IO waits (§5).
    async fn exists_or_throw(&self, path: &PathHandle) -> Result<(), IoError> {
        if self.exists(path).await? {
            Ok(())
        } else {
            Err(IoError::NotFound(path.as_str().to_string()))
        }
    }
}

/// Deadline wrapper matching §5: "each backend call carries a deadline;
/// on deadline the attempt is classified as bounded-retryable I/O."
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, IoError>
where
    F: std::future::Future<Output = Result<T, IoError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(IoError::Io {
            path: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "io deadline exceeded"),
        }),
    }
}
