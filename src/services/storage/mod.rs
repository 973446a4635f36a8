//! Storage abstraction.
//!
//! Every backend stores content bytes together with one [`Metadata`] record
//! under the same key. Callers depend only on [`StorageBackend`]; the sweep
//! additionally needs [`EnumerableBackend`], which only the local filesystem
//! backend implements.

pub mod localfs;
pub mod s3;

use crate::models::{Expiry, Metadata};
use async_trait::async_trait;
use axum::{http::HeaderMap, response::Response};
use std::{io, pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use localfs::LocalFsBackend;
pub use s3::S3Backend;

/// An unseekable byte source handed to or returned from a backend.
pub type ByteSource<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("metadata for `{0}` is unreadable")]
    BadMetadata(String),
    #[error("empty file")]
    FileEmpty,
    #[error("invalid key `{0}`")]
    InvalidKey(String),
    #[error("insufficient disk space: {available} bytes available, {required} bytes required")]
    InsufficientDiskSpace { available: u64, required: u64 },
    #[error("storage transport error: {0}")]
    Transport(String),
    #[error("delete failed: {}", .0.join("; "))]
    Delete(Vec<String>),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Capability set shared by all storage backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Whether content exists under `key`. Absence is `Ok(false)`, never an error.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Fetch metadata only.
    async fn head(&self, key: &str) -> StorageResult<Metadata>;

    /// Fetch metadata and a content stream. The stream is released on drop.
    async fn get(&self, key: &str) -> StorageResult<(Metadata, ByteSource<'static>)>;

    /// Store content and metadata together.
    ///
    /// Hash, mimetype and size in the returned metadata are computed from the
    /// bytes written. Zero bytes is [`StorageError::FileEmpty`]. A failed put
    /// leaves neither content nor metadata behind.
    async fn put(
        &self,
        key: &str,
        original_name: &str,
        src: ByteSource<'_>,
        expiry: Expiry,
        delete_key: &str,
        access_key: &str,
    ) -> StorageResult<Metadata>;

    /// Replace the stored metadata without touching content.
    async fn put_metadata(&self, key: &str, metadata: &Metadata) -> StorageResult<()>;

    /// Stream content as an HTTP response, honoring `Range` in `request_headers`.
    async fn serve(&self, key: &str, request_headers: &HeaderMap) -> StorageResult<Response>;

    /// Content length in bytes.
    async fn size(&self, key: &str) -> StorageResult<u64>;

    /// Remove content and metadata. Both removals are attempted.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Backends whose keys can be listed; used by the expiry sweep.
#[async_trait]
pub trait EnumerableBackend: StorageBackend {
    async fn list(&self) -> StorageResult<Vec<String>>;
}

const MAX_KEY_LEN: usize = 255;

/// Reject keys that could escape the storage root or collide with
/// temporary files.
pub(crate) fn ensure_key_safe(key: &str) -> StorageResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key.starts_with('.')
        || key.contains("..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'/' || b == b'\\');
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Backend selection and its parameters.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    LocalFs {
        files_dir: String,
        meta_dir: String,
        min_free_space_gb: f64,
    },
    ObjectStore {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    },
}

/// The configured backend, instantiated once per process.
#[derive(Clone)]
pub enum Backend {
    LocalFs(Arc<LocalFsBackend>),
    ObjectStore(Arc<S3Backend>),
}

impl Backend {
    pub async fn from_config(config: &BackendConfig) -> StorageResult<Self> {
        match config {
            BackendConfig::LocalFs {
                files_dir,
                meta_dir,
                min_free_space_gb,
            } => {
                let backend = LocalFsBackend::new(files_dir, meta_dir, *min_free_space_gb).await?;
                Ok(Backend::LocalFs(Arc::new(backend)))
            }
            BackendConfig::ObjectStore {
                bucket,
                region,
                endpoint,
                force_path_style,
            } => {
                let backend = S3Backend::new(
                    bucket.clone(),
                    region.clone(),
                    endpoint.clone(),
                    *force_path_style,
                )
                .await;
                Ok(Backend::ObjectStore(Arc::new(backend)))
            }
        }
    }

    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        match self {
            Backend::LocalFs(b) => b.clone(),
            Backend::ObjectStore(b) => b.clone(),
        }
    }

    /// The listable view of this backend, if it has one.
    pub fn enumerable(&self) -> Option<Arc<dyn EnumerableBackend>> {
        match self {
            Backend::LocalFs(b) => Some(b.clone()),
            Backend::ObjectStore(_) => None,
        }
    }

    /// Check that the backend can currently be reached and written to.
    pub async fn probe(&self) -> StorageResult<()> {
        match self {
            Backend::LocalFs(b) => b.probe().await,
            Backend::ObjectStore(b) => b.probe().await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::LocalFs(_) => "localfs",
            Backend::ObjectStore(_) => "s3",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_hidden_keys() {
        for key in ["", "../etc", "a/b", "a\\b", ".tmp-123", "a..b", "bad\nkey"] {
            assert!(
                matches!(ensure_key_safe(key), Err(StorageError::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
        assert!(ensure_key_safe("abc123xyz0.tar.gz").is_ok());
    }
}
