//! Local filesystem backend.
//!
//! Content lives in `files_dir/<key>` and metadata as JSON in
//! `meta_dir/<key>`. Both are written to `.tmp-<uuid>` siblings first and
//! renamed into place, so readers never observe a half-written file.

use super::{
    ByteSource, EnumerableBackend, StorageBackend, StorageError, StorageResult, ensure_key_safe,
};
use crate::{
    models::{Expiry, Metadata},
    services::{archive, sniff},
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Request, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Instant,
};
use sysinfo::Disks;
use tokio::fs::{self, File};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Request headers forwarded to the file server.
const FORWARDED_HEADERS: [header::HeaderName; 4] = [
    header::RANGE,
    header::IF_RANGE,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
];

/// On-disk metadata layout.
#[derive(Serialize, Deserialize)]
struct StoredMetadata {
    original_name: String,
    delete_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    access_key: String,
    #[serde(alias = "sha256sum")]
    content_hash: String,
    mimetype: String,
    size: u64,
    expiry: i64,
    #[serde(default, alias = "archive_files", skip_serializing_if = "Vec::is_empty")]
    archive_entries: Vec<String>,
}

impl From<&Metadata> for StoredMetadata {
    fn from(m: &Metadata) -> Self {
        Self {
            original_name: m.original_name.clone(),
            delete_key: m.delete_key.clone(),
            access_key: m.access_key.clone(),
            content_hash: m.content_hash.clone(),
            mimetype: m.mimetype.clone(),
            size: m.size,
            expiry: m.expiry.to_epoch(),
            archive_entries: m.archive_entries.clone(),
        }
    }
}

impl StoredMetadata {
    fn into_metadata(self) -> Option<Metadata> {
        Some(Metadata {
            expiry: Expiry::from_epoch(self.expiry)?,
            original_name: self.original_name,
            delete_key: self.delete_key,
            access_key: self.access_key,
            content_hash: self.content_hash,
            mimetype: self.mimetype,
            size: self.size,
            archive_entries: self.archive_entries,
        })
    }
}

#[derive(Debug)]
pub struct LocalFsBackend {
    files_dir: PathBuf,
    meta_dir: PathBuf,
    min_free_bytes: u64,
}

impl LocalFsBackend {
    /// Create the backend, creating both directories if needed.
    pub async fn new(
        files_dir: impl Into<PathBuf>,
        meta_dir: impl Into<PathBuf>,
        min_free_space_gb: f64,
    ) -> StorageResult<Self> {
        let files_dir = files_dir.into();
        let meta_dir = meta_dir.into();
        fs::create_dir_all(&files_dir).await?;
        fs::create_dir_all(&meta_dir).await?;

        let min_free_bytes = if min_free_space_gb > 0.0 {
            (min_free_space_gb * BYTES_PER_GB) as u64
        } else {
            0
        };

        Ok(Self {
            files_dir,
            meta_dir,
            min_free_bytes,
        })
    }

    /// Write, read back and remove a scratch file in `files_dir`.
    pub async fn probe(&self) -> StorageResult<()> {
        let tmp_path = self.files_dir.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(io::Error::other("scratch file content mismatch").into());
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.files_dir.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.meta_dir.join(key)
    }

    /// Available bytes on the disk holding `files_dir`, or `None` when the
    /// guard is disabled.
    async fn free_space_snapshot(&self) -> StorageResult<Option<u64>> {
        if self.min_free_bytes == 0 {
            return Ok(None);
        }
        let dir = self.files_dir.clone();
        let available = tokio::task::spawn_blocking(move || available_space(&dir))
            .await
            .map_err(io::Error::other)??;
        if available < self.min_free_bytes {
            warn!(
                available_bytes = available,
                required_bytes = self.min_free_bytes,
                path = %self.files_dir.display(),
                "insufficient disk space before upload"
            );
            return Err(StorageError::InsufficientDiskSpace {
                available,
                required: self.min_free_bytes,
            });
        }
        Ok(Some(available))
    }

    async fn read_metadata(&self, key: &str) -> StorageResult<Metadata> {
        let raw = match fs::read(self.meta_path(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice::<StoredMetadata>(&raw)
            .ok()
            .and_then(StoredMetadata::into_metadata)
            .ok_or_else(|| StorageError::BadMetadata(key.to_string()))
    }

    async fn write_metadata(&self, key: &str, metadata: &Metadata) -> StorageResult<()> {
        let encoded = serde_json::to_vec(&StoredMetadata::from(metadata)).map_err(io::Error::other)?;
        let tmp_path = self.meta_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::write(&tmp_path, &encoded).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, self.meta_path(key)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Stream `src` into a temporary file in `files_dir`.
    ///
    /// On success the caller owns the temporary file; on failure it is gone.
    async fn spool(&self, src: &mut ByteSource<'_>) -> StorageResult<(PathBuf, sniff::ContentDigest)> {
        let tmp_path = self.files_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let digest = match sniff::copy_and_digest(src, &mut file).await {
            Ok(digest) => digest,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        };
        if let Err(err) = file.sync_all().await {
            drop(file);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok((tmp_path, digest))
    }
}

/// Available bytes on the mount with the longest prefix of `dir`.
fn available_space(dir: &Path) -> io::Result<u64> {
    let target = std::fs::canonicalize(dir)?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| {
            io::Error::other(format!(
                "could not determine disk space for {}",
                dir.display()
            ))
        })
}

/// Free bytes left once `written` bytes land on a disk that had `available`.
fn remaining_after_write(available: u64, written: u64, required: u64) -> StorageResult<u64> {
    let remaining = available.saturating_sub(written);
    if remaining < required {
        return Err(StorageError::InsufficientDiskSpace {
            available: remaining,
            required,
        });
    }
    Ok(remaining)
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        ensure_key_safe(key)?;
        Ok(fs::try_exists(self.file_path(key)).await?)
    }

    async fn head(&self, key: &str) -> StorageResult<Metadata> {
        ensure_key_safe(key)?;
        self.read_metadata(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<(Metadata, ByteSource<'static>)> {
        ensure_key_safe(key)?;
        let metadata = self.read_metadata(key).await?;
        let file = match File::open(self.file_path(key)).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok((metadata, Box::pin(file)))
    }

    async fn put(
        &self,
        key: &str,
        original_name: &str,
        mut src: ByteSource<'_>,
        expiry: Expiry,
        delete_key: &str,
        access_key: &str,
    ) -> StorageResult<Metadata> {
        ensure_key_safe(key)?;
        let started = Instant::now();
        let snapshot = self.free_space_snapshot().await?;

        let (tmp_path, digest) = self.spool(&mut src).await?;

        if digest.size == 0 {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::FileEmpty);
        }

        if let Some(available) = snapshot {
            if let Err(err) = remaining_after_write(available, digest.size, self.min_free_bytes) {
                let _ = fs::remove_file(&tmp_path).await;
                warn!(key = %key, error = %err, "insufficient disk space after upload");
                return Err(err);
            }
        }

        let listing_path = tmp_path.clone();
        let mimetype = digest.mimetype.clone();
        let archive_entries = tokio::task::spawn_blocking(move || {
            archive::list_archive_entries(&mimetype, &listing_path)
        })
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

        let file_path = self.file_path(key);
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let metadata = Metadata {
            original_name: original_name.to_string(),
            delete_key: delete_key.to_string(),
            access_key: access_key.to_string(),
            content_hash: digest.sha256,
            mimetype: digest.mimetype,
            size: digest.size,
            expiry,
            archive_entries,
        };

        if let Err(err) = self.write_metadata(key, &metadata).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        info!(
            key = %key,
            size_bytes = metadata.size,
            mimetype = %metadata.mimetype,
            duration_ms = started.elapsed().as_millis() as u64,
            "stored file"
        );
        Ok(metadata)
    }

    async fn put_metadata(&self, key: &str, metadata: &Metadata) -> StorageResult<()> {
        ensure_key_safe(key)?;
        if !fs::try_exists(self.file_path(key)).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        self.write_metadata(key, metadata).await
    }

    async fn serve(&self, key: &str, request_headers: &HeaderMap) -> StorageResult<Response> {
        ensure_key_safe(key)?;
        let path = self.file_path(key);
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let mut request = Request::new(Body::empty());
        for name in FORWARDED_HEADERS {
            if let Some(value) = request_headers.get(&name) {
                request.headers_mut().insert(name, value.clone());
            }
        }

        let response = match ServeFile::new(path).oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        Ok(response.map(Body::new))
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        ensure_key_safe(key)?;
        match fs::metadata(self.file_path(key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_safe(key)?;
        let mut missing = 0;
        let mut failures = Vec::new();

        for path in [self.file_path(key), self.meta_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("removed {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => missing += 1,
                Err(err) => failures.push(format!("{}: {err}", path.display())),
            }
        }

        if !failures.is_empty() {
            return Err(StorageError::Delete(failures));
        }
        if missing == 2 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        info!(key = %key, "deleted file");
        Ok(())
    }
}

#[async_trait]
impl EnumerableBackend for LocalFsBackend {
    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.files_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};
    use chrono::{Duration, Utc};
    use sha2::{Digest, Sha256};
    use std::io::Cursor;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    async fn backend(root: &Path) -> LocalFsBackend {
        LocalFsBackend::new(root.join("files"), root.join("meta"), 0.0)
            .await
            .unwrap()
    }

    fn source(bytes: &[u8]) -> ByteSource<'static> {
        Box::pin(Cursor::new(bytes.to_vec()))
    }

    fn dir_names(path: &Path) -> Vec<String> {
        std::fs::read_dir(path)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn put_then_head_round_trips_size_and_hash() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        let body = b"hello, drop";

        let stored = store
            .put("abc123.txt", "notes.txt", source(body), Expiry::Never, "dk", "")
            .await
            .unwrap();
        let head = store.head("abc123.txt").await.unwrap();

        assert_eq!(stored, head);
        assert_eq!(head.size, body.len() as u64);
        assert_eq!(head.content_hash, hex::encode(Sha256::digest(body)));
        assert_eq!(head.mimetype, "text/plain; charset=utf-8");
        assert_eq!(head.expiry, Expiry::Never);
        assert_eq!(store.size("abc123.txt").await.unwrap(), body.len() as u64);

        let (_, mut stream) = store.get("abc123.txt").await.unwrap();
        let mut read_back = Vec::new();
        stream.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, body);
    }

    #[tokio::test]
    async fn empty_put_leaves_no_artifacts() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;

        let err = store
            .put("empty.txt", "empty.txt", source(b""), Expiry::Never, "dk", "")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::FileEmpty));
        assert!(!store.exists("empty.txt").await.unwrap());
        assert!(dir_names(&dir.path().join("files")).is_empty());
        assert!(dir_names(&dir.path().join("meta")).is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_not_found_and_absent() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;

        assert!(!store.exists("nothing.bin").await.unwrap());
        assert!(matches!(
            store.head("nothing.bin").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("nothing.bin").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_metadata_is_reported() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        std::fs::write(dir.path().join("files/bad.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("meta/bad.txt"), b"{not json").unwrap();

        assert!(matches!(
            store.head("bad.txt").await,
            Err(StorageError::BadMetadata(_))
        ));
    }

    #[tokio::test]
    async fn legacy_field_names_are_accepted() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        std::fs::write(dir.path().join("files/old.tar"), b"x").unwrap();
        let legacy = serde_json::json!({
            "original_name": "old.tar",
            "delete_key": "dk",
            "sha256sum": "abcd",
            "mimetype": "application/x-tar",
            "size": 1,
            "expiry": 0,
            "archive_files": ["a", "b"],
        });
        std::fs::write(dir.path().join("meta/old.tar"), legacy.to_string()).unwrap();

        let head = store.head("old.tar").await.unwrap();
        assert_eq!(head.content_hash, "abcd");
        assert_eq!(head.archive_entries, vec!["a", "b"]);
        assert!(head.access_key.is_empty());
        assert!(head.expiry.is_expired());
    }

    #[tokio::test]
    async fn put_metadata_keeps_content() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        let mut metadata = store
            .put("keep.txt", "keep.txt", source(b"content"), Expiry::Never, "dk", "")
            .await
            .unwrap();

        let later = Expiry::At(Utc::now() + Duration::hours(1));
        metadata.expiry = later;
        metadata.access_key = "secret".into();
        store.put_metadata("keep.txt", &metadata).await.unwrap();

        let head = store.head("keep.txt").await.unwrap();
        assert_eq!(head.access_key, "secret");
        assert_eq!(head.expiry.to_epoch(), later.to_epoch());
        assert_eq!(head.content_hash, hex::encode(Sha256::digest(b"content")));
    }

    #[tokio::test]
    async fn delete_removes_content_and_metadata() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        store
            .put("gone.txt", "gone.txt", source(b"bye"), Expiry::Never, "dk", "")
            .await
            .unwrap();

        store.delete("gone.txt").await.unwrap();

        assert!(!store.exists("gone.txt").await.unwrap());
        assert!(matches!(
            store.head("gone.txt").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_skips_temporary_files() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        store
            .put("b.txt", "b.txt", source(b"b"), Expiry::Never, "dk", "")
            .await
            .unwrap();
        store
            .put("a.txt", "a.txt", source(b"a"), Expiry::Never, "dk", "")
            .await
            .unwrap();
        std::fs::write(dir.path().join("files/.tmp-partial"), b"zz").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn serve_honors_range_requests() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        store
            .put("range.txt", "range.txt", source(b"0123456789"), Expiry::Never, "dk", "")
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));
        let response = store.serve("range.txt", &headers).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 2-5/10"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"2345");
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let store = backend(dir.path()).await;
        assert!(matches!(
            store
                .put("../escape", "x", source(b"x"), Expiry::Never, "dk", "")
                .await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn put_refused_when_disk_would_drop_below_minimum() {
        let dir = tempdir().unwrap();
        let store = LocalFsBackend::new(dir.path().join("files"), dir.path().join("meta"), 1e9)
            .await
            .unwrap();

        let err = store
            .put("full.txt", "full.txt", source(b"data"), Expiry::Never, "dk", "")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InsufficientDiskSpace { .. }), "{err:?}");
        assert!(!store.exists("full.txt").await.unwrap());
        assert!(dir_names(&dir.path().join("files")).is_empty());
        assert!(dir_names(&dir.path().join("meta")).is_empty());
    }

    #[test]
    fn remaining_space_is_checked_after_the_write() {
        assert_eq!(remaining_after_write(100, 30, 50).unwrap(), 70);
        assert_eq!(remaining_after_write(100, 50, 50).unwrap(), 50);
        assert!(matches!(
            remaining_after_write(100, 60, 50),
            Err(StorageError::InsufficientDiskSpace {
                available: 40,
                required: 50
            })
        ));
        assert!(matches!(
            remaining_after_write(10, 60, 1),
            Err(StorageError::InsufficientDiskSpace { available: 0, .. })
        ));
    }
}
