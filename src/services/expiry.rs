//! Lazy expiry on the access path.

use crate::{
    models::Metadata,
    services::storage::{StorageBackend, StorageError, StorageResult},
};
use tracing::{info, warn};

/// Head `key`, reaping it first if it has expired.
///
/// An expired file is reported as [`StorageError::NotFound`], the same shape
/// as a key that never existed. A failed delete is logged and the caller
/// still sees `NotFound`.
pub async fn check_file(storage: &dyn StorageBackend, key: &str) -> StorageResult<Metadata> {
    let metadata = storage.head(key).await?;
    if !metadata.expiry.is_expired() {
        return Ok(metadata);
    }

    match storage.delete(key).await {
        Ok(()) => info!(key = %key, "reaped expired file on access"),
        Err(err) => warn!(key = %key, error = %err, "failed to delete expired file"),
    }
    Err(StorageError::NotFound(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::Expiry, services::storage::LocalFsBackend};
    use chrono::{Duration, Utc};
    use std::io::Cursor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn expired_file_is_removed_on_access() {
        let dir = tempdir().unwrap();
        let store = LocalFsBackend::new(dir.path().join("files"), dir.path().join("meta"), 0.0)
            .await
            .unwrap();
        let past = Expiry::At(Utc::now() - Duration::seconds(5));
        store
            .put("old.txt", "old.txt", Box::pin(Cursor::new(b"stale".to_vec())), past, "dk", "")
            .await
            .unwrap();
        store
            .put("new.txt", "new.txt", Box::pin(Cursor::new(b"fresh".to_vec())), Expiry::Never, "dk", "")
            .await
            .unwrap();

        assert!(matches!(
            check_file(&store, "old.txt").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.exists("old.txt").await.unwrap());
        assert!(check_file(&store, "new.txt").await.is_ok());
    }
}
