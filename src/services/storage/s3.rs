//! S3-compatible object store backend.
//!
//! Metadata travels as user metadata on the object itself. S3 lowercases
//! user metadata keys, so every lookup is case-insensitive.

use super::{ByteSource, StorageBackend, StorageError, StorageResult, ensure_key_safe};
use crate::{
    models::{Expiry, Metadata},
    services::sniff,
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, meta::region::RegionProviderChain};
use aws_sdk_s3::{
    Client,
    config::http::HttpResponse,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::MetadataDirective,
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use std::{collections::HashMap, io, time::Instant};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

const META_ORIGINAL_NAME: &str = "OriginalName";
const META_EXPIRY: &str = "Expiry";
const META_DELETE_KEY: &str = "Deletekey";
const META_LEGACY_DELETE_KEY: &str = "Delete_key";
const META_SIZE: &str = "Size";
const META_MIMETYPE: &str = "Mimetype";
const META_SHA256: &str = "Sha256sum";
const META_ACCESS_KEY: &str = "AccessKey";

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Build a client from the ambient AWS configuration.
    ///
    /// `endpoint` points the client at an S3-compatible provider such as
    /// MinIO; `force_path_style` is usually required alongside it.
    pub async fn new(
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    ) -> Self {
        let region_provider =
            RegionProviderChain::first_try(region.map(Region::new)).or_default_provider();
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(force_path_style);

        Self {
            client: Client::from_conf(builder.build()),
            bucket,
        }
    }

    /// Cheap reachability probe used by the readiness check.
    pub async fn probe(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| map_sdk_error(&self.bucket, e))?;
        Ok(())
    }
}

fn map_sdk_error<E>(key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err.code() {
        Some("NoSuchKey" | "NotFound") => StorageError::NotFound(key.to_string()),
        _ => StorageError::Transport(DisplayErrorContext(&err).to_string()),
    }
}

fn metadata_to_map(metadata: &Metadata) -> HashMap<String, String> {
    HashMap::from([
        (META_ORIGINAL_NAME.to_string(), metadata.original_name.clone()),
        (META_EXPIRY.to_string(), metadata.expiry.to_epoch().to_string()),
        (META_DELETE_KEY.to_string(), metadata.delete_key.clone()),
        (META_SIZE.to_string(), metadata.size.to_string()),
        (META_MIMETYPE.to_string(), metadata.mimetype.clone()),
        (META_SHA256.to_string(), metadata.content_hash.clone()),
        (META_ACCESS_KEY.to_string(), metadata.access_key.clone()),
    ])
}

fn lookup<'a>(map: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn metadata_from_map(
    key: &str,
    map: Option<&HashMap<String, String>>,
    content_length: Option<i64>,
) -> StorageResult<Metadata> {
    let empty = HashMap::new();
    let map = map.unwrap_or(&empty);
    let unreadable = |field: &str| {
        StorageError::Transport(format!("object `{key}` has unreadable {field} metadata"))
    };

    let expiry = lookup(map, META_EXPIRY)
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(Expiry::from_epoch)
        .ok_or_else(|| unreadable(META_EXPIRY))?;

    let size = match lookup(map, META_SIZE) {
        Some(raw) => raw.parse::<u64>().map_err(|_| unreadable(META_SIZE))?,
        None => content_length
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or_default(),
    };

    let delete_key = lookup(map, META_DELETE_KEY)
        .or_else(|| lookup(map, META_LEGACY_DELETE_KEY))
        .unwrap_or_default();

    Ok(Metadata {
        original_name: lookup(map, META_ORIGINAL_NAME).unwrap_or(key).to_string(),
        delete_key: delete_key.to_string(),
        access_key: lookup(map, META_ACCESS_KEY).unwrap_or_default().to_string(),
        content_hash: lookup(map, META_SHA256).unwrap_or_default().to_string(),
        mimetype: lookup(map, META_MIMETYPE)
            .unwrap_or(sniff::OCTET_STREAM)
            .to_string(),
        size,
        expiry,
        archive_entries: Vec::new(),
    })
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        ensure_key_safe(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match map_sdk_error(key, e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn head(&self, key: &str) -> StorageResult<Metadata> {
        ensure_key_safe(key)?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;
        metadata_from_map(key, output.metadata(), output.content_length())
    }

    async fn get(&self, key: &str) -> StorageResult<(Metadata, ByteSource<'static>)> {
        ensure_key_safe(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;
        let metadata = metadata_from_map(key, output.metadata(), output.content_length())?;
        Ok((metadata, Box::pin(output.body.into_async_read())))
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

        // Spooled to disk so the upload has a known length; removed on drop.
        let spool = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);
        let digest = sniff::copy_and_digest(&mut src, &mut file).await?;
        drop(file);

        if digest.size == 0 {
            return Err(StorageError::FileEmpty);
        }

        let metadata = Metadata {
            original_name: original_name.to_string(),
            delete_key: delete_key.to_string(),
            access_key: access_key.to_string(),
            content_hash: digest.sha256,
            mimetype: digest.mimetype,
            size: digest.size,
            expiry,
            archive_entries: Vec::new(),
        };

        let body = ByteStream::from_path(spool.path())
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(&metadata.mimetype)
            .set_metadata(Some(metadata_to_map(&metadata)))
            .send()
            .await
            .map_err(|e| {
                error!(
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = metadata.size,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "S3 upload failed"
                );
                map_sdk_error(key, e)
            })?;

        info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = metadata.size,
            duration_ms = started.elapsed().as_millis() as u64,
            "stored file"
        );
        Ok(metadata)
    }

    async fn put_metadata(&self, key: &str, metadata: &Metadata) -> StorageResult<()> {
        ensure_key_safe(key)?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(format!("{}/{}", self.bucket, key))
            .metadata_directive(MetadataDirective::Replace)
            .content_type(&metadata.mimetype)
            .set_metadata(Some(metadata_to_map(metadata)))
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;
        Ok(())
    }

    async fn serve(&self, key: &str, request_headers: &HeaderMap) -> StorageResult<Response> {
        ensure_key_safe(key)?;
        let range = request_headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;

        let status = if output.content_range().is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };

        let mut builder = Response::builder()
            .status(status)
            .header(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(len) = output.content_length() {
            builder = builder.header(header::CONTENT_LENGTH, len);
        }
        if let Some(content_range) = output.content_range() {
            builder = builder.header(header::CONTENT_RANGE, content_range);
        }

        let stream = ReaderStream::new(output.body.into_async_read());
        builder
            .body(Body::from_stream(stream))
            .map_err(|e| StorageError::Io(io::Error::other(e)))
    }

    async fn size(&self, key: &str) -> StorageResult<u64> {
        ensure_key_safe(key)?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;
        Ok(output
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_safe(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete(vec![map_sdk_error(key, e).to_string()]))?;
        info!(bucket = %self.bucket, key = %key, "deleted file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> Metadata {
        Metadata {
            original_name: "photo.png".into(),
            delete_key: "dk".into(),
            access_key: "".into(),
            content_hash: "ab12".into(),
            mimetype: "image/png".into(),
            size: 42,
            expiry: Expiry::Never,
            archive_entries: Vec::new(),
        }
    }

    #[test]
    fn metadata_survives_lowercased_keys() {
        let lowered: HashMap<String, String> = metadata_to_map(&sample())
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        let decoded = metadata_from_map("abc.png", Some(&lowered), None).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn legacy_delete_key_is_read() {
        let map = HashMap::from([
            ("expiry".to_string(), "0".to_string()),
            ("delete_key".to_string(), "legacy".to_string()),
        ]);
        let decoded = metadata_from_map("abc.bin", Some(&map), Some(7)).unwrap();
        assert_eq!(decoded.delete_key, "legacy");
        assert_eq!(decoded.size, 7);
        assert_eq!(decoded.original_name, "abc.bin");
        assert!(decoded.expiry.is_expired_at(Utc::now()));
    }

    #[test]
    fn missing_expiry_is_a_transport_error() {
        let map = HashMap::from([("size".to_string(), "1".to_string())]);
        assert!(matches!(
            metadata_from_map("abc.bin", Some(&map), None),
            Err(StorageError::Transport(_))
        ));
    }
}
