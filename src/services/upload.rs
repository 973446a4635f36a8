//! Upload pipeline.
//!
//! Turns an unseekable, size-bounded byte source plus client hints into a
//! stored file under a freshly allocated key. Names, types and hashes are
//! derived here or by the backend, never trusted from the client.

use crate::{
    models::{Expiry, Metadata},
    services::{
        sniff,
        storage::{ByteSource, StorageBackend, StorageError},
    },
};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, distr::Alphanumeric};
use std::{
    io::{self, Cursor},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, info};

const MAX_FILENAME_LEN: usize = 255;
const SLUG_LEN: usize = 10;
const SLUG_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const DELETE_KEY_LEN: usize = 30;
const FALLBACK_EXTENSION: &str = "file";

const COMPRESSED_EXTENSIONS: [&str; 3] = [".bz2", ".gz", ".xz"];
const ARCHIVE_EXTENSIONS: [&str; 1] = [".tar"];

/// Keys that would shadow well-known site paths.
const PROHIBITED_FILENAMES: [&str; 6] = [
    "favicon.ico",
    "index.htm",
    "index.html",
    "index.php",
    "robots.txt",
    "crossdomain.xml",
];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file too large")]
    FileTooLarge,
    #[error("filename too long")]
    FilenameTooLong,
    #[error("forbidden file extension `{0}`")]
    ForbiddenExtension(String),
    #[error("prohibited filename `{0}`")]
    ProhibitedFilename(String),
    #[error("empty file")]
    FileEmpty,
    #[error(transparent)]
    Storage(StorageError),
}

impl UploadError {
    /// Whether the client can fix the request and retry.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, UploadError::Storage(_))
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileEmpty => UploadError::FileEmpty,
            StorageError::Io(ref io_err) if is_size_limit(io_err) => UploadError::FileTooLarge,
            other => UploadError::Storage(other),
        }
    }
}

/// Raised through an [`io::Error`] by [`BoundedReader`].
#[derive(Debug, Error)]
#[error("upload exceeds the {limit} byte limit")]
pub struct SizeLimitExceeded {
    pub limit: u64,
}

fn is_size_limit(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<SizeLimitExceeded>())
}

/// Fails reads once more than `limit` bytes have passed through.
pub struct BoundedReader<R> {
    inner: R,
    limit: u64,
    read: u64,
}

impl<R> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        self.read += (buf.filled().len() - before) as u64;
        if self.read > self.limit {
            return Poll::Ready(Err(io::Error::other(SizeLimitExceeded { limit: self.limit })));
        }
        Poll::Ready(Ok(()))
    }
}

/// Size and extension limits.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_size: u64,
    /// Lowercase extensions without the leading dot.
    pub forbidden_extensions: Vec<String>,
}

/// Default and maximum lifetimes in seconds; zero means unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryPolicy {
    pub default_secs: u64,
    pub default_cli_secs: u64,
    pub max_secs: u64,
}

impl ExpiryPolicy {
    /// Effective lifetime in seconds; zero means the file never expires.
    pub fn resolve_secs(&self, requested: Option<i64>, from_cli: bool) -> u64 {
        let fallback = if from_cli && self.default_cli_secs > 0 {
            self.default_cli_secs
        } else if self.default_secs > 0 {
            self.default_secs
        } else {
            self.max_secs
        };

        let secs = match requested {
            Some(secs) if secs > 0 => secs as u64,
            _ => fallback,
        };

        if self.max_secs > 0 {
            secs.min(self.max_secs)
        } else {
            secs
        }
    }

    pub fn resolve_at(&self, requested: Option<i64>, from_cli: bool, now: DateTime<Utc>) -> Expiry {
        match self.resolve_secs(requested, from_cli) {
            0 => Expiry::Never,
            secs => i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|d| now.checked_add_signed(d))
                .map_or(Expiry::Never, Expiry::At),
        }
    }

    pub fn resolve(&self, requested: Option<i64>, from_cli: bool) -> Expiry {
        self.resolve_at(requested, from_cli, Utc::now())
    }
}

/// Everything the pipeline needs to accept one upload.
pub struct UploadRequest<'a> {
    pub src: ByteSource<'a>,
    /// Declared size; a fast rejection hint only.
    pub size: Option<u64>,
    pub filename: String,
    pub expiry: Option<i64>,
    pub delete_key: Option<String>,
    pub access_key: Option<String>,
    pub from_cli: bool,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub key: String,
    pub metadata: Metadata,
}

#[derive(Clone)]
pub struct UploadPipeline {
    storage: Arc<dyn StorageBackend>,
    policy: UploadPolicy,
    expiry: ExpiryPolicy,
}

impl UploadPipeline {
    pub fn new(storage: Arc<dyn StorageBackend>, policy: UploadPolicy, expiry: ExpiryPolicy) -> Self {
        Self {
            storage,
            policy,
            expiry,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.policy.max_size
    }

    pub async fn process(&self, request: UploadRequest<'_>) -> Result<Upload, UploadError> {
        let started = Instant::now();
        let UploadRequest {
            mut src,
            size,
            filename,
            expiry,
            delete_key,
            access_key,
            from_cli,
        } = request;

        if size.is_some_and(|size| size > self.policy.max_size) {
            return Err(UploadError::FileTooLarge);
        }
        if filename.len() > MAX_FILENAME_LEN {
            return Err(UploadError::FilenameTooLong);
        }
        let filename = sanitize_filename(&filename);

        let (barename, mut extension) = bare_plus_ext(&filename);

        if extension.is_empty() {
            let window = sniff::read_window(&mut src, sniff::SNIFF_WINDOW)
                .await
                .map_err(StorageError::from)?;
            if window.is_empty() {
                return Err(UploadError::FileEmpty);
            }
            let mimetype = sniff::detect_mimetype(&window);
            extension = sniff::extension_for_mimetype(mimetype)
                .unwrap_or(FALLBACK_EXTENSION)
                .to_string();
            debug!(mimetype, extension = %extension, "sniffed extension");
            src = Box::pin(Cursor::new(window).chain(src));
        }

        if self.policy.forbidden_extensions.iter().any(|e| *e == extension) {
            return Err(UploadError::ForbiddenExtension(extension));
        }

        let key = self.allocate_key(&extension).await?;

        if is_prohibited_filename(&key) {
            return Err(UploadError::ProhibitedFilename(key));
        }

        let expiry = self.expiry.resolve(expiry, from_cli);
        let delete_key = delete_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(generate_delete_key);
        let access_key = access_key.unwrap_or_default();
        let original_name = if barename.is_empty() {
            key.clone()
        } else {
            filename
        };

        let metadata = self
            .storage
            .put(&key, &original_name, src, expiry, &delete_key, &access_key)
            .await?;

        info!(
            key = %key,
            size_bytes = metadata.size,
            mimetype = %metadata.mimetype,
            protected = !metadata.access_key.is_empty(),
            duration_ms = started.elapsed().as_millis() as u64,
            "upload accepted"
        );
        Ok(Upload { key, metadata })
    }

    /// Draw slugs until one is free. Not atomic with the following put.
    async fn allocate_key(&self, extension: &str) -> Result<String, UploadError> {
        loop {
            let key = format!("{}.{}", generate_slug(), extension);
            if !self.storage.exists(&key).await? {
                return Ok(key);
            }
            debug!(key = %key, "slug collision, retrying");
        }
    }
}

/// Remove markup tags and control characters. Script and style elements
/// are dropped together with their contents.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(c) = rest.chars().next() {
        if c == '<' {
            let Some(end) = rest.find('>') else {
                break;
            };
            let tag = &rest[1..end];
            rest = &rest[end + 1..];
            if let Some(element) = raw_text_element(tag) {
                let closing = format!("</{element}");
                rest = match rest.to_ascii_lowercase().find(&closing) {
                    Some(at) => rest[at..].find('>').map_or("", |gt| &rest[at + gt + 1..]),
                    None => "",
                };
            }
            continue;
        }
        if c != '>' && !c.is_control() {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// The element name when `tag` opens a `script` or `style` element.
fn raw_text_element(tag: &str) -> Option<&'static str> {
    let name = tag
        .trim_start()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    ["script", "style"].into_iter().find(|element| *element == name)
}

/// Final `.suffix` of the last path element, dot included.
fn split_ext(name: &str) -> (&str, &str) {
    let element_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[element_start..].rfind('.') {
        Some(dot) => name.split_at(element_start + dot),
        None => (name, ""),
    }
}

/// Split a client filename into a sanitized bare-name and extension.
///
/// `archive.tar.gz` keeps `tar.gz` as one extension; any other name splits
/// at the last dot.
pub fn bare_plus_ext(filename: &str) -> (String, String) {
    let lowered = filename.trim().to_lowercase();
    let (mut bare, mut ext) = split_ext(&lowered);

    let fused;
    if COMPRESSED_EXTENSIONS.contains(&ext) {
        let (inner_bare, inner_ext) = split_ext(bare);
        if ARCHIVE_EXTENSIONS.contains(&inner_ext) {
            fused = format!("{inner_ext}{ext}");
            ext = &fused;
            bare = inner_bare;
        }
    }

    let extension: String = ext
        .chars()
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '.'))
        .collect();
    let barename: String = bare
        .chars()
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        .collect();

    (
        barename.trim_matches('-').to_string(),
        extension.trim_matches(|c| c == '-' || c == '.').to_string(),
    )
}

pub fn is_prohibited_filename(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    PROHIBITED_FILENAMES.contains(&lowered.as_str())
}

fn generate_slug() -> String {
    let mut rng = rand::rng();
    (0..SLUG_LEN)
        .map(|_| SLUG_ALPHABET[rng.random_range(0..SLUG_ALPHABET.len())] as char)
        .collect()
}

pub fn generate_delete_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(DELETE_KEY_LEN)
        .map(char::from)
        .collect()
}
