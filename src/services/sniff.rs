//! Content sniffing and hashing.
//!
//! Mimetypes are detected from magic bytes in the leading [`SNIFF_WINDOW`]
//! bytes of a stream, never from the filename. [`copy_and_digest`] derives
//! size, SHA-256 and mimetype in a single pass while copying a stream to its
//! destination, so backends never need to re-read what they wrote.

use sha2::{Digest, Sha256};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Number of leading bytes inspected for mimetype detection.
pub const SNIFF_WINDOW: usize = 3072;

const COPY_BUFFER: usize = 64 * 1024;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Size, hash and type of a fully copied stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub size: u64,
    pub sha256: String,
    pub mimetype: String,
}

/// Copy `src` into `dst`, computing the digest of everything copied.
///
/// `dst` is flushed before returning. A zero-length stream yields a digest
/// with `size == 0`; callers decide whether that is an error.
pub async fn copy_and_digest<R, W>(src: &mut R, dst: &mut W) -> io::Result<ContentDigest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut header = Vec::with_capacity(SNIFF_WINDOW);
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size: u64 = 0;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        if header.len() < SNIFF_WINDOW {
            let take = (SNIFF_WINDOW - header.len()).min(n);
            header.extend_from_slice(&chunk[..take]);
        }
        hasher.update(chunk);
        dst.write_all(chunk).await?;
        size += n as u64;
    }
    dst.flush().await?;

    Ok(ContentDigest {
        size,
        sha256: hex::encode(hasher.finalize()),
        mimetype: detect_mimetype(&header).to_string(),
    })
}

/// Read up to `limit` bytes, stopping early only at end of stream.
pub async fn read_window<R>(src: &mut R, limit: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut window = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = src.read(&mut window[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    window.truncate(filled);
    Ok(window)
}

/// Detect a mimetype from leading content bytes.
pub fn detect_mimetype(header: &[u8]) -> &'static str {
    if header.is_empty() {
        return "text/plain";
    }

    let starts = |magic: &[u8]| header.starts_with(magic);

    if starts(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if starts(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if starts(b"GIF87a") || starts(b"GIF89a") {
        "image/gif"
    } else if header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        "image/webp"
    } else if header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WAVE" {
        "audio/wav"
    } else if starts(b"BM") && header.len() >= 14 && header[6..10] == [0, 0, 0, 0] {
        "image/bmp"
    } else if starts(&[0x00, 0x00, 0x01, 0x00]) {
        "image/x-icon"
    } else if starts(b"%PDF-") {
        "application/pdf"
    } else if starts(b"PK\x03\x04") || starts(b"PK\x05\x06") {
        "application/zip"
    } else if starts(&[0x1F, 0x8B]) {
        "application/gzip"
    } else if starts(b"BZh") {
        "application/x-bzip2"
    } else if starts(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]) {
        "application/x-xz"
    } else if starts(b"7z\xBC\xAF\x27\x1C") {
        "application/x-7z-compressed"
    } else if starts(b"Rar!\x1A\x07") {
        "application/x-rar-compressed"
    } else if header.len() >= 262 && &header[257..262] == b"ustar" {
        "application/x-tar"
    } else if header.len() >= 12 && &header[4..8] == b"ftyp" {
        "video/mp4"
    } else if starts(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "video/webm"
    } else if starts(b"OggS") {
        "audio/ogg"
    } else if starts(b"fLaC") {
        "audio/flac"
    } else if starts(b"ID3") || starts(&[0xFF, 0xFB]) || starts(&[0xFF, 0xF3]) {
        "audio/mpeg"
    } else if starts(b"\x7FELF") {
        "application/x-elf"
    } else if starts(b"MZ") {
        "application/vnd.microsoft.portable-executable"
    } else {
        detect_text(header)
    }
}

fn detect_text(header: &[u8]) -> &'static str {
    // A multi-byte character may be cut at the window boundary.
    let valid = match std::str::from_utf8(header) {
        Ok(text) => Some(text),
        Err(err) if err.error_len().is_none() => std::str::from_utf8(&header[..err.valid_up_to()]).ok(),
        Err(_) => None,
    };
    let Some(text) = valid else {
        return OCTET_STREAM;
    };
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0C'))
    {
        return OCTET_STREAM;
    }

    let trimmed = text.trim_start().to_ascii_lowercase();
    if trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html") {
        "text/html; charset=utf-8"
    } else if trimmed.starts_with("<svg") || (trimmed.starts_with("<?xml") && trimmed.contains("<svg")) {
        "image/svg+xml"
    } else if trimmed.starts_with("<?xml") {
        "text/xml; charset=utf-8"
    } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if serde_json::from_str::<serde_json::Value>(text).is_ok() {
            "application/json"
        } else {
            "text/plain; charset=utf-8"
        }
    } else {
        "text/plain; charset=utf-8"
    }
}

/// Canonical file extension (without the dot) for a detected mimetype.
pub fn extension_for_mimetype(mimetype: &str) -> Option<&'static str> {
    let essence = mimetype.split(';').next().unwrap_or(mimetype).trim();
    let ext = match essence {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/x-icon" => "ico",
        "image/svg+xml" => "svg",
        "audio/wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/flac" => "flac",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/gzip" => "gz",
        "application/x-bzip2" => "bz2",
        "application/x-xz" => "xz",
        "application/x-7z-compressed" => "7z",
        "application/x-rar-compressed" => "rar",
        "application/x-tar" => "tar",
        "application/vnd.microsoft.portable-executable" => "exe",
        "application/json" => "json",
        "text/html" => "html",
        "text/xml" => "xml",
        "text/plain" => "txt",
        _ => return None,
    };
    Some(ext)
}
