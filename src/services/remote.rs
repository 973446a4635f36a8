//! Fetching a remote URL to republish it as an upload.

use crate::services::{storage::ByteSource, upload::BoundedReader};
use futures::TryStreamExt;
use reqwest::{Client, Url};
use std::{io, time::Duration};
use thiserror::Error;
use tokio_util::io::StreamReader;
use tracing::debug;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid remote url `{0}`")]
    InvalidUrl(String),
    #[error("could not retrieve url: {0}")]
    Request(#[from] reqwest::Error),
    #[error("remote server answered {0}")]
    Status(u16),
}

/// A fetched body ready to be fed into the upload pipeline.
pub struct RemoteFile {
    pub filename: String,
    /// `Content-Length` as announced by the remote server.
    pub size: Option<u64>,
    pub src: ByteSource<'static>,
}

#[derive(Clone)]
pub struct RemoteFetcher {
    client: Client,
    max_size: u64,
}

impl RemoteFetcher {
    pub fn new(max_size: u64) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client, max_size })
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<RemoteFile, RemoteError> {
        let url = parse_remote_url(raw_url)?;
        let filename = filename_from_url(&url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RemoteError::Status(response.status().as_u16()));
        }
        let size = response.content_length();
        debug!(url = %raw_url, size_bytes = ?size, "fetching remote file");

        let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let reader = BoundedReader::new(StreamReader::new(stream), self.max_size);

        Ok(RemoteFile {
            filename,
            size,
            src: Box::pin(reader),
        })
    }
}

fn parse_remote_url(raw: &str) -> Result<Url, RemoteError> {
    let url = Url::parse(raw.trim()).map_err(|_| RemoteError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(RemoteError::InvalidUrl(raw.to_string())),
    }
}

/// Last non-empty path segment, or empty when the path has none.
fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_urls_are_fetched() {
        assert!(parse_remote_url("https://example.com/a.png").is_ok());
        assert!(parse_remote_url(" http://example.com/ ").is_ok());
        assert!(matches!(
            parse_remote_url("file:///etc/passwd"),
            Err(RemoteError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_remote_url("not a url"),
            Err(RemoteError::InvalidUrl(_))
        ));
    }

    #[test]
    fn filename_is_last_path_segment() {
        let name = |s| filename_from_url(&Url::parse(s).unwrap());
        assert_eq!(name("https://example.com/dir/file.tar.gz?x=1"), "file.tar.gz");
        assert_eq!(name("https://example.com/dir/"), "dir");
        assert_eq!(name("https://example.com"), "");
    }
}
