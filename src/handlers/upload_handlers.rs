//! Upload endpoints.
//!
//! - `PUT  /upload[/{name}]` -> raw request body
//! - `POST /upload[/{name}]` -> multipart `file` field, or a urlencoded paste form
//!
//! Multipart text fields apply wherever they sit relative to `file`. The
//! file part is spooled to an anonymous temporary file until every field has
//! been read.
//! - `POST /upload/remote` -> fetch a URL and store its body

use super::{DELETE_KEY_HEADER, EXPIRY_HEADER, header_string, site_url, user_agent, wants_json};
use crate::{
    errors::AppError,
    models::Expiry,
    services::{
        access::{ACCESS_KEY_NAME, ACCESS_KEY_PARAM, is_cli_user_agent},
        storage::{ByteSource, StorageError},
        upload::{BoundedReader, Upload, UploadError, UploadRequest},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequest, Multipart, Path, Query, Request, State, multipart::Field},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, io, io::Cursor};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;

const PASTE_DEFAULT_EXTENSION: &str = "txt";

#[derive(Serialize)]
struct UploadResponse<'a> {
    url: String,
    direct_url: String,
    filename: &'a str,
    original_name: &'a str,
    delete_key: &'a str,
    access_key: &'a str,
    expiry: Expiry,
    size: u64,
    mimetype: &'a str,
    sha256sum: &'a str,
}

/// JSON for clients that ask for it, otherwise the file URL as text.
fn upload_response(state: &AppState, headers: &HeaderMap, upload: &Upload) -> Response {
    let base = site_url(&state.settings, headers);
    let url = format!("{base}{}", upload.key);
    if !wants_json(headers) {
        return (StatusCode::OK, format!("{url}\n")).into_response();
    }

    let metadata = &upload.metadata;
    Json(UploadResponse {
        direct_url: format!("{base}{}/{}", state.settings.selif_path, upload.key),
        url,
        filename: &upload.key,
        original_name: &metadata.original_name,
        delete_key: &metadata.delete_key,
        access_key: &metadata.access_key,
        expiry: metadata.expiry,
        size: metadata.size,
        mimetype: &metadata.mimetype,
        sha256sum: &metadata.content_hash,
    })
    .into_response()
}

fn parse_expiry(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
}

fn bounded_body(body: Body, limit: u64) -> ByteSource<'static> {
    let stream = Box::pin(body.into_data_stream().map_err(io::Error::other));
    Box::pin(BoundedReader::new(StreamReader::new(stream), limit))
}

fn declared_size(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// `PUT /upload`
pub async fn upload_put(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    put_upload(&state, &headers, String::new(), body).await
}

/// `PUT /upload/{name}`
pub async fn upload_put_named(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    put_upload(&state, &headers, name, body).await
}

async fn put_upload(
    state: &AppState,
    headers: &HeaderMap,
    filename: String,
    body: Body,
) -> Result<Response, AppError> {
    let request = UploadRequest {
        src: bounded_body(body, state.pipeline.max_size()),
        size: declared_size(headers),
        filename,
        expiry: parse_expiry(headers.get(EXPIRY_HEADER).and_then(|v| v.to_str().ok())),
        delete_key: header_string(headers, DELETE_KEY_HEADER),
        access_key: header_string(headers, ACCESS_KEY_NAME),
        from_cli: is_cli_user_agent(user_agent(headers)),
    };
    let upload = state.pipeline.process(request).await?;
    Ok(upload_response(state, headers, &upload))
}

#[derive(Debug, Deserialize)]
pub struct PasteForm {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub delete_key: Option<String>,
}

/// `POST /upload`
pub async fn upload_post(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    let is_multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        multipart_upload(&state, &headers, multipart).await
    } else {
        let axum::Form(paste) = axum::Form::<PasteForm>::from_request(request, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        paste_upload(&state, &headers, paste).await
    }
}

/// The `file` part of a multipart upload, copied aside so the fields that
/// follow it can still be read.
struct SpooledPart {
    filename: String,
    size: u64,
    file: tokio::fs::File,
}

async fn spool_part(field: Field<'_>, limit: u64) -> io::Result<SpooledPart> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let stream = Box::pin(field.map_err(io::Error::other));
    let mut reader = BoundedReader::new(StreamReader::new(stream), limit);

    let spool = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(io::Error::other)??;
    let mut file = tokio::fs::File::from_std(spool);
    let size = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    file.rewind().await?;
    Ok(SpooledPart {
        filename,
        size,
        file,
    })
}

async fn multipart_upload(
    state: &AppState,
    headers: &HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut part: Option<SpooledPart> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name != "file" {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::bad_request(e.body_text()))?;
            fields.insert(name, value);
            continue;
        }
        if part.is_some() {
            debug!("ignoring extra `file` field");
            continue;
        }

        debug!(filename = ?field.file_name(), "receiving multipart upload");
        let spooled = spool_part(field, state.pipeline.max_size())
            .await
            .map_err(|e| AppError::from(UploadError::from(StorageError::from(e))))?;
        part = Some(spooled);
    }

    let Some(part) = part else {
        return Err(AppError::bad_request("missing `file` field"));
    };

    let field_or_header = |field: &str, header_name: &str| {
        fields
            .get(field)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| header_string(headers, header_name))
    };

    let request = UploadRequest {
        src: Box::pin(part.file),
        size: Some(part.size),
        filename: part.filename,
        expiry: parse_expiry(fields.get("expires").map(String::as_str))
            .or_else(|| parse_expiry(headers.get(EXPIRY_HEADER).and_then(|v| v.to_str().ok()))),
        delete_key: field_or_header("delete_key", DELETE_KEY_HEADER),
        access_key: field_or_header(ACCESS_KEY_PARAM, ACCESS_KEY_NAME),
        from_cli: is_cli_user_agent(user_agent(headers)),
    };
    let upload = state.pipeline.process(request).await?;
    Ok(upload_response(state, headers, &upload))
}

async fn paste_upload(
    state: &AppState,
    headers: &HeaderMap,
    paste: PasteForm,
) -> Result<Response, AppError> {
    let extension = paste
        .extension
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| PASTE_DEFAULT_EXTENSION.to_string());
    let filename = format!("{}.{}", paste.filename.unwrap_or_default(), extension);
    let bytes = paste.content.into_bytes();

    let request = UploadRequest {
        size: Some(bytes.len() as u64),
        src: Box::pin(Cursor::new(bytes)),
        filename,
        expiry: parse_expiry(paste.expires.as_deref()),
        delete_key: paste.delete_key,
        access_key: paste.access_key,
        from_cli: is_cli_user_agent(user_agent(headers)),
    };
    let upload = state.pipeline.process(request).await?;
    Ok(upload_response(state, headers, &upload))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteParams {
    #[serde(default)]
    pub url: String,
    pub access_key: Option<String>,
    pub deletekey: Option<String>,
    pub expiry: Option<String>,
}

/// `POST /upload/remote`
pub async fn upload_remote(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    let Some(fetcher) = state.remote.clone() else {
        return Err(AppError::not_found("remote upload is disabled"));
    };
    let headers = request.headers().clone();

    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    let params = if is_form {
        axum::Form::<RemoteParams>::from_request(request, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?
            .0
    } else {
        Query::<RemoteParams>::try_from_uri(request.uri())
            .map_err(|e| AppError::bad_request(e.body_text()))?
            .0
    };
    if params.url.trim().is_empty() {
        return Err(AppError::bad_request("missing `url` parameter"));
    }

    let remote = fetcher.fetch(&params.url).await?;
    let request = UploadRequest {
        src: remote.src,
        size: remote.size,
        filename: remote.filename,
        expiry: parse_expiry(params.expiry.as_deref()),
        delete_key: params.deletekey,
        access_key: params.access_key,
        from_cli: true,
    };
    let upload = state.pipeline.process(request).await?;
    Ok(upload_response(&state, &headers, &upload))
}
