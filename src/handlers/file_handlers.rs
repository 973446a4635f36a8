//! Retrieval and deletion of stored files.

use super::{
    DELETE_KEY_HEADER, append_cookies, cookie_value, header_string, is_foreign_referer, site_url,
    user_agent, wants_json,
};
use crate::{
    errors::AppError,
    models::{Expiry, Metadata},
    services::{
        access::{
            ACCESS_KEY_NAME, AccessDecision, AccessError, Credentials, authorize_delete,
            is_cli_user_agent,
        },
        expiry::check_file,
        storage::StorageError,
    },
    state::{AppState, HttpSettings},
};
use axum::{
    Form, Json,
    extract::{FromRequest, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Deserialize)]
pub struct AccessParams {
    pub access_key: Option<String>,
}

#[derive(Serialize)]
struct FileInfo<'a> {
    filename: &'a str,
    original_name: &'a str,
    url: String,
    direct_url: String,
    expiry: Expiry,
    size: u64,
    mimetype: &'a str,
    sha256sum: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    archive_entries: Option<&'a [String]>,
}

fn denied_response(decision: &AccessDecision) -> Response {
    let mut response = AppError::from(AccessError::InvalidAccessKey).into_response();
    append_cookies(response.headers_mut(), decision.cookie.as_ref());
    response
}

/// `GET|POST /{name}`
///
/// Describes a file as JSON once the access key gate passes. Scripted
/// clients that did not ask for JSON get the raw file instead.
pub async fn display_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    let query_key = Query::<AccessParams>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(p)| p.access_key);

    if !state.settings.no_direct_agents
        && is_cli_user_agent(user_agent(&headers))
        && !wants_json(&headers)
    {
        return serve_gated(&state, &name, &headers, query_key, false).await;
    }

    let form_key = if request.method() == Method::POST {
        Form::<AccessParams>::from_request(request, &state)
            .await
            .ok()
            .and_then(|Form(p)| p.access_key)
    } else {
        None
    };

    let metadata = check_file(state.storage.as_ref(), &name).await?;
    let credentials = Credentials {
        cookie: cookie_value(&headers, ACCESS_KEY_NAME),
        header: header_string(&headers, ACCESS_KEY_NAME),
        form: form_key,
        query: query_key,
    };
    let decision = state.gate.check(&name, &metadata.access_key, &credentials);
    if !decision.is_granted() {
        return Ok(denied_response(&decision));
    }

    let base = site_url(&state.settings, &headers);
    let mut response = Json(FileInfo {
        filename: &name,
        original_name: &metadata.original_name,
        url: format!("{base}{name}"),
        direct_url: format!("{base}{}/{name}", state.settings.selif_path),
        expiry: metadata.expiry,
        size: metadata.size,
        mimetype: &metadata.mimetype,
        sha256sum: &metadata.content_hash,
        archive_entries: (!metadata.archive_entries.is_empty())
            .then_some(metadata.archive_entries.as_slice()),
    })
    .into_response();
    append_cookies(response.headers_mut(), decision.cookie.as_ref());
    Ok(response)
}

/// `GET /{selif}/{name}`
///
/// Requests referred from another site are sent to the file page instead
/// unless hotlinking is allowed.
pub async fn serve_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<AccessParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_gated(&state, &name, &headers, params.access_key, true).await
}

async fn serve_gated(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
    query_key: Option<String>,
    guard_hotlink: bool,
) -> Result<Response, AppError> {
    let metadata = check_file(state.storage.as_ref(), name).await?;
    let credentials = Credentials {
        cookie: cookie_value(headers, ACCESS_KEY_NAME),
        header: header_string(headers, ACCESS_KEY_NAME),
        form: None,
        query: query_key,
    };
    let decision = state.gate.check(name, &metadata.access_key, &credentials);
    if !decision.is_granted() {
        return Ok(denied_response(&decision));
    }

    if guard_hotlink
        && !state.settings.allow_hotlink
        && is_foreign_referer(headers, &site_url(&state.settings, headers))
    {
        debug!(key = %name, "redirecting hotlinked file to its page");
        return Ok(Redirect::to(&format!("{}{name}", state.settings.site_path)).into_response());
    }

    let mut response = state.storage.serve(name, headers).await?;
    if response.status().is_success() {
        set_file_headers(response.headers_mut(), &metadata, &state.settings);
    }
    append_cookies(response.headers_mut(), decision.cookie.as_ref());
    Ok(response)
}

fn set_file_headers(headers: &mut HeaderMap, metadata: &Metadata, settings: &HttpSettings) {
    let mut set = |name: header::HeaderName, value: String| match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(err) => warn!(header = %name, error = %err, "skipping unencodable header"),
    };

    set(header::CONTENT_TYPE, metadata.mimetype.clone());
    if !metadata.original_name.is_empty() {
        set(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                metadata.original_name.replace('"', "")
            ),
        );
    }
    set(header::ETAG, format!("\"{}\"", metadata.content_hash));
    set(header::CACHE_CONTROL, "public, no-cache".into());
    if !settings.file_content_security_policy.is_empty() {
        set(
            header::CONTENT_SECURITY_POLICY,
            settings.file_content_security_policy.clone(),
        );
    }
    if !settings.file_referrer_policy.is_empty() {
        set(header::REFERRER_POLICY, settings.file_referrer_policy.clone());
    }
}

/// `DELETE /{name}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let presented = header_string(&headers, DELETE_KEY_HEADER).unwrap_or_default();

    let metadata = match state.storage.head(&name).await {
        Ok(metadata) => metadata,
        Err(StorageError::NotFound(_) | StorageError::InvalidKey(_)) => {
            return Err(AppError::not_found("file not found"));
        }
        Err(err) => {
            warn!(key = %name, error = %err, "delete refused, metadata unavailable");
            return Err(AppError::unauthorized("metadata unavailable"));
        }
    };

    if !authorize_delete(&metadata, &presented, state.settings.anyone_can_delete) {
        return Err(AppError::unauthorized("invalid delete key"));
    }

    state.storage.delete(&name).await.map_err(|err| {
        error!(key = %name, error = %err, "delete failed");
        AppError::internal("could not delete")
    })?;

    info!(key = %name, "file deleted on request");
    Ok((StatusCode::OK, "DELETED").into_response())
}
