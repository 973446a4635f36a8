//! Defines the routes of the file drop.
//!
//! ## Structure
//! - **Uploads**
//!   - `PUT    /upload` -> raw body, filename derived from the content
//!   - `PUT    /upload/{name}` -> raw body with a client supplied filename
//!   - `POST   /upload` -> multipart `file` field or urlencoded paste form
//!   - `POST   /upload/remote` -> fetch a URL and store the response body
//!
//! - **Files**
//!   - `GET|POST /{name}` -> file description, or raw content for scripted clients
//!   - `DELETE   /{name}` -> delete with the `Drop-Delete-Key` header
//!   - `GET      /{selif}/{name}` -> raw content with range support
//!
//! Everything except the health endpoints is mounted under the configured
//! site path. `{selif}` is configurable too, so both are assembled at
//! startup. `/upload/` and `POST /upload/{name}` are accepted as aliases.

use crate::{
    handlers::{
        file_handlers::{delete_file, display_file, serve_file},
        health_handlers::{healthz, readyz},
        upload_handlers::{upload_post, upload_put, upload_put_named, upload_remote},
    },
    middleware::security_headers::security_headers_middleware,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post, put},
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Headroom for multipart framing and form fields on top of the file itself.
const BODY_OVERHEAD: u64 = 1024 * 1024;

/// Build the router for every endpoint, still waiting for its state.
pub fn routes(site_path: &str, selif_path: &str) -> Router<AppState> {
    let site = Router::new()
        // uploads
        .route("/upload", put(upload_put).post(upload_post))
        .route("/upload/", put(upload_put).post(upload_post))
        .route("/upload/remote", post(upload_remote))
        .route("/upload/{name}", put(upload_put_named).post(upload_post))
        // raw content
        .route(&format!("/{selif_path}/{{name}}"), get(serve_file))
        // file pages
        .route(
            "/{name}",
            get(display_file).post(display_file).delete(delete_file),
        );

    // health endpoints (always mounted at root)
    let health = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));

    match site_path.trim_matches('/') {
        "" => health.merge(site),
        prefix => health.nest(&format!("/{prefix}"), site),
    }
}

/// The complete application: routes, state and the request layers.
///
/// Axum's default 2 MB body cap is replaced with one derived from the
/// configured upload limit.
pub fn app(state: AppState) -> Router {
    let body_limit = usize::try_from(state.settings.max_size.saturating_add(BODY_OVERHEAD))
        .unwrap_or(usize::MAX);

    routes(&state.settings.site_path, &state.settings.selif_path)
        .layer(from_fn_with_state(
            state.security_headers.clone(),
            security_headers_middleware,
        ))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
