//! Site-wide response headers.
//!
//! Served files carry their own Content-Security-Policy and
//! Referrer-Policy; the site defaults fill in only where a handler set none.

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct SecurityHeadersConfig {
    content_security_policy: Option<HeaderValue>,
    referrer_policy: Option<HeaderValue>,
    x_frame_options: Option<HeaderValue>,
    extra: Vec<(HeaderName, HeaderValue)>,
}

/// `None` for an empty setting, which disables the header.
fn optional_value(name: &str, value: &str) -> Result<Option<HeaderValue>> {
    if value.is_empty() {
        return Ok(None);
    }
    HeaderValue::from_str(value)
        .map(Some)
        .with_context(|| format!("invalid {name} header value `{value}`"))
}

/// Parse a `Name: value` header line.
fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = line
        .split_once(": ")
        .with_context(|| format!("header `{line}` is not in `Name: value` form"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("invalid header name in `{line}`"))?;
    let value =
        HeaderValue::from_str(value.trim()).with_context(|| format!("invalid header value in `{line}`"))?;
    Ok((name, value))
}

impl SecurityHeadersConfig {
    pub fn new(
        content_security_policy: &str,
        referrer_policy: &str,
        x_frame_options: &str,
        extra: &[String],
    ) -> Result<Self> {
        Ok(Self {
            content_security_policy: optional_value(
                "Content-Security-Policy",
                content_security_policy,
            )?,
            referrer_policy: optional_value("Referrer-Policy", referrer_policy)?,
            x_frame_options: optional_value("X-Frame-Options", x_frame_options)?,
            extra: extra
                .iter()
                .map(|line| parse_header_line(line))
                .collect::<Result<_>>()?,
        })
    }

    /// Whether any of the policy headers is enabled.
    fn is_hardened(&self) -> bool {
        self.content_security_policy.is_some()
            || self.referrer_policy.is_some()
            || self.x_frame_options.is_some()
    }

    fn apply(&self, headers: &mut HeaderMap) {
        if self.is_hardened() {
            if let Some(csp) = &self.content_security_policy {
                headers
                    .entry(header::CONTENT_SECURITY_POLICY)
                    .or_insert_with(|| csp.clone());
            }
            if let Some(policy) = &self.referrer_policy {
                headers
                    .entry(header::REFERRER_POLICY)
                    .or_insert_with(|| policy.clone());
            }
            if let Some(frame) = &self.x_frame_options {
                headers.insert(header::X_FRAME_OPTIONS, frame.clone());
            }
            headers.insert(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            );
            headers.insert(
                header::X_XSS_PROTECTION,
                HeaderValue::from_static("1; mode=block"),
            );
        }

        for (name, value) in &self.extra {
            headers.append(name.clone(), value.clone());
        }
    }
}

/// Security headers middleware
/// Adds the configured headers to all HTTP responses
pub async fn security_headers_middleware(
    State(config): State<Arc<SecurityHeadersConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    config.apply(response.headers_mut());
    response
}
