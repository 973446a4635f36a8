//! HTTP handlers and the request plumbing they share.

pub mod file_handlers;
pub mod health_handlers;
pub mod upload_handlers;

use crate::{services::access::CookieInstruction, state::HttpSettings};
use axum::http::{HeaderMap, HeaderValue, header};
use reqwest::Url;
use tracing::warn;

pub const DELETE_KEY_HEADER: &str = "Drop-Delete-Key";
pub const EXPIRY_HEADER: &str = "Drop-Expiry";

/// Trimmed, non-empty value of a request header.
pub(crate) fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"))
}

pub(crate) fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// First cookie named `name` across all `Cookie` headers.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"').to_string())
}

/// Absolute URL of the site root, always ending in `/`.
pub(crate) fn site_url(settings: &HttpSettings, headers: &HeaderMap) -> String {
    if let Some(url) = &settings.site_url {
        return if url.ends_with('/') {
            url.clone()
        } else {
            format!("{url}/")
        };
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{scheme}://{host}{}", settings.site_path)
}

/// Whether a non-empty `Referer` names a different origin than `site_url`.
/// Unparseable referers count as foreign.
pub(crate) fn is_foreign_referer(headers: &HeaderMap, site_url: &str) -> bool {
    let Some(referer) = headers
        .get(header::REFERER)
        .map(|v| v.to_str().unwrap_or("<opaque>"))
        .filter(|v| !v.is_empty())
    else {
        return false;
    };
    match (Url::parse(referer), Url::parse(site_url)) {
        (Ok(referer), Ok(site)) => referer.origin() != site.origin(),
        _ => true,
    }
}

pub(crate) fn append_cookies(headers: &mut HeaderMap, instruction: Option<&CookieInstruction>) {
    let Some(instruction) = instruction else {
        return;
    };
    for value in instruction.header_values() {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(err) => warn!(error = %err, "dropping unencodable cookie"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1; Drop-Access-Key=k1"));
        headers.append(header::COOKIE, HeaderValue::from_static("Drop-Access-Key=k2"));
        assert_eq!(cookie_value(&headers, "Drop-Access-Key").as_deref(), Some("k1"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn referers_from_other_origins_are_foreign() {
        let site = "https://drop.example/files/";
        let with_referer = |value: &'static str| {
            let mut headers = HeaderMap::new();
            headers.insert(header::REFERER, HeaderValue::from_static(value));
            headers
        };

        assert!(!is_foreign_referer(&HeaderMap::new(), site));
        assert!(!is_foreign_referer(&with_referer(""), site));
        assert!(!is_foreign_referer(&with_referer("https://drop.example/abc.png"), site));
        assert!(is_foreign_referer(&with_referer("https://forum.example/thread"), site));
        assert!(is_foreign_referer(&with_referer("http://drop.example/abc.png"), site));
        assert!(is_foreign_referer(&with_referer("garbage"), site));
    }

    #[test]
    fn site_url_prefers_configuration() {
        let mut settings = HttpSettings {
            site_url: None,
            site_path: "/drop/".into(),
            selif_path: "selif".into(),
            max_size: 1,
            anyone_can_delete: false,
            no_direct_agents: false,
            file_content_security_policy: String::new(),
            file_referrer_policy: String::new(),
            allow_hotlink: false,
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("files.test"));
        assert_eq!(site_url(&settings, &headers), "http://files.test/drop/");

        settings.site_url = Some("https://drop.example".into());
        assert_eq!(site_url(&settings, &headers), "https://drop.example/");
    }
}
