//! Access key gate.
//!
//! Decides whether a request may see a protected file and which credential
//! source decided it. Cookie side effects are returned as instructions; the
//! HTTP layer renders them.

use crate::models::Metadata;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::LazyLock;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Cookie and header name carrying the access key.
pub const ACCESS_KEY_NAME: &str = "Drop-Access-Key";

/// Form field and query parameter carrying the access key.
pub const ACCESS_KEY_PARAM: &str = "access_key";

static CLI_USER_AGENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(lib)?curl|wget|java|python|go-http-client").expect("valid user agent regex")
});

/// Whether a `User-Agent` belongs to a scripted client.
pub fn is_cli_user_agent(user_agent: &str) -> bool {
    CLI_USER_AGENT.is_match(user_agent)
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid access key")]
    InvalidAccessKey,
}

/// Where a presented credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    None,
    Cookie,
    Header,
    Form,
    Query,
}

/// Credential values already pulled out of a request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub cookie: Option<String>,
    pub header: Option<String>,
    pub form: Option<String>,
    pub query: Option<String>,
}

impl Credentials {
    fn in_precedence_order(&self) -> [(CredentialSource, Option<&str>); 4] {
        [
            (CredentialSource::Cookie, self.cookie.as_deref()),
            (CredentialSource::Header, self.header.as_deref()),
            (CredentialSource::Form, self.form.as_deref()),
            (CredentialSource::Query, self.query.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieExpiry {
    Session,
    At(DateTime<Utc>),
}

/// Cookie the caller should emit, once per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieInstruction {
    Set {
        value: String,
        paths: [String; 2],
        expiry: CookieExpiry,
    },
    Clear {
        paths: [String; 2],
    },
}

impl CookieInstruction {
    /// Render as `Set-Cookie` header values.
    pub fn header_values(&self) -> Vec<String> {
        match self {
            CookieInstruction::Set {
                value,
                paths,
                expiry,
            } => {
                let value = cookie_safe(value);
                let expires = match expiry {
                    CookieExpiry::Session => String::new(),
                    CookieExpiry::At(at) => format!("; Expires={}", http_date(*at)),
                };
                paths
                    .iter()
                    .map(|path| format!("{ACCESS_KEY_NAME}={value}; Path={path}{expires}; HttpOnly"))
                    .collect()
            }
            CookieInstruction::Clear { paths } => paths
                .iter()
                .map(|path| {
                    format!(
                        "{ACCESS_KEY_NAME}=; Path={path}; Expires={}; Max-Age=0; HttpOnly",
                        http_date(DateTime::UNIX_EPOCH)
                    )
                })
                .collect(),
        }
    }
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Drop bytes that are not valid in a cookie value.
fn cookie_safe(value: &str) -> String {
    value
        .chars()
        .filter(|c| matches!(c, '\x21' | '\x23'..='\x2B' | '\x2D'..='\x3A' | '\x3C'..='\x5B' | '\x5D'..='\x7E'))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub outcome: AccessOutcome,
    pub source: CredentialSource,
    pub cookie: Option<CookieInstruction>,
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        self.outcome == AccessOutcome::Granted
    }

    pub fn into_result(self) -> Result<Self, AccessError> {
        match self.outcome {
            AccessOutcome::Granted => Ok(self),
            AccessOutcome::Denied => Err(AccessError::InvalidAccessKey),
        }
    }
}

/// Cookie scoping and lifetime.
#[derive(Debug, Clone)]
pub struct AccessCookiePolicy {
    /// Site path prefix with leading and trailing `/`.
    pub site_path: String,
    /// Raw-serve prefix without slashes.
    pub selif_path: String,
    /// Zero means a session cookie.
    pub cookie_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AccessKeyGate {
    policy: AccessCookiePolicy,
}

impl AccessKeyGate {
    pub fn new(policy: AccessCookiePolicy) -> Self {
        Self { policy }
    }

    fn cookie_paths(&self, key: &str) -> [String; 2] {
        let site = &self.policy.site_path;
        [
            format!("{site}{key}"),
            format!("{site}{}/{key}", self.policy.selif_path),
        ]
    }

    pub fn check(&self, key: &str, stored_access_key: &str, credentials: &Credentials) -> AccessDecision {
        self.check_at(key, stored_access_key, credentials, Utc::now())
    }

    pub fn check_at(
        &self,
        key: &str,
        stored_access_key: &str,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        if stored_access_key.is_empty() {
            return AccessDecision {
                outcome: AccessOutcome::Granted,
                source: CredentialSource::None,
                cookie: None,
            };
        }

        let presented = credentials
            .in_precedence_order()
            .into_iter()
            .find_map(|(source, value)| value.filter(|v| !v.is_empty()).map(|v| (source, v)));

        let Some((source, value)) = presented else {
            return AccessDecision {
                outcome: AccessOutcome::Denied,
                source: CredentialSource::None,
                cookie: None,
            };
        };

        if secure_compare(value, stored_access_key) {
            let expiry = match self.policy.cookie_ttl_secs {
                0 => CookieExpiry::Session,
                ttl => i64::try_from(ttl)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|d| now.checked_add_signed(d))
                    .map_or(CookieExpiry::Session, CookieExpiry::At),
            };
            return AccessDecision {
                outcome: AccessOutcome::Granted,
                source,
                cookie: Some(CookieInstruction::Set {
                    value: stored_access_key.to_string(),
                    paths: self.cookie_paths(key),
                    expiry,
                }),
            };
        }

        let cookie = (source == CredentialSource::Cookie).then(|| CookieInstruction::Clear {
            paths: self.cookie_paths(key),
        });
        AccessDecision {
            outcome: AccessOutcome::Denied,
            source,
            cookie,
        }
    }
}

fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Whether `presented` may delete the file described by `metadata`.
pub fn authorize_delete(metadata: &Metadata, presented: &str, anyone_can_delete: bool) -> bool {
    anyone_can_delete || (!presented.is_empty() && secure_compare(presented, &metadata.delete_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Expiry;

    fn gate(ttl: u64) -> AccessKeyGate {
        AccessKeyGate::new(AccessCookiePolicy {
            site_path: "/".into(),
            selif_path: "selif".into(),
            cookie_ttl_secs: ttl,
        })
    }

    fn creds(cookie: Option<&str>, header: Option<&str>, form: Option<&str>, query: Option<&str>) -> Credentials {
        Credentials {
            cookie: cookie.map(Into::into),
            header: header.map(Into::into),
            form: form.map(Into::into),
            query: query.map(Into::into),
        }
    }

    #[test]
    fn public_files_need_no_credentials() {
        let decision = gate(0).check("a.txt", "", &creds(Some("junk"), None, None, None));
        assert!(decision.is_granted());
        assert_eq!(decision.source, CredentialSource::None);
        assert_eq!(decision.cookie, None);
    }

    #[test]
    fn cookie_takes_precedence_over_header() {
        let decision = gate(0).check("a.txt", "k", &creds(Some("k"), Some("wrong"), None, None));
        assert!(decision.is_granted());
        assert_eq!(decision.source, CredentialSource::Cookie);
    }

    #[test]
    fn first_present_source_decides() {
        let decision = gate(0).check("a.txt", "k", &creds(None, Some("wrong"), Some("k"), Some("k")));
        assert_eq!(decision.outcome, AccessOutcome::Denied);
        assert_eq!(decision.source, CredentialSource::Header);
        assert_eq!(decision.cookie, None);

        let decision = gate(0).check("a.txt", "k", &creds(Some(""), None, None, Some("k")));
        assert!(decision.is_granted());
        assert_eq!(decision.source, CredentialSource::Query);
    }

    #[test]
    fn no_credentials_is_denied_without_source() {
        let decision = gate(0).check("a.txt", "k", &Credentials::default());
        assert_eq!(decision.outcome, AccessOutcome::Denied);
        assert_eq!(decision.source, CredentialSource::None);
        assert!(matches!(decision.into_result(), Err(AccessError::InvalidAccessKey)));
    }

    #[test]
    fn wrong_cookie_is_cleared_on_both_paths() {
        let decision = gate(0).check("a.txt", "k", &creds(Some("stale"), Some("k"), None, None));
        assert_eq!(decision.outcome, AccessOutcome::Denied);
        assert_eq!(
            decision.cookie,
            Some(CookieInstruction::Clear {
                paths: ["/a.txt".into(), "/selif/a.txt".into()]
            })
        );
        let headers = decision.cookie.unwrap().header_values();
        assert!(headers[0].starts_with("Drop-Access-Key=; Path=/a.txt; Expires=Thu, 01 Jan 1970"));
    }

    #[test]
    fn grant_sets_cookie_with_configured_lifetime() {
        let now = Utc::now();
        let decision = gate(60).check_at("a.txt", "k", &creds(None, None, Some("k"), None), now);
        assert_eq!(
            decision.cookie,
            Some(CookieInstruction::Set {
                value: "k".into(),
                paths: ["/a.txt".into(), "/selif/a.txt".into()],
                expiry: CookieExpiry::At(now + Duration::seconds(60)),
            })
        );

        let session = gate(0).check("a.txt", "k", &creds(None, Some("k"), None, None));
        let headers = session.cookie.unwrap().header_values();
        assert_eq!(
            headers,
            vec![
                "Drop-Access-Key=k; Path=/a.txt; HttpOnly",
                "Drop-Access-Key=k; Path=/selif/a.txt; HttpOnly",
            ]
        );
    }

    #[test]
    fn delete_key_check() {
        let metadata = Metadata {
            original_name: "a".into(),
            delete_key: "del".into(),
            access_key: String::new(),
            content_hash: String::new(),
            mimetype: String::new(),
            size: 1,
            expiry: Expiry::Never,
            archive_entries: Vec::new(),
        };
        assert!(authorize_delete(&metadata, "del", false));
        assert!(!authorize_delete(&metadata, "nope", false));
        assert!(!authorize_delete(&metadata, "", false));
        assert!(authorize_delete(&metadata, "", true));
    }

    #[test]
    fn recognizes_scripted_clients() {
        assert!(is_cli_user_agent("curl/8.4.0"));
        assert!(is_cli_user_agent("Wget/1.21"));
        assert!(is_cli_user_agent("python-requests/2.31"));
        assert!(!is_cli_user_agent("Mozilla/5.0 (X11; Linux x86_64)"));
    }
}
