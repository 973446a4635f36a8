use crate::services::{
    access::AccessCookiePolicy,
    storage::BackendConfig,
    upload::{ExpiryPolicy, UploadPolicy},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "TEMPDROP_";

/// One year; longer sweep periods overflow timer deadlines.
const MAX_CLEANUP_MINUTES: u64 = 365 * 24 * 60;

const DEFAULT_MAX_SIZE: u64 = 4 * 1024 * 1024 * 1024;
const DEFAULT_FILE_CSP: &str = "default-src 'none'; img-src 'self'; object-src 'self'; \
    media-src 'self'; style-src 'self' 'unsafe-inline'; frame-ancestors 'self';";
const DEFAULT_CSP: &str = "default-src 'self'; img-src 'self' data:; \
    style-src 'self' 'unsafe-inline'; frame-ancestors 'self';";
const DEFAULT_REFERRER_POLICY: &str = "same-origin";
const DEFAULT_X_FRAME_OPTIONS: &str = "SAMEORIGIN";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Absolute base URL for links; derived from the request when unset.
    pub site_url: Option<String>,
    /// Always starts and ends with `/`.
    pub site_path: String,
    /// Raw-serve prefix without slashes.
    pub selif_path: String,
    pub files_dir: String,
    pub meta_dir: String,
    pub max_size: u64,
    pub max_expiry: u64,
    pub default_expiry: u64,
    pub default_expiry_cli: u64,
    pub forbidden_extensions: Vec<String>,
    pub anyone_can_delete: bool,
    pub access_cookie_expiry: u64,
    pub cleanup_every_minutes: u64,
    pub min_free_space_gb: f64,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_force_path_style: bool,
    pub no_direct_agents: bool,
    pub file_content_security_policy: String,
    pub file_referrer_policy: String,
    /// Site-wide headers; an empty value disables the header.
    pub content_security_policy: String,
    pub referrer_policy: String,
    pub x_frame_options: String,
    /// Extra `Name: value` headers added to every response.
    pub add_headers: Vec<String>,
    pub allow_hotlink: bool,
    pub allow_remote_upload: bool,
}

/// Command-line + environment configuration.
///
/// Every option falls back to `TEMPDROP_<NAME>` when not given on the
/// command line.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Temporary file drop server")]
pub struct Args {
    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(long)]
    pub port: Option<u16>,

    /// Public base URL used in returned links, e.g. https://drop.example.com/
    #[arg(long)]
    pub site_url: Option<String>,

    /// Path prefix the site is mounted under
    #[arg(long)]
    pub site_path: Option<String>,

    /// Path prefix for raw file downloads
    #[arg(long)]
    pub selif_path: Option<String>,

    /// Directory holding file contents
    #[arg(long)]
    pub files_dir: Option<String>,

    /// Directory holding file metadata
    #[arg(long)]
    pub meta_dir: Option<String>,

    /// Maximum upload size in bytes
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Maximum expiry in seconds (0 = unlimited)
    #[arg(long)]
    pub max_expiry: Option<u64>,

    /// Default expiry in seconds (0 = use the maximum)
    #[arg(long)]
    pub default_expiry: Option<u64>,

    /// Default expiry in seconds for scripted clients
    #[arg(long)]
    pub default_expiry_cli: Option<u64>,

    /// Extension that may not be uploaded; repeatable
    #[arg(long = "forbidden-extension")]
    pub forbidden_extensions: Vec<String>,

    /// Allow deletion without the delete key
    #[arg(long)]
    pub anyone_can_delete: bool,

    /// Lifetime of access key cookies in seconds (0 = session)
    #[arg(long)]
    pub access_cookie_expiry: Option<u64>,

    /// Sweep expired files every N minutes (0 = never)
    #[arg(long)]
    pub cleanup_every_minutes: Option<u64>,

    /// Refuse uploads that would leave less free disk space than this
    #[arg(long)]
    pub min_free_space_gb: Option<f64>,

    /// Store files in this S3 bucket instead of on local disk
    #[arg(long)]
    pub s3_bucket: Option<String>,

    #[arg(long)]
    pub s3_region: Option<String>,

    /// Endpoint of an S3-compatible service
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    #[arg(long)]
    pub s3_force_path_style: bool,

    /// Do not serve raw files to scripted clients on the display route
    #[arg(long)]
    pub no_direct_agents: bool,

    /// Content-Security-Policy sent with served files
    #[arg(long)]
    pub file_content_security_policy: Option<String>,

    /// Referrer-Policy sent with served files
    #[arg(long)]
    pub file_referrer_policy: Option<String>,

    /// Default Content-Security-Policy for every other response
    #[arg(long)]
    pub content_security_policy: Option<String>,

    /// Default Referrer-Policy for every other response
    #[arg(long)]
    pub referrer_policy: Option<String>,

    /// Value of the X-Frame-Options header
    #[arg(long)]
    pub x_frame_options: Option<String>,

    /// Add `Name: value` to every response; repeatable
    #[arg(long = "add-header")]
    pub add_headers: Vec<String>,

    /// Serve raw files to pages on other sites instead of redirecting
    #[arg(long)]
    pub allow_hotlink: bool,

    /// Enable POST /upload/remote
    #[arg(long)]
    pub allow_remote_upload: bool,
}

/// Reads `TEMPDROP_*` values through a lookup function.
struct EnvSource<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.raw(name)
            .map(|value| {
                value
                    .parse::<T>()
                    .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{value}`"))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> Result<bool> {
        match self.raw(name).as_deref() {
            None => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => anyhow::bail!("parsing {ENV_PREFIX}{name} value `{other}` as a flag"),
        }
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.raw(name)
            .map(|value| value.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// One entry per non-empty line, for values that may contain commas.
    fn lines(&self, name: &str) -> Vec<String> {
        self.raw(name)
            .map(|value| {
                value
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_sources(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over values from `lookup`, then defaults.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvSource { lookup };

        let forbidden = if args.forbidden_extensions.is_empty() {
            env.list("FORBIDDEN_EXTENSIONS")
        } else {
            args.forbidden_extensions
        };

        let add_headers = if args.add_headers.is_empty() {
            env.lines("ADD_HEADERS")
        } else {
            args.add_headers
        };

        let site_url = args.site_url.or(env.raw("SITE_URL"));
        let site_path = match args.site_path.or(env.raw("SITE_PATH")) {
            Some(path) => path,
            None => site_url
                .as_deref()
                .map(path_of_url)
                .transpose()?
                .unwrap_or_default(),
        };

        let cfg = Self {
            host: args.host.or(env.raw("HOST")).unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.or(env.parsed("PORT")?).unwrap_or(8080),
            site_url,
            site_path: normalize_site_path(&site_path),
            selif_path: args
                .selif_path
                .or(env.raw("SELIF_PATH"))
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "selif".into()),
            files_dir: args
                .files_dir
                .or(env.raw("FILES_DIR"))
                .unwrap_or_else(|| "./data/files".into()),
            meta_dir: args
                .meta_dir
                .or(env.raw("META_DIR"))
                .unwrap_or_else(|| "./data/meta".into()),
            max_size: args
                .max_size
                .or(env.parsed("MAX_SIZE")?)
                .unwrap_or(DEFAULT_MAX_SIZE),
            max_expiry: args.max_expiry.or(env.parsed("MAX_EXPIRY")?).unwrap_or(0),
            default_expiry: args
                .default_expiry
                .or(env.parsed("DEFAULT_EXPIRY")?)
                .unwrap_or(0),
            default_expiry_cli: args
                .default_expiry_cli
                .or(env.parsed("DEFAULT_EXPIRY_CLI")?)
                .unwrap_or(0),
            forbidden_extensions: forbidden
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            anyone_can_delete: args.anyone_can_delete || env.flag("ANYONE_CAN_DELETE")?,
            access_cookie_expiry: args
                .access_cookie_expiry
                .or(env.parsed("ACCESS_COOKIE_EXPIRY")?)
                .unwrap_or(0),
            cleanup_every_minutes: args
                .cleanup_every_minutes
                .or(env.parsed("CLEANUP_EVERY_MINUTES")?)
                .unwrap_or(0),
            min_free_space_gb: args
                .min_free_space_gb
                .or(env.parsed("MIN_FREE_SPACE_GB")?)
                .unwrap_or(0.0),
            s3_bucket: args.s3_bucket.or(env.raw("S3_BUCKET")),
            s3_region: args.s3_region.or(env.raw("S3_REGION")),
            s3_endpoint: args.s3_endpoint.or(env.raw("S3_ENDPOINT")),
            s3_force_path_style: args.s3_force_path_style || env.flag("S3_FORCE_PATH_STYLE")?,
            no_direct_agents: args.no_direct_agents || env.flag("NO_DIRECT_AGENTS")?,
            file_content_security_policy: args
                .file_content_security_policy
                .or(env.raw("FILE_CONTENT_SECURITY_POLICY"))
                .unwrap_or_else(|| DEFAULT_FILE_CSP.into()),
            file_referrer_policy: args
                .file_referrer_policy
                .or(env.raw("FILE_REFERRER_POLICY"))
                .unwrap_or_else(|| DEFAULT_REFERRER_POLICY.into()),
            content_security_policy: args
                .content_security_policy
                .or(env.raw("CONTENT_SECURITY_POLICY"))
                .unwrap_or_else(|| DEFAULT_CSP.into()),
            referrer_policy: args
                .referrer_policy
                .or(env.raw("REFERRER_POLICY"))
                .unwrap_or_else(|| DEFAULT_REFERRER_POLICY.into()),
            x_frame_options: args
                .x_frame_options
                .or(env.raw("X_FRAME_OPTIONS"))
                .unwrap_or_else(|| DEFAULT_X_FRAME_OPTIONS.into()),
            add_headers,
            allow_hotlink: args.allow_hotlink || env.flag("ALLOW_HOTLINK")?,
            allow_remote_upload: args.allow_remote_upload || env.flag("ALLOW_REMOTE_UPLOAD")?,
        };

        if cfg.cleanup_every_minutes > MAX_CLEANUP_MINUTES {
            anyhow::bail!(
                "cleanup-every-minutes must be at most {MAX_CLEANUP_MINUTES}, got {}",
                cfg.cleanup_every_minutes
            );
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Period of the expired file sweep; `None` when disabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        match self.cleanup_every_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes.saturating_mul(60))),
        }
    }

    pub fn backend_config(&self) -> BackendConfig {
        match &self.s3_bucket {
            Some(bucket) => BackendConfig::ObjectStore {
                bucket: bucket.clone(),
                region: self.s3_region.clone(),
                endpoint: self.s3_endpoint.clone(),
                force_path_style: self.s3_force_path_style,
            },
            None => BackendConfig::LocalFs {
                files_dir: self.files_dir.clone(),
                meta_dir: self.meta_dir.clone(),
                min_free_space_gb: self.min_free_space_gb,
            },
        }
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_size: self.max_size,
            forbidden_extensions: self.forbidden_extensions.clone(),
        }
    }

    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            default_secs: self.default_expiry,
            default_cli_secs: self.default_expiry_cli,
            max_secs: self.max_expiry,
        }
    }

    pub fn cookie_policy(&self) -> AccessCookiePolicy {
        AccessCookiePolicy {
            site_path: self.site_path.clone(),
            selif_path: self.selif_path.clone(),
            cookie_ttl_secs: self.access_cookie_expiry,
        }
    }
}

/// Path component of an absolute site URL.
fn path_of_url(raw: &str) -> Result<String> {
    let url = reqwest::Url::parse(raw).with_context(|| format!("parsing site url `{raw}`"))?;
    Ok(url.path().to_string())
}

fn normalize_site_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".into()
    } else {
        format!("/{trimmed}/")
    }
}
