//! Shared state handed to every handler.

use crate::{
    config::AppConfig,
    middleware::security_headers::SecurityHeadersConfig,
    services::{
        access::AccessKeyGate,
        remote::RemoteFetcher,
        storage::{Backend, StorageBackend},
        upload::UploadPipeline,
    },
};
use anyhow::{Context, Result};
use std::sync::Arc;

/// The slice of configuration the HTTP layer reads per request.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub site_url: Option<String>,
    pub site_path: String,
    pub selif_path: String,
    pub max_size: u64,
    pub anyone_can_delete: bool,
    pub no_direct_agents: bool,
    pub file_content_security_policy: String,
    pub file_referrer_policy: String,
    pub allow_hotlink: bool,
}

impl From<&AppConfig> for HttpSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            site_url: cfg.site_url.clone(),
            site_path: cfg.site_path.clone(),
            selif_path: cfg.selif_path.clone(),
            max_size: cfg.max_size,
            anyone_can_delete: cfg.anyone_can_delete,
            no_direct_agents: cfg.no_direct_agents,
            file_content_security_policy: cfg.file_content_security_policy.clone(),
            file_referrer_policy: cfg.file_referrer_policy.clone(),
            allow_hotlink: cfg.allow_hotlink,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
    pub storage: Arc<dyn StorageBackend>,
    pub pipeline: UploadPipeline,
    pub gate: AccessKeyGate,
    /// Present only when remote uploads are enabled.
    pub remote: Option<RemoteFetcher>,
    pub settings: Arc<HttpSettings>,
    pub security_headers: Arc<SecurityHeadersConfig>,
}

impl AppState {
    pub fn new(cfg: &AppConfig, backend: Backend) -> Result<Self> {
        let storage = backend.storage();
        let pipeline = UploadPipeline::new(storage.clone(), cfg.upload_policy(), cfg.expiry_policy());
        let remote = if cfg.allow_remote_upload {
            Some(RemoteFetcher::new(cfg.max_size).context("building remote fetch client")?)
        } else {
            None
        };

        let security_headers = SecurityHeadersConfig::new(
            &cfg.content_security_policy,
            &cfg.referrer_policy,
            &cfg.x_frame_options,
            &cfg.add_headers,
        )
        .context("building response headers")?;

        Ok(Self {
            backend,
            storage,
            pipeline,
            gate: AccessKeyGate::new(cfg.cookie_policy()),
            remote,
            settings: Arc::new(HttpSettings::from(cfg)),
            security_headers: Arc::new(security_headers),
        })
    }
}
