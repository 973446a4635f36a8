use anyhow::{Context, Result};
use std::io::ErrorKind;
use tempdrop::{
    config::AppConfig,
    routes::routes::app,
    services::{cleanup, storage::Backend},
    state::AppState,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting tempdrop with config: {:?}", cfg);

    // --- Storage backend ---
    let backend = Backend::from_config(&cfg.backend_config())
        .await
        .context("initializing storage backend")?;
    tracing::info!(backend = backend.name(), "storage backend ready");

    let state = AppState::new(&cfg, backend.clone())?;

    // --- Expired file sweeper ---
    let shutdown = CancellationToken::new();
    let sweeper = match (cfg.cleanup_interval(), backend.enumerable()) {
        (None, _) => None,
        (Some(every), Some(enumerable)) => {
            tracing::info!(
                every_minutes = cfg.cleanup_every_minutes,
                "periodic cleanup enabled"
            );
            Some(cleanup::spawn_periodic(enumerable, every, shutdown.clone()))
        }
        (Some(_), None) => {
            tracing::warn!(
                backend = backend.name(),
                "periodic cleanup is not supported by this backend; relying on lazy expiry"
            );
            None
        }
    };

    // --- Build router ---
    let app = app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
