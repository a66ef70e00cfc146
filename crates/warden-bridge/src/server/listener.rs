//! Server entry point.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use super::dispatch::Dispatcher;
use super::http::routes;
use crate::backend::Backend;
use crate::bomberman::{Bomberman, EvictionScheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Grace time for containers created without one. Zero never expires.
    pub container_grace_time: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            container_grace_time: Duration::ZERO,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `WARDEN_HOST`, `WARDEN_PORT` and
    /// `WARDEN_GRACE_TIME` (seconds).
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("WARDEN_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("WARDEN_PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("invalid WARDEN_PORT '{port}'"))?;
        }
        if let Some(grace) = lookup("WARDEN_GRACE_TIME") {
            let secs: u64 = grace
                .parse()
                .with_context(|| format!("invalid WARDEN_GRACE_TIME '{grace}'"))?;
            config.container_grace_time = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

/// Bind the configured address and serve until SIGINT or SIGTERM.
pub async fn serve(config: ServerConfig, backend: Arc<dyn Backend>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.addr()?).await?;
    serve_on(listener, config, backend, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: TcpListener,
    config: ServerConfig,
    backend: Arc<dyn Backend>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let scheduler = Arc::new(Bomberman::destroying(Arc::clone(&backend)));
    for container in backend.containers().await? {
        scheduler.strap(&container.handle(), container.grace_time());
    }

    let dispatcher = Dispatcher::new(backend, scheduler, config.container_grace_time);
    let app = routes(Arc::new(dispatcher));

    info!("Starting warden server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
///
/// A signal whose handler cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
