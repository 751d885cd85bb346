//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::upstream::{SheetSource, SheetsClient, UnconfiguredSource};
use crate::{Error, Result, cache, failsafe};

/// Sheet gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared state handed to the router
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// Missing upstream credentials do not prevent startup: requests are
    /// answered with a misconfiguration error instead.
    pub fn new(config: Config) -> Result<Self> {
        let source: Arc<dyn SheetSource> = match SheetsClient::new(&config.upstream) {
            Ok(client) => Arc::new(client),
            Err(Error::ConfigurationMissing(what)) => {
                warn!(missing = %what, "Upstream credentials missing, sheet requests will fail");
                Arc::new(UnconfiguredSource::new(what))
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            config,
            state: Arc::new(AppState::new(source)),
        })
    }

    /// Run the gateway until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_sweepers(&self.state, &shutdown_tx);

        let app = create_router(Arc::clone(&self.state), self.config.server.request_timeout);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("SHEET GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            "  GET http://{}:{}/api/sheets?action=list",
            self.config.server.host, self.config.server.port
        );
        info!(
            "  GET http://{}:{}/api/sheets?sheet=<name>",
            self.config.server.host, self.config.server.port
        );
        info!("============================================================");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Start the periodic cache and limiter sweeps
///
/// Both run on their own interval, off the request path, and stop when the
/// shutdown broadcast fires.
pub fn spawn_sweepers(state: &Arc<AppState>, shutdown_tx: &broadcast::Sender<()>) {
    let response_cache = Arc::clone(&state.cache);
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cache::SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = response_cache.sweep();
                    if removed > 0 {
                        debug!(removed, "Swept expired cache entries");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });

    let limiter = Arc::clone(&state.limiter);
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(failsafe::SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = limiter.sweep();
                    if removed > 0 {
                        debug!(removed, "Dropped idle rate-limit windows");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Resolves when Ctrl-C or SIGTERM arrives, then notifies background tasks
pub(crate) async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
