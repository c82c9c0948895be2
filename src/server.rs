//! `sse-to-stdio`: the HTTP listener in front of the relay.
//!
//! [`bind`] allocates a port (falling back to an ephemeral one when the
//! preferred port is taken) and binds it; [`Server::serve`] runs the router
//! until the shutdown future resolves, then tears down every session.
//!
//! Shutdown closes all sessions *before* waiting for connections to drain:
//! SSE responses only end once their session is gone, so axum's graceful
//! shutdown would otherwise wait on them forever.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::error::{AllocationError, ProxyError};
use crate::port;
use crate::routes;
use crate::state::AppState;

/// A bound, not yet serving, relay server.
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    state: AppState,
}

/// Allocate a port, bind it and build the relay state.
///
/// The configuration must already have passed [`Config::validate_relay`].
pub async fn bind(config: Config) -> Result<Server, ProxyError> {
    let host = config.server.host.clone();
    let port = port::allocate(&host, config.server.port).await?;

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .map_err(|source| ProxyError::Listen {
            addr: format!("{host}:{port}"),
            source,
        })?;
    let addr = listener.local_addr().map_err(AllocationError::NoAddress)?;

    Ok(Server {
        listener,
        addr,
        state: AppState::new(config),
    })
}

impl Server {
    /// The address actually bound, which may differ from the configured one.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` resolves, then close every session and wait for
    /// open connections to finish.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let server = &self.state.config.server;
        let port = self.addr.port();
        info!("server started on port {port}");
        info!("SSE endpoint: http://localhost:{port}{}", server.sse_path);
        info!("POST messages: http://localhost:{port}{}", server.messages_path);

        let relay = self.state.relay.clone();
        let drain = relay.clone();
        let app = routes::router(self.state);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutting down...");
                drain.shutdown().await;
            })
            .await
            .map_err(ProxyError::Serve)?;

        relay.shutdown().await;
        info!("Goodbye");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// Handlers are installed when this is called, so a signal that arrives
/// before the returned future is first polled is not lost.
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static, ProxyError> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(ProxyError::Signal)?;

    Ok(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    })
}

/// Run `sse-to-stdio` until a shutdown signal.
pub async fn run(config: Config) -> Result<(), ProxyError> {
    config.validate_relay()?;
    info!(
        isolation = %config.child.isolation,
        "mcp-proxy v{} fronting `{}`",
        env!("CARGO_PKG_VERSION"),
        config.child.command_line()
    );

    let server = bind(config).await?;
    let shutdown = shutdown_signal()?;
    server.serve(shutdown).await
}
