//! Adapter server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::CredentialExtractor;
use crate::dispatcher::Dispatcher;
use crate::registry::ToolRegistry;
use crate::transport::{AppState, SessionRegistry, create_router};
use crate::upstream::UpstreamFactory;
use crate::{Error, Result};

/// Serves one tool registry over both MCP HTTP transports
pub struct AdapterServer {
    config: Config,
    state: Arc<AppState>,
}

impl AdapterServer {
    /// Create a server.
    ///
    /// `factory` builds the upstream client handlers reach through their
    /// request context; without one, handlers that need the upstream fail
    /// with a configuration error.
    pub fn new(
        config: Config,
        registry: ToolRegistry,
        factory: Option<Arc<dyn UpstreamFactory>>,
    ) -> Result<Self> {
        let extractor = CredentialExtractor::new(&config.credentials)?;
        let dispatcher = Dispatcher::new(Arc::new(registry));

        for tool in dispatcher.registry().list_tools() {
            info!(tool = %tool.name(), "Registered tool");
        }

        let state = Arc::new(AppState {
            dispatcher: Arc::new(dispatcher),
            extractor,
            factory,
            sessions: Arc::new(SessionRegistry::new(config.transport.session_buffer)),
            transport: config.transport.clone(),
            max_body_size: config.server.max_body_size,
        });

        Ok(Self { config, state })
    }

    /// Router serving both transports and `/health`
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Open session registry
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.state.sessions
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// Open connections then get `server.shutdown_timeout` to drain before
    /// they are dropped.
    pub async fn serve_with_shutdown<S>(self, listener: TcpListener, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        let transport = &self.config.transport;

        info!("============================================================");
        info!("SAAS MCP BRIDGE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(address = %local, "Listening");
        info!(tools = self.state.dispatcher.registry().len(), "Tools registered");
        info!("Streamable HTTP (stateless):");
        info!("  POST http://{local}{}", transport.stateless_path);
        info!("Legacy SSE:");
        info!("  GET  http://{local}{}", transport.sse_path);
        info!("  POST http://{local}{}?sessionId=<id>", transport.messages_path);
        info!("============================================================");

        // SSE streams never end on their own, so draining is bounded
        let signalled = Arc::new(Notify::new());
        let notify = Arc::clone(&signalled);
        let server = axum::serve(listener, self.router()).with_graceful_shutdown(async move {
            signal.await;
            info!("Shutdown signal received");
            notify.notify_one();
        });
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let drain_deadline = async {
            signalled.notified().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = async { server.await } => {
                result.map_err(|e| Error::Internal(e.to_string()))?;
            }
            () = drain_deadline => {
                warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out, dropping open streams");
            }
        }

        info!(
            open_sessions = self.state.sessions.len(),
            "Server stopped"
        );
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
