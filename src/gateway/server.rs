//! Gateway server: wires the core subsystems into an axum HTTP server with
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use routeforge_core::{Dispatcher, GlobalContext, HookOrchestrator, InstanceIdentity, QueueFabric, RouteManager};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::gateway::router::{build_router, AppState};

/// Owns the wired-up core subsystems and the bound listener.
pub struct Gateway {
    config: Config,
    state: AppState,
    _queue_fabric: Arc<QueueFabric>,
}

impl Gateway {
    /// Build the Route Manager, Queue Fabric, Hook Orchestrator, and
    /// Dispatcher from `config`, and spawn their background tasks.
    pub async fn new(config: Config) -> Result<Self> {
        let route_manager = Arc::new(RouteManager::new(config.route_manager.into()));
        route_manager.spawn_background_tasks();

        let queue_fabric = Arc::new(QueueFabric::new(
            config.queue_fabric.max_queue_depth,
            config.queue_fabric.max_delivery_attempts,
        ));
        queue_fabric.spawn_dispatcher();

        let hooks = Arc::new(HookOrchestrator::new(None));
        let dispatcher = Arc::new(Dispatcher::new(route_manager, hooks));

        let identity = InstanceIdentity::new(None, None);
        let global = Arc::new(GlobalContext::new(identity, serde_json::json!({})));

        let state = AppState { dispatcher, global };

        Ok(Self { config, state, _queue_fabric: queue_fabric })
    }

    /// Bind the configured address and serve until a shutdown signal
    /// (ctrl-c or SIGTERM) arrives, then drain in-flight requests.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| crate::error::Error::Config(format!("invalid bind address: {e}")))?;

        let app = build_router(self.state)
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(self.config.server.request_timeout));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
