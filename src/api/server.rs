//! API Server
//!
//! Wires the gateway into the axum router, the WebSocket manager and the
//! middleware stack, then serves until a shutdown signal arrives.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
    websocket::WebSocketManager,
};
use crate::{
    config::ApiConfig,
    errors::{ConfigurationError, CrashResult},
    gateway::GameGateway,
    metrics::GameMetrics,
};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

pub struct ApiServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create the server and start forwarding round events to WebSocket clients
    pub fn new(config: ApiConfig, gateway: GameGateway, metrics: GameMetrics, metrics_enabled: bool) -> Self {
        let websocket_manager = Arc::new(WebSocketManager::new(
            config.event_buffer,
            Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            metrics.clone(),
        ));
        websocket_manager.start_background_tasks();
        gateway.forward_events(websocket_manager.clone());

        let state = Arc::new(AppState {
            gateway,
            websocket_manager,
            metrics,
            metrics_enabled,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        Self { config, state }
    }

    /// Router with the full middleware stack
    pub fn app(&self) -> axum::Router {
        build_app(self.state.clone(), &self.config)
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> CrashResult<()> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> CrashResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        self.log_server_info(addr);

        axum::serve(listener, self.app())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("API server stopped gracefully");
        Ok(())
    }

    fn socket_addr(&self) -> CrashResult<SocketAddr> {
        let ip = self.config.host.parse::<std::net::IpAddr>().map_err(|e| ConfigurationError::InvalidValue {
            field: "api.host".to_string(),
            value: self.config.host.clone(),
            reason: e.to_string(),
        })?;
        Ok(SocketAddr::from((ip, self.config.port)))
    }

    fn log_server_info(&self, addr: SocketAddr) {
        info!("Crash table API listening on http://{}", addr);
        info!("   CORS: {:?}", self.config.allowed_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        if self.config.allowed_origins.is_empty() {
            warn!("No allowed origins configured, accepting any origin");
        }
        info!("Available endpoints:");
        info!("   POST /crash/bet             - Place a bet in the waiting round");
        info!("   POST /crash/cashout         - Cash out the running round");
        info!("   GET  /crash/current         - Live round and bets");
        info!("   GET  /crash/history         - Finished rounds");
        info!("   GET  /crash/verify          - Recompute a crash point");
        info!("   GET  /ws                    - Round events");
    }
}

/// Router plus request id, CORS, timeout and tracing layers
pub fn build_app(state: Arc<AppState>, config: &ApiConfig) -> axum::Router {
    create_router(state)
        // Request ID middleware (first for tracing)
        .layer(axum::middleware::from_fn(request_id_middleware))
        // CORS layer (before timeout to handle preflight)
        .layer(create_cors_layer(config.allowed_origins.clone()))
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)))
        .layer(TraceLayer::new_for_http())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
