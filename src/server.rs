use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderName, Method},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::{api, channel::PresenceHub, config::RelayConfig, ws::ws_handler};

/// Shared state of every relay route.
#[derive(Debug)]
pub struct AppState {
    pub hub: Arc<PresenceHub>,
    pub config: RelayConfig,
}

/// The presence relay: a [`PresenceHub`] served over WebSocket, plus a small
/// read-only HTTP API to inspect it.
pub struct App {
    state: Arc<AppState>,
}

impl Default for App {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl App {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: Arc::new(AppState {
                hub: Arc::new(PresenceHub::new()),
                config,
            }),
        }
    }

    pub fn hub(&self) -> Arc<PresenceHub> {
        Arc::clone(&self.state.hub)
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET])
            // allow the Content-Type header and other headers needed for WebSockets
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("upgrade"),
                HeaderName::from_static("connection"),
                HeaderName::from_static("sec-websocket-key"),
                HeaderName::from_static("sec-websocket-version"),
                HeaderName::from_static("sec-websocket-extensions"),
                HeaderName::from_static("sec-websocket-protocol"),
            ])
            // allow requests from any origin
            .allow_origin(Any);

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/channels", get(api::channels::list_channels))
            .route(
                "/api/channels/{channel}/presence",
                get(api::presence::get_presence),
            )
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Serves the relay on an already bound listener until it fails.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }

    /// Binds the configured address and serves the relay.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.state.config.addr;
        let listener = TcpListener::bind(addr).await?;

        info!("Presence relay running on http://{}", addr);
        match self.serve(listener).await {
            Ok(_) => info!("Server shut down gracefully"),
            Err(e) => error!("Server error: {}", e),
        }

        Ok(())
    }
}
