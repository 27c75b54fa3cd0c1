//! HTTP server implementation using Axum.

use crate::auth::{AuthController, Authenticator};
use crate::block_devices::BlockDeviceController;
use crate::storage_servers::StorageServerController;
use crate::ws::handle_ws;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use bvm_core::{
    dtos, AgentTracker, ConnectionConfig, Forwarder, HandlerExporter, JsonCodec, MessageCodec,
    Router, SessionConfig, UnknownMessagePolicy,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// Message router shared by every connection
    pub router: Arc<Router>,
    pub codec: Arc<dyn MessageCodec>,
    pub connection_config: ConnectionConfig,
    /// Connected storage servers
    pub tracker: Arc<AgentTracker>,
}

impl AppState {
    /// Wire the registry, tracker, forwarder and controllers together.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        connection_config: ConnectionConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(dtos::standard_registry());
        let tracker = Arc::new(AgentTracker::new());
        let forwarder = Arc::new(Forwarder::new(Arc::clone(&tracker)));

        let mut router = Router::new(Arc::clone(&registry))
            .with_unknown_policy(UnknownMessagePolicy::ReplyError);
        Arc::new(AuthController::new(authenticator)).export_handlers(&mut router);
        Arc::new(StorageServerController::new(Arc::clone(&tracker))).export_handlers(&mut router);
        Arc::new(BlockDeviceController::new(forwarder)).export_handlers(&mut router);

        Arc::new(Self {
            router: Arc::new(router),
            codec: Arc::new(JsonCodec::new(registry)),
            connection_config,
            tracker,
        })
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "storageServers": state.tracker.len(),
    }))
}

/// Start the HTTP/WebSocket server.
///
/// Returns the actual address the server is bound to (useful when port=0).
/// When `views` is given, files under it are served for every other path.
pub async fn start_server(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    views: Option<PathBuf>,
) -> anyhow::Result<SocketAddr> {
    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = axum::Router::new()
        .route("/health", get(handle_health))
        .route(SessionConfig::WS_PATH, get(handle_ws));
    if let Some(views) = views {
        info!("Serving views from {}", views.display());
        app = app.fallback_service(ServeDir::new(views));
    }
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
