//! Admin HTTP API.

mod auth;
mod handlers;

pub use handlers::*;

use crate::clock::MonotonicClock;
use crate::config::AppConfig;
use crate::notify::Fanout;
use crate::radio::{DeferredMessage, Mailbox, RadioArbiter};
use crate::scheduler::PushEdge;
use crate::status::StatusLed;
use crate::store::Store;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Largest request body any route reads.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub fanout: Arc<Fanout>,
    pub arbiter: Arc<RadioArbiter>,
    pub mailbox: Arc<Mailbox<DeferredMessage>>,
    pub led: Arc<StatusLed>,
    pub push_tx: mpsc::Sender<PushEdge>,
    pub clock: MonotonicClock,
}

/// Web server for meshwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        let admin = Router::new()
            .route("/api/services", get(handlers::handle_list_services).post(handlers::handle_create_service))
            .route(
                "/api/services/{id}",
                delete(handlers::handle_delete_service).patch(handlers::handle_update_service),
            )
            .route("/api/export", get(handlers::handle_export))
            .route("/api/import", post(handlers::handle_import))
            .route("/api/mesh/status", get(handlers::handle_mesh_status))
            .route("/api/mesh/send", post(handlers::handle_mesh_send))
            .route("/api/status", get(handlers::handle_status))
            .route_layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_basic_auth,
            ));

        // Heartbeats come from scripts that only know the token.
        let public = Router::new().route("/api/push/{token}", get(handlers::handle_push));

        admin
            .merge(public)
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
