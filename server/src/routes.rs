use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::devices::update;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Permissive CORS: any origin may call the API from a browser dashboard.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::OPTIONS,
            Method::POST,
            Method::PUT,
        ])
        .allow_headers([
            header::ORIGIN,
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
}

/// Build the HTTP API router: update endpoint, device WebSocket, health check.
pub fn build_router(state: AppState) -> Router {
    let device_routes = Router::new().route(
        "/device/update",
        axum::routing::post(update::update_device),
    );

    // Devices may connect here as well as on the dedicated port
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(device_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the dedicated device port: WebSocket upgrade at `/` or any other path.
pub fn build_device_router(state: AppState) -> Router {
    Router::new()
        .route("/", axum::routing::get(ws_handler::ws_upgrade))
        .fallback(ws_handler::ws_upgrade)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
