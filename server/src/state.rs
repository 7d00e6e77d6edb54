use crate::store::StorePool;
use crate::ws::{ConnectionRegistry, Liveness};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Persisted users and devices, behind a single lock
    pub store: StorePool,
    /// Live WebSocket connection per device MAC address
    pub connections: ConnectionRegistry,
    /// Ping/pong keepalive applied to every device connection
    pub liveness: Liveness,
}
