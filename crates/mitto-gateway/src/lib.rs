//! HTTP/WebSocket transport surface.
//!
//! Exposes one endpoint per session (`/ws/{session_id}`) bridging a
//! browser's JSON messages onto its [`mitto_runtime::RuntimeHandle`], plus
//! a `/events` endpoint for the manager's session-lifecycle feed. Both sit
//! behind a bearer-token check, routed through a per-session socket
//! resolved through a [`mitto_manager::Manager`].

mod auth;
mod error;
mod events_ws;
mod protocol;
mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use mitto_manager::Manager;
use mitto_store::Store;
use tower_http::trace::TraceLayer;

pub use auth::AuthState;
pub use error::GatewayError;
pub use protocol::{ClientMessage, ServerMessage};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub store: Arc<Store>,
}

/// Builds the full router: session sockets, the lifecycle feed, both
/// behind the bearer-token middleware.
pub fn router(manager: Arc<Manager>, token: impl Into<String>) -> Router {
    let store = manager.store();
    let state = AppState { manager, store };
    let auth_state = AuthState::new(token);

    Router::new()
        .route("/ws/:session_id", get(ws::ws_handler))
        .route("/events", get(events_ws::events_handler))
        .layer(axum::middleware::from_fn_with_state(auth_state, auth::bearer_auth_mw))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
