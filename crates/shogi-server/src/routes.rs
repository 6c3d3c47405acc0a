use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::state::AppState;
use crate::ws;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let current = state.connection_count.load(Ordering::Relaxed);
    if current >= state.config.max_connections {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(upgrade.on_upgrade(move |socket| ws::handle_socket(state, socket)))
}
