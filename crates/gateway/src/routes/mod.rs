//! API route definitions.

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

mod sandbox;
mod ws;

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "UP",
        "service": "codecell",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// API v1 routes: the Language Registry and the batch executor.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/languages", get(sandbox::list_languages))
        .route("/execute", post(sandbox::run_code))
}

/// WebSocket routes: the interactive executor.
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/execute", get(ws::interactive_handler))
}
