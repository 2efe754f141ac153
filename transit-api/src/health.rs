use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use transit_core::PoolStatus;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/health/pool", get(pool_status))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn pool_status(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.engine.pool_status())
}
