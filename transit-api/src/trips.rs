use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use uuid::Uuid;
use transit_core::SeatMap;

use crate::error::AppError;
use crate::extract::AppPath;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/trips/{trip_id}/seats", get(get_seat_map))
}

async fn get_seat_map(
    State(state): State<AppState>,
    AppPath(trip_id): AppPath<Uuid>,
) -> Result<Json<SeatMap>, AppError> {
    Ok(Json(state.engine.seat_map(trip_id).await?))
}
