use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use serde::Serialize;
use uuid::Uuid;
use transit_core::BookingRequest;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::middleware::CustomerClaims;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub success: bool,
    pub message: String,
    pub order_id: Uuid,
    pub total_amount_cents: i64,
    pub ticket_ids: Vec<Uuid>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/bookings", post(create_booking))
}

async fn create_booking(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    AppJson(req): AppJson<BookingRequest>,
) -> Result<(StatusCode, Json<BookingResponse>), AppError> {
    let receipt = state.engine.book(&claims.sub, &req).await?;

    Ok((
        StatusCode::CREATED,
        Json(BookingResponse {
            success: true,
            message: format!("Booked {} ticket(s)", receipt.ticket_ids.len()),
            order_id: receipt.order_id,
            total_amount_cents: receipt.total_cents,
            ticket_ids: receipt.ticket_ids,
        }),
    ))
}
