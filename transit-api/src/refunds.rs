use axum::{
    extract::State,
    routing::post,
    Extension, Json, Router,
};
use serde::Serialize;
use uuid::Uuid;
use transit_core::RefundRequest;

use crate::error::AppError;
use crate::extract::AppJson;
use crate::middleware::CustomerClaims;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub success: bool,
    pub message: String,
    pub refund_amount_cents: i64,
    pub refunded_ticket_ids: Vec<Uuid>,
    pub refunded_orders: Vec<Uuid>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/refunds", post(create_refund))
}

async fn create_refund(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
    AppJson(req): AppJson<RefundRequest>,
) -> Result<Json<RefundResponse>, AppError> {
    let receipt = state.engine.refund(&claims.sub, &req).await?;

    Ok(Json(RefundResponse {
        success: true,
        message: format!("Refunded {} ticket(s)", receipt.refunded_ticket_ids.len()),
        refund_amount_cents: receipt.refund_cents,
        refunded_ticket_ids: receipt.refunded_ticket_ids,
        refunded_orders: receipt.refunded_orders,
    }))
}
