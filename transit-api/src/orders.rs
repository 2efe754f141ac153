use axum::{
    extract::State,
    routing::get,
    Extension, Json, Router,
};
use serde::Serialize;
use transit_core::OrderDetails;

use crate::error::AppError;
use crate::middleware::CustomerClaims;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    pub success: bool,
    pub orders: Vec<OrderDetails>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/orders", get(list_orders))
}

async fn list_orders(
    State(state): State<AppState>,
    Extension(claims): Extension<CustomerClaims>,
) -> Result<Json<OrdersResponse>, AppError> {
    let orders = state.engine.orders_for_owner(&claims.sub).await?;
    Ok(Json(OrdersResponse { success: true, orders }))
}
