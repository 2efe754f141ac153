use axum::{http::Method, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod bookings;
pub mod error;
pub mod extract;
pub mod health;
pub mod middleware;
pub mod orders;
pub mod refunds;
pub mod state;
pub mod trips;

pub use error::AppError;
pub use state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    // Everything that acts for a requester needs a customer token.
    let customer = Router::new()
        .merge(bookings::routes())
        .merge(refunds::routes())
        .merge(orders::routes())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::customer_auth_middleware,
        ));

    Router::new()
        .merge(health::routes())
        .merge(trips::routes())
        .merge(customer)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
