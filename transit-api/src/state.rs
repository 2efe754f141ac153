use transit_booking::BookingEngine;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: BookingEngine,
    pub auth: AuthConfig,
}

impl AppState {
    pub fn new(engine: BookingEngine, jwt_secret: impl Into<String>) -> Self {
        Self {
            engine,
            auth: AuthConfig { secret: jwt_secret.into() },
        }
    }
}
