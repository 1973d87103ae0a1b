use crate::models::AppState;
use axum::Router;

pub mod appointment_routes;
pub mod health_routes;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(appointment_routes::router())
        .merge(health_routes::router());

    Router::new().nest("/api/v1", api).with_state(state)
}
