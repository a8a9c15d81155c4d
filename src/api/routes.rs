use axum::routing::{get, post};
use axum::Router;

use crate::api::handlers;
use crate::api::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhook/signal", post(handlers::webhook_signal))
        .route(
            "/api/strategies/performance",
            get(handlers::strategies_performance),
        )
        .route(
            "/api/strategies/:strategy_id/mode",
            post(handlers::set_strategy_mode),
        )
        .with_state(state)
}
