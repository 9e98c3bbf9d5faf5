pub mod commands;
pub mod health;

use crate::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(commands::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
