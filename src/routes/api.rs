use axum::{Router, routing::get};

use crate::handlers::api;
use crate::state::AppState;

pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(api::health_check))
        .route("/calls", get(api::list_calls))
        .route("/calls/{session_id}", get(api::call_status))
        .route("/campaigns/{campaign_id}", get(api::campaign_status))
}
