use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use tracing::info;

use crate::proxy::server::AppState;

pub async fn admin_token_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.stats())
}

pub async fn admin_reload_tokens(State(state): State<AppState>) -> impl IntoResponse {
    match state.pool.reload(&state.config.tokens_file) {
        Ok(count) => {
            info!("Token pool reloaded from disk: {} tokens", count);
            let stats = state.pool.stats();
            Json(json!({ "total": stats.total, "active": stats.active })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn admin_reset_token(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    if state.pool.reset(index) {
        Json(json!({ "reset": index })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": format!("no token at index {}", index), "type": "invalid_request_error" } })),
        )
            .into_response()
    }
}

pub async fn admin_reset_all(State(state): State<AppState>) -> impl IntoResponse {
    state.pool.reset_all();
    let stats = state.pool.stats();
    Json(json!({ "total": stats.total, "active": stats.active }))
}

pub async fn admin_updater_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.updater.status())
}

// Returns once the refresh is scheduled; completion is observable through
// the status endpoint.
pub async fn admin_force_update(State(state): State<AppState>) -> impl IntoResponse {
    state.updater.force_update();
    Json(json!({ "scheduled": true }))
}
