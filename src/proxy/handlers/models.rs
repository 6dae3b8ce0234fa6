use axum::{
    extract::State,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde_json::json;

use crate::constants::MODEL_OWNER;
use crate::proxy::server::AppState;

pub async fn handle_list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.upstream_model_id,
            "object": "model",
            "created": Utc::now().timestamp(),
            "owned_by": MODEL_OWNER,
        }],
    }))
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pool.stats();
    Json(json!({
        "status": "ok",
        "tokens": { "active": stats.active, "total": stats.total },
    }))
}

pub async fn handle_root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "success",
        "service": "K2Gate",
        "message": "OpenAI-compatible gateway for K2-Think",
        "model": state.config.upstream_model_id,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "chat": "/v1/chat/completions",
            "models": "/v1/models",
            "health": "/health",
        },
    }))
}
