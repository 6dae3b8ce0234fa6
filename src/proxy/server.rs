use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tracing::{error, info};

use crate::error::{ProxyError, ProxyResult};
use crate::proxy::admin;
use crate::proxy::config::ProxyConfig;
use crate::proxy::handlers;
use crate::proxy::middleware::{auth_middleware, cors_layer};
use crate::proxy::token::{TokenPool, TokenUpdater};
use crate::proxy::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub pool: Arc<TokenPool>,
    pub updater: Arc<TokenUpdater>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppState {
    pub fn from_config(config: ProxyConfig) -> ProxyResult<Self> {
        let config = Arc::new(config);
        let pool = Arc::new(TokenPool::load(
            &config.tokens_file,
            config.max_token_failures,
        )?);
        let upstream = Arc::new(UpstreamClient::new(&config)?);
        let updater = Arc::new(TokenUpdater::new(
            config.clone(),
            pool.clone(),
            upstream.clone(),
        ));
        Ok(Self {
            config,
            pool,
            updater,
            upstream,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    // Client-facing and admin routes share the key check; health and the
    // service banner stay open for probes.
    let authed_routes = Router::new()
        .route(
            "/v1/chat/completions",
            post(handlers::chat::handle_chat_completions),
        )
        .route("/v1/models", get(handlers::models::handle_list_models))
        .route("/admin/tokens/stats", get(admin::admin_token_stats))
        .route("/admin/tokens/reload", post(admin::admin_reload_tokens))
        .route("/admin/tokens/reset/:index", post(admin::admin_reset_token))
        .route("/admin/tokens/reset-all", post(admin::admin_reset_all))
        .route(
            "/admin/tokens/updater/status",
            get(admin::admin_updater_status),
        )
        .route(
            "/admin/tokens/updater/force-update",
            post(admin::admin_force_update),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::models::handle_root))
        .route("/health", get(handlers::models::handle_health))
        .merge(authed_routes)
        .layer(cors_layer())
        .with_state(state)
}

pub async fn start_server(
    state: AppState,
) -> ProxyResult<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = build_router(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::Config(format!("cannot bind {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ProxyError::Config(format!("cannot read bound address: {}", e)))?;

    info!("K2Gate listening on http://{}", local_addr);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });
    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_state(tokens: &[&str], strict_key: Option<&str>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tokens_file = dir.path().join("tokens.txt");
        let contents: String = tokens.iter().map(|t| format!("{}\n", t)).collect();
        std::fs::write(&tokens_file, contents).expect("write tokens");

        let config = ProxyConfig {
            tokens_file,
            accounts_file: dir.path().join("accounts.txt"),
            valid_api_key: strict_key.unwrap_or_default().to_string(),
            allow_any_api_key: strict_key.is_none(),
            ..ProxyConfig::default()
        };
        let state = AppState::from_config(config).expect("state");
        (state, dir)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_token_counts() {
        let (state, _dir) = test_state(&["a", "b"], None);
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tokens"]["total"], 2);
        assert_eq!(body["tokens"]["active"], 2);
    }

    #[tokio::test]
    async fn models_lists_exactly_one_entry() {
        let (state, _dir) = test_state(&["a"], None);
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        let data = body["data"].as_array().expect("data array");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], crate::constants::DEFAULT_MODEL_ID);
        assert_eq!(data[0]["object"], "model");
    }

    #[tokio::test]
    async fn strict_auth_rejects_wrong_key() {
        let (state, _dir) = test_state(&["a"], Some("sk-secret"));
        let app = build_router(state);

        let denied = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("Authorization", "Bearer sk-secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_pool_returns_503_on_chat() {
        let (state, _dir) = test_state(&[], None);
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({
                            "model": "gpt-4",
                            "messages": [{ "role": "user", "content": "Hi" }],
                            "stream": false,
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "no_tokens_available");
    }

    #[tokio::test]
    async fn malformed_chat_body_returns_400() {
        let (state, _dir) = test_state(&["a"], None);
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("Content-Type", "application/json")
                    .body(Body::from("{\"model\": 7}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_stats_reload_and_reset_round_trip() {
        let (state, dir) = test_state(&["a", "b", "c"], None);
        let app = build_router(state.clone());

        state.pool.record_failure("b", "test");
        let stats = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/tokens/stats")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = body_json(stats).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["entries"][1]["failure_count"], 1);

        // Admin rewrites the file with two new tokens, then reloads.
        std::fs::write(dir.path().join("tokens.txt"), "x\ny\n").expect("rewrite");
        let reload = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/tokens/reload")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(reload.status(), StatusCode::OK);
        let body = body_json(reload).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["active"], 2);
        assert_eq!(state.pool.select().expect("token"), "x");

        let reset_bad = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/tokens/reset/9")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(reset_bad.status(), StatusCode::NOT_FOUND);

        let reset_all = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/tokens/reset-all")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(reset_all.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn updater_status_and_force_update_endpoints_respond() {
        let (state, _dir) = test_state(&["a"], None);
        let app = build_router(state);

        let status = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/admin/tokens/updater/status")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(status.status(), StatusCode::OK);
        let body = body_json(status).await;
        assert_eq!(body["enabled"], false);
        assert_eq!(body["running"], false);
        assert_eq!(body["in_progress"], false);

        let force = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/tokens/updater/force-update")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(force.status(), StatusCode::OK);
        let body = body_json(force).await;
        assert_eq!(body["scheduled"], true);
    }
}
