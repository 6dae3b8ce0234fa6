use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid or missing API key")]
    Auth,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no tokens available")]
    PoolEmpty,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timed out after {0}s")]
    UpstreamTimeout(u64),

    // Internal to the dispatch loop; consumed by retry handling and never
    // serialized to a client.
    #[error("token rejected by upstream: {0}")]
    TokenAuthFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("token refresh failed: {0}")]
    Refresher(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth => StatusCode::UNAUTHORIZED,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PoolEmpty => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::TokenAuthFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Config(_) | ProxyError::Refresher(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Auth => "authentication_error",
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::PoolEmpty => "service_unavailable",
            ProxyError::Upstream(_) | ProxyError::TokenAuthFailed(_) => "upstream_error",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::Config(_) | ProxyError::Refresher(_) => "api_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        if matches!(self, ProxyError::PoolEmpty) {
            body["error"]["code"] = json!("no_tokens_available");
        }
        (self.status(), Json(body)).into_response()
    }
}
