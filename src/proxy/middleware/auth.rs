use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ProxyError;
use crate::proxy::server::AppState;

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

pub fn is_authorized(
    provided: Option<&str>,
    valid_api_key: &str,
    allow_any_api_key: bool,
) -> bool {
    if allow_any_api_key {
        return true;
    }
    provided
        .map(|candidate| constant_time_str_eq(candidate, valid_api_key))
        .unwrap_or(false)
}

// Client key check for the OpenAI and admin surfaces. Permissive mode
// accepts anything, including a missing header; strict mode requires the
// configured key as a bearer token.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == axum::http::Method::OPTIONS {
        return next.run(request).await;
    }

    let provided = bearer_token(&request);
    if is_authorized(
        provided,
        &state.config.valid_api_key,
        state.config.allow_any_api_key,
    ) {
        next.run(request).await
    } else {
        tracing::warn!("Rejected request with invalid API key: {}", request.uri().path());
        ProxyError::Auth.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare_matches_and_rejects() {
        assert!(constant_time_str_eq("sk-abc", "sk-abc"));
        assert!(!constant_time_str_eq("sk-abc", "sk-abd"));
        assert!(!constant_time_str_eq("sk-abc", "sk-abcd"));
    }

    #[test]
    fn permissive_mode_accepts_anything() {
        assert!(is_authorized(None, "sk-key", true));
        assert!(is_authorized(Some("whatever"), "sk-key", true));
    }

    #[test]
    fn strict_mode_requires_exact_key() {
        assert!(is_authorized(Some("sk-key"), "sk-key", false));
        assert!(!is_authorized(Some("wrong"), "sk-key", false));
        assert!(!is_authorized(None, "sk-key", false));
    }
}
