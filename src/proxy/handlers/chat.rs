use axum::{
    body::Body,
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::constants::NOTHINK_SUFFIX;
use crate::error::ProxyError;
use crate::proxy::mappers::request::{build_upstream_payload, ChatCompletionRequest, ToolChoice};
use crate::proxy::mappers::response::{
    build_completion_response, estimate_prompt_tokens, translate_completion,
};
use crate::proxy::mappers::streaming::{create_chat_sse_stream, StreamContext};
use crate::proxy::mappers::tools::ToolScan;
use crate::proxy::server::AppState;

// Auth-failure markers the upstream has been observed to put in otherwise
// successful response bodies.
const AUTH_FAILURE_MARKERS: [&str; 5] = [
    "401",
    "unauthorized",
    "invalid token",
    "authentication failed",
    "token expired",
];

// Streaming responses are peeked up to this many bytes before any SSE data
// is committed to the client, so a 200 whose body is really an auth error
// still rotates the token.
const STREAM_PEEK_LIMIT: usize = 1024;

// A 200 body counts as a token failure only when it is an error object whose
// detail text carries a well-known auth marker. Answer text merely
// mentioning one of the markers must not burn a token.
fn is_auth_failure_text(text: &str) -> bool {
    let Ok(body) = serde_json::from_str::<Value>(text.trim()) else {
        return false;
    };
    let detail = body
        .get("detail")
        .and_then(Value::as_str)
        .or_else(|| {
            body.get("error").and_then(|e| {
                e.as_str()
                    .or_else(|| e.get("message").and_then(Value::as_str))
            })
        });
    let Some(detail) = detail else {
        return false;
    };
    let lowered = detail.to_ascii_lowercase();
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

// Streaming bodies may carry the auth error either as a bare JSON object or
// framed as the first SSE event.
fn is_auth_failure_body(text: &str) -> bool {
    if is_auth_failure_text(text) {
        return true;
    }
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("data: "))
        .any(is_auth_failure_text)
}

// Dispatcher-side view of the consecutive-disable refresh trigger: once two
// distinct tokens in a row are disabled within one request (and the pool was
// big enough for that to be surprising), the whole pool is probably expired
// and a refresh is scheduled without blocking the request.
struct FailureTracker {
    pool_size_at_start: usize,
    consecutive_disables: u32,
    refresh_triggered: bool,
}

impl FailureTracker {
    fn new(pool_size_at_start: usize) -> Self {
        Self {
            pool_size_at_start,
            consecutive_disables: 0,
            refresh_triggered: false,
        }
    }

    fn note_failure(&mut self, state: &AppState, token: &str, reason: &str) {
        let (_, disabled_now) = state.pool.record_failure(token, reason);
        if disabled_now {
            self.consecutive_disables += 1;
        } else {
            self.consecutive_disables = 0;
        }
        if self.consecutive_disables >= 2
            && self.pool_size_at_start > 2
            && !self.refresh_triggered
            && state.config.enable_token_auto_update
        {
            warn!("Two consecutive tokens disabled, scheduling a token refresh");
            state.updater.force_update();
            self.refresh_triggered = true;
        }
    }
}

fn resolve_models(state: &AppState, requested: &str) -> (String, bool) {
    let nothink_requested = requested.ends_with(NOTHINK_SUFFIX);
    let upstream_model = if state.config.model_override {
        state.config.upstream_model_id.clone()
    } else {
        requested.trim_end_matches(NOTHINK_SUFFIX).to_string()
    };
    if state.config.model_override && requested != upstream_model {
        info!("Client model {} mapped to {}", requested, upstream_model);
    }
    let output_thinking = state.config.output_thinking && !nothink_requested;
    (upstream_model, output_thinking)
}

fn tool_scan_for(state: &AppState, request: &ChatCompletionRequest) -> Option<ToolScan> {
    let tools_enabled = state.config.tool_support
        && request.tools.as_ref().map_or(false, |t| !t.is_empty())
        && !request.tool_choice_is_none();
    if !tools_enabled {
        return None;
    }
    let keep_undeclared = match &request.tool_choice {
        None => true,
        Some(ToolChoice::Mode(mode)) => mode == "auto",
        Some(ToolChoice::Named { .. }) => false,
    };
    Some(ToolScan {
        declared: request.declared_tool_names(),
        keep_undeclared,
        scan_limit: state.config.scan_limit,
    })
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::BadRequest(format!("invalid request body: {}", e)).into_response()
        }
    };
    if let Err(e) = request.validate() {
        return e.into_response();
    }

    let (upstream_model, output_thinking) = resolve_models(&state, &request.model);
    let tool_scan = tool_scan_for(&state, &request);

    info!(
        "Chat request: {} | {} messages | stream: {} | tools: {}",
        request.model,
        request.messages.len(),
        request.stream,
        tool_scan.is_some(),
    );

    let payload = build_upstream_payload(&request, &upstream_model, tool_scan.is_some());
    let prompt_tokens = estimate_prompt_tokens(&request);

    let pool_size_at_start = state.pool.len();
    let max_attempts = pool_size_at_start.max(1);
    let mut tracker = FailureTracker::new(pool_size_at_start);
    let mut last_failure = String::new();

    for attempt in 0..max_attempts {
        let Some(token) = state.pool.select() else {
            return ProxyError::PoolEmpty.into_response();
        };
        debug!("Dispatch attempt {}/{}", attempt + 1, max_attempts);

        let response = match state.upstream.chat(&token, &payload, request.stream).await {
            Ok(response) => response,
            Err(ProxyError::TokenAuthFailed(reason)) => {
                tracker.note_failure(&state, &token, &reason);
                last_failure = reason;
                continue;
            }
            Err(other) => return other.into_response(),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let reason = format!("upstream HTTP {}", status.as_u16());
            tracker.note_failure(&state, &token, &reason);
            last_failure = reason;
            continue;
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Upstream error {}: {}", status.as_u16(), text);
            return ProxyError::Upstream(format!("HTTP {}: {}", status.as_u16(), text))
                .into_response();
        }

        if request.stream {
            // Peek the first bytes before returning any SSE: the upstream
            // has been seen answering 200 with an auth-error body, which
            // must burn the token and rotate instead of reaching the client
            // as a broken stream.
            let mut upstream_stream = Box::pin(response.bytes_stream());
            let mut peeked = BytesMut::new();
            let mut peek_error: Option<String> = None;
            while peeked.len() < STREAM_PEEK_LIMIT && !peeked.contains(&b'\n') {
                match upstream_stream.next().await {
                    Some(Ok(bytes)) => peeked.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        peek_error = Some(format!("stream error during peek: {}", e));
                        break;
                    }
                    None => break,
                }
            }
            if peek_error.is_none() && peeked.is_empty() {
                peek_error = Some("empty upstream stream".to_string());
            }
            if peek_error.is_none() && is_auth_failure_body(&String::from_utf8_lossy(&peeked)) {
                peek_error = Some("auth failure in upstream stream body".to_string());
            }
            if let Some(reason) = peek_error {
                tracker.note_failure(&state, &token, &reason);
                last_failure = reason;
                continue;
            }

            state.pool.record_success(&token);
            let combined = futures::stream::once(async move {
                Ok::<Bytes, reqwest::Error>(peeked.freeze())
            })
            .chain(upstream_stream);
            let sse = create_chat_sse_stream(
                Box::pin(combined),
                StreamContext {
                    model: upstream_model.clone(),
                    output_thinking,
                    tool_scan: tool_scan.clone(),
                },
            );
            return Response::builder()
                .header("Content-Type", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .header("Connection", "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(Body::from_stream(sse))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return ProxyError::Upstream(format!("unreadable upstream body: {}", e))
                    .into_response()
            }
        };
        if is_auth_failure_text(&text) {
            let reason = "auth failure in upstream body".to_string();
            tracker.note_failure(&state, &token, &reason);
            last_failure = reason;
            continue;
        }

        state.pool.record_success(&token);
        let translated = translate_completion(&text, output_thinking, tool_scan.as_ref());
        let completion = build_completion_response(&upstream_model, &translated, prompt_tokens);
        return (StatusCode::OK, Json(completion)).into_response();
    }

    if state.pool.active_len() == 0 {
        ProxyError::PoolEmpty.into_response()
    } else {
        ProxyError::Upstream(format!("all token attempts failed: {}", last_failure))
            .into_response()
    }
}
