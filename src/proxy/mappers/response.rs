use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::constants::{THINK_CLOSE, THINK_OPEN};
use crate::proxy::mappers::request::{flatten_content, ChatCompletionRequest};
use crate::proxy::mappers::tags::{Segment, TagParser};
use crate::proxy::mappers::tools::{extract_tool_calls, ToolCall, ToolScan};

#[derive(Debug)]
pub struct TranslatedCompletion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: &'static str,
}

// Pull the accumulated text out of an upstream body. The upstream answers
// with SSE framing in both modes, but a plain JSON completion body is
// accepted too.
pub fn extract_upstream_text(raw: &str) -> String {
    if raw.lines().any(|line| line.trim_start().starts_with("data:")) {
        let mut text = String::new();
        for line in raw.lines() {
            let line = line.trim();
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            if let Some(delta) = event
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
            {
                text.push_str(delta);
            }
        }
        return text;
    }

    let Ok(body) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    let choice = body.get("choices").and_then(Value::as_array).and_then(|c| c.first());
    choice
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .or_else(|| {
            choice
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
        .unwrap_or_default()
}

// Run the tagged text through the parser and produce the final message
// content plus any extracted tool calls.
pub fn translate_completion(
    raw: &str,
    output_thinking: bool,
    tool_scan: Option<&ToolScan>,
) -> TranslatedCompletion {
    let text = extract_upstream_text(raw);
    let mut parser = TagParser::new();
    let mut segments = parser.feed(&text);
    segments.extend(parser.finish());

    let answer_text: String = segments
        .iter()
        .filter_map(|s| match s {
            Segment::Answer(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();

    let (tool_calls, answer_final) = match tool_scan {
        Some(scan) => extract_tool_calls(&answer_text, scan),
        None => (Vec::new(), answer_text.clone()),
    };

    let mut content = String::new();
    if tool_calls.is_empty() {
        // No extraction happened; replay the segments in order so think and
        // answer regions keep their original interleaving.
        for segment in &segments {
            match segment {
                Segment::Answer(t) => content.push_str(t),
                Segment::Think(t) => {
                    if output_thinking {
                        content.push_str(t);
                    }
                }
                Segment::ThinkStart => {
                    if output_thinking {
                        content.push_str(THINK_OPEN);
                    }
                }
                Segment::ThinkEnd => {
                    if output_thinking {
                        content.push_str(THINK_CLOSE);
                    }
                }
            }
        }
    } else {
        // The extractor rewrote the answer region as a whole; splice the
        // residual in at the first answer position.
        let mut answer_emitted = false;
        for segment in &segments {
            match segment {
                Segment::Answer(_) => {
                    if !answer_emitted {
                        content.push_str(&answer_final);
                        answer_emitted = true;
                    }
                }
                Segment::Think(t) => {
                    if output_thinking {
                        content.push_str(t);
                    }
                }
                Segment::ThinkStart => {
                    if output_thinking {
                        content.push_str(THINK_OPEN);
                    }
                }
                Segment::ThinkEnd => {
                    if output_thinking {
                        content.push_str(THINK_CLOSE);
                    }
                }
            }
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };
    TranslatedCompletion {
        content,
        tool_calls,
        finish_reason,
    }
}

// Conservative whitespace-word token estimate; exactness is not a goal,
// monotonicity is.
pub fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

pub fn estimate_prompt_tokens(request: &ChatCompletionRequest) -> u64 {
    request
        .messages
        .iter()
        .filter_map(|m| m.content.as_ref())
        .map(|c| estimate_tokens(&flatten_content(c)))
        .sum()
}

pub fn build_completion_response(
    model: &str,
    translated: &TranslatedCompletion,
    prompt_tokens: u64,
) -> Value {
    let completion_tokens = estimate_tokens(&translated.content);
    let mut message = json!({
        "role": "assistant",
        "content": translated.content,
    });
    if !translated.tool_calls.is_empty() {
        message["tool_calls"] = serde_json::to_value(&translated.tool_calls).unwrap_or_default();
    }
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": translated.finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    })
}
