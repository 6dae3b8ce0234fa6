use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::error;
use uuid::Uuid;

use crate::constants::{THINK_CLOSE, THINK_OPEN};
use crate::proxy::mappers::tags::{Segment, TagParser};
use crate::proxy::mappers::tools::{extract_tool_calls, ToolCall, ToolScan};

pub struct StreamContext {
    pub model: String,
    pub output_thinking: bool,
    // When set, answer text is buffered and scanned for tool calls at end
    // of stream instead of being forwarded live; the residual text is what
    // reaches the client.
    pub tool_scan: Option<ToolScan>,
}

// Turn parser segments into the content pieces that go to the client.
// Answer text always lands in `answer_acc`; it is additionally returned for
// live emission unless answers are being buffered for tool extraction.
fn render_segments(
    segments: Vec<Segment>,
    output_thinking: bool,
    buffer_answers: bool,
    answer_acc: &mut String,
) -> Vec<String> {
    let mut pieces = Vec::new();
    for segment in segments {
        match segment {
            Segment::Answer(text) => {
                answer_acc.push_str(&text);
                if !buffer_answers {
                    pieces.push(text);
                }
            }
            Segment::Think(text) => {
                if output_thinking {
                    pieces.push(text);
                }
            }
            Segment::ThinkStart => {
                if output_thinking {
                    pieces.push(THINK_OPEN.to_string());
                }
            }
            Segment::ThinkEnd => {
                if output_thinking {
                    pieces.push(THINK_CLOSE.to_string());
                }
            }
        }
    }
    pieces
}

fn content_chunk(id: &str, created: i64, model: &str, text: &str, with_role: bool) -> Bytes {
    let mut delta = json!({ "content": text });
    if with_role {
        delta["role"] = json!("assistant");
    }
    sse_data(&json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }],
    }))
}

fn tool_calls_chunk(
    id: &str,
    created: i64,
    model: &str,
    calls: &[ToolCall],
    with_role: bool,
) -> Bytes {
    let calls_json: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(index, call)| {
            json!({
                "index": index,
                "id": call.id,
                "type": "function",
                "function": { "name": call.function.name, "arguments": call.function.arguments },
            })
        })
        .collect();
    let mut delta = json!({ "tool_calls": calls_json });
    if with_role {
        delta["role"] = json!("assistant");
    }
    sse_data(&json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": Value::Null }],
    }))
}

fn finish_chunk(
    id: &str,
    created: i64,
    model: &str,
    finish_reason: &str,
    stream_error: Option<&str>,
) -> Bytes {
    let mut chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": {}, "finish_reason": finish_reason }],
    });
    if let Some(message) = stream_error {
        chunk["error"] = json!({
            "message": message,
            "type": "upstream_error",
            "code": "stream_error",
        });
    }
    sse_data(&chunk)
}

fn sse_data(value: &Value) -> Bytes {
    Bytes::from(format!(
        "data: {}\n\n",
        serde_json::to_string(value).unwrap_or_default()
    ))
}

fn done_marker() -> Bytes {
    Bytes::from("data: [DONE]\n\n")
}

fn delta_content(event: &Value) -> Option<&str> {
    event
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()
}

// Translate the upstream SSE byte stream into OpenAI chat-completion
// chunks. The upstream's tagged text is re-segmented through `TagParser`;
// thinking is re-wrapped in literal tags or dropped per `output_thinking`.
// The chunk id is generated once and reused for every chunk of the
// response.
pub fn create_chat_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    ctx: StreamContext,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    let stream_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created_ts = Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut buffer = BytesMut::new();
        let mut parser = TagParser::new();
        let mut role_sent = false;
        let mut answer_acc = String::new();
        let buffer_answers = ctx.tool_scan.is_some();

        'receive: while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line_str) = std::str::from_utf8(&line_raw) else {
                            continue;
                        };
                        let line = line_str.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let Some(json_part) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let json_part = json_part.trim();
                        if json_part == "[DONE]" {
                            break 'receive;
                        }
                        let Ok(event) = serde_json::from_str::<Value>(json_part) else {
                            continue;
                        };
                        let Some(delta) = delta_content(&event) else {
                            continue;
                        };
                        let pieces = render_segments(
                            parser.feed(delta),
                            ctx.output_thinking,
                            buffer_answers,
                            &mut answer_acc,
                        );
                        for piece in pieces {
                            let with_role = !role_sent;
                            role_sent = true;
                            yield Ok::<Bytes, String>(content_chunk(
                                &stream_id, created_ts, &ctx.model, &piece, with_role,
                            ));
                        }
                    }
                }
                Err(e) => {
                    error!("Upstream stream error: {}", e);
                    yield Ok(finish_chunk(
                        &stream_id,
                        created_ts,
                        &ctx.model,
                        "stop",
                        Some(&e.to_string()),
                    ));
                    yield Ok(done_marker());
                    return;
                }
            }
        }

        let pieces = render_segments(
            parser.finish(),
            ctx.output_thinking,
            buffer_answers,
            &mut answer_acc,
        );
        for piece in pieces {
            let with_role = !role_sent;
            role_sent = true;
            yield Ok(content_chunk(&stream_id, created_ts, &ctx.model, &piece, with_role));
        }

        let mut finish_reason = "stop";
        if let Some(scan) = &ctx.tool_scan {
            let (calls, residual) = extract_tool_calls(&answer_acc, scan);
            let tail = if calls.is_empty() { answer_acc.clone() } else { residual };
            if !tail.is_empty() {
                let with_role = !role_sent;
                role_sent = true;
                yield Ok(content_chunk(&stream_id, created_ts, &ctx.model, &tail, with_role));
            }
            if !calls.is_empty() {
                yield Ok(tool_calls_chunk(&stream_id, created_ts, &ctx.model, &calls, !role_sent));
                finish_reason = "tool_calls";
            }
        }

        yield Ok(finish_chunk(&stream_id, created_ts, &ctx.model, finish_reason, None));
        yield Ok(done_marker());
    };
    Box::pin(stream)
}
