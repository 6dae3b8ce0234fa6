use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*\n?(.*?)```").expect("Invalid json fence regex")
});
static CALL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)call\s+([A-Za-z0-9_\-]+)\s+with\s+").expect("Invalid call pattern regex")
});

// OpenAI tool-call shape. `arguments` is always a JSON-serialized string,
// even when the model emitted an object.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub struct ToolScan {
    pub declared: Vec<String>,
    // `tool_choice: "auto"` keeps calls whose name was never declared.
    pub keep_undeclared: bool,
    pub scan_limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    name: String,
    arguments: Value,
}

// Scan answer text for embedded tool-call JSON and lift it into OpenAI
// `tool_calls`, returning the text with the matched fragments removed.
// Recognized forms, in order: fenced ```json blocks, inline JSON objects,
// and a `call <name> with {...}` phrase. Only the trailing `scan_limit`
// bytes are examined.
pub fn extract_tool_calls(text: &str, scan: &ToolScan) -> (Vec<ToolCall>, String) {
    let start = scan_start(text, scan.scan_limit);
    let (prefix, region) = text.split_at(start);

    let mut candidates = Vec::new();
    let mut residual = region.to_string();

    extract_from_fences(&mut residual, &mut candidates, scan);
    if candidates.is_empty() {
        extract_inline_objects(&mut residual, &mut candidates, scan);
    }
    if candidates.is_empty() {
        extract_call_phrases(&mut residual, &mut candidates);
    }

    let calls: Vec<ToolCall> = candidates
        .into_iter()
        .filter(|c| scan.keep_undeclared || scan.declared.iter().any(|d| d == &c.name))
        .enumerate()
        .map(|(i, c)| ToolCall {
            id: format!("call_{}", i),
            kind: "function",
            function: ToolCallFunction {
                name: c.name,
                arguments: serde_json::to_string(&c.arguments).unwrap_or_else(|_| "{}".to_string()),
            },
        })
        .collect();

    let mut cleaned = String::with_capacity(prefix.len() + residual.len());
    cleaned.push_str(prefix);
    cleaned.push_str(&residual);
    let cleaned = cleaned.trim().to_string();
    (calls, cleaned)
}

fn scan_start(text: &str, scan_limit: usize) -> usize {
    if text.len() <= scan_limit {
        return 0;
    }
    let mut start = text.len() - scan_limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    start
}

// Shapes accepted inside a fence or inline object:
//   {"tool_calls": [{"name": ..., "arguments": ...}, ...]}
//   {"function_call": {"name": ..., "arguments": ...}}
//   {"name": ..., "arguments": ...}        (declared names only)
//   [{"name": ..., "arguments": ...}, ...] (fenced form only)
fn candidates_from_value(value: &Value, scan: &ToolScan, allow_array: bool) -> Option<Vec<Candidate>> {
    if let Some(obj) = value.as_object() {
        if let Some(calls) = obj.get("tool_calls").and_then(Value::as_array) {
            let parsed: Vec<Candidate> = calls.iter().filter_map(candidate_from_entry).collect();
            if !parsed.is_empty() {
                return Some(parsed);
            }
            return None;
        }
        if let Some(call) = obj.get("function_call") {
            return candidate_from_entry(call).map(|c| vec![c]);
        }
        if let Some(candidate) = candidate_from_entry(value) {
            // A bare {name, arguments} object is only trusted when the name
            // was actually declared; arbitrary JSON is left alone.
            if scan.declared.iter().any(|d| d == &candidate.name) {
                return Some(vec![candidate]);
            }
        }
        return None;
    }
    if allow_array {
        if let Some(entries) = value.as_array() {
            let parsed: Vec<Candidate> = entries.iter().filter_map(candidate_from_entry).collect();
            if !parsed.is_empty() && parsed.len() == entries.len() {
                return Some(parsed);
            }
        }
    }
    None
}

fn candidate_from_entry(entry: &Value) -> Option<Candidate> {
    let obj = entry.as_object()?;
    let name = obj.get("name").and_then(Value::as_str)?.to_string();
    let arguments = obj.get("arguments").cloned().unwrap_or(Value::Object(Default::default()));
    // String arguments may themselves be serialized JSON.
    let arguments = match arguments {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    };
    Some(Candidate { name, arguments })
}

fn extract_from_fences(residual: &mut String, out: &mut Vec<Candidate>, scan: &ToolScan) {
    loop {
        let mut matched: Option<(std::ops::Range<usize>, Vec<Candidate>)> = None;
        for captures in JSON_FENCE.captures_iter(residual) {
            let whole = captures.get(0).expect("fence match");
            let inner = captures.get(1).expect("fence body").as_str();
            let Ok(value) = serde_json::from_str::<Value>(inner.trim()) else {
                // Malformed JSON stays in place as answer text.
                continue;
            };
            if let Some(candidates) = candidates_from_value(&value, scan, true) {
                matched = Some((whole.range(), candidates));
                break;
            }
        }
        match matched {
            Some((range, candidates)) => {
                debug!("Extracted {} tool call(s) from json fence", candidates.len());
                out.extend(candidates);
                remove_range(residual, range);
            }
            None => break,
        }
    }
}

fn extract_inline_objects(residual: &mut String, out: &mut Vec<Candidate>, scan: &ToolScan) {
    loop {
        let mut matched: Option<(std::ops::Range<usize>, Vec<Candidate>)> = None;
        let mut search_from = 0;
        while let Some(offset) = residual[search_from..].find('{') {
            let start = search_from + offset;
            let Some(end) = balanced_object_end(&residual[start..]) else {
                search_from = start + 1;
                continue;
            };
            let span = &residual[start..start + end];
            if let Ok(value) = serde_json::from_str::<Value>(span) {
                if let Some(candidates) = candidates_from_value(&value, scan, false) {
                    matched = Some((start..start + end, candidates));
                    break;
                }
            }
            search_from = start + 1;
        }
        match matched {
            Some((range, candidates)) => {
                debug!(
                    "Extracted {} tool call(s) from inline JSON",
                    candidates.len()
                );
                out.extend(candidates);
                remove_range(residual, range);
            }
            None => break,
        }
    }
}

fn extract_call_phrases(residual: &mut String, out: &mut Vec<Candidate>) {
    loop {
        let mut matched: Option<(std::ops::Range<usize>, Candidate)> = None;
        for captures in CALL_PATTERN.captures_iter(residual) {
            let whole = captures.get(0).expect("call match");
            let name = captures.get(1).expect("tool name").as_str().to_string();
            let tail = &residual[whole.end()..];
            let Some(brace_offset) = tail.find('{') else {
                continue;
            };
            // Only whitespace may sit between "with" and the JSON object.
            if !tail[..brace_offset].trim().is_empty() {
                continue;
            }
            let json_start = whole.end() + brace_offset;
            let Some(len) = balanced_object_end(&residual[json_start..]) else {
                continue;
            };
            let span = &residual[json_start..json_start + len];
            if let Ok(arguments) = serde_json::from_str::<Value>(span) {
                matched = Some((
                    whole.start()..json_start + len,
                    Candidate { name, arguments },
                ));
                break;
            }
        }
        match matched {
            Some((range, candidate)) => {
                debug!("Extracted tool call from call phrase: {}", candidate.name);
                out.push(candidate);
                remove_range(residual, range);
            }
            None => break,
        }
    }
}

// Byte length of a balanced `{...}` starting at the beginning of `s`,
// respecting string literals and escapes.
fn balanced_object_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn remove_range(text: &mut String, range: std::ops::Range<usize>) {
    text.replace_range(range, "");
}
