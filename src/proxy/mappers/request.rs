use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};

// OpenAI Chat Completions request, reduced to the fields the gateway acts
// on. Sampling fields are passed through to the upstream untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stop: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named { function: NamedFunction },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> ProxyResult<()> {
        if self.messages.is_empty() {
            return Err(ProxyError::BadRequest("messages must not be empty".to_string()));
        }
        for msg in &self.messages {
            match msg.role.as_str() {
                "system" | "user" | "assistant" | "tool" => {}
                other => {
                    return Err(ProxyError::BadRequest(format!(
                        "unsupported message role: {}",
                        other
                    )))
                }
            }
        }
        if let Some(ToolChoice::Mode(mode)) = &self.tool_choice {
            match mode.as_str() {
                "auto" | "none" | "required" => {}
                other => {
                    return Err(ProxyError::BadRequest(format!(
                        "unsupported tool_choice: {}",
                        other
                    )))
                }
            }
        }
        if matches!(self.tool_choice, Some(ToolChoice::Mode(ref m)) if m == "required")
            && self.tools.as_ref().map_or(true, |t| t.is_empty())
        {
            return Err(ProxyError::BadRequest(
                "tool_choice 'required' needs a non-empty tools list".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tool_choice_is_none(&self) -> bool {
        matches!(self.tool_choice, Some(ToolChoice::Mode(ref m)) if m == "none")
    }

    pub fn declared_tool_names(&self) -> Vec<String> {
        self.tools
            .as_ref()
            .map(|tools| tools.iter().map(|t| t.function.name.clone()).collect())
            .unwrap_or_default()
    }
}

// Reduce a message's content to one text string. Image parts become a text
// placeholder so the upstream still receives a well-formed prompt.
pub fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::String(s) => s.clone(),
        MessageContent::Parts(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => out.push_str(text),
                    ContentPart::ImageUrl { image_url } => {
                        out.push_str(&format!("[image: {}]", image_url.url))
                    }
                    ContentPart::Unknown => {}
                }
            }
            out
        }
    }
}

fn flatten_message(msg: &ChatMessage) -> Value {
    let mut text = msg
        .content
        .as_ref()
        .map(flatten_content)
        .unwrap_or_default();

    // Assistant tool calls from earlier turns are replayed as the fenced
    // JSON the model was asked to emit, keeping the transcript coherent.
    if msg.role == "assistant" {
        if let Some(calls) = &msg.tool_calls {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&format!(
                "```json\n{}\n```",
                serde_json::to_string(&json!({ "tool_calls": calls })).unwrap_or_default()
            ));
        }
    }
    if msg.role == "tool" {
        let id = msg.tool_call_id.as_deref().unwrap_or("unknown");
        return json!({
            "role": "user",
            "content": format!("[tool result for {}]\n{}", id, text),
        });
    }

    json!({ "role": msg.role, "content": text })
}

// Deterministic description of the declared tools, prepended as a system
// message. This is the only tool-aware content the upstream ever sees.
pub fn build_tool_system_prompt(request: &ChatCompletionRequest) -> String {
    let mut prompt = String::from(
        "You have access to the following tools. To call a tool, respond with a \
         fenced JSON code block of this exact form:\n\
         ```json\n\
         {\"tool_calls\": [{\"name\": \"<tool name>\", \"arguments\": {<JSON arguments>}}]}\n\
         ```\n\
         Emit the block only when a tool call is needed; otherwise answer normally.\n\n\
         Available tools:\n",
    );
    if let Some(tools) = &request.tools {
        for tool in tools {
            prompt.push_str(&format!("\n### {}\n", tool.function.name));
            if let Some(description) = &tool.function.description {
                prompt.push_str(&format!("Description: {}\n", description));
            }
            if let Some(parameters) = &tool.function.parameters {
                prompt.push_str(&format!(
                    "Parameters (JSON Schema): {}\n",
                    serde_json::to_string(parameters).unwrap_or_default()
                ));
            }
        }
    }
    match &request.tool_choice {
        Some(ToolChoice::Mode(mode)) if mode == "required" => {
            prompt.push_str("\nYou must call at least one tool in your response.\n");
        }
        Some(ToolChoice::Named { function }) => {
            prompt.push_str(&format!(
                "\nYou must call the tool `{}` in your response.\n",
                function.name
            ));
        }
        _ => {}
    }
    prompt
}

fn datetime_variables() -> Value {
    let now = chrono::Local::now();
    json!({
        "{{CURRENT_DATETIME}}": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "{{CURRENT_DATE}}": now.format("%Y-%m-%d").to_string(),
        "{{CURRENT_TIME}}": now.format("%H:%M:%S").to_string(),
        "{{CURRENT_WEEKDAY}}": now.format("%A").to_string(),
        "{{CURRENT_TIMEZONE}}": now.format("%Z").to_string(),
    })
}

// Build the upstream chat envelope. The K2-Think service expects the chat
// metadata (chat/session ids, feature switches, model_item) alongside the
// OpenAI-looking core fields.
pub fn build_upstream_payload(
    request: &ChatCompletionRequest,
    model_id: &str,
    with_tool_prompt: bool,
) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
    if with_tool_prompt {
        messages.push(json!({
            "role": "system",
            "content": build_tool_system_prompt(request),
        }));
    }
    messages.extend(request.messages.iter().map(flatten_message));

    let chat_id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();

    let mut payload = json!({
        "stream": request.stream,
        "model": model_id,
        "messages": messages,
        "params": {},
        "tool_servers": [],
        "features": {
            "image_generation": false,
            "code_interpreter": false,
            "web_search": false,
        },
        "variables": datetime_variables(),
        "model_item": {
            "id": model_id,
            "object": "model",
            "owned_by": crate::constants::MODEL_OWNER,
            "root": model_id,
            "parent": Value::Null,
            "name": model_id,
            "status": "active",
            "connection_type": "external",
        },
        "background_tasks": {
            "title_generation": true,
            "tags_generation": true,
        },
        "chat_id": chat_id,
        "id": session_id,
        "session_id": session_id,
    });

    if let Some(temperature) = request.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        payload["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(stop) = &request.stop {
        payload["stop"] = stop.clone();
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).expect("request parses")
    }

    #[test]
    fn string_and_part_content_flatten_to_identical_text() {
        let as_string = MessageContent::String("Hello world".to_string());
        let as_parts = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "Hello ".to_string(),
            },
            ContentPart::Text {
                text: "world".to_string(),
            },
        ]);
        assert_eq!(flatten_content(&as_string), flatten_content(&as_parts));
    }

    #[test]
    fn image_parts_become_placeholders() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "Look: ".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/cat.png".to_string(),
                },
            },
        ]);
        assert_eq!(
            flatten_content(&content),
            "Look: [image: https://example.com/cat.png]"
        );
    }

    #[test]
    fn empty_messages_are_rejected() {
        let req = parse(json!({ "model": "gpt-4", "messages": [] }));
        assert!(req.validate().is_err());
    }

    #[test]
    fn unknown_tool_choice_is_rejected() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{ "role": "user", "content": "hi" }],
            "tool_choice": "sometimes",
        }));
        assert!(req.validate().is_err());
    }

    #[test]
    fn required_tool_choice_without_tools_is_rejected() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{ "role": "user", "content": "hi" }],
            "tool_choice": "required",
        }));
        assert!(req.validate().is_err());
    }

    #[test]
    fn named_tool_choice_parses() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{ "role": "user", "content": "hi" }],
            "tools": [{ "type": "function", "function": { "name": "get_weather" } }],
            "tool_choice": { "type": "function", "function": { "name": "get_weather" } },
        }));
        req.validate().expect("valid");
        assert_eq!(req.declared_tool_names(), vec!["get_weather"]);
    }

    #[test]
    fn upstream_payload_carries_core_fields() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{ "role": "user", "content": "Hi" }],
            "stream": false,
            "temperature": 0.5,
        }));
        let payload = build_upstream_payload(&req, "MBZUAI-IFM/K2-Think", false);
        assert_eq!(payload["model"], "MBZUAI-IFM/K2-Think");
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["temperature"], 0.5);
        assert_eq!(payload["messages"][0]["content"], "Hi");
        assert!(payload["chat_id"].as_str().is_some());
        assert_eq!(payload["model_item"]["root"], "MBZUAI-IFM/K2-Think");
        assert!(payload["model_item"]["parent"].is_null());
        assert_eq!(payload["background_tasks"]["title_generation"], true);
        assert_eq!(payload["background_tasks"]["tags_generation"], true);
    }

    #[test]
    fn tool_prompt_is_prepended_as_system_message() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [{ "role": "user", "content": "weather?" }],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Look up the weather",
                    "parameters": { "type": "object", "properties": { "city": { "type": "string" } } },
                }
            }],
        }));
        let payload = build_upstream_payload(&req, "MBZUAI-IFM/K2-Think", true);
        let first = &payload["messages"][0];
        assert_eq!(first["role"], "system");
        let prompt = first["content"].as_str().expect("prompt text");
        assert!(prompt.contains("get_weather"));
        assert!(prompt.contains("Look up the weather"));
        assert!(prompt.contains("tool_calls"));
    }

    #[test]
    fn tool_role_messages_are_rewritten_for_the_upstream() {
        let req = parse(json!({
            "model": "gpt-4",
            "messages": [
                { "role": "user", "content": "weather?" },
                { "role": "tool", "tool_call_id": "call_0", "content": "{\"temp\": 21}" },
            ],
        }));
        let payload = build_upstream_payload(&req, "MBZUAI-IFM/K2-Think", false);
        let tool_msg = &payload["messages"][1];
        assert_eq!(tool_msg["role"], "user");
        let text = tool_msg["content"].as_str().expect("text");
        assert!(text.contains("call_0"));
        assert!(text.contains("{\"temp\": 21}"));
    }
}
