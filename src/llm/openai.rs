//! OpenAI 兼容 API 客户端
//!
//! 直接以 reqwest 调用 `{base_url}/chat/completions`；支持 DeepSeek、OpenAI、自建代理等。
//! 推理模型的 `reasoning_content` 原样透出；任何失败都转成错误文本响应。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{ChatRequest, LlmClient, LlmResponse, ToolCallRequest, ToolDefinition, Usage};
use crate::memory::{Message, Role};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usage: &Usage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens
            .fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn build_body(&self, request: &ChatRequest<'_>) -> Value {
        let model = if request.model.is_empty() {
            self.model.as_str()
        } else {
            request.model
        };
        let mut body = json!({
            "model": model,
            "messages": request.messages.iter().map(to_wire_message).collect::<Vec<_>>(),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens.max(1),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(to_wire_tool).collect());
            body["tool_choice"] = Value::from("auto");
        }
        body
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<LlmResponse, String> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status.as_u16(), truncate(&body, 500)));
        }
        let parsed: WireResponse = resp.json().await.map_err(|e| e.to_string())?;
        parse_response(parsed)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat<'a>(&self, request: ChatRequest<'a>) -> LlmResponse {
        match self.send(&request).await {
            Ok(resp) => {
                self.usage.add(&resp.usage);
                resp
            }
            Err(e) => {
                tracing::warn!(error = %e, "LLM request failed");
                LlmResponse::error(e)
            }
        }
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

/// 空内容会被部分服务端拒绝：带工具调用的 assistant 用 null，其余用 "(empty)"
fn wire_content(msg: &Message) -> Value {
    match msg.content.as_deref() {
        Some(s) if !s.is_empty() => Value::from(s),
        _ if msg.role == Role::Assistant && !msg.tool_calls.is_empty() => Value::Null,
        _ => Value::from("(empty)"),
    }
}

fn to_wire_message(msg: &Message) -> Value {
    let mut out = json!({
        "role": msg.role.as_str(),
        "content": wire_content(msg),
    });
    if !msg.tool_calls.is_empty() {
        out["tool_calls"] = msg
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments.to_string() },
                })
            })
            .collect();
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = Value::from(id.as_str());
    }
    if let Some(name) = &msg.name {
        out["name"] = Value::from(name.as_str());
    }
    if let Some(reasoning) = &msg.reasoning_content {
        out["reasoning_content"] = Value::from(reasoning.as_str());
    }
    out
}

fn to_wire_tool(def: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        }
    })
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_response(resp: WireResponse) -> Result<LlmResponse, String> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| "response has no choices".to_string())?;
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| ToolCallRequest::new(c.id, c.function.name, decode_arguments(&c.function.arguments)))
        .collect();
    Ok(LlmResponse {
        content: choice.message.content,
        tool_calls,
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        usage: resp.usage.unwrap_or_default(),
        reasoning_content: choice.message.reasoning_content,
    })
}

/// 参数是 JSON 字符串；解析失败或不是对象时退化为空对象，交给校验器报缺参
fn decode_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) | Err(_) if raw.trim().is_empty() => json!({}),
        Ok(other) => {
            tracing::warn!(arguments = %other, "tool arguments are not an object");
            json!({})
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode tool arguments");
            json!({})
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_sanitizes_empty_content() {
        let call = ToolCallRequest::new("c1", "exec", json!({"command": "ls"}));
        let assistant = Message::assistant_with_tools(Some(String::new()), vec![call], None);
        let wire = to_wire_message(&assistant);
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"command":"ls"}"#);

        let user = Message::user("");
        assert_eq!(to_wire_message(&user)["content"], "(empty)");
    }

    #[test]
    fn test_parse_response_decodes_tool_arguments() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "reasoning_content": "thinking",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"a.txt\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        });
        let parsed: WireResponse = serde_json::from_value(raw).unwrap();
        let resp = parse_response(parsed).unwrap();
        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].arguments["path"], "a.txt");
        assert_eq!(resp.reasoning_content.as_deref(), Some("thinking"));
        assert_eq!(resp.usage.total_tokens, 5);
    }

    #[test]
    fn test_decode_arguments_falls_back_to_empty_object() {
        assert_eq!(decode_arguments("not json"), json!({}));
        assert_eq!(decode_arguments(""), json!({}));
        assert_eq!(decode_arguments("[1]"), json!({}));
    }
}
