//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::chat。
//! 约定：chat 不返回 Err，后端失败转成以 `Error calling LLM:` 开头的文本响应，
//! 由调用方像普通回复一样处理。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Message;

/// 模型发起的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// 参数对象（已从 JSON 字符串解码）
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// 随请求发送给模型的工具描述：{name, description, parameters}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次调用的 token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 模型响应
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Usage,
    /// 推理模型（如 deepseek-reasoner）返回的思考过程
    pub reasoning_content: Option<String>,
}

impl LlmResponse {
    /// 纯文本最终回答
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: "stop".to_string(),
            ..Default::default()
        }
    }

    /// 携带工具调用的响应
    pub fn tool_calls(content: Option<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content,
            tool_calls: calls,
            finish_reason: "tool_calls".to_string(),
            ..Default::default()
        }
    }

    /// 后端失败：以错误文本的形式返回
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: Some(format!("Error calling LLM: {}", message)),
            finish_reason: "error".to_string(),
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 一次 chat 请求的参数
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    /// 为空时按普通补全请求发送
    pub tools: &'a [ToolDefinition],
    pub model: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发送对话与工具描述，返回文本或工具调用
    async fn chat<'a>(&self, request: ChatRequest<'a>) -> LlmResponse;

    /// 未显式指定模型时使用的模型名
    fn default_model(&self) -> &str;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
