//! 会话消息：与 LLM API 对齐的消息结构
//!
//! 一条消息即会话中的一个 turn：user / assistant（可带工具调用）/ tool 结果 / system。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ToolCallRequest;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// tool 消息对应的调用 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// tool 消息的工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 推理模型的思考过程，仅在本轮内回传给模型，不落盘
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            reasoning_content: None,
            timestamp: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    pub fn assistant(content: Option<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// 携带工具调用的 assistant 消息
    pub fn assistant_with_tools(
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
        reasoning_content: Option<String>,
    ) -> Self {
        Self {
            tool_calls,
            reasoning_content,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// 工具执行结果
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::with_role(Role::Tool, Some(content.into()))
        }
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning_content = reasoning;
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialized_shape_omits_empty_fields() {
        let v = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(v, json!({"role": "user", "content": "hi"}));

        let call = ToolCallRequest::new("c1", "list_dir", json!({"path": "."}));
        let v = serde_json::to_value(Message::assistant_with_tools(None, vec![call], None)).unwrap();
        assert_eq!(v["role"], "assistant");
        assert!(v["content"].is_null());
        assert_eq!(v["tool_calls"][0]["name"], "list_dir");
    }

    #[test]
    fn test_tool_result_round_trips() {
        let msg = Message::tool_result("c1", "exec", "ok").with_timestamp(Utc::now());
        let line = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.role, Role::Tool);
    }
}
