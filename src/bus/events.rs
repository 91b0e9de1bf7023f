//! 总线消息定义
//!
//! 渠道适配器产生 InboundMessage，分发循环产生 OutboundMessage；两者都是构造后不再修改的值。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 子代理 / 后台任务完成通知使用的保留渠道
pub const SYSTEM_CHANNEL: &str = "system";

/// 元数据键：中间进度消息
pub const META_PROGRESS: &str = "_progress";
/// 元数据键：工具调用提示（进度消息的一种）
pub const META_TOOL_HINT: &str = "_tool_hint";

/// 入站消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// 媒体引用（本地路径或 URL）
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// 指定时覆盖默认的 `channel:chat_id` 会话键
    #[serde(default)]
    pub session_key_override: Option<String>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: Map::new(),
            session_key_override: None,
        }
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key_override = Some(key.into());
        self
    }

    /// 会话键：覆盖值，或 `channel:chat_id`
    pub fn session_key(&self) -> String {
        match &self.session_key_override {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.channel, self.chat_id),
        }
    }
}

/// 出站消息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    /// 构造一条进度消息：继承原消息元数据并打上进度标记
    pub fn progress(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
        base: &Map<String, Value>,
        tool_hint: bool,
    ) -> Self {
        let mut metadata = base.clone();
        metadata.insert(META_PROGRESS.to_string(), Value::Bool(true));
        metadata.insert(META_TOOL_HINT.to_string(), Value::Bool(tool_hint));
        Self::new(channel, chat_id, content).with_metadata(metadata)
    }

    pub fn is_progress(&self) -> bool {
        flag(&self.metadata, META_PROGRESS)
    }

    pub fn is_tool_hint(&self) -> bool {
        flag(&self.metadata, META_TOOL_HINT)
    }
}

fn flag(metadata: &Map<String, Value>, key: &str) -> bool {
    metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_override_wins() {
        let msg = InboundMessage::new("telegram", "u1", "42", "hi");
        assert_eq!(msg.session_key(), "telegram:42");
        let msg = msg.with_session_key("shared");
        assert_eq!(msg.session_key(), "shared");
    }

    #[test]
    fn test_progress_markers() {
        let mut base = Map::new();
        base.insert("message_id".into(), Value::from("m1"));
        let hint = OutboundMessage::progress("cli", "direct", "read_file(\"a\")", &base, true);
        assert!(hint.is_progress());
        assert!(hint.is_tool_hint());
        assert_eq!(hint.metadata["message_id"], "m1");
        assert!(!OutboundMessage::new("cli", "direct", "done").is_progress());
    }
}
