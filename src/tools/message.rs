//! message 工具：模型在一轮中主动向某个渠道/会话发送消息
//!
//! 目标等于本轮来源会话时标记「本轮已发送」，分发循环据此不再自动回复。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::{MessageBus, OutboundMessage};
use crate::tools::{Tool, ToolContext};

pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

fn non_empty<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Use this when you want to communicate something."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The message content to send"},
                "channel": {"type": "string", "description": "Optional: target channel (cli, telegram, ...)"},
                "chat_id": {"type": "string", "description": "Optional: target chat/user ID"},
                "media": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional: list of file paths to attach"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let content = non_empty(&args, "content").unwrap_or_default();
        let channel = non_empty(&args, "channel").unwrap_or(&ctx.channel);
        let chat_id = non_empty(&args, "chat_id").unwrap_or(&ctx.chat_id);
        if channel.is_empty() || chat_id.is_empty() {
            return Err("No target channel/chat specified".to_string());
        }
        let media: Vec<String> = args
            .get("media")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let is_origin = ctx.is_origin(channel, chat_id);
        let mut msg = OutboundMessage::new(channel, chat_id, content).with_media(media.clone());
        if is_origin {
            msg.reply_to = ctx.message_id.clone();
        }
        self.bus.publish_outbound(msg);
        if is_origin {
            ctx.mark_sent();
        }

        let mut reply = format!("Message sent to {}:{}", channel, chat_id);
        if !media.is_empty() {
            reply.push_str(&format!(" with {} attachments", media.len()));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_to_origin_marks_turn() {
        let bus = Arc::new(MessageBus::new());
        let tool = MessageTool::new(bus.clone());
        let ctx = ToolContext::new("cli", "direct", "cli:direct");

        let out = tool
            .execute(json!({"content": "hello", "media": ["a.png"]}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "Message sent to cli:direct with 1 attachments");
        assert!(ctx.sent_in_turn());
        let msg = bus.consume_outbound().await;
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.media, vec!["a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_send_elsewhere_keeps_flag_clear() {
        let bus = Arc::new(MessageBus::new());
        let tool = MessageTool::new(bus.clone());
        let ctx = ToolContext::new("cli", "direct", "cli:direct");
        tool.execute(json!({"content": "hi", "chat_id": "other"}), &ctx)
            .await
            .unwrap();
        assert!(!ctx.sent_in_turn());
        assert_eq!(bus.outbound_size(), 1);
    }

    #[tokio::test]
    async fn test_no_target() {
        let tool = MessageTool::new(Arc::new(MessageBus::new()));
        let err = tool
            .execute(json!({"content": "hi"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err, "No target channel/chat specified");
    }
}
