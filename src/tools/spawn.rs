//! spawn 工具：把耗时任务交给后台子代理

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::SubagentManager;
use crate::tools::{Tool, ToolContext};

pub struct SpawnTool {
    manager: Arc<SubagentManager>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. \
         Use this for complex or time-consuming tasks that can run independently. \
         The subagent will complete the task and report back when done."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "The task for the subagent to complete"},
                "label": {"type": "string", "description": "Optional short label for the task (for display)"}
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let task = args.get("task").and_then(Value::as_str).unwrap_or_default();
        let label = args.get("label").and_then(Value::as_str);
        let channel = if ctx.channel.is_empty() { "cli" } else { ctx.channel.as_str() };
        let chat_id = if ctx.chat_id.is_empty() { "direct" } else { ctx.chat_id.as_str() };
        let session_key = (!ctx.session_key.is_empty()).then_some(ctx.session_key.as_str());
        Ok(self
            .manager
            .spawn(task, label, channel, chat_id, session_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SubagentSettings;
    use crate::bus::MessageBus;
    use crate::llm::MockLlmClient;
    use crate::tools::ToolRegistry;

    #[tokio::test]
    async fn test_spawn_defaults_origin_to_cli_direct() {
        let ws = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new());
        let manager = Arc::new(SubagentManager::new(
            Arc::new(MockLlmClient::new()),
            ws.path(),
            bus.clone(),
            ToolRegistry::new(),
            SubagentSettings {
                model: "mock".into(),
                temperature: 0.1,
                max_tokens: 256,
            },
        ));
        let tool = SpawnTool::new(manager);
        let reply = tool
            .execute(json!({"task": "say hi", "label": "greeter"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(reply.starts_with("Subagent [greeter] started"));

        let msg = bus.consume_inbound().await;
        assert_eq!(msg.chat_id, "cli:direct");
        assert!(msg.content.contains("Echo: say hi"));
    }
}
