//! 分发循环集成测试：经总线驱动完整的消息处理路径

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use nectar::agent::{AgentLoop, AgentLoopBuilder, AgentSettings};
    use nectar::bus::{InboundMessage, MessageBus, OutboundMessage};
    use nectar::llm::{LlmClient, LlmResponse, MockLlmClient, ToolCallRequest};
    use nectar::memory::Role;
    use nectar::skills::SkillsLoader;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn settings(max_iterations: usize) -> AgentSettings {
        AgentSettings {
            model: "mock".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            max_iterations,
            memory_window: 100,
        }
    }

    fn start(
        ws: &Path,
        provider: Arc<dyn LlmClient>,
        max_iterations: usize,
    ) -> (Arc<MessageBus>, Arc<AgentLoop>, CancellationToken) {
        let bus = Arc::new(MessageBus::new());
        let agent = AgentLoopBuilder::new(Arc::clone(&bus), provider, ws)
            .with_settings(settings(max_iterations))
            .with_skills(SkillsLoader::new(ws, None))
            .build();
        let token = CancellationToken::new();
        tokio::spawn(Arc::clone(&agent).run(token.clone()));
        (bus, agent, token)
    }

    fn user(chat_id: &str, content: &str) -> InboundMessage {
        InboundMessage::new("cli", "user", chat_id, content)
    }

    /// 取下一条非进度出站消息
    async fn next_reply(bus: &MessageBus) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = bus.consume_outbound().await;
                if !msg.is_progress() {
                    return msg;
                }
            }
        })
        .await
        .expect("no reply within 5s")
    }

    #[tokio::test]
    async fn test_replies_follow_acceptance_order_one_at_a_time() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(30)));
        let (bus, _agent, token) = start(ws.path(), provider.clone(), 40);

        bus.publish_inbound(user("a", "first"));
        bus.publish_inbound(user("b", "second"));
        bus.publish_inbound(user("a", "third"));

        let replies: Vec<(String, String)> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                let r = next_reply(&bus).await;
                out.push((r.chat_id, r.content));
            }
            out
        };
        assert_eq!(
            replies,
            vec![
                ("a".to_string(), "Echo: first".to_string()),
                ("b".to_string(), "Echo: second".to_string()),
                ("a".to_string(), "Echo: third".to_string()),
            ]
        );
        assert_eq!(provider.max_in_flight(), 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_iteration_cap_produces_fallback() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockLlmClient::new().with_repeat(LlmResponse::tool_calls(
            None,
            vec![ToolCallRequest::new("c", "list_dir", json!({"path": "."}))],
        )));
        let (bus, _agent, token) = start(ws.path(), provider.clone(), 3);

        bus.publish_inbound(user("direct", "loop forever"));
        let reply = next_reply(&bus).await;
        assert_eq!(
            reply.content,
            "I reached the maximum number of tool call iterations (3) without completing the task."
        );
        assert_eq!(provider.calls(), 3);
        token.cancel();
    }

    #[tokio::test]
    async fn test_stop_cancels_running_turn() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockLlmClient::new().with_delay(Duration::from_millis(300)));
        let (bus, agent, token) = start(ws.path(), provider, 40);

        bus.publish_inbound(user("direct", "slow question"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish_inbound(user("direct", "/stop"));
        assert_eq!(next_reply(&bus).await.content, "Stopped 1 task(s).");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(bus.outbound_size(), 0);
        let session = agent.sessions().get_or_create("cli:direct");
        assert!(session.lock().await.messages.is_empty());

        bus.publish_inbound(user("direct", "/stop"));
        assert_eq!(next_reply(&bus).await.content, "No active task to stop.");
        token.cancel();
    }

    #[tokio::test]
    async fn test_help_command() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockLlmClient::new());
        let (bus, _agent, token) = start(ws.path(), provider.clone(), 40);

        bus.publish_inbound(user("direct", "/help"));
        let reply = next_reply(&bus).await;
        assert!(reply.content.contains("/new"));
        assert!(reply.content.contains("/stop"));
        assert_eq!(provider.calls(), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_subagent_result_is_announced_through_dispatch() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockLlmClient::new().with_responder(|req| {
            let first = req.messages.first().map(|m| m.text()).unwrap_or_default();
            let last = req.messages.last()?;
            if first.starts_with("# Subagent") {
                return Some(LlmResponse::text("found 3 results"));
            }
            if last.text().starts_with("[Subagent 'research'") {
                return Some(LlmResponse::text("Research is done: 3 results."));
            }
            if last.role == Role::Tool {
                return Some(LlmResponse::text("Working on it."));
            }
            Some(LlmResponse::tool_calls(
                None,
                vec![ToolCallRequest::new(
                    "s1",
                    "spawn",
                    json!({"task": "research rust", "label": "research"}),
                )],
            ))
        }));
        let (bus, agent, token) = start(ws.path(), provider, 40);

        bus.publish_inbound(user("direct", "please research rust"));
        assert_eq!(next_reply(&bus).await.content, "Working on it.");
        let summary = next_reply(&bus).await;
        assert_eq!(summary.channel, "cli");
        assert_eq!(summary.chat_id, "direct");
        assert_eq!(summary.content, "Research is done: 3 results.");
        assert_eq!(agent.subagents().running_count(), 0);
        token.cancel();
    }
}
