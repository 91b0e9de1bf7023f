//! 子代理管理
//!
//! spawn 立即返回，后台任务跑一个独立的工具循环（上限 15 次迭代，只有文件 / exec / 网页工具）。
//! 结束后把结果包装成 system 渠道的入站消息投回总线，由主循环以自然语言转述给用户。
//! 运行中的任务同时登记在全局表与按会话分组的表中，供 /stop 取消。

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::agent::tool_loop::ToolLoop;
use crate::bus::{InboundMessage, MessageBus, SYSTEM_CHANNEL};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::tools::{ToolContext, ToolRegistry};

/// 子代理工具循环的迭代上限
pub const SUBAGENT_MAX_ITERATIONS: usize = 15;

const LABEL_MAX_CHARS: usize = 30;

#[derive(Default)]
struct Tracker {
    running: HashMap<String, CancellationToken>,
    by_session: HashMap<String, HashSet<String>>,
}

/// 任务结束（含 panic）时从两张表中移除
struct TrackGuard {
    tracker: Arc<Mutex<Tracker>>,
    task_id: String,
    session_key: Option<String>,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        let mut t = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        t.running.remove(&self.task_id);
        if let Some(key) = &self.session_key {
            if let Some(ids) = t.by_session.get_mut(key) {
                ids.remove(&self.task_id);
                if ids.is_empty() {
                    t.by_session.remove(key);
                }
            }
        }
    }
}

/// 子代理的执行参数，主代理构建时一并给出
#[derive(Clone)]
pub struct SubagentSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub struct SubagentManager {
    provider: Arc<dyn LlmClient>,
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    tools: ToolRegistry,
    settings: SubagentSettings,
    tracker: Arc<Mutex<Tracker>>,
}

impl SubagentManager {
    pub fn new(
        provider: Arc<dyn LlmClient>,
        workspace: &Path,
        bus: Arc<MessageBus>,
        tools: ToolRegistry,
        settings: SubagentSettings,
    ) -> Self {
        Self {
            provider,
            workspace: workspace.to_path_buf(),
            bus,
            tools,
            settings,
            tracker: Arc::new(Mutex::new(Tracker::default())),
        }
    }

    /// 启动后台任务并立即返回提示文本
    pub fn spawn(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
        session_key: Option<&str>,
    ) -> String {
        let task_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let label = match label.filter(|l| !l.trim().is_empty()) {
            Some(l) => l.to_string(),
            None if task.chars().count() > LABEL_MAX_CHARS => {
                format!("{}...", task.chars().take(LABEL_MAX_CHARS).collect::<String>())
            }
            None => task.to_string(),
        };

        let token = CancellationToken::new();
        {
            let mut t = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            t.running.insert(task_id.clone(), token.clone());
            if let Some(key) = session_key {
                t.by_session
                    .entry(key.to_string())
                    .or_default()
                    .insert(task_id.clone());
            }
        }
        let guard = TrackGuard {
            tracker: self.tracker.clone(),
            task_id: task_id.clone(),
            session_key: session_key.map(str::to_string),
        };

        let run = SubagentRun {
            task_id: task_id.clone(),
            task: task.to_string(),
            label: label.clone(),
            origin_channel: origin_channel.to_string(),
            origin_chat_id: origin_chat_id.to_string(),
            session_key: session_key.unwrap_or_default().to_string(),
            provider: self.provider.clone(),
            workspace: self.workspace.clone(),
            bus: self.bus.clone(),
            tools: self.tools.clone(),
            settings: self.settings.clone(),
        };
        tokio::spawn(async move {
            let _guard = guard;
            run.execute(token).await;
        });

        tracing::info!("Spawned subagent [{}]: {}", task_id, label);
        format!(
            "Subagent [{}] started (id: {}). I'll notify you when it completes.",
            label, task_id
        )
    }

    /// 取消某会话的所有子代理，返回新取消的数量
    pub fn cancel_by_session(&self, session_key: &str) -> usize {
        let t = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ids) = t.by_session.get(session_key) else {
            return 0;
        };
        let mut cancelled = 0;
        for token in ids.iter().filter_map(|id| t.running.get(id)) {
            if !token.is_cancelled() {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn running_count(&self) -> usize {
        self.tracker
            .lock()
            .map(|t| t.running.len())
            .unwrap_or_default()
    }
}

/// 一个后台任务所需的全部数据
struct SubagentRun {
    task_id: String,
    task: String,
    label: String,
    origin_channel: String,
    origin_chat_id: String,
    session_key: String,
    provider: Arc<dyn LlmClient>,
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    tools: ToolRegistry,
    settings: SubagentSettings,
}

impl SubagentRun {
    async fn execute(self, token: CancellationToken) {
        tracing::info!("Subagent [{}] starting task: {}", self.task_id, self.label);
        let outcome = AssertUnwindSafe(self.run_loop(token)).catch_unwind().await;
        let (result, ok) = match outcome {
            Ok(Ok(result)) => (result, true),
            Ok(Err(AgentError::Cancelled)) => {
                tracing::info!("Subagent [{}] cancelled", self.task_id);
                return;
            }
            Ok(Err(e)) => (format!("Error: {}", e), false),
            Err(_) => ("Error: subagent panicked".to_string(), false),
        };
        if ok {
            tracing::info!("Subagent [{}] completed successfully", self.task_id);
        } else {
            tracing::error!("Subagent [{}] failed: {}", self.task_id, result);
        }
        self.announce(&result, ok);
    }

    async fn run_loop(&self, token: CancellationToken) -> Result<String, AgentError> {
        let ctx = ToolContext::new(
            self.origin_channel.clone(),
            self.origin_chat_id.clone(),
            self.session_key.clone(),
        );
        let messages = vec![
            Message::system(self.system_prompt()),
            Message::user(self.task.clone()),
        ];
        let outcome = ToolLoop::new(self.provider.as_ref(), &self.tools, &ctx, token)
            .with_model(&self.settings.model)
            .with_sampling(self.settings.temperature, self.settings.max_tokens)
            .with_max_iterations(SUBAGENT_MAX_ITERATIONS)
            .run(messages)
            .await?;
        Ok(match outcome.final_content {
            Some(content) if !outcome.exhausted => content,
            _ => "Task completed but no final response was generated.".to_string(),
        })
    }

    fn system_prompt(&self) -> String {
        format!(
            "# Subagent\n\n\
             ## Current Time\n{}\n\n\
             You are a subagent spawned by the main agent to complete a specific task.\n\
             Stay focused on the assigned task. Your final response will be reported back to the main agent.\n\n\
             ## Workspace\n{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M (%A)"),
            self.workspace.display()
        )
    }

    /// 结果作为 system 入站消息投回总线
    fn announce(&self, result: &str, ok: bool) {
        let status = if ok { "completed successfully" } else { "failed" };
        let content = format!(
            "[Subagent '{}' {}]\n\n\
             Task: {}\n\n\
             Result:\n{}\n\n\
             Summarize this naturally for the user. Keep it brief (1-2 sentences). \
             Do not mention technical details like \"subagent\" or task IDs.",
            self.label, status, self.task, result
        );
        let msg = InboundMessage::new(
            SYSTEM_CHANNEL,
            "subagent",
            format!("{}:{}", self.origin_channel, self.origin_chat_id),
            content,
        );
        self.bus.publish_inbound(msg);
        tracing::debug!(
            "Subagent [{}] announced result to {}:{}",
            self.task_id,
            self.origin_channel,
            self.origin_chat_id
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient};

    fn settings() -> SubagentSettings {
        SubagentSettings {
            model: "mock".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
        }
    }

    #[tokio::test]
    async fn test_spawn_announces_result() {
        let ws = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new());
        let provider = Arc::new(MockLlmClient::new().with_repeat(LlmResponse::text("42 files")));
        let manager = SubagentManager::new(
            provider,
            ws.path(),
            bus.clone(),
            ToolRegistry::new(),
            settings(),
        );

        let reply = manager.spawn(
            "count all the files in the workspace directory tree",
            None,
            "cli",
            "direct",
            Some("cli:direct"),
        );
        assert!(reply.starts_with("Subagent [count all the files in the wor...] started (id: "));

        let msg = tokio::time::timeout(Duration::from_secs(5), bus.consume_inbound())
            .await
            .unwrap();
        assert_eq!(msg.channel, SYSTEM_CHANNEL);
        assert_eq!(msg.sender_id, "subagent");
        assert_eq!(msg.chat_id, "cli:direct");
        assert!(msg.content.contains("completed successfully"));
        assert!(msg.content.contains("42 files"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_by_session_suppresses_announcement() {
        let ws = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new());
        let provider = Arc::new(
            MockLlmClient::new()
                .with_delay(Duration::from_millis(200))
                .with_repeat(LlmResponse::text("late")),
        );
        let manager = SubagentManager::new(
            provider,
            ws.path(),
            bus.clone(),
            ToolRegistry::new(),
            settings(),
        );
        manager.spawn("task a", Some("a"), "cli", "direct", Some("s1"));
        manager.spawn("task b", Some("b"), "cli", "direct", Some("s2"));
        assert_eq!(manager.running_count(), 2);

        assert_eq!(manager.cancel_by_session("s1"), 1);
        assert_eq!(manager.cancel_by_session("s1"), 0);
        assert_eq!(manager.cancel_by_session("unknown"), 0);

        let msg = tokio::time::timeout(Duration::from_secs(5), bus.consume_inbound())
            .await
            .unwrap();
        assert!(msg.content.contains("[Subagent 'b' completed successfully]"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bus.inbound_size(), 0);
        assert_eq!(manager.running_count(), 0);
    }
}
