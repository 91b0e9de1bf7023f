//! 心跳：定期读取工作区 HEARTBEAT.md，由模型判断是否有到期任务
//!
//! 第一步只让模型调用 heartbeat 工具给出 skip / run；选择 run 时才通过 Agent 直接路径执行任务，
//! 结果交给通知回调（通常投递到最近活跃的渠道）。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatSection;
use crate::llm::{ChatRequest, LlmClient, ToolDefinition};
use crate::memory::Message;

/// 执行任务描述，返回 Agent 的回答
pub type ExecuteFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;
/// 投递执行结果
pub type NotifyFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// 模型的判断
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatDecision {
    Skip,
    Run { tasks: String },
}

pub struct HeartbeatService {
    workspace: PathBuf,
    provider: Arc<dyn LlmClient>,
    model: String,
    interval: Duration,
    enabled: bool,
    on_execute: Option<ExecuteFn>,
    on_notify: Option<NotifyFn>,
    timer: Mutex<Option<CancellationToken>>,
}

impl HeartbeatService {
    pub fn new(
        workspace: &Path,
        provider: Arc<dyn LlmClient>,
        model: impl Into<String>,
        cfg: &HeartbeatSection,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            provider,
            model: model.into(),
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            enabled: cfg.enabled,
            on_execute: None,
            on_notify: None,
            timer: Mutex::new(None),
        }
    }

    pub fn with_on_execute(mut self, f: ExecuteFn) -> Self {
        self.on_execute = Some(f);
        self
    }

    pub fn with_on_notify(mut self, f: NotifyFn) -> Self {
        self.on_notify = Some(f);
        self
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.workspace.join("HEARTBEAT.md")
    }

    fn read_heartbeat_file(&self) -> Option<String> {
        std::fs::read_to_string(self.heartbeat_file())
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    /// 启动定时循环；未启用时只记日志
    pub fn start(self: &Arc<Self>) {
        if !self.enabled {
            tracing::info!("Heartbeat disabled");
            return;
        }
        let token = CancellationToken::new();
        {
            let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = timer.replace(token.clone()) {
                old.cancel();
            }
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.interval);
            interval.tick().await; // 启动后不立即执行
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        this.tick().await;
                    }
                }
            }
        });
        tracing::info!("Heartbeat started (every {}s)", self.interval.as_secs());
    }

    pub fn stop(&self) {
        if let Some(token) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    async fn tick(&self) {
        if let Some(response) = self.run_once().await {
            if let Some(notify) = &self.on_notify {
                tracing::info!("Heartbeat: completed, delivering response");
                notify(response).await;
            }
        }
    }

    /// 立即执行一次判断，返回任务执行结果（若有）
    pub async fn trigger_now(&self) -> Option<String> {
        self.run_once().await
    }

    async fn run_once(&self) -> Option<String> {
        let Some(content) = self.read_heartbeat_file() else {
            tracing::debug!("Heartbeat: HEARTBEAT.md missing or empty");
            return None;
        };
        tracing::info!("Heartbeat: checking for tasks...");
        let tasks = match self.decide(&content).await {
            HeartbeatDecision::Skip => {
                tracing::info!("Heartbeat: OK (nothing to report)");
                return None;
            }
            HeartbeatDecision::Run { tasks } => tasks,
        };
        let execute = self.on_execute.as_ref()?;
        tracing::info!("Heartbeat: tasks found, executing...");
        match execute(tasks).await {
            Ok(response) if !response.trim().is_empty() => Some(response),
            Ok(_) => None,
            Err(e) => {
                tracing::error!("Heartbeat execution failed: {}", e);
                None
            }
        }
    }

    /// 让模型通过 heartbeat 工具给出判断；没有调用工具视为 skip
    pub async fn decide(&self, content: &str) -> HeartbeatDecision {
        let messages = vec![
            Message::system(
                "You are a heartbeat agent. Call the heartbeat tool to report your decision.",
            ),
            Message::user(format!(
                "Review the following HEARTBEAT.md and decide whether there are active tasks.\n\n{}",
                content
            )),
        ];
        let tools = [heartbeat_tool_definition()];
        let response = self
            .provider
            .chat(ChatRequest {
                messages: &messages,
                tools: &tools,
                model: &self.model,
                temperature: 0.1,
                max_tokens: 1024,
            })
            .await;

        let Some(call) = response.tool_calls.first() else {
            return HeartbeatDecision::Skip;
        };
        let action = call.arguments.get("action").and_then(|v| v.as_str());
        let tasks = call
            .arguments
            .get("tasks")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        match action {
            Some("run") if !tasks.is_empty() => HeartbeatDecision::Run { tasks },
            _ => HeartbeatDecision::Skip,
        }
    }
}

fn heartbeat_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "heartbeat".to_string(),
        description: "Report heartbeat decision after reviewing tasks.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["skip", "run"],
                    "description": "skip = nothing to do, run = has active tasks"
                },
                "tasks": {
                    "type": "string",
                    "description": "Natural-language summary of active tasks (required for run)"
                }
            },
            "required": ["action"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient, ToolCallRequest};

    fn decision(action: &str, tasks: &str) -> LlmResponse {
        LlmResponse::tool_calls(
            None,
            vec![ToolCallRequest::new(
                "h1",
                "heartbeat",
                json!({"action": action, "tasks": tasks}),
            )],
        )
    }

    fn service(ws: &Path, response: LlmResponse) -> HeartbeatService {
        let provider = Arc::new(MockLlmClient::new().with_repeat(response));
        let execute: ExecuteFn =
            Arc::new(|tasks: String| async move { Ok::<_, String>(format!("did: {}", tasks)) }.boxed());
        HeartbeatService::new(ws, provider, "mock", &HeartbeatSection::default())
            .with_on_execute(execute)
    }

    #[tokio::test]
    async fn test_run_decision_executes_tasks() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("HEARTBEAT.md"), "- [ ] check inbox").unwrap();
        let svc = service(ws.path(), decision("run", "check inbox"));
        assert_eq!(svc.trigger_now().await.as_deref(), Some("did: check inbox"));
    }

    #[tokio::test]
    async fn test_skip_and_missing_file() {
        let ws = tempfile::tempdir().unwrap();
        let svc = service(ws.path(), decision("run", "anything"));
        assert_eq!(svc.trigger_now().await, None);

        std::fs::write(ws.path().join("HEARTBEAT.md"), "nothing due").unwrap();
        let svc = service(ws.path(), decision("skip", ""));
        assert_eq!(svc.trigger_now().await, None);

        let svc = service(ws.path(), LlmResponse::text("no tool call"));
        assert_eq!(svc.decide("x").await, HeartbeatDecision::Skip);
    }
}
