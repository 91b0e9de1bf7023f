//! 分发循环
//!
//! 读取端不停地从总线取入站消息，登记取消 token 后交给唯一的工作端；
//! 工作端按接收顺序一次处理一条，因此任意时刻最多只有一个 turn 在进行，回复顺序与接收顺序一致。
//! /stop 在读取端直接处理，不排队。

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::agent::context::{ContextBuilder, RUNTIME_CONTEXT_TAG};
use crate::agent::subagent::{SubagentManager, SubagentSettings};
use crate::agent::tool_loop::{LoopOutcome, ProgressFn, ToolLoop};
use crate::bus::{InboundMessage, MessageBus, OutboundMessage, SYSTEM_CHANNEL};
use crate::config::{AgentSection, AppConfig, ToolsSection};
use crate::core::{ActiveTasks, AgentError, TaskId};
use crate::cron::CronService;
use crate::llm::LlmClient;
use crate::memory::{Consolidation, ConsolidationRequest, Message, Role};
use crate::session::{Session, SessionManager, SharedSession};
use crate::skills::SkillsLoader;
use crate::tools::{
    build_worker_registry, CronTool, MessageTool, SpawnTool, ToolContext, ToolRegistry,
};

/// 持久化时工具结果的最大字符数
pub const TOOL_RESULT_MAX_CHARS: usize = 500;

const APOLOGY: &str = "Sorry, I encountered an error.";
const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";
const HELP_TEXT: &str = "nectar commands:\n/new - Start a new conversation\n/stop - Stop the current task\n/help - Show available commands";

/// 模型与循环参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub memory_window: usize,
}

impl From<&AgentSection> for AgentSettings {
    fn from(cfg: &AgentSection) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            max_iterations: cfg.max_tool_iterations.max(1),
            memory_window: cfg.memory_window,
        }
    }
}

/// 排队等待工作端处理的消息
struct QueuedTurn {
    msg: InboundMessage,
    key: String,
    task_id: TaskId,
    token: CancellationToken,
}

/// 消息的调度键：system 消息按其 chat_id 中的 `channel:chat_id` 归属原会话
fn dispatch_key(msg: &InboundMessage) -> String {
    if msg.channel == SYSTEM_CHANNEL {
        let (channel, chat_id) = split_origin(&msg.chat_id);
        format!("{}:{}", channel, chat_id)
    } else {
        msg.session_key()
    }
}

fn split_origin(chat_id: &str) -> (&str, &str) {
    chat_id.split_once(':').unwrap_or(("cli", chat_id))
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmClient>,
    context: ContextBuilder,
    sessions: Arc<SessionManager>,
    tools: ToolRegistry,
    subagents: Arc<SubagentManager>,
    active: ActiveTasks,
    consolidating: Arc<Mutex<HashSet<String>>>,
    consolidation_done: Arc<Notify>,
    settings: AgentSettings,
}

impl AgentLoop {
    /// 读取端 + 工作端；shutdown 取消后不再接收新消息，已排队的 turn 被取消，等待当前 turn 结束后返回
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedTurn>();
        let worker = {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(turn) = rx.recv().await {
                    this.handle_turn(turn).await;
                }
            })
        };
        tracing::info!("Agent loop started");

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.bus.consume_inbound() => msg,
            };
            if msg.content.trim().eq_ignore_ascii_case("/stop") {
                self.handle_stop(&msg);
                continue;
            }
            let key = dispatch_key(&msg);
            let (task_id, token) = self.active.register(&key);
            let turn = QueuedTurn {
                msg,
                key,
                task_id,
                token,
            };
            if let Err(mpsc::error::SendError(turn)) = tx.send(turn) {
                tracing::error!("Agent worker is gone, dropping message");
                self.active.finish(&turn.key, turn.task_id);
                break;
            }
        }

        self.active.cancel_all();
        drop(tx);
        if let Err(e) = worker.await {
            tracing::error!("Agent worker terminated abnormally: {}", e);
        }
        tracing::info!("Agent loop stopped");
    }

    /// 取消该会话所有排队与运行中的 turn 以及子代理，立即回复数量
    fn handle_stop(&self, msg: &InboundMessage) {
        let key = msg.session_key();
        let cancelled = self.active.cancel_session(&key) + self.subagents.cancel_by_session(&key);
        tracing::info!("/stop for {}: {} task(s) cancelled", key, cancelled);
        let content = if cancelled > 0 {
            format!("Stopped {} task(s).", cancelled)
        } else {
            "No active task to stop.".to_string()
        };
        self.bus
            .publish_outbound(OutboundMessage::new(&msg.channel, &msg.chat_id, content));
    }

    async fn handle_turn(&self, turn: QueuedTurn) {
        let QueuedTurn {
            msg,
            key,
            task_id,
            token,
        } = turn;
        if token.is_cancelled() {
            tracing::info!("Skipping cancelled message for {}", key);
            self.active.finish(&key, task_id);
            return;
        }

        let result = AssertUnwindSafe(self.process_message(&msg, token))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(Some(reply))) => self.bus.publish_outbound(reply),
            Ok(Ok(None)) => {}
            Ok(Err(AgentError::Cancelled)) => {
                tracing::info!("Turn for {} cancelled", key);
            }
            Ok(Err(e)) => {
                tracing::error!("Error processing message for {}: {}", key, e);
                self.publish_apology(&msg);
            }
            Err(_) => {
                tracing::error!("Panic while processing message for {}", key);
                self.publish_apology(&msg);
            }
        }
        self.active.finish(&key, task_id);
    }

    fn publish_apology(&self, msg: &InboundMessage) {
        let (channel, chat_id) = if msg.channel == SYSTEM_CHANNEL {
            split_origin(&msg.chat_id)
        } else {
            (msg.channel.as_str(), msg.chat_id.as_str())
        };
        self.bus
            .publish_outbound(OutboundMessage::new(channel, chat_id, APOLOGY));
    }

    /// 处理一条消息，返回要发出的回复（None 表示不回复）
    pub async fn process_message(
        &self,
        msg: &InboundMessage,
        token: CancellationToken,
    ) -> Result<Option<OutboundMessage>, AgentError> {
        if msg.channel == SYSTEM_CHANNEL {
            return self.process_system_message(msg, token).await;
        }
        tracing::info!(
            "Processing message from {}:{}: {}",
            msg.channel,
            msg.sender_id,
            preview(&msg.content, 80)
        );

        let key = msg.session_key();
        let command = msg.content.trim().to_lowercase();
        if command == "/new" {
            // 等后台整理推进完游标，/new 只归档剩下的部分
            self.wait_for_consolidation(&key).await;
        }
        let shared = self.sessions.get_or_create(&key);
        let mut session = shared.lock().await;

        match command.as_str() {
            "/new" => {
                let reply = self.start_new_session(&mut session).await;
                return Ok(Some(OutboundMessage::new(&msg.channel, &msg.chat_id, reply)));
            }
            "/help" => {
                return Ok(Some(OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    HELP_TEXT,
                )));
            }
            _ => {}
        }

        let message_id = msg
            .metadata
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let ctx = ToolContext::new(&msg.channel, &msg.chat_id, &key).with_message_id(message_id);
        let history = session.get_history(self.settings.memory_window);
        let skip = history.len() + 1;
        let initial = self.context.build_messages(
            history,
            &msg.content,
            &[],
            &msg.media,
            Some(&msg.channel),
            Some(&msg.chat_id),
        );

        let bus = &self.bus;
        let publish_progress = |content: String, tool_hint: bool| {
            bus.publish_outbound(OutboundMessage::progress(
                &msg.channel,
                &msg.chat_id,
                content,
                &msg.metadata,
                tool_hint,
            ));
        };
        let progress: ProgressFn<'_> = &publish_progress;
        let outcome = self.run_tool_loop(initial, &ctx, token, Some(progress)).await?;
        let final_content = outcome
            .final_content
            .clone()
            .unwrap_or_else(|| EMPTY_REPLY.to_string());

        self.persist_turn(&mut session, &outcome, skip);
        self.maybe_consolidate(&shared, &session);
        drop(session);

        if ctx.sent_in_turn() {
            // 模型已用 message 工具回复；CLI 仍需一条空回复解除输入等待
            return Ok((msg.channel == "cli").then(|| {
                OutboundMessage::new(&msg.channel, &msg.chat_id, "")
                    .with_metadata(msg.metadata.clone())
            }));
        }

        tracing::info!(
            "Response to {}:{}: {}",
            msg.channel,
            msg.sender_id,
            preview(&final_content, 120)
        );
        Ok(Some(
            OutboundMessage::new(&msg.channel, &msg.chat_id, final_content)
                .with_metadata(msg.metadata.clone()),
        ))
    }

    /// 子代理 / 后台任务的结果：回到原会话跑一轮，让模型转述
    async fn process_system_message(
        &self,
        msg: &InboundMessage,
        token: CancellationToken,
    ) -> Result<Option<OutboundMessage>, AgentError> {
        tracing::info!("Processing system message from {}", msg.sender_id);
        let (channel, chat_id) = split_origin(&msg.chat_id);
        let key = format!("{}:{}", channel, chat_id);
        let shared = self.sessions.get_or_create(&key);
        let mut session = shared.lock().await;

        let ctx = ToolContext::new(channel, chat_id, &key);
        let history = session.get_history(self.settings.memory_window);
        let skip = history.len() + 1;
        let initial = self.context.build_messages(
            history,
            &msg.content,
            &[],
            &[],
            Some(channel),
            Some(chat_id),
        );
        let outcome = self.run_tool_loop(initial, &ctx, token, None).await?;

        self.persist_turn(&mut session, &outcome, skip);
        self.maybe_consolidate(&shared, &session);
        drop(session);

        if ctx.sent_in_turn() {
            return Ok(None);
        }
        let content = outcome
            .final_content
            .unwrap_or_else(|| "Background task completed.".to_string());
        Ok(Some(OutboundMessage::new(channel, chat_id, content)))
    }

    /// 不经总线直接处理一条消息（CLI 单次模式、定时任务、心跳）；在调用方任务中执行
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        let msg =
            InboundMessage::new(channel, "user", chat_id, content).with_session_key(session_key);
        let (task_id, token) = self.active.register(session_key);
        let result = self.process_message(&msg, token).await;
        self.active.finish(session_key, task_id);
        Ok(result?.map(|m| m.content).unwrap_or_default())
    }

    async fn run_tool_loop(
        &self,
        messages: Vec<Message>,
        ctx: &ToolContext,
        token: CancellationToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<LoopOutcome, AgentError> {
        let mut tool_loop = ToolLoop::new(self.provider.as_ref(), &self.tools, ctx, token)
            .with_model(&self.settings.model)
            .with_sampling(self.settings.temperature, self.settings.max_tokens)
            .with_max_iterations(self.settings.max_iterations);
        if let Some(progress) = progress {
            tool_loop = tool_loop.with_progress(progress);
        }
        let outcome = tool_loop.run(messages).await?;
        if !outcome.tools_used.is_empty() {
            tracing::debug!("Tools used this turn: {}", outcome.tools_used.join(", "));
        }
        Ok(outcome)
    }

    /// 写入本轮新增消息并落盘；落盘失败只记日志
    fn persist_turn(&self, session: &mut Session, outcome: &LoopOutcome, skip: usize) {
        save_turn(session, outcome.messages.get(skip..).unwrap_or_default());
        if let Err(e) = self.sessions.save(session) {
            tracing::error!("Failed to save session {}: {}", session.key, e);
        }
    }

    /// /new：先归档全部未整理消息，成功后才清空
    async fn start_new_session(&self, session: &mut Session) -> String {
        let pending = session.messages[session.last_consolidated()..].to_vec();
        let result = self
            .context
            .memory()
            .consolidate(ConsolidationRequest {
                messages: &pending,
                last_consolidated: 0,
                archive_all: true,
                memory_window: self.settings.memory_window,
                provider: self.provider.as_ref(),
                model: &self.settings.model,
            })
            .await;
        if let Err(e) = result {
            tracing::warn!("/new archival failed for {}: {}", session.key, e);
            return "Memory archival failed, session not cleared. Please try again.".to_string();
        }
        session.clear();
        if let Err(e) = self.sessions.save(session) {
            tracing::error!("Failed to save session {}: {}", session.key, e);
        }
        "New session started.".to_string()
    }

    fn is_consolidating(&self, key: &str) -> bool {
        self.consolidating
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// 等待该会话的后台整理结束；调用方不能持有会话锁
    async fn wait_for_consolidation(&self, key: &str) {
        loop {
            let notified = self.consolidation_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_consolidating(key) {
                return;
            }
            notified.await;
        }
    }

    /// 未整理消息达到窗口大小且该会话没有整理在进行时，后台整理
    fn maybe_consolidate(&self, shared: &SharedSession, session: &Session) {
        if session.unconsolidated_count() < self.settings.memory_window {
            return;
        }
        {
            let mut running = self
                .consolidating
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !running.insert(session.key.clone()) {
                return;
            }
        }

        let key = session.key.clone();
        let messages = session.messages.clone();
        let cursor = session.last_consolidated();
        let generation = session.generation();
        let shared = Arc::clone(shared);
        let provider = Arc::clone(&self.provider);
        let sessions = Arc::clone(&self.sessions);
        let memory = self.context.memory().clone();
        let consolidating = Arc::clone(&self.consolidating);
        let done = Arc::clone(&self.consolidation_done);
        let window = self.settings.memory_window;
        let model = self.settings.model.clone();

        tokio::spawn(async move {
            let result = memory
                .consolidate(ConsolidationRequest {
                    messages: &messages,
                    last_consolidated: cursor,
                    archive_all: false,
                    memory_window: window,
                    provider: provider.as_ref(),
                    model: &model,
                })
                .await;
            match result {
                Ok(Consolidation::Archived { upto }) => {
                    let mut session = shared.lock().await;
                    if session.generation() != generation {
                        // 整理期间会话被清空，快照下标已失效
                        tracing::debug!("Session {} was cleared, dropping cursor {}", key, upto);
                    } else if session.mark_consolidated(upto) {
                        if let Err(e) = sessions.save(&session) {
                            tracing::error!("Failed to save session {}: {}", key, e);
                        }
                    }
                }
                Ok(Consolidation::Nothing) => {}
                Err(e) => tracing::warn!("Background consolidation failed for {}: {}", key, e),
            }
            consolidating
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            done.notify_waiters();
        });
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.tool_names()
    }
}

/// 把新消息写入会话：跳过运行时上下文与空 assistant，截断过长的工具结果，去掉推理字段，补时间戳
fn save_turn(session: &mut Session, messages: &[Message]) {
    for m in messages {
        if m.role == Role::Assistant && m.content.is_none() && m.tool_calls.is_empty() {
            continue;
        }
        if m.role == Role::User && m.text().starts_with(RUNTIME_CONTEXT_TAG) {
            continue;
        }
        let mut entry = m.clone();
        if entry.role == Role::Tool && entry.text().chars().count() > TOOL_RESULT_MAX_CHARS {
            let head: String = entry.text().chars().take(TOOL_RESULT_MAX_CHARS).collect();
            entry.content = Some(format!("{}\n... (truncated)", head));
        }
        entry.reasoning_content = None;
        if entry.timestamp.is_none() {
            entry.timestamp = Some(Utc::now());
        }
        session.push(entry);
    }
}

/// AgentLoop 构建器：从配置组装工具集、子代理与会话存储
pub struct AgentLoopBuilder {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmClient>,
    workspace: PathBuf,
    sessions_dir: PathBuf,
    settings: AgentSettings,
    tools_cfg: ToolsSection,
    skills: Option<SkillsLoader>,
    cron: Option<Arc<CronService>>,
}

impl AgentLoopBuilder {
    pub fn new(bus: Arc<MessageBus>, provider: Arc<dyn LlmClient>, workspace: &Path) -> Self {
        let agent = AgentSection::default();
        Self {
            bus,
            provider,
            workspace: workspace.to_path_buf(),
            sessions_dir: workspace.join("sessions"),
            settings: AgentSettings::from(&agent),
            tools_cfg: ToolsSection::default(),
            skills: None,
            cron: None,
        }
    }

    /// 采用配置中的模型参数、工具设置与会话目录
    pub fn with_config(mut self, cfg: &AppConfig) -> Self {
        self.settings = AgentSettings::from(&cfg.agent);
        self.tools_cfg = cfg.tools.clone();
        self.sessions_dir = cfg.sessions_dir();
        self
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = dir.into();
        self
    }

    pub fn with_skills(mut self, skills: SkillsLoader) -> Self {
        self.skills = Some(skills);
        self
    }

    /// 注册 cron 工具
    pub fn with_cron(mut self, cron: Arc<CronService>) -> Self {
        self.cron = Some(cron);
        self
    }

    pub fn build(self) -> Arc<AgentLoop> {
        let worker_tools = build_worker_registry(&self.workspace, &self.tools_cfg);
        let subagents = Arc::new(SubagentManager::new(
            Arc::clone(&self.provider),
            &self.workspace,
            Arc::clone(&self.bus),
            worker_tools.clone(),
            SubagentSettings {
                model: self.settings.model.clone(),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
            },
        ));

        let mut tools = worker_tools;
        tools.register(MessageTool::new(Arc::clone(&self.bus)));
        tools.register(SpawnTool::new(Arc::clone(&subagents)));
        if let Some(cron) = &self.cron {
            tools.register(CronTool::new(Arc::clone(cron)));
        }

        let context = match self.skills {
            Some(skills) => ContextBuilder::with_skills(&self.workspace, skills),
            None => ContextBuilder::new(&self.workspace),
        };
        tracing::info!(
            "Agent loop built: model={}, tools=[{}]",
            self.settings.model,
            tools.tool_names().join(", ")
        );

        Arc::new(AgentLoop {
            bus: self.bus,
            provider: self.provider,
            context,
            sessions: Arc::new(SessionManager::new(self.sessions_dir)),
            tools,
            subagents,
            active: ActiveTasks::new(),
            consolidating: Arc::new(Mutex::new(HashSet::new())),
            consolidation_done: Arc::new(Notify::new()),
            settings: self.settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient, ToolCallRequest};

    fn build(ws: &Path, provider: Arc<dyn LlmClient>) -> (Arc<MessageBus>, Arc<AgentLoop>) {
        let bus = Arc::new(MessageBus::new());
        let agent = AgentLoopBuilder::new(Arc::clone(&bus), provider, ws)
            .with_skills(SkillsLoader::new(ws, None))
            .build();
        (bus, agent)
    }

    fn save_memory_provider(delay: Option<std::time::Duration>) -> Arc<MockLlmClient> {
        let mock = MockLlmClient::new().with_responder(|req| {
            req.tools
                .iter()
                .any(|t| t.name == "save_memory")
                .then(|| {
                    LlmResponse::tool_calls(
                        None,
                        vec![ToolCallRequest::new(
                            "m1",
                            "save_memory",
                            json!({"history_entry": "[2026-01-01 10:00] chatted", "memory_update": "facts"}),
                        )],
                    )
                })
        });
        Arc::new(match delay {
            Some(d) => mock.with_delay(d),
            None => mock,
        })
    }

    fn build_with_window(
        ws: &Path,
        provider: Arc<dyn LlmClient>,
        memory_window: usize,
    ) -> Arc<AgentLoop> {
        let settings = AgentSettings::from(&AgentSection {
            memory_window,
            ..AgentSection::default()
        });
        AgentLoopBuilder::new(Arc::new(MessageBus::new()), provider, ws)
            .with_skills(SkillsLoader::new(ws, None))
            .with_sessions_dir(ws.join("sessions"))
            .with_settings(settings)
            .build()
    }

    fn history_entries(ws: &Path) -> usize {
        std::fs::read_to_string(ws.join("memory/HISTORY.md"))
            .unwrap_or_default()
            .matches("chatted")
            .count()
    }

    async fn fill_session(agent: &AgentLoop, key: &str, turns: usize) -> SharedSession {
        let shared = agent.sessions().get_or_create(key);
        let mut session = shared.lock().await;
        for i in 0..turns {
            session.push(Message::user(format!("u{}", i)));
            session.push(Message::assistant(Some(format!("a{}", i))));
        }
        drop(session);
        shared
    }

    #[test]
    fn test_save_turn_filters_and_truncates() {
        let mut session = Session::new("cli:direct");
        let long = "x".repeat(600);
        let messages = vec![
            Message::user(format!("{}\nCurrent Time: now", RUNTIME_CONTEXT_TAG)),
            Message::user("hello"),
            Message::assistant_with_tools(
                None,
                vec![ToolCallRequest::new("1", "read_file", json!({"path": "a"}))],
                Some("thinking".into()),
            ),
            Message::tool_result("1", "read_file", long),
            Message::assistant(None),
            Message::assistant(Some("done".into())).with_reasoning(Some("r".into())),
        ];
        save_turn(&mut session, &messages);

        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[0].text(), "hello");
        let tool = &session.messages[2];
        assert!(tool.text().ends_with("\n... (truncated)"));
        assert_eq!(tool.text().chars().count(), 500 + "\n... (truncated)".len());
        assert!(session.messages.iter().all(|m| m.reasoning_content.is_none()));
        assert!(session.messages.iter().all(|m| m.timestamp.is_some()));
    }

    #[tokio::test]
    async fn test_process_direct_persists_turn() {
        let ws = tempfile::tempdir().unwrap();
        let (_bus, agent) = build(ws.path(), Arc::new(MockLlmClient::new()));

        let reply = agent
            .process_direct("hi there", "cli:direct", "cli", "direct")
            .await
            .unwrap();
        assert_eq!(reply, "Echo: hi there");

        let session = agent.sessions().get_or_create("cli:direct");
        let session = session.lock().await;
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].text(), "hi there");
        assert_eq!(session.messages[1].text(), "Echo: hi there");
    }

    #[tokio::test]
    async fn test_help_and_new_commands() {
        let ws = tempfile::tempdir().unwrap();
        let (_bus, agent) = build(ws.path(), save_memory_provider(None));

        let help = agent.process_direct("/help", "s", "cli", "direct").await.unwrap();
        assert!(help.contains("/new"));

        agent.process_direct("remember me", "s", "cli", "direct").await.unwrap();
        let reply = agent.process_direct("/new", "s", "cli", "direct").await.unwrap();
        assert_eq!(reply, "New session started.");
        let session = agent.sessions().get_or_create("s");
        assert!(session.lock().await.messages.is_empty());
        assert_eq!(
            std::fs::read_to_string(ws.path().join("memory/MEMORY.md")).unwrap(),
            "facts"
        );
    }

    #[tokio::test]
    async fn test_new_keeps_session_when_archival_fails() {
        let ws = tempfile::tempdir().unwrap();
        let (_bus, agent) = build(ws.path(), Arc::new(MockLlmClient::new()));
        agent.process_direct("keep me", "s", "cli", "direct").await.unwrap();

        let reply = agent.process_direct("/new", "s", "cli", "direct").await.unwrap();
        assert_eq!(
            reply,
            "Memory archival failed, session not cleared. Please try again."
        );
        let session = agent.sessions().get_or_create("s");
        assert_eq!(session.lock().await.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_message_tool_suppresses_reply() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockLlmClient::new().with_responses(vec![
            LlmResponse::tool_calls(
                None,
                vec![ToolCallRequest::new("c1", "message", json!({"content": "pushed"}))],
            ),
            LlmResponse::text("also final"),
        ]));
        let (bus, agent) = build(ws.path(), provider);

        let msg = InboundMessage::new("telegram", "u1", "42", "notify me");
        let reply = agent
            .process_message(&msg, CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.is_none());

        let mut contents = Vec::new();
        while bus.outbound_size() > 0 {
            let out = bus.consume_outbound().await;
            if !out.is_progress() {
                contents.push(out.content);
            }
        }
        assert_eq!(contents, vec!["pushed".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_turn_is_not_persisted() {
        let ws = tempfile::tempdir().unwrap();
        let (_bus, agent) = build(ws.path(), Arc::new(MockLlmClient::new()));
        let token = CancellationToken::new();
        token.cancel();
        let msg = InboundMessage::new("cli", "user", "direct", "hello");
        let result = agent.process_message(&msg, token).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        let session = agent.sessions().get_or_create("cli:direct");
        assert!(session.lock().await.messages.is_empty());
    }

    #[tokio::test]
    async fn test_system_message_routes_to_origin() {
        let ws = tempfile::tempdir().unwrap();
        let (_bus, agent) = build(
            ws.path(),
            Arc::new(MockLlmClient::new().with_repeat(LlmResponse::text("Your files are counted."))),
        );
        let msg = InboundMessage::new(SYSTEM_CHANNEL, "subagent", "telegram:42", "[Subagent 'x' completed successfully]");
        let reply = agent
            .process_message(&msg, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "42");
        assert_eq!(reply.content, "Your files are counted.");
        let session = agent.sessions().get_or_create("telegram:42");
        assert_eq!(session.lock().await.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_window_reached_triggers_background_consolidation() {
        let ws = tempfile::tempdir().unwrap();
        let agent = build_with_window(ws.path(), save_memory_provider(None), 4);

        agent.process_direct("first", "s", "cli", "direct").await.unwrap();
        let shared = agent.sessions().get_or_create("s");
        assert_eq!(shared.lock().await.last_consolidated(), 0);

        agent.process_direct("second", "s", "cli", "direct").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // 4 条达到窗口，保留最近 2 条
        assert_eq!(shared.lock().await.last_consolidated(), 2);
        assert_eq!(history_entries(ws.path()), 1);
        assert!(!agent.is_consolidating("s"));
    }

    #[tokio::test]
    async fn test_one_consolidation_in_flight_per_session() {
        let ws = tempfile::tempdir().unwrap();
        let provider = save_memory_provider(Some(std::time::Duration::from_millis(100)));
        let agent = build_with_window(ws.path(), provider.clone(), 4);
        let shared = fill_session(&agent, "s", 2).await;

        let snapshot = shared.lock().await.clone();
        agent.maybe_consolidate(&shared, &snapshot);
        assert!(agent.is_consolidating("s"));
        agent.maybe_consolidate(&shared, &snapshot);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(shared.lock().await.last_consolidated(), 2);
        assert!(!agent.is_consolidating("s"));
    }

    #[tokio::test]
    async fn test_cleared_session_ignores_stale_cursor() {
        let ws = tempfile::tempdir().unwrap();
        let provider = save_memory_provider(Some(std::time::Duration::from_millis(100)));
        let agent = build_with_window(ws.path(), provider, 4);
        let shared = fill_session(&agent, "s", 2).await;

        let snapshot = shared.lock().await.clone();
        agent.maybe_consolidate(&shared, &snapshot);
        {
            // 整理进行中会话被清空后又长回 4 条
            let mut session = shared.lock().await;
            session.clear();
            for i in 0..2 {
                session.push(Message::user(format!("fresh{}", i)));
                session.push(Message::assistant(Some("ok".into())));
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(shared.lock().await.last_consolidated(), 0);
        assert!(!agent.is_consolidating("s"));
    }

    #[tokio::test]
    async fn test_new_waits_for_running_consolidation() {
        let ws = tempfile::tempdir().unwrap();
        let provider = save_memory_provider(Some(std::time::Duration::from_millis(100)));
        let agent = build_with_window(ws.path(), provider.clone(), 4);
        let shared = fill_session(&agent, "s", 2).await;

        let snapshot = shared.lock().await.clone();
        agent.maybe_consolidate(&shared, &snapshot);
        let reply = agent.process_direct("/new", "s", "cli", "direct").await.unwrap();
        assert_eq!(reply, "New session started.");

        // 后台整理归档 u0/a0，/new 只归档剩下的 u1/a1
        let seen = provider.seen_messages();
        assert_eq!(seen.len(), 2);
        let archive_prompt = seen[1][1].text();
        assert!(archive_prompt.contains("u1"));
        assert!(!archive_prompt.contains("u0"));
        assert_eq!(history_entries(ws.path()), 2);
        assert!(shared.lock().await.messages.is_empty());
    }

    #[tokio::test]
    async fn test_model_error_keeps_turns_alternating() {
        let ws = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            MockLlmClient::new().with_responses(vec![LlmResponse::error("upstream 502")]),
        );
        let (_bus, agent) = build(ws.path(), provider.clone());

        let reply = agent.process_direct("first", "s", "cli", "direct").await.unwrap();
        assert!(reply.starts_with("Error calling LLM:"));
        agent.process_direct("second", "s", "cli", "direct").await.unwrap();

        let seen = provider.seen_messages();
        let roles: Vec<Role> = seen[1]
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.role)
            .collect();
        // 历史 user / assistant，随后是运行时上下文与本轮输入
        assert_eq!(roles[..2], [Role::User, Role::Assistant]);
        let session = agent.sessions().get_or_create("s");
        assert_eq!(session.lock().await.messages.len(), 4);
    }
}
