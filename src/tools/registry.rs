//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册。
//! registry.execute 是模型调用工具的唯一入口：先按 schema 校验参数，再在超时内执行，
//! 所有失败（未知工具、参数错误、工具报错、panic、超时）都归一成以 "Error" 开头的文本并附上提示语，
//! 每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::timeout;

use crate::llm::ToolDefinition;
use crate::tools::schema::validate_params;

/// 附在错误结果后面，提示模型换个思路
pub const COACHING_HINT: &str = "\n\n[Analyze the error above and try a different approach.]";

/// 一轮处理的工具上下文：来源渠道、会话与「本轮已发送」标记
///
/// 每轮新建，克隆后共享同一个标记；工具实例本身不保存任何轮次状态。
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub message_id: Option<String>,
    sent_in_turn: Arc<AtomicBool>,
}

impl ToolContext {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            session_key: session_key.into(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    /// 是否就是本轮的来源会话
    pub fn is_origin(&self, channel: &str, chat_id: &str) -> bool {
        self.channel == channel && self.chat_id == chat_id
    }

    /// message 工具已向本轮来源会话发送过内容
    pub fn mark_sent(&self) {
        self.sent_in_turn.store(true, Ordering::SeqCst);
    }

    pub fn sent_in_turn(&self) -> bool {
        self.sent_in_turn.load(Ordering::SeqCst)
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Err 中的文本会以 `Error: ` 前缀交给模型
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 单次工具调用的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 已注册工具名（按名称排序）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 发给模型的工具描述 {name, description, parameters}
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(&name).map(|t| (name, t)))
            .map(|(name, tool)| ToolDefinition {
                name,
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// 校验并执行工具，结果总是文本
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> String {
        let Some(tool) = self.tools.get(name) else {
            return format!(
                "Error: Tool '{}' not found. Available: {}",
                name,
                self.tool_names().join(", ")
            );
        };

        let errors = validate_params(&tool.parameters_schema(), &args);
        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            tracing::debug!(tool = name, "invalid tool parameters: {}", joined.join("; "));
            return format!(
                "Error: Invalid parameters for tool '{}': {}{}",
                name,
                joined.join("; "),
                COACHING_HINT
            );
        }

        let start = Instant::now();
        let preview = args_preview(&args);
        let run = AssertUnwindSafe(tool.execute(args, ctx)).catch_unwind();
        let result = timeout(self.timeout, run).await;

        let (outcome, text) = match result {
            Ok(Ok(Ok(content))) => ("ok", content),
            Ok(Ok(Err(e))) => ("error", format!("Error: {}", e)),
            Ok(Err(panic)) => (
                "panic",
                format!("Error executing {}: {}", name, panic_message(panic.as_ref())),
            ),
            Err(_) => (
                "timeout",
                format!(
                    "Error executing {}: timed out after {}s",
                    name,
                    self.timeout.as_secs()
                ),
            ),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "session": ctx.session_key,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        if text.starts_with("Error") {
            format!("{}{}", text, COACHING_HINT)
        } else {
            text
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
