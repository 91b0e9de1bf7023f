//! 工具调用循环
//!
//! 调用模型 -> 有工具调用则依次执行并把结果追加到消息列表 -> 再次调用模型，
//! 直到模型给出不含工具调用的回复或达到迭代上限。主代理与子代理共用。

use std::sync::OnceLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{ChatRequest, LlmClient, ToolCallRequest};
use crate::memory::Message;
use crate::tools::{ToolContext, ToolRegistry};

/// 进度回调：(文本, 是否为工具提示)
pub type ProgressFn<'a> = &'a (dyn Fn(String, bool) + Send + Sync);

/// 工具提示中参数预览的最大字符数
const HINT_ARG_MAX_CHARS: usize = 40;

/// 一次循环的结果
#[derive(Debug)]
pub struct LoopOutcome {
    /// 最终回复；模型返回空文本时为 None
    pub final_content: Option<String>,
    /// 是否因达到迭代上限而结束
    pub exhausted: bool,
    pub tools_used: Vec<String>,
    /// 输入消息加上本轮新增的 assistant / tool 消息
    pub messages: Vec<Message>,
}

/// 工具循环配置
pub struct ToolLoop<'a> {
    pub provider: &'a dyn LlmClient,
    pub tools: &'a ToolRegistry,
    pub ctx: &'a ToolContext,
    /// 每次调用模型前后、每次执行工具前检查
    pub cancel_token: CancellationToken,
    pub model: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub progress: Option<ProgressFn<'a>>,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        provider: &'a dyn LlmClient,
        tools: &'a ToolRegistry,
        ctx: &'a ToolContext,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            provider,
            tools,
            ctx,
            cancel_token,
            model: provider.default_model(),
            temperature: 0.1,
            max_tokens: 8192,
            max_iterations: 40,
            progress: None,
        }
    }

    pub fn with_model(mut self, model: &'a str) -> Self {
        self.model = model;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel_token.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 运行循环；仅在被取消时返回错误
    pub async fn run(&self, mut messages: Vec<Message>) -> Result<LoopOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let mut tools_used = Vec::new();

        for iteration in 0..self.max_iterations {
            self.check_cancelled()?;
            let response = self
                .provider
                .chat(ChatRequest {
                    messages: &messages,
                    tools: &definitions,
                    model: self.model,
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                })
                .await;
            // 模型调用不会被中断，返回后再检查一次
            self.check_cancelled()?;

            if !response.has_tool_calls() {
                let clean = strip_think(response.content.as_deref());
                if response.finish_reason == "error" {
                    tracing::error!(
                        "LLM returned error: {}",
                        response.content.as_deref().unwrap_or_default()
                    );
                    // 错误文本也作为 assistant 回复记下，保持 user / assistant 交替
                    let text = clean.unwrap_or_else(|| {
                        "Sorry, I encountered an error calling the AI model.".to_string()
                    });
                    messages.push(Message::assistant(Some(text.clone())));
                    return Ok(LoopOutcome {
                        final_content: Some(text),
                        exhausted: false,
                        tools_used,
                        messages,
                    });
                }
                messages.push(
                    Message::assistant(clean.clone()).with_reasoning(response.reasoning_content),
                );
                return Ok(LoopOutcome {
                    final_content: clean,
                    exhausted: false,
                    tools_used,
                    messages,
                });
            }

            tracing::debug!(
                iteration,
                calls = response.tool_calls.len(),
                "model requested tools"
            );
            if let Some(progress) = self.progress {
                if let Some(thought) = strip_think(response.content.as_deref()) {
                    progress(thought, false);
                }
                progress(tool_hint(&response.tool_calls), true);
            }

            messages.push(Message::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
                response.reasoning_content.clone(),
            ));

            for call in &response.tool_calls {
                self.check_cancelled()?;
                tools_used.push(call.name.clone());
                let args = call.arguments.to_string();
                tracing::info!(
                    "Tool call: {}({})",
                    call.name,
                    args.chars().take(200).collect::<String>()
                );
                let result = self
                    .tools
                    .execute(&call.name, call.arguments.clone(), self.ctx)
                    .await;
                messages.push(Message::tool_result(&call.id, &call.name, result));
            }
        }

        tracing::warn!("Max iterations ({}) reached", self.max_iterations);
        Ok(LoopOutcome {
            final_content: Some(format!(
                "I reached the maximum number of tool call iterations ({}) without completing the task.",
                self.max_iterations
            )),
            exhausted: true,
            tools_used,
            messages,
        })
    }
}

static THINK_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 去掉 `<think>...</think>` 推理标记；剩余为空时返回 None
pub fn strip_think(text: Option<&str>) -> Option<String> {
    let text = text?;
    let re = THINK_RE.get_or_init(|| Regex::new(r"<think>[\s\S]*?</think>").ok());
    let cleaned = match re {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    };
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// 工具调用的简短提示，如 `web_search("rust async")`
pub fn tool_hint(calls: &[ToolCallRequest]) -> String {
    calls
        .iter()
        .map(|call| {
            let first = call
                .arguments
                .as_object()
                .and_then(|args| args.values().next())
                .and_then(|v| v.as_str());
            match first {
                Some(val) if val.chars().count() > HINT_ARG_MAX_CHARS => {
                    let head: String = val.chars().take(HINT_ARG_MAX_CHARS).collect();
                    format!("{}(\"{}...\")", call.name, head)
                }
                Some(val) => format!("{}(\"{}\")", call.name, val),
                None => call.name.clone(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient};
    use crate::memory::Role;
    use crate::tools::Tool;

    struct EchoArg;

    #[async_trait::async_trait]
    impl Tool for EchoArg {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo text"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<String, String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(EchoArg);
        r
    }

    fn echo_call(id: &str) -> LlmResponse {
        LlmResponse::tool_calls(
            Some("<think>plan</think>Let me check.".to_string()),
            vec![ToolCallRequest::new(id, "echo", json!({"text": "hi"}))],
        )
    }

    #[test]
    fn test_strip_think() {
        assert_eq!(strip_think(Some("<think>x</think> answer ")), Some("answer".to_string()));
        assert_eq!(strip_think(Some("<think>only</think>")), None);
        assert_eq!(strip_think(None), None);
    }

    #[test]
    fn test_tool_hint_truncates_first_string_arg() {
        let long = "a".repeat(50);
        let calls = vec![
            ToolCallRequest::new("1", "web_search", json!({"query": long})),
            ToolCallRequest::new("2", "list_dir", json!({"depth": 2})),
            ToolCallRequest::new("3", "read_file", json!({"path": "a.txt"})),
        ];
        assert_eq!(
            tool_hint(&calls),
            format!("web_search(\"{}...\"), list_dir, read_file(\"a.txt\")", "a".repeat(40))
        );
    }

    #[tokio::test]
    async fn test_loop_runs_tools_then_answers() {
        let provider = MockLlmClient::new()
            .with_responses(vec![echo_call("c1"), LlmResponse::text("<think>ok</think>Done.")]);
        let tools = registry();
        let ctx = ToolContext::new("cli", "direct", "cli:direct");
        let seen = Mutex::new(Vec::new());
        let progress = |text: String, hint: bool| seen.lock().unwrap().push((text, hint));

        let outcome = ToolLoop::new(&provider, &tools, &ctx, CancellationToken::new())
            .with_progress(&progress)
            .run(vec![Message::user("go")])
            .await
            .unwrap();

        assert_eq!(outcome.final_content.as_deref(), Some("Done."));
        assert!(!outcome.exhausted);
        assert_eq!(outcome.tools_used, vec!["echo".to_string()]);
        let roles: Vec<Role> = outcome.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(outcome.messages[2].text(), "hi");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("Let me check.".to_string(), false),
                ("echo(\"hi\")".to_string(), true)
            ]
        );
    }

    #[tokio::test]
    async fn test_loop_stops_at_iteration_cap() {
        let provider = MockLlmClient::new().with_repeat(echo_call("c"));
        let tools = registry();
        let ctx = ToolContext::default();
        let outcome = ToolLoop::new(&provider, &tools, &ctx, CancellationToken::new())
            .with_max_iterations(3)
            .run(vec![Message::user("loop")])
            .await
            .unwrap();
        assert!(outcome.exhausted);
        assert_eq!(provider.calls(), 3);
        assert_eq!(
            outcome.final_content.as_deref(),
            Some("I reached the maximum number of tool call iterations (3) without completing the task.")
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_model_call() {
        let provider = MockLlmClient::new();
        let tools = registry();
        let ctx = ToolContext::default();
        let token = CancellationToken::new();
        token.cancel();
        let result = ToolLoop::new(&provider, &tools, &ctx, token)
            .run(vec![Message::user("x")])
            .await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_error_response_is_recorded_as_assistant_turn() {
        let provider = MockLlmClient::new().with_responses(vec![LlmResponse::error("boom")]);
        let tools = registry();
        let ctx = ToolContext::default();
        let outcome = ToolLoop::new(&provider, &tools, &ctx, CancellationToken::new())
            .run(vec![Message::user("x")])
            .await
            .unwrap();
        let answer = outcome.final_content.unwrap();
        assert!(answer.starts_with("Error calling LLM:"));
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[1].role, Role::Assistant);
        assert_eq!(outcome.messages[1].text(), answer);
    }
}
