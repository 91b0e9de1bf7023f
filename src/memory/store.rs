//! 长期记忆：Markdown 文件存储与会话整理
//!
//! - 长期事实：memory/MEMORY.md（整理时整体重写，注入 system prompt）
//! - 历史日志：memory/HISTORY.md（只追加，每段以 [YYYY-MM-DD HH:MM] 开头，便于 grep）
//!
//! 整理（consolidation）由模型通过 save_memory 工具给出 history_entry 与 memory_update。

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{ChatRequest, LlmClient, ToolDefinition};
use crate::memory::{Message, Role};

/// 记忆根目录：memory/
pub fn memory_root(workspace: &Path) -> PathBuf {
    workspace.join("memory")
}

/// 整理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consolidation {
    /// 没有需要整理的消息
    Nothing,
    /// 已归档到该下标（不含）为止的消息
    Archived { upto: usize },
}

/// 一次整理的输入
pub struct ConsolidationRequest<'a> {
    pub messages: &'a [Message],
    pub last_consolidated: usize,
    /// 为 true 时归档全部消息（/new）
    pub archive_all: bool,
    pub memory_window: usize,
    pub provider: &'a dyn LlmClient,
    pub model: &'a str,
}

/// MEMORY.md + HISTORY.md
#[derive(Debug, Clone)]
pub struct MemoryStore {
    memory_dir: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            memory_dir: memory_root(workspace),
        }
    }

    pub fn memory_file(&self) -> PathBuf {
        self.memory_dir.join("MEMORY.md")
    }

    pub fn history_file(&self) -> PathBuf {
        self.memory_dir.join("HISTORY.md")
    }

    pub fn read_long_term(&self) -> String {
        std::fs::read_to_string(self.memory_file()).unwrap_or_default()
    }

    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.memory_dir)?;
        std::fs::write(self.memory_file(), content)
    }

    pub fn append_history(&self, entry: &str) -> std::io::Result<()> {
        if entry.trim().is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.memory_dir)?;
        let line = format!("{}\n\n", entry.trim_end());
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_file())?
            .write_all(line.as_bytes())
    }

    /// 注入 system prompt 的记忆段落；无内容时为空串
    pub fn memory_context(&self) -> String {
        let long_term = self.read_long_term();
        if long_term.trim().is_empty() {
            String::new()
        } else {
            format!("## Long-term Memory\n{}", long_term)
        }
    }

    /// 把旧消息整理进 MEMORY.md / HISTORY.md
    ///
    /// 非 archive_all 时保留最近 memory_window/2 条不整理。模型未调用 save_memory 或写文件失败时返回错误，
    /// 调用方据此决定是否推进游标。
    pub async fn consolidate(
        &self,
        req: ConsolidationRequest<'_>,
    ) -> Result<Consolidation, AgentError> {
        let total = req.messages.len();
        let (start, upto) = if req.archive_all {
            (0, total)
        } else {
            let keep = req.memory_window / 2;
            if total <= keep {
                return Ok(Consolidation::Nothing);
            }
            (req.last_consolidated.min(total), total - keep)
        };
        if start >= upto {
            return Ok(Consolidation::Nothing);
        }

        let transcript = format_transcript(&req.messages[start..upto]);
        if transcript.is_empty() {
            return Ok(Consolidation::Archived { upto });
        }
        tracing::info!(
            "Memory consolidation: {} messages to archive ({}..{})",
            upto - start,
            start,
            upto
        );

        let current = self.read_long_term();
        let prompt = format!(
            "Process this conversation and call the save_memory tool with your consolidation.\n\n\
             ## Current Long-term Memory\n{}\n\n## Conversation to Process\n{}",
            if current.trim().is_empty() { "(empty)" } else { current.as_str() },
            transcript
        );
        let messages = vec![
            Message::system(
                "You are a memory consolidation agent. Call the save_memory tool with your consolidation of the conversation.",
            ),
            Message::user(prompt),
        ];
        let tools = [save_memory_definition()];
        let response = req
            .provider
            .chat(ChatRequest {
                messages: &messages,
                tools: &tools,
                model: req.model,
                temperature: 0.1,
                max_tokens: 4096,
            })
            .await;

        let Some(call) = response.tool_calls.first() else {
            return Err(AgentError::ConsolidationFailed(
                "model did not call save_memory".to_string(),
            ));
        };

        let io_err = |e: std::io::Error| AgentError::ConsolidationFailed(e.to_string());
        if let Some(entry) = call.arguments.get("history_entry").map(as_text) {
            self.append_history(&entry).map_err(io_err)?;
        }
        if let Some(update) = call.arguments.get("memory_update").map(as_text) {
            if update != current {
                self.write_long_term(&update).map_err(io_err)?;
            }
        }
        tracing::info!("Memory consolidation done, archived up to {}", upto);
        Ok(Consolidation::Archived { upto })
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `[YYYY-MM-DD HH:MM] ROLE [tools: a, b]: content`，跳过空内容
fn format_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.text().is_empty())
        .map(|m| {
            let ts = m
                .timestamp
                .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "?".to_string());
            let tools = if m.role == Role::Assistant && !m.tool_calls.is_empty() {
                let names: Vec<&str> = m.tool_calls.iter().map(|c| c.name.as_str()).collect();
                format!(" [tools: {}]", names.join(", "))
            } else {
                String::new()
            };
            format!(
                "[{}] {}{}: {}",
                ts,
                m.role.as_str().to_uppercase(),
                tools,
                m.text()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn save_memory_definition() -> ToolDefinition {
    ToolDefinition {
        name: "save_memory".to_string(),
        description: "Save the memory consolidation result to persistent storage.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "history_entry": {
                    "type": "string",
                    "description": "A paragraph (2-5 sentences) summarizing key events/decisions/topics. Start with [YYYY-MM-DD HH:MM]. Include detail useful for grep search."
                },
                "memory_update": {
                    "type": "string",
                    "description": "Full updated long-term memory as markdown. Include all existing facts plus new ones. Return unchanged if nothing new."
                }
            },
            "required": ["history_entry", "memory_update"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, MockLlmClient, ToolCallRequest};

    fn turns(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {}", i))
                } else {
                    Message::assistant(Some(format!("answer {}", i)))
                }
            })
            .collect()
    }

    fn saving_mock() -> MockLlmClient {
        MockLlmClient::new().with_repeat(LlmResponse::tool_calls(
            None,
            vec![ToolCallRequest::new(
                "m1",
                "save_memory",
                json!({
                    "history_entry": "[2026-01-01 10:00] User asked questions.",
                    "memory_update": "- likes questions"
                }),
            )],
        ))
    }

    #[tokio::test]
    async fn test_consolidate_keeps_recent_half_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let llm = saving_mock();
        let messages = turns(12);

        let result = store
            .consolidate(ConsolidationRequest {
                messages: &messages,
                last_consolidated: 0,
                archive_all: false,
                memory_window: 10,
                provider: &llm,
                model: "mock",
            })
            .await
            .unwrap();

        assert_eq!(result, Consolidation::Archived { upto: 7 });
        assert_eq!(store.read_long_term(), "- likes questions");
        assert!(std::fs::read_to_string(store.history_file())
            .unwrap()
            .contains("User asked questions."));
        assert!(store.memory_context().starts_with("## Long-term Memory"));
    }

    #[tokio::test]
    async fn test_consolidate_nothing_when_within_keep() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let llm = saving_mock();
        let messages = turns(4);

        let result = store
            .consolidate(ConsolidationRequest {
                messages: &messages,
                last_consolidated: 0,
                archive_all: false,
                memory_window: 10,
                provider: &llm,
                model: "mock",
            })
            .await
            .unwrap();
        assert_eq!(result, Consolidation::Nothing);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_consolidate_fails_without_tool_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let llm = MockLlmClient::new().with_repeat(LlmResponse::text("no tools today"));
        let messages = turns(3);

        let result = store
            .consolidate(ConsolidationRequest {
                messages: &messages,
                last_consolidated: 0,
                archive_all: true,
                memory_window: 10,
                provider: &llm,
                model: "mock",
            })
            .await;
        assert!(matches!(result, Err(AgentError::ConsolidationFailed(_))));
        assert!(!store.memory_file().exists());
    }
}
