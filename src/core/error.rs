//! Agent 错误类型
//!
//! 工具与模型层的失败都先转成文本交给模型；只有越过这些边界的错误才以 AgentError 上抛，
//! 由分发循环统一兜底（回复致歉消息，循环本身不退出）。

use thiserror::Error;

/// 一轮处理过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 本轮被 /stop 取消：不回复、不落盘
    #[error("Turn cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Memory consolidation failed: {0}")]
    ConsolidationFailed(String),

    #[error("Session store error: {0}")]
    SessionStore(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),
}
