//! Agent 核心：Prompt 构建、工具调用循环、分发循环与子代理

pub mod context;
pub mod loop_;
pub mod subagent;
pub mod tool_loop;

pub use context::{ContextBuilder, RUNTIME_CONTEXT_TAG};
pub use loop_::{AgentLoop, AgentLoopBuilder, AgentSettings};
pub use subagent::{SubagentManager, SubagentSettings, SUBAGENT_MAX_ITERATIONS};
pub use tool_loop::{strip_think, tool_hint, LoopOutcome, ToolLoop};
