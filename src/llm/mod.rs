//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatRequest, LlmClient, LlmResponse, ToolCallRequest, ToolDefinition, Usage};

use crate::config::AppConfig;

/// 按配置与环境变量选择后端；没有可用 Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient::new());
    }

    let timeout = Duration::from_secs(cfg.llm.request_timeout_secs.max(1));
    let env_key = |name: &str| std::env::var(name).ok().filter(|k| !k.is_empty());
    let api_key = cfg.llm.api_key.clone().or_else(|| {
        if provider == "deepseek" {
            env_key("DEEPSEEK_API_KEY").or_else(|| env_key("OPENAI_API_KEY"))
        } else {
            env_key("OPENAI_API_KEY")
        }
    });

    let Some(api_key) = api_key else {
        tracing::warn!("No API key set for provider '{}', using Mock LLM", provider);
        return Arc::new(MockLlmClient::new());
    };

    let model = cfg.agent.model.as_str();
    if provider == "deepseek" && cfg.llm.base_url.is_none() {
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(create_deepseek_client(&api_key, Some(model), timeout))
    } else {
        tracing::info!(
            "Using OpenAI-compatible LLM ({}) at {}",
            model,
            cfg.llm.base_url.as_deref().unwrap_or(openai::OPENAI_BASE_URL)
        );
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            model,
            &api_key,
            timeout,
        ))
    }
}
