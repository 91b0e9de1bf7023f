//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 默认回显最后一条 User 消息；可预置脚本响应、固定重复响应、按消息内容动态应答，
//! 并记录调用次数与最大并发数，便于验证分发循环的串行性。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatRequest, LlmClient, LlmResponse};
use crate::memory::{Message, Role};

type Responder = Box<dyn Fn(&ChatRequest<'_>) -> Option<LlmResponse> + Send + Sync>;

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<LlmResponse>>,
    repeat: Option<LlmResponse>,
    responder: Option<Responder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回这些响应，用完后回到默认行为
    pub fn with_responses(self, responses: Vec<LlmResponse>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(responses);
        }
        self
    }

    /// 每次都返回同一个响应
    pub fn with_repeat(mut self, response: LlmResponse) -> Self {
        self.repeat = Some(response);
        self
    }

    /// 按请求内容决定响应；返回 None 时走脚本 / 默认行为
    pub fn with_responder(
        mut self,
        f: impl Fn(&ChatRequest<'_>) -> Option<LlmResponse> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(f));
        self
    }

    /// 每次调用前等待，用于观察并发
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 观察到的最大同时在途调用数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn respond(&self, request: &ChatRequest<'_>) -> LlmResponse {
        if let Some(resp) = self.responder.as_ref().and_then(|f| f(request)) {
            return resp;
        }
        if let Some(resp) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return resp;
        }
        if let Some(resp) = &self.repeat {
            return resp.clone();
        }
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.as_deref())
            .unwrap_or("(no input)");
        LlmResponse::text(format!("Echo: {}", last_user))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat<'a>(&self, request: ChatRequest<'a>) -> LlmResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.messages.to_vec());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.respond(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }

    fn default_model(&self) -> &str {
        "mock"
    }
}
