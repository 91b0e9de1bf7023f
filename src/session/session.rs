//! 会话：一个 session key 下的全部 turn 与整理游标
//!
//! 游标 last_consolidated 之前的消息已归档进长期记忆；游标只增不减且不超过消息数。

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::memory::{Message, Role};

/// 单个会话
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    last_consolidated: usize,
    /// 每次 clear 加一；后台整理据此判断快照是否仍属于当前会话
    generation: u64,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: Map::new(),
            last_consolidated: 0,
            generation: 0,
        }
    }

    /// 从持久化记录恢复；越界的游标会被截到消息数
    pub(crate) fn restore(
        key: String,
        messages: Vec<Message>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        metadata: Map<String, Value>,
        last_consolidated: usize,
    ) -> Self {
        let last_consolidated = last_consolidated.min(messages.len());
        Self {
            key,
            messages,
            created_at,
            updated_at,
            metadata,
            last_consolidated,
            generation: 0,
        }
    }

    pub fn last_consolidated(&self) -> usize {
        self.last_consolidated
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 尚未整理的消息条数
    pub fn unconsolidated_count(&self) -> usize {
        self.messages.len().saturating_sub(self.last_consolidated)
    }

    /// 推进整理游标；只接受前进且不越界的值
    pub fn mark_consolidated(&mut self, upto: usize) -> bool {
        if upto > self.last_consolidated && upto <= self.messages.len() {
            self.last_consolidated = upto;
            true
        } else {
            false
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.updated_at = Utc::now();
    }

    /// 送入模型的历史：游标之后的后缀，取最近 max_messages 条，再对齐到第一条 user 消息。
    /// 时间戳与推理字段不回传给模型。
    pub fn get_history(&self, max_messages: usize) -> Vec<Message> {
        let unconsolidated = &self.messages[self.last_consolidated..];
        let start = unconsolidated.len().saturating_sub(max_messages);
        let mut sliced = &unconsolidated[start..];

        if let Some(first_user) = sliced.iter().position(|m| m.role == Role::User) {
            sliced = &sliced[first_user..];
        }

        sliced
            .iter()
            .map(|m| Message {
                timestamp: None,
                reasoning_content: None,
                ..m.clone()
            })
            .collect()
    }

    /// 清空消息并重置游标
    pub fn clear(&mut self) {
        self.messages.clear();
        self.last_consolidated = 0;
        self.generation += 1;
        self.updated_at = Utc::now();
    }
}
