//! 记忆层：会话消息结构与长期记忆（MEMORY.md / HISTORY.md）

pub mod conversation;
pub mod store;

pub use conversation::{Message, Role};
pub use store::{Consolidation, ConsolidationRequest, MemoryStore};
