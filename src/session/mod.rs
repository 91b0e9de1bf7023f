//! 会话层：按 session key 组织的对话历史与 JSONL 持久化

pub mod manager;
pub mod session;

pub use manager::{safe_filename, SessionInfo, SessionManager, SharedSession};
pub use session::Session;
