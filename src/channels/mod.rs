//! 渠道层：各前端适配器与出站分发
//!
//! 渠道把收到的用户消息发布到总线入站队列；ChannelManager 从出站队列取消息，按渠道名转交。

pub mod base;
pub mod cli;
pub mod manager;

pub use base::{is_allowed, Channel};
pub use cli::CliChannel;
pub use manager::ChannelManager;
