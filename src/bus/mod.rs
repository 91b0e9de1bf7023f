//! 消息总线：解耦渠道适配器与 Agent

pub mod events;
pub mod queue;

pub use events::{InboundMessage, OutboundMessage, SYSTEM_CHANNEL};
pub use queue::MessageBus;
