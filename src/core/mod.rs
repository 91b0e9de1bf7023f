//! 核心运行时：错误类型、活跃任务登记、优雅关闭

pub mod active_tasks;
pub mod error;
pub mod shutdown;

pub use active_tasks::{ActiveTasks, TaskId};
pub use error::AgentError;
pub use shutdown::{ShutdownManager, ShutdownReason};
