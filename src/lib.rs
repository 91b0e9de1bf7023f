//! Nectar - Rust 个人助理进程
//!
//! 模块划分：
//! - **agent**: Prompt 构建、工具调用循环、分发循环、子代理
//! - **bus**: 入站 / 出站消息队列
//! - **channels**: 渠道适配器（CLI）与出站分发
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、活跃任务登记、优雅关闭
//! - **cron**: 持久化定时任务
//! - **heartbeat**: 周期性检查 HEARTBEAT.md
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 消息类型与长期记忆整理
//! - **observability**: 日志初始化
//! - **session**: 会话存储（JSONL）
//! - **skills**: 技能加载
//! - **tools**: 工具注册表、参数校验与内置工具

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod core;
pub mod cron;
pub mod heartbeat;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod session;
pub mod skills;
pub mod tools;
