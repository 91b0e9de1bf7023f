//! 工具层
//!
//! 文件读写、shell、网页抓取与搜索、消息发送、子代理、定时任务。
//! 所有工具经 ToolRegistry 统一校验参数、限时执行并把失败归一成文本。

pub mod cron;
pub mod filesystem;
pub mod message;
pub mod registry;
pub mod schema;
pub mod shell;
pub mod spawn;
pub mod web;

use std::path::Path;
use std::time::Duration;

pub use cron::CronTool;
pub use filesystem::{EditFileTool, ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use message::MessageTool;
pub use registry::{Tool, ToolContext, ToolRegistry, COACHING_HINT};
pub use schema::{validate_params, ValidationError};
pub use shell::ExecTool;
pub use spawn::SpawnTool;
pub use web::{WebFetchTool, WebSearchTool};

use crate::config::ToolsSection;

/// 基础工具集：文件、exec、网页（子代理只用这一套，主代理在此之上再注册 message / spawn / cron）
pub fn build_worker_registry(workspace: &Path, cfg: &ToolsSection) -> ToolRegistry {
    let fs = SafeFs::new(workspace, cfg.restrict_to_workspace);
    let mut registry =
        ToolRegistry::new().with_timeout(Duration::from_secs(cfg.tool_timeout_secs.max(1)));
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(WriteFileTool::new(fs.clone()));
    registry.register(EditFileTool::new(fs.clone()));
    registry.register(ListDirTool::new(fs));
    registry.register(ExecTool::new(workspace, &cfg.shell, cfg.restrict_to_workspace));
    registry.register(WebSearchTool::new(&cfg.web));
    registry.register(WebFetchTool::new(&cfg.web));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_registry_has_no_orchestration_tools() {
        let ws = tempfile::tempdir().unwrap();
        let registry = build_worker_registry(ws.path(), &ToolsSection::default());
        assert_eq!(
            registry.tool_names(),
            vec![
                "edit_file",
                "exec",
                "list_dir",
                "read_file",
                "web_fetch",
                "web_search",
                "write_file"
            ]
        );
        assert!(!registry.has("spawn"));
        assert!(!registry.has("message"));
    }
}
