//! exec 工具：在工作区内执行 shell 命令
//!
//! 命中拒绝列表（配置 deny_patterns + 内置 fork bomb 等）的命令直接拒绝；限制模式下禁止 ../ 与工作区外的绝对路径。
//! 执行通过 sh -c / cmd /C，带超时；stdout、stderr 与非零退出码一并返回，输出过长时截断。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::ShellSection;
use crate::tools::{Tool, ToolContext};

/// 无论配置如何都拒绝的子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    ":(){ :|:& };:", // fork bomb
    "> /dev/sd",
    "chmod -r 777 /",
];

const MAX_OUTPUT_CHARS: usize = 10_000;

/// Shell 工具
pub struct ExecTool {
    working_dir: PathBuf,
    deny_patterns: Vec<String>,
    timeout: Duration,
    restrict_to_workspace: bool,
    path_append: Option<String>,
}

impl ExecTool {
    pub fn new(working_dir: impl Into<PathBuf>, cfg: &ShellSection, restrict_to_workspace: bool) -> Self {
        Self {
            working_dir: working_dir.into(),
            deny_patterns: cfg.deny_patterns.iter().map(|p| p.to_lowercase()).collect(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            restrict_to_workspace,
            path_append: cfg.path_append.clone(),
        }
    }

    fn guard(&self, command: &str) -> Result<(), String> {
        let lower = command.to_lowercase();
        if lower.trim().is_empty() {
            return Err("Empty command".to_string());
        }
        let hit = FORBIDDEN_SUBSTR
            .iter()
            .map(|s| s.to_string())
            .chain(self.deny_patterns.iter().cloned())
            .find(|p| !p.is_empty() && lower.contains(p.as_str()));
        if let Some(p) = hit {
            return Err(format!("Command blocked by safety guard (pattern: {})", p));
        }

        if self.restrict_to_workspace {
            if command.contains("../") || command.contains("..\\") {
                return Err("Command blocked by safety guard (path traversal detected)".to_string());
            }
            let outside = command
                .split_whitespace()
                .filter(|tok| tok.starts_with('/'))
                .map(|tok| PathBuf::from(tok.trim_matches(|c| c == '"' || c == '\'')))
                .any(|p| !p.starts_with(&self.working_dir));
            if outside {
                return Err(
                    "Command blocked by safety guard (path outside working dir)".to_string(),
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. Use with caution."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to execute"},
                "working_dir": {"type": "string", "description": "Optional working directory for the command"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        self.guard(command)?;
        let cwd = match args.get("working_dir").and_then(Value::as_str) {
            Some(dir) if !self.restrict_to_workspace => PathBuf::from(dir),
            _ => self.working_dir.clone(),
        };

        tracing::info!(command = %command, cwd = %cwd.display(), "exec tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&cwd).kill_on_drop(true);
        if let Some(extra) = &self.path_append {
            let path = std::env::var("PATH").unwrap_or_default();
            let sep = if cfg!(target_os = "windows") { ";" } else { ":" };
            cmd.env("PATH", format!("{}{}{}", path, sep, extra));
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {} seconds", self.timeout.as_secs()))?
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut parts = Vec::new();
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{}", stderr));
        }
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            parts.push(format!("\nExit code: {}", code));
        }
        let result = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };

        let total = result.chars().count();
        if total > MAX_OUTPUT_CHARS {
            let head: String = result.chars().take(MAX_OUTPUT_CHARS).collect();
            return Ok(format!("{}\n... (truncated, {} more chars)", head, total - MAX_OUTPUT_CHARS));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(restrict: bool) -> (tempfile::TempDir, ExecTool) {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path(), &ShellSection::default(), restrict);
        (dir, tool)
    }

    #[test]
    fn test_guard_blocks_deny_patterns_and_escape() {
        let (_dir, t) = tool(true);
        assert!(t.guard("rm -rf /").is_err());
        assert!(t.guard("cat ../secret").is_err());
        assert!(t.guard("cat /etc/passwd").is_err());
        assert!(t.guard("ls -la").is_ok());
        assert!(t.guard("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_reports_output_and_exit_code() {
        let (_dir, t) = tool(false);
        let ctx = ToolContext::default();
        let out = t.execute(json!({"command": "echo hi"}), &ctx).await.unwrap();
        assert_eq!(out.trim(), "hi");

        let out = t
            .execute(json!({"command": "echo oops >&2; exit 3"}), &ctx)
            .await
            .unwrap();
        assert!(out.contains("STDERR:\noops"));
        assert!(out.ends_with("Exit code: 3"));
    }
}
