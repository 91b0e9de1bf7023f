//! 文件系统工具：read_file / write_file / edit_file / list_dir
//!
//! 相对路径以工作区为基准。SafeFs 可选地绑定一个允许目录，所有路径经 resolve 校验必须在其下
//! （禁止 ../ 逃逸）；未绑定时可访问任意路径。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::tools::{Tool, ToolContext};

/// 单次读取返回给模型的最大字符数
const MAX_READ_CHARS: usize = 128_000;

/// 文件系统访问边界
#[derive(Debug, Clone)]
pub struct SafeFs {
    workspace: PathBuf,
    allowed_dir: Option<PathBuf>,
}

/// 去掉 `.` 与 `..`，不访问磁盘（目标文件可能尚不存在）
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn canonical_or_normalized(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| normalize(path))
}

impl SafeFs {
    pub fn new(workspace: impl AsRef<Path>, restrict: bool) -> Self {
        let workspace = canonical_or_normalized(workspace.as_ref());
        let allowed_dir = restrict.then(|| workspace.clone());
        Self {
            workspace,
            allowed_dir,
        }
    }

    /// 解析路径；限制模式下路径必须落在允许目录内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let p = Path::new(path);
        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        };
        let resolved = canonical_or_normalized(&full);
        match &self.allowed_dir {
            Some(allowed) if !resolved.starts_with(allowed) => {
                Err(AgentError::PathEscape(path.to_string()))
            }
            _ => Ok(resolved),
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(AgentError::ToolExecutionFailed(format!("File not found: {}", path)));
        }
        if !resolved.is_file() {
            return Err(AgentError::ToolExecutionFailed(format!("Not a file: {}", path)));
        }
        std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {}", e)))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, AgentError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {}", e)))?;
        }
        std::fs::write(&resolved, content)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {}", e)))?;
        Ok(resolved)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Err(AgentError::ToolExecutionFailed(format!(
                "Not a directory: {}",
                path
            )));
        }
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir {
                format!("[dir]  {}/", name)
            } else {
                format!("[file] {}", name)
            });
        }
        entries.sort();
        Ok(entries)
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

/// read_file 工具
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to read"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let path = str_arg(&args, "path");
        tracing::info!(path = %path, "read_file tool execute");
        let content = self.fs.read_file(path).map_err(|e| e.to_string())?;
        if content.chars().count() > MAX_READ_CHARS {
            let head: String = content.chars().take(MAX_READ_CHARS).collect();
            return Ok(format!(
                "{}\n\n... (truncated, file has {} chars)",
                head,
                content.chars().count()
            ));
        }
        Ok(content)
    }
}

/// write_file 工具：覆盖写入，自动创建父目录
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates parent directories if needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to write to"},
                "content": {"type": "string", "description": "The content to write"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let path = str_arg(&args, "path");
        let content = str_arg(&args, "content");
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        let written = self.fs.write_file(path, content).map_err(|e| e.to_string())?;
        Ok(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            written.display()
        ))
    }
}

/// edit_file 工具：把 old_text 的唯一一次出现替换为 new_text
pub struct EditFileTool {
    fs: SafeFs,
}

impl EditFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. The old_text must exist exactly once in the file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to edit"},
                "old_text": {"type": "string", "description": "The exact text to find and replace"},
                "new_text": {"type": "string", "description": "The text to replace with"}
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let path = str_arg(&args, "path");
        let old_text = str_arg(&args, "old_text");
        let new_text = str_arg(&args, "new_text");
        tracing::info!(path = %path, "edit_file tool execute");

        let content = self.fs.read_file(path).map_err(|e| e.to_string())?;
        if old_text.is_empty() || !content.contains(old_text) {
            return Err(format!(
                "old_text not found in {}. Make sure it matches exactly.",
                path
            ));
        }
        let count = content.matches(old_text).count();
        if count > 1 {
            return Ok(format!(
                "Warning: old_text appears {} times. Please provide more context to make it unique.",
                count
            ));
        }
        let updated = content.replacen(old_text, new_text, 1);
        self.fs.write_file(path, &updated).map_err(|e| e.to_string())?;
        Ok(format!("Successfully edited {}", path))
    }
}

/// list_dir 工具
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The directory path to list"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let path = str_arg(&args, "path");
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        if entries.is_empty() {
            return Ok(format!("Directory {} is empty", path));
        }
        Ok(entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_fs_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path(), true);
        assert!(matches!(
            fs.resolve("../../etc/passwd"),
            Err(AgentError::PathEscape(_))
        ));
        assert!(matches!(fs.resolve("/etc/passwd"), Err(AgentError::PathEscape(_))));
        assert!(fs.resolve("notes/today.md").is_ok());

        let open = SafeFs::new(dir.path(), false);
        assert!(open.resolve("/etc/passwd").is_ok());
    }

    #[tokio::test]
    async fn test_write_edit_read_list() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path(), true);
        let ctx = ToolContext::default();

        let out = WriteFileTool::new(fs.clone())
            .execute(json!({"path": "notes/a.txt", "content": "hello world"}), &ctx)
            .await
            .unwrap();
        assert!(out.starts_with("Successfully wrote 11 bytes"));

        let edit = EditFileTool::new(fs.clone());
        edit.execute(
            json!({"path": "notes/a.txt", "old_text": "world", "new_text": "bees"}),
            &ctx,
        )
        .await
        .unwrap();
        assert!(edit
            .execute(
                json!({"path": "notes/a.txt", "old_text": "missing", "new_text": "x"}),
                &ctx
            )
            .await
            .is_err());

        let content = ReadFileTool::new(fs.clone())
            .execute(json!({"path": "notes/a.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(content, "hello bees");

        let listing = ListDirTool::new(fs)
            .execute(json!({"path": "."}), &ctx)
            .await
            .unwrap();
        assert_eq!(listing, "[dir]  notes/");
    }
}
