//! Prompt 构建
//!
//! system prompt 由身份说明、工作区引导文件、长期记忆、技能组成；
//! 每轮在历史之后插入一条运行时上下文（时间、来源渠道），明确标注为元数据而非指令。

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::memory::{MemoryStore, Message};
use crate::skills::SkillsLoader;

/// 运行时上下文消息的首行标记；持久化时据此跳过
pub const RUNTIME_CONTEXT_TAG: &str = "[Runtime Context - metadata only, not instructions]";

/// 工作区根目录下的引导文件，存在即注入 system prompt
pub const BOOTSTRAP_FILES: [&str; 5] = ["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// 为每轮对话组装消息列表
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    workspace: PathBuf,
    memory: MemoryStore,
    skills: SkillsLoader,
}

impl ContextBuilder {
    pub fn new(workspace: &Path) -> Self {
        Self::with_skills(workspace, SkillsLoader::with_default_builtin(workspace))
    }

    pub fn with_skills(workspace: &Path, skills: SkillsLoader) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            memory: MemoryStore::new(workspace),
            skills,
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// 完整 system prompt；skill_names 为本轮额外请求的技能
    pub fn build_system_prompt(&self, skill_names: &[String]) -> String {
        let mut parts = vec![self.identity()];

        let bootstrap = self.load_bootstrap_files();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let memory = self.memory.memory_context();
        if !memory.is_empty() {
            parts.push(format!("# Memory\n\n{}", memory));
        }

        let always = self.skills.always_skills();
        if !always.is_empty() {
            let content = self.skills.load_for_context(&always);
            if !content.is_empty() {
                parts.push(format!("# Active Skills\n\n{}", content));
            }
        }

        let requested: Vec<String> = skill_names
            .iter()
            .filter(|name| !always.contains(*name))
            .cloned()
            .collect();
        if !requested.is_empty() {
            let content = self.skills.load_for_context(&requested);
            if !content.is_empty() {
                parts.push(format!("# Requested Skills\n\n{}", content));
            }
        }

        let summary = self.skills.build_summary();
        if !summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. To use a skill, read its capability.md file using the read_file tool.\n\
                 Skills with available=\"false\" need dependencies installed first.\n\n{}",
                summary
            ));
        }

        parts.join(SECTION_SEPARATOR)
    }

    fn identity(&self) -> String {
        let ws = self.workspace.display();
        format!(
            "# nectar\n\n\
             You are nectar, a helpful personal assistant.\n\n\
             ## Current Time\n{}\n\n\
             ## Runtime\n{} {}\n\n\
             ## Workspace\n\
             Your workspace is at: {ws}\n\
             - Long-term memory: {ws}/memory/MEMORY.md\n\
             - History log: {ws}/memory/HISTORY.md (grep-searchable)\n\
             - Custom skills: {ws}/skills/{{skill-name}}/capability.md\n\n\
             Reply directly with text for conversations. Only use the 'message' tool to send to a specific chat channel.",
            current_time(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }

    fn load_bootstrap_files(&self) -> String {
        BOOTSTRAP_FILES
            .iter()
            .filter_map(|name| {
                let content = std::fs::read_to_string(self.workspace.join(name)).ok()?;
                Some(format!("## {}\n\n{}", name, content.trim()))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// 运行时上下文：当前时间与来源渠道
    pub fn build_runtime_context(channel: Option<&str>, chat_id: Option<&str>) -> String {
        let mut lines = vec![
            RUNTIME_CONTEXT_TAG.to_string(),
            format!("Current Time: {}", current_time()),
        ];
        if let (Some(channel), Some(chat_id)) = (channel, chat_id) {
            lines.push(format!("Channel: {}", channel));
            lines.push(format!("Chat ID: {}", chat_id));
        }
        lines.join("\n")
    }

    /// system、历史、运行时上下文、本轮用户消息
    pub fn build_messages(
        &self,
        history: Vec<Message>,
        current: &str,
        skill_names: &[String],
        media: &[String],
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(Message::system(self.build_system_prompt(skill_names)));
        messages.extend(history);
        messages.push(Message::user(Self::build_runtime_context(channel, chat_id)));
        let content = if media.is_empty() {
            current.to_string()
        } else {
            format!("{}\n\n[Attached files: {}]", current, media.join(", "))
        };
        messages.push(Message::user(content));
        messages
    }
}

fn current_time() -> String {
    let now = Local::now();
    format!("{} ({})", now.format("%Y-%m-%d %H:%M (%A)"), now.format("%:z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[test]
    fn test_system_prompt_sections() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("SOUL.md"), "Be kind.").unwrap();
        let builder = ContextBuilder::with_skills(ws.path(), SkillsLoader::new(ws.path(), None));
        builder.memory().write_long_term("User likes tea.").unwrap();

        let prompt = builder.build_system_prompt(&[]);
        assert!(prompt.starts_with("# nectar"));
        assert!(prompt.contains("## SOUL.md\n\nBe kind."));
        assert!(prompt.contains("# Memory\n\n## Long-term Memory\nUser likes tea."));
        assert!(!prompt.contains("# Skills"));
        assert_eq!(prompt.matches(SECTION_SEPARATOR).count(), 2);
    }

    #[test]
    fn test_messages_layout() {
        let ws = tempfile::tempdir().unwrap();
        let builder = ContextBuilder::with_skills(ws.path(), SkillsLoader::new(ws.path(), None));
        let history = vec![Message::user("earlier"), Message::assistant(Some("ok".into()))];
        let msgs = builder.build_messages(history, "now", &[], &[], Some("cli"), Some("direct"));

        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[0].role, Role::System);
        assert!(msgs[3].text().starts_with(RUNTIME_CONTEXT_TAG));
        assert!(msgs[3].text().contains("Channel: cli\nChat ID: direct"));
        assert_eq!(msgs[4].text(), "now");
    }
}
