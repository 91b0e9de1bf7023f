//! 技能加载器
//!
//! 依次扫描工作区 skills/ 与内置 config/skills/，同 ID 时工作区优先。
//! 每次构建 prompt 时重新读取，新增或修改的技能无需重启即可生效。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 技能运行所需的外部条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillRequires {
    /// PATH 中必须存在的可执行文件
    #[serde(default)]
    pub bins: Vec<String>,
    /// 必须设置的环境变量
    #[serde(default)]
    pub env: Vec<String>,
}

/// 技能元数据（skill.toml 的 [skill] 段）
#[derive(Debug, Clone, Deserialize)]
pub struct SkillMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 为 true 时全文常驻 system prompt
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub requires: SkillRequires,
}

#[derive(Debug, Deserialize)]
struct SkillToml {
    skill: SkillMeta,
}

/// 技能来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Workspace,
    Builtin,
}

/// 完整技能数据
#[derive(Debug, Clone)]
pub struct Skill {
    pub meta: SkillMeta,
    pub capability: String,
    pub dir: PathBuf,
    pub source: SkillSource,
}

impl Skill {
    /// 未满足的依赖，形如 `CLI: gh`、`ENV: GITHUB_TOKEN`
    pub fn missing_requirements(&self) -> Vec<String> {
        let bins = self
            .meta
            .requires
            .bins
            .iter()
            .filter(|b| !binary_on_path(b))
            .map(|b| format!("CLI: {}", b));
        let env = self
            .meta
            .requires
            .env
            .iter()
            .filter(|e| std::env::var_os(e).is_none())
            .map(|e| format!("ENV: {}", e));
        bins.chain(env).collect()
    }

    pub fn is_available(&self) -> bool {
        self.missing_requirements().is_empty()
    }

    /// 注入 prompt 的全文
    pub fn full_capability(&self) -> String {
        format!("### Skill: {}\n\n{}", self.meta.name, self.capability.trim())
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// 技能加载器
#[derive(Debug, Clone)]
pub struct SkillsLoader {
    workspace_skills: PathBuf,
    builtin_skills: Option<PathBuf>,
}

impl SkillsLoader {
    pub fn new(workspace: &Path, builtin_skills: Option<PathBuf>) -> Self {
        Self {
            workspace_skills: workspace.join("skills"),
            builtin_skills,
        }
    }

    /// 内置技能目录取 config/skills（与配置文件同一查找顺序）
    pub fn with_default_builtin(workspace: &Path) -> Self {
        let builtin = ["config/skills", "../config/skills"]
            .into_iter()
            .map(PathBuf::from)
            .find(|d| d.exists());
        Self::new(workspace, builtin)
    }

    /// 列出技能；filter_unavailable 为 true 时去掉依赖不满足的
    pub fn list_skills(&self, filter_unavailable: bool) -> Vec<Skill> {
        let mut seen = HashSet::new();
        let mut skills = Vec::new();
        let dirs = std::iter::once((self.workspace_skills.as_path(), SkillSource::Workspace))
            .chain(
                self.builtin_skills
                    .as_deref()
                    .map(|d| (d, SkillSource::Builtin)),
            );
        for (dir, source) in dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            paths.sort();
            for path in paths {
                if let Some(skill) = load_skill(&path, source) {
                    if seen.insert(skill.meta.id.clone()) {
                        skills.push(skill);
                    }
                }
            }
        }
        if filter_unavailable {
            skills.retain(Skill::is_available);
        }
        skills
    }

    pub fn get(&self, id: &str) -> Option<Skill> {
        self.list_skills(false).into_iter().find(|s| s.meta.id == id)
    }

    /// 依赖满足且标记 always 的技能 ID
    pub fn always_skills(&self) -> Vec<String> {
        self.list_skills(true)
            .into_iter()
            .filter(|s| s.meta.always)
            .map(|s| s.meta.id)
            .collect()
    }

    /// 指定技能的全文，未知 ID 忽略
    pub fn load_for_context(&self, ids: &[String]) -> String {
        let skills = self.list_skills(false);
        ids.iter()
            .filter_map(|id| skills.iter().find(|s| &s.meta.id == id))
            .map(Skill::full_capability)
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// 所有技能的 XML 摘要（含可用性与缺失依赖），供模型按需读取 capability.md
    pub fn build_summary(&self) -> String {
        let skills = self.list_skills(false);
        if skills.is_empty() {
            return String::new();
        }
        let mut lines = vec!["<skills>".to_string()];
        for s in &skills {
            let missing = s.missing_requirements();
            lines.push(format!(
                "  <skill available=\"{}\">",
                missing.is_empty()
            ));
            lines.push(format!("    <name>{}</name>", escape_xml(&s.meta.name)));
            lines.push(format!(
                "    <description>{}</description>",
                escape_xml(&s.meta.description)
            ));
            lines.push(format!(
                "    <location>{}</location>",
                s.dir.join("capability.md").display()
            ));
            if !missing.is_empty() {
                lines.push(format!(
                    "    <requires>{}</requires>",
                    escape_xml(&missing.join(", "))
                ));
            }
            lines.push("  </skill>".to_string());
        }
        lines.push("</skills>".to_string());
        lines.join("\n")
    }
}

/// 加载单个技能目录；缺少或无法解析 skill.toml 时跳过
fn load_skill(dir: &Path, source: SkillSource) -> Option<Skill> {
    let toml_content = std::fs::read_to_string(dir.join("skill.toml")).ok()?;
    let meta = match toml::from_str::<SkillToml>(&toml_content) {
        Ok(data) => data.skill,
        Err(e) => {
            tracing::warn!("Invalid skill.toml in {}: {}", dir.display(), e);
            return None;
        }
    };
    let capability = std::fs::read_to_string(dir.join("capability.md")).unwrap_or_default();
    Some(Skill {
        meta,
        capability,
        dir: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, id: &str, extra: &str, capability: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("skill.toml"),
            format!(
                "[skill]\nid = \"{id}\"\nname = \"{id} skill\"\ndescription = \"does {id} <things>\"\n{extra}"
            ),
        )
        .unwrap();
        std::fs::write(dir.join("capability.md"), capability).unwrap();
    }

    #[test]
    fn test_workspace_overrides_builtin_and_always_filter() {
        let ws = tempfile::tempdir().unwrap();
        let builtin = tempfile::tempdir().unwrap();
        write_skill(&ws.path().join("skills"), "notes", "always = true\n", "workspace notes");
        write_skill(builtin.path(), "notes", "", "builtin notes");
        write_skill(
            builtin.path(),
            "gh",
            "[skill.requires]\nbins = [\"definitely-not-a-binary-xyz\"]\n",
            "github",
        );

        let loader = SkillsLoader::new(ws.path(), Some(builtin.path().to_path_buf()));
        let all = loader.list_skills(false);
        assert_eq!(all.len(), 2);
        let notes = loader.get("notes").unwrap();
        assert_eq!(notes.source, SkillSource::Workspace);
        assert_eq!(notes.capability, "workspace notes");

        assert_eq!(loader.list_skills(true).len(), 1);
        assert_eq!(loader.always_skills(), vec!["notes".to_string()]);
        assert_eq!(
            loader.load_for_context(&["notes".to_string(), "unknown".to_string()]),
            "### Skill: notes skill\n\nworkspace notes"
        );

        let summary = loader.build_summary();
        assert!(summary.starts_with("<skills>"));
        assert!(summary.contains("does gh &lt;things&gt;"));
        assert!(summary.contains("<requires>CLI: definitely-not-a-binary-xyz</requires>"));
    }

    #[test]
    fn test_missing_dirs_yield_nothing() {
        let ws = tempfile::tempdir().unwrap();
        let loader = SkillsLoader::new(ws.path(), None);
        assert!(loader.list_skills(false).is_empty());
        assert_eq!(loader.build_summary(), "");
    }
}
