//! 技能系统
//!
//! 技能（Skill）是一段能力描述，告诉模型如何借助已有工具完成某类任务。
//! 标记 always 的技能全文常驻 system prompt，其余只以摘要出现，模型需要时用 read_file 读取全文。
//!
//! 目录结构：
//! ```text
//! <workspace>/skills/        # 用户技能（优先）
//! config/skills/             # 内置技能
//! ├── weather/
//! │   ├── skill.toml      # 技能元数据（id、name、description、always、requires）
//! │   └── capability.md   # 能力描述
//! └── ...
//! ```

mod loader;

pub use loader::{Skill, SkillMeta, SkillRequires, SkillSource, SkillsLoader};
