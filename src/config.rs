//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再读显式指定的文件，最后用环境变量 `NECTAR__*` 覆盖
//! （双下划线表示嵌套，如 `NECTAR__AGENT__MODEL=gpt-4o-mini`）。每一段都有完整默认值，缺省即可运行。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub channels: ChannelsSection,
    pub heartbeat: HeartbeatSection,
    pub cron: CronSection,
}

/// [agent] 段：工作区、模型参数、工具循环上限与记忆窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 工作区根目录，未设置时用 ~/.nectar/workspace
    pub workspace: Option<PathBuf>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 单轮最多调用模型的次数
    pub max_tool_iterations: usize,
    /// 送入模型的历史条数；未归档条数达到该值时触发后台记忆整理
    pub memory_window: usize,
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            workspace: None,
            model: default_model(),
            temperature: 0.1,
            max_tokens: 8192,
            max_tool_iterations: 40,
            memory_window: 100,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / 任意 OpenAI 兼容端点；mock 强制使用本地 Mock
    pub provider: String,
    /// 覆盖默认端点（自建代理、vLLM 等）
    pub base_url: Option<String>,
    /// 未设置时依次读取 DEEPSEEK_API_KEY、OPENAI_API_KEY
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

/// [tools] 段：单次工具调用超时、是否限制在工作区内
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    /// 为 true 时文件工具与 exec 只能访问工作区
    pub restrict_to_workspace: bool,
    pub shell: ShellSection,
    pub web: WebSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 120,
            restrict_to_workspace: false,
            shell: ShellSection::default(),
            web: WebSection::default(),
        }
    }
}

/// [tools.shell] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub timeout_secs: u64,
    /// 命中任一子串的命令直接拒绝
    pub deny_patterns: Vec<String>,
    /// 追加到子进程 PATH 的目录
    pub path_append: Option<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            deny_patterns: ["rm -rf /", "mkfs", "dd if=", ":(){", "shutdown", "reboot"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            path_append: None,
        }
    }
}

/// [tools.web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    /// Brave Search API Key；未设置时读取 BRAVE_API_KEY
    pub search_api_key: Option<String>,
    pub max_results: usize,
    pub max_chars: usize,
    pub timeout_secs: u64,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            search_api_key: None,
            max_results: 5,
            max_chars: 50_000,
            timeout_secs: 20,
        }
    }
}

/// [channels] 段：进度消息过滤与各渠道开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelsSection {
    /// 是否把中间进度（思考文本）推送给渠道
    pub send_progress: bool,
    /// 是否把工具调用提示推送给渠道
    pub send_tool_hints: bool,
    pub cli: CliChannelSection,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            send_progress: true,
            send_tool_hints: false,
            cli: CliChannelSection::default(),
        }
    }
}

/// [channels.cli] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliChannelSection {
    pub enabled: bool,
    /// 为空表示不限制发送者
    pub allow_from: Vec<String>,
}

impl Default for CliChannelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_from: Vec::new(),
        }
    }
}

/// [heartbeat] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 1800,
        }
    }
}

/// [cron] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CronSection {
    /// 任务存储文件，未设置时用 ~/.nectar/cron/jobs.json
    pub store_path: Option<PathBuf>,
}

/// 数据根目录：~/.nectar（无 HOME 时退回当前目录下 .nectar）
pub fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nectar")
}

impl AppConfig {
    /// 工作区路径（支持 `~/` 前缀）
    pub fn workspace_path(&self) -> PathBuf {
        match &self.agent.workspace {
            Some(p) => expand_home(p),
            None => data_dir().join("workspace"),
        }
    }

    pub fn cron_store_path(&self) -> PathBuf {
        match &self.cron.store_path {
            Some(p) => expand_home(p),
            None => data_dir().join("cron").join("jobs.json"),
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        data_dir().join("sessions")
    }
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// 从默认路径与环境变量加载配置；config_path 可指定额外 TOML 文件，不存在时报错
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    // 显式指定的文件必须存在
    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NECTAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
