//! 定时任务数据结构与下次运行时间计算
//!
//! 存储格式为 JSON：`{"version": 1, "jobs": [...]}`，字段使用 camelCase。

use chrono::{Local, TimeZone, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 定时任务错误：添加时同步拒绝，任务不会被创建
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("tz can only be used with cron schedules")]
    TzWithoutCron,

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("interval must be positive and at most 100 years")]
    InvalidInterval,

    #[error("either every, cron or at is required")]
    MissingSchedule,
}

/// 固定间隔上限（约 100 年）
pub const MAX_EVERY_MS: i64 = 100 * 365 * 24 * 3600 * 1000;

/// 调度方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    /// 在该时间点运行一次；已过去则永不运行
    At {
        #[serde(rename = "atMs")]
        at_ms: i64,
    },
    /// 固定间隔，从上次计算时刻起算，不对齐墙钟
    Every {
        #[serde(rename = "everyMs")]
        every_ms: i64,
    },
    /// cron 表达式，按 tz（缺省为本地时区）求值
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl CronSchedule {
    /// 由分散的参数组装调度；tz 只能与 cron 表达式一起使用
    pub fn from_parts(
        every_ms: Option<i64>,
        cron_expr: Option<&str>,
        tz: Option<&str>,
        at_ms: Option<i64>,
    ) -> Result<Self, CronError> {
        if tz.is_some() && cron_expr.is_none() {
            return Err(CronError::TzWithoutCron);
        }
        if let Some(ms) = every_ms {
            Ok(CronSchedule::Every { every_ms: ms })
        } else if let Some(expr) = cron_expr {
            Ok(CronSchedule::Cron {
                expr: expr.to_string(),
                tz: tz.map(str::to_string),
            })
        } else if let Some(ms) = at_ms {
            Ok(CronSchedule::At { at_ms: ms })
        } else {
            Err(CronError::MissingSchedule)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CronSchedule::At { .. } => "at",
            CronSchedule::Every { .. } => "every",
            CronSchedule::Cron { .. } => "cron",
        }
    }

    /// 添加前校验：间隔为正、表达式可解析、时区可识别
    pub fn validate(&self) -> Result<(), CronError> {
        match self {
            CronSchedule::At { .. } => Ok(()),
            CronSchedule::Every { every_ms } if *every_ms <= 0 || *every_ms > MAX_EVERY_MS => {
                Err(CronError::InvalidInterval)
            }
            CronSchedule::Every { .. } => Ok(()),
            CronSchedule::Cron { expr, tz } => {
                parse_cron(expr)?;
                if let Some(name) = tz {
                    parse_tz(name)?;
                }
                Ok(())
            }
        }
    }
}

fn parse_cron(expr: &str) -> Result<Cron, CronError> {
    Cron::new(expr)
        .parse()
        .map_err(|e| CronError::InvalidExpression {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

fn parse_tz(name: &str) -> Result<chrono_tz::Tz, CronError> {
    name.parse::<chrono_tz::Tz>()
        .map_err(|_| CronError::UnknownTimezone(name.to_string()))
}

/// 计算下次运行时间（毫秒时间戳）；None 表示不再运行
pub fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::At { at_ms } => (*at_ms > now_ms).then_some(*at_ms),
        CronSchedule::Every { every_ms } if *every_ms > 0 => now_ms.checked_add(*every_ms),
        CronSchedule::Every { .. } => None,
        CronSchedule::Cron { expr, tz } => {
            let cron = match parse_cron(expr) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Cron: {}", e);
                    return None;
                }
            };
            let now = Utc.timestamp_millis_opt(now_ms).single()?;
            let next = match tz {
                Some(name) => {
                    let tz = parse_tz(name).ok()?;
                    cron.find_next_occurrence(&now.with_timezone(&tz), false)
                        .map(|t| t.timestamp_millis())
                }
                None => cron
                    .find_next_occurrence(&now.with_timezone(&Local), false)
                    .map(|t| t.timestamp_millis()),
            };
            next.ok()
        }
    }
}

/// 任务内容：交给 Agent 的消息与投递目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronPayload {
    #[serde(default = "default_payload_kind")]
    pub kind: String,
    pub message: String,
    /// 为 true 且有 to 时把 Agent 的回答投递到渠道
    #[serde(default)]
    pub deliver: bool,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

fn default_payload_kind() -> String {
    "agent_turn".to_string()
}

/// 最近一次运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
}

/// 运行状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(default)]
    pub next_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_status: Option<JobStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// 定时任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
    #[serde(default)]
    pub created_at_ms: i64,
    #[serde(default)]
    pub updated_at_ms: i64,
    #[serde(default)]
    pub delete_after_run: bool,
}

/// 持久化文件内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronStore {
    pub version: u32,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

impl Default for CronStore {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}
