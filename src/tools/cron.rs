//! cron 工具：让模型创建、列出、删除定时提醒与周期任务
//!
//! 任务结果投递回创建它的渠道/会话。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde_json::{json, Value};

use crate::cron::{CronError, CronSchedule, CronService, NewJob};
use crate::tools::{Tool, ToolContext};

const NAME_MAX_CHARS: usize = 30;

pub struct CronTool {
    service: Arc<CronService>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }

    fn add(&self, args: &Value, ctx: &ToolContext) -> Result<String, String> {
        let message = str_arg(args, "message").ok_or("message is required for add")?;
        if ctx.channel.is_empty() || ctx.chat_id.is_empty() {
            return Err("no session context (channel/chat_id)".to_string());
        }

        let every_ms = args
            .get("every_seconds")
            .and_then(Value::as_i64)
            .map(|s| s.saturating_mul(1000));
        let at_ms = match str_arg(args, "at") {
            Some(text) => Some(parse_at(text).ok_or("invalid ISO datetime in at")?),
            None => None,
        };
        let schedule = CronSchedule::from_parts(
            every_ms,
            str_arg(args, "cron_expr"),
            str_arg(args, "tz"),
            at_ms,
        )
        .map_err(|e| match e {
            CronError::TzWithoutCron => "tz can only be used with cron_expr".to_string(),
            CronError::MissingSchedule => {
                "either every_seconds, cron_expr, or at is required".to_string()
            }
            other => other.to_string(),
        })?;

        let job = self
            .service
            .add_job(NewJob {
                name: message.chars().take(NAME_MAX_CHARS).collect(),
                delete_after_run: matches!(schedule, CronSchedule::At { .. }),
                schedule,
                message: message.to_string(),
                deliver: true,
                channel: Some(ctx.channel.clone()),
                to: Some(ctx.chat_id.clone()),
            })
            .map_err(|e| e.to_string())?;
        Ok(format!("Created job '{}' (id: {})", job.name, job.id))
    }

    fn list(&self) -> String {
        let jobs = self.service.list_jobs(false);
        if jobs.is_empty() {
            return "No scheduled jobs.".to_string();
        }
        let lines: Vec<String> = jobs
            .iter()
            .map(|j| format!("- {} (id: {}, {})", j.name, j.id, j.schedule.kind()))
            .collect();
        format!("Scheduled jobs:\n{}", lines.join("\n"))
    }

    fn remove(&self, args: &Value) -> Result<String, String> {
        let id = str_arg(args, "job_id").ok_or("job_id is required for remove")?;
        if self.service.remove_job(id) {
            Ok(format!("Removed job {}", id))
        } else {
            Err(format!("Job {} not found", id))
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// ISO 时间：带偏移按偏移解析，不带偏移按本地时间
fn parse_at(text: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp_millis())
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule reminders and recurring tasks. Actions: add, list, remove."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Action to perform"
                },
                "message": {"type": "string", "description": "Reminder message (for add)"},
                "every_seconds": {"type": "integer", "description": "Interval in seconds (for recurring tasks)"},
                "cron_expr": {"type": "string", "description": "Cron expression like '0 9 * * *' (for scheduled tasks)"},
                "tz": {"type": "string", "description": "IANA timezone for cron expressions (e.g. 'America/Vancouver')"},
                "at": {"type": "string", "description": "ISO datetime for one-time execution (e.g. '2026-02-12T10:30:00')"},
                "job_id": {"type": "string", "description": "Job ID (for remove)"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        match args.get("action").and_then(Value::as_str).unwrap_or_default() {
            "add" => self.add(&args, ctx),
            "list" => Ok(self.list()),
            "remove" => self.remove(&args),
            other => Err(format!("Unknown action: {}", other)),
        }
    }
}
