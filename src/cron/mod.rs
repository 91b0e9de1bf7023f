//! 定时任务：一次性 / 固定间隔 / cron 表达式三种调度，JSON 持久化

pub mod service;
pub mod types;

pub use service::{CronService, CronStatus, JobCallback, NewJob};
pub use types::{
    compute_next_run, CronError, CronJob, CronJobState, CronPayload, CronSchedule, CronStore,
    JobStatus,
};
