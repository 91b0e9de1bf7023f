//! 定时任务服务：持久化任务集合，单个定时器始终对准所有启用任务中最早的下次运行时间
//!
//! 状态放在同步 Mutex 中，任何 await 之前都会释放；任务回调在锁外执行，
//! 因此回调里再增删任务（例如 Agent 调用 cron 工具）不会死锁。

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cron::types::{
    compute_next_run, CronError, CronJob, CronJobState, CronPayload, CronSchedule, CronStore,
    JobStatus,
};

/// 任务执行回调：返回 Agent 的回答（若有）或错误文本
pub type JobCallback =
    Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<Option<String>, String>> + Send + Sync>;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// add_job 的参数
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub schedule: CronSchedule,
    pub message: String,
    pub deliver: bool,
    pub channel: Option<String>,
    pub to: Option<String>,
    pub delete_after_run: bool,
}

/// status() 摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronStatus {
    pub enabled: bool,
    pub jobs: usize,
    pub next_wake_at_ms: Option<i64>,
}

/// 定时任务服务
pub struct CronService {
    store_path: PathBuf,
    store: Mutex<CronStore>,
    on_job: Mutex<Option<JobCallback>>,
    running: AtomicBool,
    rearm: Notify,
    timer: Mutex<Option<CancellationToken>>,
}

impl CronService {
    /// 从磁盘加载任务；文件不存在或损坏时从空集合开始
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        let store_path = store_path.into();
        let store = load_store(&store_path);
        Self {
            store_path,
            store: Mutex::new(store),
            on_job: Mutex::new(None),
            running: AtomicBool::new(false),
            rearm: Notify::new(),
            timer: Mutex::new(None),
        }
    }

    /// 设置任务执行回调（启动前调用）
    pub fn set_on_job(&self, callback: JobCallback) {
        *self.on_job.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, CronStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, store: &CronStore) {
        if let Err(e) = save_store(&self.store_path, store) {
            tracing::warn!("Cron: failed to save store {}: {}", self.store_path.display(), e);
        }
    }

    /// 启动：为所有启用任务重新计算下次运行时间，保存并启动定时器
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut store = self.lock_store();
            let now = now_ms();
            for job in store.jobs.iter_mut().filter(|j| j.enabled) {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now);
            }
            self.save(&store);
            tracing::info!(
                "Cron service started with {} jobs",
                store.jobs.len()
            );
        }

        let token = CancellationToken::new();
        *self.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move { this.timer_loop(token).await });
    }

    /// 停止定时器（正在执行的回调会跑完）
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(token) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn next_wake_at_ms(&self) -> Option<i64> {
        self.lock_store()
            .jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
    }

    async fn timer_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let wake = self.next_wake_at_ms();
            let sleep = async {
                match wake {
                    Some(at) => {
                        let delay = (at - now_ms()).max(0) as u64;
                        tokio::time::sleep(Duration::from_millis(delay)).await
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.rearm.notified() => continue,
                _ = sleep => self.on_timer().await,
            }
        }
        tracing::debug!("Cron timer loop stopped");
    }

    /// 执行所有到期任务（每个任务每次唤醒最多执行一次）
    async fn on_timer(&self) {
        let now = now_ms();
        let due: Vec<CronJob> = self
            .lock_store()
            .jobs
            .iter()
            .filter(|j| j.enabled && j.state.next_run_at_ms.map_or(false, |t| now >= t))
            .cloned()
            .collect();
        for job in due {
            self.execute_job(job).await;
        }
        let store = self.lock_store();
        self.save(&store);
    }

    /// 运行回调并记录结果；回调失败只记入任务状态
    async fn execute_job(&self, job: CronJob) {
        let started = now_ms();
        tracing::info!("Cron: executing job '{}' ({})", job.name, job.id);
        let callback = self
            .on_job
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let result = match callback {
            Some(cb) => match AssertUnwindSafe(cb(job.clone())).catch_unwind().await {
                Ok(r) => r,
                Err(_) => Err("job callback panicked".to_string()),
            },
            None => Ok(None),
        };

        let mut store = self.lock_store();
        let Some(idx) = store.jobs.iter().position(|j| j.id == job.id) else {
            // 回调执行期间任务被删除
            return;
        };
        let finished = now_ms();
        let entry = &mut store.jobs[idx];
        entry.state.last_run_at_ms = Some(started);
        entry.updated_at_ms = finished;
        match result {
            Ok(_) => {
                entry.state.last_status = Some(JobStatus::Ok);
                entry.state.last_error = None;
                tracing::info!("Cron: job '{}' completed", entry.name);
            }
            Err(e) => {
                tracing::error!("Cron: job '{}' failed: {}", entry.name, e);
                entry.state.last_status = Some(JobStatus::Error);
                entry.state.last_error = Some(e);
            }
        }

        let one_shot = matches!(entry.schedule, CronSchedule::At { .. });
        let delete = one_shot && entry.delete_after_run;
        if one_shot {
            entry.enabled = false;
            entry.state.next_run_at_ms = None;
        } else {
            entry.state.next_run_at_ms = compute_next_run(&entry.schedule, finished);
        }
        if delete {
            store.jobs.remove(idx);
        }
    }

    fn after_change(&self, store: &CronStore) {
        self.save(store);
        if self.is_running() {
            self.rearm.notify_one();
        }
    }

    // ========== 对外接口 ==========

    /// 列出任务，按下次运行时间排序（无下次时间的排最后）
    pub fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let mut jobs: Vec<CronJob> = self
            .lock_store()
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.state.next_run_at_ms.unwrap_or(i64::MAX));
        jobs
    }

    /// 添加任务；调度非法时拒绝，任务不会被保存
    pub fn add_job(&self, new: NewJob) -> Result<CronJob, CronError> {
        new.schedule.validate()?;
        let now = now_ms();
        let job = CronJob {
            id: short_id(),
            name: new.name,
            enabled: true,
            state: CronJobState {
                next_run_at_ms: compute_next_run(&new.schedule, now),
                ..Default::default()
            },
            schedule: new.schedule,
            payload: CronPayload {
                kind: "agent_turn".to_string(),
                message: new.message,
                deliver: new.deliver,
                channel: new.channel,
                to: new.to,
            },
            created_at_ms: now,
            updated_at_ms: now,
            delete_after_run: new.delete_after_run,
        };

        let mut store = self.lock_store();
        store.jobs.push(job.clone());
        self.after_change(&store);
        tracing::info!("Cron: added job '{}' ({})", job.name, job.id);
        Ok(job)
    }

    pub fn remove_job(&self, job_id: &str) -> bool {
        let mut store = self.lock_store();
        let before = store.jobs.len();
        store.jobs.retain(|j| j.id != job_id);
        let removed = store.jobs.len() < before;
        if removed {
            self.after_change(&store);
            tracing::info!("Cron: removed job {}", job_id);
        }
        removed
    }

    /// 启用 / 停用任务，返回更新后的任务
    pub fn enable_job(&self, job_id: &str, enabled: bool) -> Option<CronJob> {
        let mut store = self.lock_store();
        let job = store.jobs.iter_mut().find(|j| j.id == job_id)?;
        let now = now_ms();
        job.enabled = enabled;
        job.updated_at_ms = now;
        job.state.next_run_at_ms = if enabled {
            compute_next_run(&job.schedule, now)
        } else {
            None
        };
        let updated = job.clone();
        self.after_change(&store);
        Some(updated)
    }

    /// 立即运行；停用的任务只有 force 时才运行
    pub async fn run_job(&self, job_id: &str, force: bool) -> bool {
        let job = {
            let store = self.lock_store();
            match store.jobs.iter().find(|j| j.id == job_id) {
                Some(j) if force || j.enabled => j.clone(),
                _ => return false,
            }
        };
        self.execute_job(job).await;
        let store = self.lock_store();
        self.after_change(&store);
        true
    }

    pub fn status(&self) -> CronStatus {
        CronStatus {
            enabled: self.is_running(),
            jobs: self.lock_store().jobs.len(),
            next_wake_at_ms: self.next_wake_at_ms(),
        }
    }
}

fn load_store(path: &Path) -> CronStore {
    if !path.exists() {
        return CronStore::default();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|data| serde_json::from_str::<CronStore>(&data).map_err(anyhow::Error::from));
    match parsed {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!("Failed to load cron store {}: {}", path.display(), e);
            CronStore::default()
        }
    }
}

fn save_store(path: &Path, store: &CronStore) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(store)?)?;
    Ok(())
}
