//! 活跃任务登记：按会话记录已接收、尚未结束的消息处理任务
//!
//! 只服务于 /stop：读取端接收消息时登记，工作端处理完毕后注销。登记本身不参与排序。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// session key -> (任务 ID -> 取消 token)
#[derive(Default)]
pub struct ActiveTasks {
    inner: Mutex<HashMap<String, HashMap<TaskId, CancellationToken>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新任务，返回其 ID 与取消 token
    pub fn register(&self, session_key: &str) -> (TaskId, CancellationToken) {
        let id = TaskId::new();
        let token = CancellationToken::new();
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(session_key.to_string())
            .or_default()
            .insert(id, token.clone());
        (id, token)
    }

    /// 任务结束（完成、失败或被跳过）后注销
    pub fn finish(&self, session_key: &str, id: TaskId) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tasks) = map.get_mut(session_key) {
            tasks.remove(&id);
            if tasks.is_empty() {
                map.remove(session_key);
            }
        }
    }

    /// 取消该会话下所有尚未取消的任务，返回数量
    pub fn cancel_session(&self, session_key: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tasks) = map.get(session_key) else {
            return 0;
        };
        let mut cancelled = 0;
        for token in tasks.values().filter(|t| !t.is_cancelled()) {
            token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// 关闭时取消全部任务
    pub fn cancel_all(&self) {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().flat_map(|t| t.values()).for_each(|t| t.cancel());
    }

    pub fn count(&self, session_key: &str) -> usize {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(session_key).map(|t| t.len()).unwrap_or(0)
    }
}
