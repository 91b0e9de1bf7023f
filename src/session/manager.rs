//! 会话存储：每个 key 在内存中只缓存一个实例，按 JSONL 落盘
//!
//! 文件格式：第一行为元数据记录（`_type: "metadata"`），其后每行一条消息。
//! 缓存项是 `Arc<tokio::sync::Mutex<Session>>`，一轮处理在读-改-存期间持有该锁，
//! 因此绕过分发队列的直接调用路径（CLI 单次、定时任务）与主循环不会交错修改同一会话。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::Message;
use crate::session::Session;

pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// 会话列表项
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct MetadataLine {
    #[serde(rename = "_type")]
    kind: String,
    key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    last_consolidated: usize,
}

const METADATA_TYPE: &str = "metadata";

/// 把 key 变成安全的文件名
pub fn safe_filename(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ':' | '<' | '>' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// 会话管理器
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", safe_filename(key)))
    }

    /// 取缓存实例；未缓存时从磁盘加载，加载失败则新建
    pub fn get_or_create(&self, key: &str) -> SharedSession {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = cache.get(key) {
            return Arc::clone(existing);
        }
        let session = match self.load(key) {
            Ok(Some(s)) => s,
            Ok(None) => Session::new(key),
            Err(e) => {
                tracing::warn!("Failed to load session {}: {}", key, e);
                Session::new(key)
            }
        };
        let shared = Arc::new(tokio::sync::Mutex::new(session));
        cache.insert(key.to_string(), Arc::clone(&shared));
        shared
    }

    fn load(&self, key: &str) -> anyhow::Result<Option<Session>> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        let mut meta: Option<MetadataLine> = None;
        let mut messages = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let value: Value = serde_json::from_str(line)?;
            if value.get("_type").and_then(Value::as_str) == Some(METADATA_TYPE) {
                meta = Some(serde_json::from_value(value)?);
            } else {
                messages.push(serde_json::from_value::<Message>(value)?);
            }
        }

        let session = match meta {
            Some(m) => Session::restore(
                key.to_string(),
                messages,
                m.created_at,
                m.updated_at,
                m.metadata,
                m.last_consolidated,
            ),
            None => {
                let mut s = Session::new(key);
                s.messages = messages;
                s
            }
        };
        Ok(Some(session))
    }

    /// 整体重写会话文件
    pub fn save(&self, session: &Session) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.sessions_dir)?;
        let meta = MetadataLine {
            kind: METADATA_TYPE.to_string(),
            key: session.key.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            metadata: session.metadata.clone(),
            last_consolidated: session.last_consolidated(),
        };
        let mut out = serde_json::to_string(&meta)?;
        out.push('\n');
        for msg in &session.messages {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        let path = self.session_path(&session.key);
        let tmp = path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// 从缓存移除；下次访问重新从磁盘加载
    pub fn invalidate(&self, key: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// 列出磁盘上的会话，按更新时间倒序
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return Vec::new();
        };
        let mut out: Vec<SessionInfo> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "jsonl"))
            .filter_map(|p| read_metadata(&p).map(|m| (p, m)))
            .map(|(path, m)| SessionInfo {
                key: m.key,
                created_at: m.created_at,
                updated_at: m.updated_at,
                path,
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }
}

fn read_metadata(path: &Path) -> Option<MetadataLine> {
    let data = std::fs::read_to_string(path).ok()?;
    let first = data.lines().next()?;
    serde_json::from_str::<MetadataLine>(first)
        .ok()
        .filter(|m| m.kind == METADATA_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCallRequest;
    use serde_json::json;

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("telegram:123"), "telegram_123");
        assert_eq!(safe_filename("a/b|c?"), "a_b_c_");
    }

    #[tokio::test]
    async fn test_jsonl_round_trip_preserves_turns_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        {
            let shared = manager.get_or_create("cli:direct");
            let mut s = shared.lock().await;
            s.push(Message::user("hello").with_timestamp(Utc::now()));
            let call = ToolCallRequest::new("c1", "exec", json!({"command": "date"}));
            s.push(Message::assistant_with_tools(None, vec![call], None));
            s.push(Message::tool_result("c1", "exec", "Mon"));
            s.push(Message::assistant(Some("It is Monday".into())));
            s.metadata.insert("lang".into(), json!("en"));
            assert!(s.mark_consolidated(2));
            manager.save(&s).unwrap();
        }

        let fresh = SessionManager::new(dir.path());
        let shared = fresh.get_or_create("cli:direct");
        let s = shared.lock().await;
        assert_eq!(s.messages.len(), 4);
        assert_eq!(s.last_consolidated(), 2);
        assert_eq!(s.messages[1].tool_calls[0].arguments["command"], "date");
        assert_eq!(s.messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(s.metadata["lang"], "en");

        let listed = fresh.list_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "cli:direct");
    }

    #[tokio::test]
    async fn test_cache_returns_same_instance_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path());
        let a = manager.get_or_create("k");
        let b = manager.get_or_create("k");
        assert!(Arc::ptr_eq(&a, &b));

        manager.invalidate("k");
        let c = manager.get_or_create("k");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_fresh_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad_key.jsonl"), "{not json\n").unwrap();
        let manager = SessionManager::new(dir.path());
        let shared = manager.get_or_create("bad:key");
        assert!(shared.lock().await.messages.is_empty());
    }
}
