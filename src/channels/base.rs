//! 渠道 trait 与发送者白名单

use async_trait::async_trait;

use crate::bus::OutboundMessage;

/// 渠道适配器
#[async_trait]
pub trait Channel: Send + Sync {
    /// 渠道名，与消息的 channel 字段一致
    fn name(&self) -> &str;

    /// 开始接收消息；接收循环在后台运行，本方法启动后即返回
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self);

    /// 发送一条出站消息
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;
}

/// allow_from 为空时允许所有人；sender_id 形如 `id|username` 时任一部分命中即可
pub fn is_allowed(allow_from: &[String], sender_id: &str) -> bool {
    if allow_from.is_empty() {
        return true;
    }
    if allow_from.iter().any(|a| a == sender_id) {
        return true;
    }
    sender_id.contains('|')
        && sender_id
            .split('|')
            .filter(|part| !part.is_empty())
            .any(|part| allow_from.iter().any(|a| a == part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_allowed() {
        let list = vec!["123".to_string(), "alice".to_string()];
        assert!(is_allowed(&[], "anyone"));
        assert!(is_allowed(&list, "123"));
        assert!(is_allowed(&list, "999|alice"));
        assert!(!is_allowed(&list, "999|bob"));
        assert!(!is_allowed(&list, "12"));
    }
}
