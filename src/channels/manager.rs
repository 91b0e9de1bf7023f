//! 渠道管理：注册、启停与出站分发
//!
//! 分发循环按配置过滤进度消息：思考文本受 send_progress 控制，工具提示受 send_tool_hints 控制。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::Channel;
use crate::config::ChannelsSection;

pub struct ChannelManager {
    bus: Arc<MessageBus>,
    channels: HashMap<String, Arc<dyn Channel>>,
    send_progress: bool,
    send_tool_hints: bool,
    dispatcher: Mutex<Option<CancellationToken>>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>, cfg: &ChannelsSection) -> Self {
        Self {
            bus,
            channels: HashMap::new(),
            send_progress: cfg.send_progress,
            send_tool_hints: cfg.send_tool_hints,
            dispatcher: Mutex::new(None),
        }
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        tracing::info!("Channel registered: {}", channel.name());
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    /// 已注册渠道名（排序）
    pub fn enabled_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// 渠道名 -> 是否运行中
    pub fn status(&self) -> BTreeMap<String, bool> {
        self.channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.is_running()))
            .collect()
    }

    /// 进度消息按配置过滤，普通消息总是投递
    pub fn should_deliver(&self, msg: &OutboundMessage) -> bool {
        if !msg.is_progress() {
            return true;
        }
        if msg.is_tool_hint() {
            self.send_tool_hints
        } else {
            self.send_progress
        }
    }

    /// 启动出站分发与所有渠道
    pub async fn start_all(self: &Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut dispatcher = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = dispatcher.replace(token.clone()) {
                old.cancel();
            }
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_outbound(token).await });

        for (name, channel) in &self.channels {
            tracing::info!("Starting {} channel...", name);
            if let Err(e) = channel.start().await {
                tracing::error!("Failed to start channel {}: {}", name, e);
            }
        }
    }

    pub async fn stop_all(&self) {
        tracing::info!("Stopping all channels...");
        if let Some(token) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        for (name, channel) in &self.channels {
            channel.stop().await;
            tracing::info!("Stopped {} channel", name);
        }
    }

    async fn dispatch_outbound(&self, token: CancellationToken) {
        tracing::info!("Outbound dispatcher started");
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => break,
                msg = self.bus.consume_outbound() => msg,
            };
            if !self.should_deliver(&msg) {
                continue;
            }
            match self.channels.get(&msg.channel) {
                Some(channel) => {
                    if let Err(e) = channel.send(&msg).await {
                        tracing::error!("Error sending to {}: {}", msg.channel, e);
                    }
                }
                None => tracing::warn!("Unknown channel: {}", msg.channel),
            }
        }
        tracing::info!("Outbound dispatcher stopped");
    }
}
