//! 终端渠道：逐行读取 stdin，回复写到 stdout
//!
//! 输入 exit / quit 或 stdin 关闭时触发进程关闭。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::channels::{is_allowed, Channel};
use crate::config::CliChannelSection;
use crate::core::{ShutdownManager, ShutdownReason};

pub const CLI_CHANNEL: &str = "cli";
const CLI_CHAT_ID: &str = "direct";
const CLI_SENDER: &str = "user";
const PROMPT: &str = "> ";

pub struct CliChannel {
    bus: Arc<MessageBus>,
    allow_from: Vec<String>,
    shutdown: Option<ShutdownManager>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<CancellationToken>>,
}

impl CliChannel {
    pub fn new(bus: Arc<MessageBus>, cfg: &CliChannelSection) -> Self {
        Self {
            bus,
            allow_from: cfg.allow_from.clone(),
            shutdown: None,
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        }
    }

    /// 输入结束时通知整个进程关闭
    pub fn with_shutdown(mut self, shutdown: ShutdownManager) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn to_inbound(&self, line: &str) -> Option<InboundMessage> {
        line_to_inbound(&self.allow_from, line)
    }
}

/// 把一行输入转成入站消息；空行与非白名单发送者返回 None
fn line_to_inbound(allow_from: &[String], line: &str) -> Option<InboundMessage> {
    let content = line.trim();
    if content.is_empty() {
        return None;
    }
    if !is_allowed(allow_from, CLI_SENDER) {
        tracing::warn!("Access denied for sender {} on channel cli", CLI_SENDER);
        return None;
    }
    Some(InboundMessage::new(CLI_CHANNEL, CLI_SENDER, CLI_CHAT_ID, content))
}

async fn write_stdout(text: &str) -> std::io::Result<()> {
    let mut out = tokio::io::stdout();
    out.write_all(text.as_bytes()).await?;
    out.flush().await
}

/// 回复格式：进度消息缩进一行，普通回复前后空行并重新显示提示符
pub fn render(msg: &OutboundMessage) -> String {
    if msg.is_progress() {
        format!("  ↳ {}\n", msg.content)
    } else if msg.content.is_empty() {
        PROMPT.to_string()
    } else {
        format!("\n{}\n\n{}", msg.content, PROMPT)
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        CLI_CHANNEL
    }

    async fn start(&self) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        {
            let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = reader.replace(token.clone()) {
                old.cancel();
            }
        }
        self.running.store(true, Ordering::SeqCst);
        write_stdout(&format!("nectar ready. Type /help for commands.\n{}", PROMPT)).await?;

        let bus = Arc::clone(&self.bus);
        let running = Arc::clone(&self.running);
        let shutdown = self.shutdown.clone();
        let allow_from = self.allow_from.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
                            if let Some(s) = &shutdown {
                                s.shutdown(ShutdownReason::UserInitiated);
                            }
                            break;
                        }
                        match line_to_inbound(&allow_from, &line) {
                            Some(msg) => bus.publish_inbound(msg),
                            None => {
                                if let Err(e) = write_stdout(PROMPT).await {
                                    tracing::warn!("stdout write failed: {}", e);
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed");
                        if let Some(s) = &shutdown {
                            s.shutdown(ShutdownReason::InputClosed);
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!("stdin read error: {}", e);
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(token) = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        write_stdout(&render(msg)).await?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
