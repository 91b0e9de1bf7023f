//! 异步消息队列：入站、出站两条互相独立的无界 FIFO
//!
//! publish 不阻塞；consume 挂起直到有消息。总线自身持有两端发送者，队列在总线存活期间不会关闭。

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};

use super::events::{InboundMessage, OutboundMessage};

/// 渠道与 Agent 之间的消息总线
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    inbound_len: AtomicUsize,
    outbound_len: AtomicUsize,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            inbound_len: AtomicUsize::new(0),
            outbound_len: AtomicUsize::new(0),
        }
    }

    /// 渠道 -> Agent
    pub fn publish_inbound(&self, msg: InboundMessage) {
        self.inbound_len.fetch_add(1, Ordering::SeqCst);
        if self.inbound_tx.send(msg).is_err() {
            self.inbound_len.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("inbound queue closed, message dropped");
        }
    }

    /// Agent -> 渠道
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        self.outbound_len.fetch_add(1, Ordering::SeqCst);
        if self.outbound_tx.send(msg).is_err() {
            self.outbound_len.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("outbound queue closed, message dropped");
        }
    }

    /// 取下一条入站消息（按到达顺序）
    pub async fn consume_inbound(&self) -> InboundMessage {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(msg) => {
                self.inbound_len.fetch_sub(1, Ordering::SeqCst);
                msg
            }
            // 发送端由 self 持有，不会走到这里
            None => std::future::pending().await,
        }
    }

    /// 取下一条出站消息（按到达顺序）
    pub async fn consume_outbound(&self) -> OutboundMessage {
        let mut rx = self.outbound_rx.lock().await;
        match rx.recv().await {
            Some(msg) => {
                self.outbound_len.fetch_sub(1, Ordering::SeqCst);
                msg
            }
            None => std::future::pending().await,
        }
    }

    pub fn inbound_size(&self) -> usize {
        self.inbound_len.load(Ordering::SeqCst)
    }

    pub fn outbound_size(&self) -> usize {
        self.outbound_len.load(Ordering::SeqCst)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
