//! 状态转换事件输出 - 业务能力层
//!
//! 每次状态转换发出一个事件，交给外部的通知 / 计费边界。
//! 发送失败只记日志，不影响调用方。

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::TransitionEvent;

/// 事件输出
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &TransitionEvent);
}

/// 写入 tokio 通道（测试和进程内消费者）
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransitionEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: &TransitionEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("事件通道已关闭，丢弃事件: 请求 {}", event.request_id);
        }
    }
}

/// 只写日志
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: &TransitionEvent) {
        let from = event
            .from
            .map(|s| s.as_str())
            .unwrap_or("-");
        match event.failure {
            Some(kind) => info!(
                "📣 请求 {}: {} → {} ({}, {:?})",
                event.request_id, from, event.to, event.reason, kind
            ),
            None => info!(
                "📣 请求 {}: {} → {} ({})",
                event.request_id, from, event.to, event.reason
            ),
        }
    }
}

/// POST JSON 到外部 webhook
///
/// `emit` 只把事件放进通道，由后台任务按顺序推送，调用方不会等待网络。
/// 必须在 tokio 运行时内创建。
pub struct WebhookSink {
    tx: mpsc::UnboundedSender<TransitionEvent>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(client, url.into(), rx));
        Ok(Self { tx })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn emit(&self, event: &TransitionEvent) {
        if self.tx.send(event.clone()).is_err() {
            warn!("事件推送任务已退出，丢弃事件: 请求 {} → {}", event.request_id, event.to);
        }
    }
}

/// 推送任务，所有发送端释放后退出
async fn deliver(client: Client, url: String, mut rx: mpsc::UnboundedReceiver<TransitionEvent>) {
    while let Some(event) = rx.recv().await {
        match client.post(&url).json(&event).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("事件已推送: 请求 {} → {}", event.request_id, event.to);
            }
            Ok(resp) => warn!(
                "事件推送被拒绝 ({}): 请求 {} → {}",
                resp.status(),
                event.request_id,
                event.to
            ),
            Err(e) => warn!("事件推送失败: 请求 {} → {}: {}", event.request_id, event.to, e),
        }
    }
    debug!("事件推送任务结束");
}

/// 同时发给多个输出
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn emit(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LifecycleState, RequestId};

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let fanout = FanoutSink::new(vec![Arc::new(a), Arc::new(b), Arc::new(LogSink)]);

        let event = TransitionEvent::new(RequestId::new(), None, LifecycleState::Queued, "enqueued");
        fanout.emit(&event).await;

        assert_eq!(rx_a.recv().await, Some(event.clone()));
        assert_eq!(rx_b.recv().await, Some(event));
    }

    #[tokio::test]
    async fn closed_channel_does_not_fail_emit() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let event = TransitionEvent::new(RequestId::new(), None, LifecycleState::Queued, "enqueued");
        sink.emit(&event).await;
    }

    #[tokio::test]
    async fn unreachable_webhook_is_logged_not_raised() {
        let sink = WebhookSink::new("http://127.0.0.1:9/events").unwrap();
        let event = TransitionEvent::new(
            RequestId::new(),
            Some(LifecycleState::Submitting),
            LifecycleState::Submitted,
            "confirmed",
        );
        sink.emit(&event).await;
    }

    #[tokio::test]
    async fn slow_webhook_does_not_block_emit() {
        // 接受连接但从不应答
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/events", listener.local_addr().unwrap());
        let sink = WebhookSink::new(url).unwrap();

        let event = TransitionEvent::new(RequestId::new(), None, LifecycleState::Queued, "enqueued");
        tokio::time::timeout(Duration::from_millis(100), sink.emit(&event))
            .await
            .unwrap();

        // 事件仍在后台送达
        let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(accepted.unwrap().is_ok());
    }
}
