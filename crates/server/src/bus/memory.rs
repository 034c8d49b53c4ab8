/// 进程内总线
///
/// 单机部署以及多实例测试使用；信封以 JSON 文本传递，与 Redis 线上格式一致

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use super::{BusEnvelope, BusError, PubSubBus};

pub struct MemoryBus {
    sender: broadcast::Sender<String>,
    available: AtomicBool,
}

impl MemoryBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self {
            sender,
            available: AtomicBool::new(true),
        }
    }

    /// 模拟总线断开 / 恢复
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::Unavailable("内存总线已停用".to_string()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        self.check_available()?;
        // 没有订阅者时 send 返回错误，视为已投递
        let _ = self.sender.send(envelope.to_json()?);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>, BusError> {
        self.check_available()?;
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(|item| match item {
            Ok(payload) => match BusEnvelope::from_json(&payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!("丢弃无法解析的总线消息: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("内存总线订阅落后: {}", e);
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OutboundMessage;

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = MemoryBus::default();
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();

        let envelope = BusEnvelope::new("node-a", "trends", OutboundMessage::new("trend_update"));
        bus.publish(&envelope).await.unwrap();

        assert_eq!(first.next().await.unwrap().channel, "trends");
        assert_eq!(second.next().await.unwrap().origin, "node-a");
    }

    #[tokio::test]
    async fn test_unavailable_bus_rejects_publish() {
        let bus = MemoryBus::default();
        bus.set_available(false);

        let envelope = BusEnvelope::new("node-a", "general", OutboundMessage::new("note"));
        assert!(matches!(
            bus.publish(&envelope).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(bus.subscribe().await.is_err());
    }
}
