/// Redis PUBLISH / SUBSCRIBE 总线

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{BusEnvelope, BusError, PubSubBus};

pub struct RedisBus {
    client: redis::Client,
    topic: String,
    /// 发布连接，首次使用时建立，出错后重建
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    pub fn new(url: &str, topic: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            topic: topic.into(),
            publisher: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PubSubBus for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError> {
        let payload = envelope.to_json()?;
        let mut guard = self.publisher.lock().await;

        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => {
                let conn = self.client.get_multiplexed_async_connection().await?;
                info!("🔌 已连接 Redis 发布通道");
                guard.insert(conn)
            }
        };

        let result: redis::RedisResult<()> = conn.publish(&self.topic, payload).await;
        if let Err(e) = result {
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.topic).await?;
        info!("📡 已订阅 Redis 主题: {}", self.topic);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("读取 Redis 消息失败: {}", e);
                    return None;
                }
            };
            match BusEnvelope::from_json(&payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!("丢弃无法解析的总线消息: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
