/// 跨实例消息总线
///
/// 所有实例订阅同一个主题，频道作为信封字段携带，收到后在本地过滤

pub mod bridge;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use bridge::{BridgeSettings, BusBridge};
pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use self::redis::RedisBus;

use async_trait::async_trait;
use common::OutboundMessage;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 默认总线主题
pub const DEFAULT_TOPIC: &str = "websocket:broadcast";

/// 总线上传输的信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// 发布方实例 ID
    pub origin: String,
    pub channel: String,
    pub message: OutboundMessage,
    pub timestamp: String,
}

impl BusEnvelope {
    pub fn new(origin: impl Into<String>, channel: impl Into<String>, message: OutboundMessage) -> Self {
        Self {
            origin: origin.into(),
            channel: channel.into(),
            message,
            timestamp: common::utils::now_iso8601(),
        }
    }

    pub fn to_json(&self) -> Result<String, BusError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, BusError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("总线不可达: {0}")]
    Unavailable(String),

    #[error("总线操作超时: {0:?}")]
    Timeout(std::time::Duration),

    #[error("信封序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis 错误: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// 发布 / 订阅总线
#[async_trait]
pub trait PubSubBus: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError>;

    /// 订阅主题，流结束表示订阅断开
    async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let msg = OutboundMessage::event("trend_update", json!({"topic": "ai"}))
            .with_channel("trends");
        let envelope = BusEnvelope::new("node-a", "trends", msg.clone());

        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["origin"], "node-a");
        assert_eq!(value["channel"], "trends");
        assert_eq!(value["message"]["type"], "trend_update");

        let decoded = BusEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded.message, msg);
    }
}
