/// 服务端下行消息定义

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::now_iso8601;

/// 下行消息类型
///
/// 已知类型为封闭集合，未知类型保留原始名称以保持前向兼容
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// 心跳探测
    Ping,
    /// 连接建立欢迎消息
    Connection,
    /// 订阅确认
    Subscribed,
    /// 取消订阅确认
    Unsubscribed,
    /// 错误通知
    Error,
    /// 趋势更新
    TrendUpdate,
    /// 报道更新
    StoryUpdate,
    /// 可信度评分更新
    TrustScoreUpdate,
    /// 未知类型，原样透传
    Other(String),
}

impl MessageKind {
    /// 转换为协议中的类型字符串
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Connection => "connection",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Error => "error",
            Self::TrendUpdate => "trend_update",
            Self::StoryUpdate => "story_update",
            Self::TrustScoreUpdate => "trust_score_update",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ping" => Self::Ping,
            "connection" => Self::Connection,
            "subscribed" => Self::Subscribed,
            "unsubscribed" => Self::Unsubscribed,
            "error" => Self::Error,
            "trend_update" => Self::TrendUpdate,
            "story_update" => Self::StoryUpdate,
            "trust_score_update" => Self::TrustScoreUpdate,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下行消息
///
/// `type` 必定存在；其余字段按消息类型选填，未识别的字段保存在 `extra` 中原样透传
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// 消息类型
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// 业务负载
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// ISO8601 时间戳
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// 所属频道，发布时缺省为发布频道
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,

    /// 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signals: Option<Vec<Value>>,

    /// 其余字段
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundMessage {
    /// 创建指定类型的空消息（带当前时间戳）
    pub fn new(kind: impl Into<MessageKind>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            timestamp: Some(now_iso8601()),
            channel: None,
            story_id: None,
            trust_score: None,
            signals: None,
            extra: Map::new(),
        }
    }

    /// 创建带业务负载的事件消息
    pub fn event(kind: impl Into<MessageKind>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::new(kind)
        }
    }

    /// 心跳探测
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping)
    }

    /// 连接建立欢迎消息
    pub fn connected(channel: impl Into<String>) -> Self {
        Self::new(MessageKind::Connection)
            .with_channel(channel)
            .with_field("status", Value::from("connected"))
    }

    /// 订阅确认
    pub fn subscribed(channel: impl Into<String>) -> Self {
        Self::new(MessageKind::Subscribed).with_channel(channel)
    }

    /// 取消订阅确认
    pub fn unsubscribed(channel: impl Into<String>) -> Self {
        Self::new(MessageKind::Unsubscribed).with_channel(channel)
    }

    /// 错误通知
    pub fn error(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        let msg = Self::new(MessageKind::Error).with_field("message", Value::from(message.into()));
        match retry_after {
            Some(secs) => msg.with_field("retry_after", Value::from(secs)),
            None => msg,
        }
    }

    /// 趋势更新
    pub fn trend_update(data: Value) -> Self {
        Self::event(MessageKind::TrendUpdate, data)
    }

    /// 报道更新
    pub fn story_update(data: Value) -> Self {
        Self::event(MessageKind::StoryUpdate, data)
    }

    /// 可信度评分更新
    pub fn trust_score_update(
        story_id: impl Into<String>,
        trust_score: f64,
        signals: Vec<Value>,
    ) -> Self {
        Self {
            story_id: Some(story_id.into()),
            trust_score: Some(trust_score),
            signals: Some(signals),
            ..Self::new(MessageKind::TrustScoreUpdate)
        }
    }

    /// 设置频道
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// 仅在未指定频道时填充发布频道
    pub fn with_default_channel(mut self, channel: &str) -> Self {
        if self.channel.is_none() {
            self.channel = Some(channel.to_string());
        }
        self
    }

    /// 追加透传字段
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// 客户端路由键：优先频道，其次消息类型
    pub fn routing_key(&self) -> &str {
        self.channel.as_deref().unwrap_or_else(|| self.kind.as_str())
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 从 JSON 字符串反序列化
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trust_score_update_shape() {
        let msg = OutboundMessage::trust_score_update(
            "abc123",
            72.5,
            vec![json!({"type": "source_diversity", "value": 0.8})],
        )
        .with_default_channel("trust_scores");

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "trust_score_update");
        assert_eq!(value["story_id"], "abc123");
        assert_eq!(value["trust_score"], 72.5);
        assert_eq!(value["signals"][0]["type"], "source_diversity");
        assert_eq!(value["channel"], "trust_scores");
        assert!(value["timestamp"].is_string());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_default_channel_does_not_override() {
        let msg = OutboundMessage::trend_update(json!({"topic": "x"}))
            .with_channel("story:1")
            .with_default_channel("trends");
        assert_eq!(msg.channel.as_deref(), Some("story:1"));
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let raw = r#"{"type":"breaking_alert","severity":"high","data":{"id":1}}"#;
        let msg = OutboundMessage::from_json(raw).unwrap();
        assert_eq!(msg.kind, MessageKind::Other("breaking_alert".to_string()));
        assert_eq!(msg.extra["severity"], "high");

        let back: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back["type"], "breaking_alert");
        assert_eq!(back["severity"], "high");
    }

    #[test]
    fn test_missing_type_is_rejected() {
        assert!(OutboundMessage::from_json(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_routing_key() {
        assert_eq!(OutboundMessage::ping().routing_key(), "ping");
        assert_eq!(
            OutboundMessage::trend_update(json!({})).with_channel("trends").routing_key(),
            "trends"
        );
    }

    #[test]
    fn test_error_message_fields() {
        let msg = OutboundMessage::error("Rate limit exceeded", Some(60));
        assert_eq!(msg.kind, MessageKind::Error);
        assert_eq!(msg.extra["message"], "Rate limit exceeded");
        assert_eq!(msg.extra["retry_after"], 60);
    }
}
