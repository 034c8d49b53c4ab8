/// 客户端上行控制消息定义

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::now_iso8601;
use crate::{Error, Result};

/// 上行控制消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// 订阅频道
    Subscribe { channel: String },
    /// 取消订阅频道
    Unsubscribe { channel: String },
    /// 心跳响应
    Pong { timestamp: Option<String> },
    /// 未识别的类型（前向兼容，忽略即可）
    Unknown { kind: String },
}

/// 线上格式
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireControl {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
}

impl ControlMessage {
    /// 创建订阅消息
    pub fn subscribe(channel: impl Into<String>) -> Self {
        Self::Subscribe { channel: channel.into() }
    }

    /// 创建取消订阅消息
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        Self::Unsubscribe { channel: channel.into() }
    }

    /// 创建带当前时间戳的心跳响应
    pub fn pong() -> Self {
        Self::Pong { timestamp: Some(now_iso8601()) }
    }

    /// 解析上行文本帧
    ///
    /// 非 JSON 或缺少 `type` 视为格式错误；未知 `type` 返回 `Unknown`
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMessage(format!("无效 JSON: {}", e)))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedMessage("缺少 type 字段".to_string()))?
            .to_string();

        if !matches!(kind.as_str(), "subscribe" | "unsubscribe" | "pong") {
            return Ok(Self::Unknown { kind });
        }

        let wire: WireControl = serde_json::from_value(value)
            .map_err(|e| Error::MalformedMessage(format!("{} 消息字段错误: {}", kind, e)))?;

        let msg = match wire {
            WireControl::Subscribe { channel } => Self::Subscribe {
                channel: Self::checked_channel(channel)?,
            },
            WireControl::Unsubscribe { channel } => Self::Unsubscribe {
                channel: Self::checked_channel(channel)?,
            },
            WireControl::Pong { timestamp } => Self::Pong {
                timestamp: timestamp.map(|ts| match ts {
                    Value::String(s) => s,
                    other => other.to_string(),
                }),
            },
        };
        Ok(msg)
    }

    /// 序列化为 JSON 字符串
    pub fn to_json(&self) -> Result<String> {
        let wire = match self {
            Self::Subscribe { channel } => WireControl::Subscribe { channel: channel.clone() },
            Self::Unsubscribe { channel } => WireControl::Unsubscribe { channel: channel.clone() },
            Self::Pong { timestamp } => WireControl::Pong {
                timestamp: timestamp.clone().map(Value::String),
            },
            Self::Unknown { kind } => {
                return Err(Error::MalformedMessage(format!("无法发送未知类型消息: {}", kind)));
            }
        };
        Ok(serde_json::to_string(&wire)?)
    }

    fn checked_channel(channel: String) -> Result<String> {
        super::validate_channel(&channel)
            .map(str::to_string)
            .map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}
