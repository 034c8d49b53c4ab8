/// 实时层错误定义

use thiserror::Error;

use crate::auth::AuthError;
use crate::bus::BusError;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("认证失败: {0}")]
    AuthRejected(#[from] AuthError),

    #[error("连接数已达上限: {0}")]
    Overloaded(usize),

    #[error("超出速率限制: {limit} 条 / {window_secs} 秒")]
    RateLimitExceeded { limit: u32, window_secs: u64 },

    #[error("心跳超时: 会话 {0}")]
    IdleTimeout(String),

    #[error("消息格式错误: {0}")]
    MalformedMessage(String),

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("总线不可用: {0}")]
    BusUnavailable(#[from] BusError),
}

impl From<common::Error> for RealtimeError {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::Transport(msg) => Self::Transport(msg),
            other => Self::MalformedMessage(other.to_string()),
        }
    }
}
