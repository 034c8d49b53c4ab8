/// 连接关闭原因与关闭码

use std::fmt;

/// 连接关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// 正常关闭
    Normal,
    /// 服务端停机
    ServerShutdown,
    /// 服务端连接数已满
    Overloaded,
    /// 认证失败
    AuthRejected,
    /// 心跳超时
    IdleTimeout,
    /// 发送队列积压
    SlowConsumer,
    /// 超出速率限制
    RateLimited,
}

impl CloseReason {
    /// WebSocket 关闭码
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::ServerShutdown => 1001,
            Self::Overloaded => 1013,
            Self::AuthRejected => 4401,
            Self::IdleTimeout => 4408,
            Self::SlowConsumer => 4413,
            Self::RateLimited => 4429,
        }
    }

    /// 关闭帧中的原因描述
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::ServerShutdown => "server shutting down",
            Self::Overloaded => "too many connections",
            Self::AuthRejected => "authentication failed",
            Self::IdleTimeout => "heartbeat timeout",
            Self::SlowConsumer => "send queue overflow",
            Self::RateLimited => "rate limit exceeded",
        }
    }

    /// 指标标签
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ServerShutdown => "shutdown",
            Self::Overloaded => "overloaded",
            Self::AuthRejected => "auth_rejected",
            Self::IdleTimeout => "idle_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::RateLimited => "rate_limited",
        }
    }

    /// 根据关闭码还原原因
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::ServerShutdown),
            1013 => Some(Self::Overloaded),
            4401 => Some(Self::AuthRejected),
            4408 => Some(Self::IdleTimeout),
            4413 => Some(Self::SlowConsumer),
            4429 => Some(Self::RateLimited),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
