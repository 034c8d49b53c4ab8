/// 客户端错误定义

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// 连接失败，按退避策略重试
    #[error("连接失败: {0}")]
    ConnectFailed(String),

    /// 认证被拒绝，不再自动重试
    #[error("认证失败: {0}")]
    AuthFailed(String),

    /// 订阅处理函数失败或 panic，路由继续
    #[error("频道 {channel} 的处理函数失败: {message}")]
    Handler { channel: String, message: String },

    #[error("连接未打开")]
    NotConnected,
}
