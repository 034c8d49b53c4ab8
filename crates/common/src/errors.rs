use thiserror::Error;

/// 协议层统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("消息格式错误: {0}")]
    MalformedMessage(String),

    #[error("无效频道: {0}")]
    InvalidChannel(String),

    #[error("传输错误: {0}")]
    Transport(String),
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
