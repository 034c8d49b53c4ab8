/// 实时消息协议模块
///
/// 单一物理连接上按频道复用的 JSON 文本帧协议

pub mod close;
pub mod codec;
pub mod control;
pub mod message;

pub use close::CloseReason;
pub use control::ControlMessage;
pub use message::{MessageKind, OutboundMessage};

/// 连接建立时的默认频道
pub const DEFAULT_CHANNEL: &str = "general";

/// 趋势更新频道
pub const TRENDS_CHANNEL: &str = "trends";

/// 报道更新频道
pub const STORIES_CHANNEL: &str = "stories";

/// 可信度评分频道
pub const TRUST_SCORES_CHANNEL: &str = "trust_scores";

/// 单条报道的专属频道名：`story:<id>`
pub fn story_channel(story_id: &str) -> String {
    format!("story:{}", story_id)
}

/// 校验频道名，频道命名空间开放，仅拒绝空名
pub fn validate_channel(channel: &str) -> crate::Result<&str> {
    let trimmed = channel.trim();
    if trimmed.is_empty() {
        return Err(crate::Error::InvalidChannel("频道名不能为空".to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_story_channel() {
        assert_eq!(story_channel("abc123"), "story:abc123");
    }

    #[test]
    fn test_validate_channel() {
        assert_eq!(validate_channel(" trends ").unwrap(), "trends");
        assert!(validate_channel("   ").is_err());
        assert!(validate_channel("").is_err());
    }
}
