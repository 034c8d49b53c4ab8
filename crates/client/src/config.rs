/// 配置管理

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    /// 建立连接时请求的频道
    pub channel: Option<String>,
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// 监控程序订阅的频道
    pub monitor_channels: Vec<String>,
}

impl ClientConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let ws_url = std::env::var("REALTIME_WS_URL")
            .unwrap_or_else(|_| "ws://localhost:8000/ws/connect".to_string());

        let channel = non_empty_var("REALTIME_CHANNEL");
        let token = non_empty_var("REALTIME_TOKEN");

        let defaults = ReconnectPolicy::default();
        let max_attempts = match non_empty_var("RECONNECT_MAX_ATTEMPTS") {
            Some(v) => v.parse()?,
            None => defaults.max_attempts,
        };
        let base_delay = match non_empty_var("RECONNECT_BASE_DELAY_MS") {
            Some(v) => Duration::from_millis(v.parse()?),
            None => defaults.base_delay,
        };
        let max_delay = match non_empty_var("RECONNECT_MAX_DELAY_MS") {
            Some(v) => Duration::from_millis(v.parse()?),
            None => defaults.max_delay,
        };

        let monitor_channels = parse_channels(
            &std::env::var("MONITOR_CHANNELS")
                .unwrap_or_else(|_| "trends,stories,trust_scores".to_string()),
        );

        Ok(Self {
            ws_url,
            channel,
            token,
            reconnect: ReconnectPolicy {
                base_delay,
                max_delay,
                max_attempts,
                ..defaults
            },
            monitor_channels,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 解析逗号分隔的频道列表
pub fn parse_channels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channels() {
        assert_eq!(
            parse_channels(" trends, ,story:42,trust_scores "),
            vec!["trends", "story:42", "trust_scores"]
        );
        assert!(parse_channels("").is_empty());
    }
}
