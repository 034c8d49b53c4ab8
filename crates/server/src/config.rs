/// 配置管理

use serde::Deserialize;
use std::time::Duration;

use crate::bus::DEFAULT_TOPIC;
use crate::ws::RealtimeSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_port: u16,
    pub jwt_secret: String,
    pub require_websocket_auth: bool,
    #[serde(default)]
    pub redis_url: Option<String>,
    pub bus_topic: String,
    pub bus_retry_secs: u64,
    pub bus_outbox_size: usize,
    pub bus_publish_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub rate_limit_messages: u32,
    pub rate_limit_window_secs: u64,
    pub send_queue_size: usize,
    pub max_connections: usize,
    pub subscription_acks: bool,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("server_port", 8000)?
            .set_default("jwt_secret", "")?
            .set_default("require_websocket_auth", false)?
            .set_default("bus_topic", DEFAULT_TOPIC)?
            .set_default("bus_retry_secs", 5)?
            .set_default("bus_outbox_size", 10000)?
            .set_default("bus_publish_timeout_secs", 5)?
            .set_default("ping_interval_secs", 30)?
            .set_default("pong_timeout_secs", 90)?
            .set_default("rate_limit_messages", 100)?
            .set_default("rate_limit_window_secs", 60)?
            .set_default("send_queue_size", 1000)?
            .set_default("max_connections", 10000)?
            .set_default("subscription_acks", true)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let mut cfg: Config = settings.try_deserialize()?;
        cfg.redis_url = cfg.redis_url.filter(|url| !url.trim().is_empty());

        if cfg.ping_interval_secs == 0 || cfg.rate_limit_window_secs == 0 {
            anyhow::bail!("PING_INTERVAL_SECS 与 RATE_LIMIT_WINDOW_SECS 必须大于 0");
        }

        Ok(cfg)
    }

    /// 实时层参数
    pub fn realtime_settings(&self) -> RealtimeSettings {
        RealtimeSettings {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            rate_limit_messages: self.rate_limit_messages,
            rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
            send_queue_size: self.send_queue_size.max(1),
            max_connections: self.max_connections,
            subscription_acks: self.subscription_acks,
            bus_retry_interval: Duration::from_secs(self.bus_retry_secs.max(1)),
            bus_outbox_size: self.bus_outbox_size.max(1),
            bus_publish_timeout: Duration::from_secs(self.bus_publish_timeout_secs.max(1)),
        }
    }
}
