/// WebSocket 模块
///
/// 管理浏览器客户端的实时连接：频道订阅、心跳、限流与跨实例广播

pub mod error;
pub mod handler;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::RealtimeError;
pub use handler::{
    handle_connect, handle_story_socket, handle_stories_socket, handle_trends_socket,
    handle_trust_scores_socket,
};
pub use manager::{ConnectionManager, RealtimeStats};
pub use registry::ChannelRegistry;
pub use session::Session;
pub use transport::{transport_pair, Outgoing, SessionTransport, TransportReceiver};

use std::time::Duration;

/// 实时层运行参数
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub rate_limit_messages: u32,
    pub rate_limit_window: Duration,
    pub send_queue_size: usize,
    pub max_connections: usize,
    pub subscription_acks: bool,
    pub bus_retry_interval: Duration,
    pub bus_outbox_size: usize,
    pub bus_publish_timeout: Duration,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
            rate_limit_messages: 100,
            rate_limit_window: Duration::from_secs(60),
            send_queue_size: 1000,
            max_connections: 10000,
            subscription_acks: true,
            bus_retry_interval: Duration::from_secs(5),
            bus_outbox_size: 10000,
            bus_publish_timeout: Duration::from_secs(5),
        }
    }
}
