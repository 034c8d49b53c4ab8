/// 实时层 Prometheus 指标

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 指标集合，每个实例持有独立的 Registry
pub struct RealtimeMetrics {
    registry: Registry,
    pub active_connections: IntGauge,
    pub messages_delivered: IntCounter,
    pub sessions_evicted: IntCounterVec,
    pub malformed_messages: IntCounter,
    pub bus_publish_failures: IntCounter,
    pub bus_messages_received: IntCounter,
}

impl RealtimeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let active_connections =
            IntGauge::new("ws_active_connections", "当前活跃的 WebSocket 会话数")?;
        let messages_delivered =
            IntCounter::new("ws_messages_delivered_total", "投递到本地会话的消息数")?;
        let sessions_evicted = IntCounterVec::new(
            Opts::new("ws_sessions_evicted_total", "按原因统计的会话关闭数"),
            &["reason"],
        )?;
        let malformed_messages =
            IntCounter::new("ws_malformed_messages_total", "被丢弃的格式错误上行消息数")?;
        let bus_publish_failures =
            IntCounter::new("bus_publish_failures_total", "发布到总线失败的次数")?;
        let bus_messages_received =
            IntCounter::new("bus_messages_received_total", "从总线收到的远端消息数")?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(messages_delivered.clone()))?;
        registry.register(Box::new(sessions_evicted.clone()))?;
        registry.register(Box::new(malformed_messages.clone()))?;
        registry.register(Box::new(bus_publish_failures.clone()))?;
        registry.register(Box::new(bus_messages_received.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            messages_delivered,
            sessions_evicted,
            malformed_messages,
            bus_publish_failures,
            bus_messages_received,
        })
    }

    /// 导出文本格式
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
