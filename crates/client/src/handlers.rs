/// 订阅处理函数表

use common::OutboundMessage;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 订阅处理函数
pub type Handler = Arc<dyn Fn(&OutboundMessage) -> anyhow::Result<()> + Send + Sync>;

/// 频道 -> 处理函数，按名称有序以保证重订阅顺序稳定
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或替换处理函数，返回频道是否为新增
    pub fn insert(&mut self, channel: impl Into<String>, handler: Handler) -> bool {
        self.handlers.insert(channel.into(), handler).is_none()
    }

    /// 移除处理函数，返回之前是否存在
    pub fn remove(&mut self, channel: &str) -> bool {
        self.handlers.remove(channel).is_some()
    }

    /// 按路由键查找：优先频道，其次消息类型
    pub fn lookup(&self, message: &OutboundMessage) -> Option<(String, Handler)> {
        let key = message.routing_key();
        self.handlers
            .get(key)
            .map(|handler| (key.to_string(), handler.clone()))
    }

    pub fn channels(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn test_lookup_prefers_channel_then_type() {
        let mut table = HandlerTable::new();
        table.insert("trends", noop());
        table.insert("notice", noop());

        let on_channel = OutboundMessage::new("trend_update").with_channel("trends");
        assert_eq!(table.lookup(&on_channel).map(|(k, _)| k).as_deref(), Some("trends"));

        let by_type = OutboundMessage::new("notice");
        assert_eq!(table.lookup(&by_type).map(|(k, _)| k).as_deref(), Some("notice"));

        let unmatched = OutboundMessage::new("notice").with_channel("stories");
        assert!(table.lookup(&unmatched).is_none());
    }

    #[test]
    fn test_insert_reports_new_channels() {
        let mut table = HandlerTable::new();
        assert!(table.insert("b", noop()));
        assert!(table.insert("a", noop()));
        assert!(!table.insert("a", noop()));
        assert_eq!(table.channels(), vec!["a", "b"]);
        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert_eq!(table.channels(), vec!["b"]);
    }
}
