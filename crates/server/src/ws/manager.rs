/// 连接管理器
///
/// 负责会话准入、上行控制消息分发、频道广播、心跳巡检以及跨实例转发

use common::protocol::{
    story_channel, validate_channel, DEFAULT_CHANNEL, STORIES_CHANNEL, TRENDS_CHANNEL,
    TRUST_SCORES_CHANNEL,
};
use common::{CloseReason, ControlMessage, OutboundMessage};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::RealtimeError;
use super::registry::ChannelRegistry;
use super::session::{HeartbeatAction, Session};
use super::transport::{SendFailure, SessionTransport};
use super::RealtimeSettings;
use crate::auth::Authenticator;
use crate::bus::{BridgeSettings, BusBridge, PubSubBus};
use crate::metrics::RealtimeMetrics;

/// 连接统计
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub total_connections: usize,
    pub channels: BTreeMap<String, usize>,
    /// 已认证的不同用户数
    pub users: usize,
    pub bus_connected: bool,
    pub instance_id: String,
}

pub struct ConnectionManager {
    settings: RealtimeSettings,
    instance_id: String,
    authenticator: Arc<dyn Authenticator>,
    metrics: Arc<RealtimeMetrics>,
    registry: ChannelRegistry,
    /// 会话表: session_id -> Session
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    bridge: Option<BusBridge>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        settings: RealtimeSettings,
        authenticator: Arc<dyn Authenticator>,
        metrics: Arc<RealtimeMetrics>,
        bus: Option<Arc<dyn PubSubBus>>,
        instance_id: impl Into<String>,
    ) -> Arc<Self> {
        let instance_id = instance_id.into();
        let bridge = bus.map(|bus| {
            BusBridge::new(
                bus,
                instance_id.clone(),
                BridgeSettings {
                    retry_interval: settings.bus_retry_interval,
                    outbox_size: settings.bus_outbox_size,
                    publish_timeout: settings.bus_publish_timeout,
                },
                metrics.clone(),
            )
        });

        Arc::new(Self {
            settings,
            instance_id,
            authenticator,
            metrics,
            registry: ChannelRegistry::new(),
            sessions: RwLock::new(HashMap::new()),
            bridge,
            shutdown: CancellationToken::new(),
        })
    }

    /// 启动心跳巡检与总线转发任务
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.run_heartbeat_monitor().await;
        });

        if let Some(bridge) = &self.bridge {
            if let Some(mut remote) = bridge.start(self.shutdown.child_token()) {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = manager.shutdown.cancelled() => break,
                            envelope = remote.recv() => match envelope {
                                Some(envelope) => {
                                    let delivered = manager
                                        .local_broadcast(&envelope.channel, &envelope.message)
                                        .await;
                                    debug!(
                                        "转发远端消息: origin={}, channel={}, delivered={}",
                                        envelope.origin, envelope.channel, delivered
                                    );
                                }
                                None => break,
                            },
                        }
                    }
                    debug!("总线转发任务结束");
                });
            }
        }

        info!(
            "✅ 连接管理器已启动: instance={}, bus={}",
            self.instance_id,
            self.bridge.as_ref().map(BusBridge::bus_name).unwrap_or("none")
        );
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<RealtimeMetrics> {
        &self.metrics
    }

    /// 接受新连接
    ///
    /// 认证失败时以 4401 关闭传输且不创建会话
    pub async fn accept_connection(
        &self,
        transport: SessionTransport,
        requested_channel: Option<&str>,
        auth_token: Option<&str>,
    ) -> Result<Arc<Session>, RealtimeError> {
        if self.shutdown.is_cancelled() {
            transport.close(CloseReason::ServerShutdown);
            return Err(RealtimeError::Transport("服务正在关闭".to_string()));
        }

        let identity = match self.authenticator.authenticate(auth_token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("❌ WebSocket 认证失败: {}", e);
                transport.close(CloseReason::AuthRejected);
                self.metrics
                    .sessions_evicted
                    .with_label_values(&[CloseReason::AuthRejected.as_label()])
                    .inc();
                return Err(e.into());
            }
        };

        let channel = requested_channel
            .and_then(|c| validate_channel(c).ok())
            .unwrap_or(DEFAULT_CHANNEL)
            .to_string();

        let session = Session::new(
            common::utils::generate_id(),
            identity,
            channel.clone(),
            transport,
            self.settings.rate_limit_messages,
            self.settings.rate_limit_window,
        );

        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.settings.max_connections {
                drop(sessions);
                warn!("连接数已达上限 {}，拒绝新连接", self.settings.max_connections);
                session.close(CloseReason::Overloaded);
                self.metrics
                    .sessions_evicted
                    .with_label_values(&[CloseReason::Overloaded.as_label()])
                    .inc();
                return Err(RealtimeError::Overloaded(self.settings.max_connections));
            }
            sessions.insert(session.id.clone(), session.clone());
        }

        self.registry.register(&channel, &session).await;
        self.metrics.active_connections.inc();

        info!(
            "🔗 新的 WebSocket 会话: id={}, channel={}, user={:?}",
            session.id, channel, session.identity.user_id
        );

        self.send_to(&session, &OutboundMessage::connected(channel)).await;
        Ok(session)
    }

    /// 处理客户端上行文本帧
    pub async fn handle_inbound(&self, session: &Arc<Session>, text: &str) -> Result<(), RealtimeError> {
        if session.is_removed() {
            return Ok(());
        }

        session.touch().await;

        if !session.record_message(Instant::now()).await {
            let window_secs = self.settings.rate_limit_window.as_secs();
            warn!(
                "⚠️ 会话 {} 超出速率限制 ({} 条 / {} 秒)",
                session.id, self.settings.rate_limit_messages, window_secs
            );
            self.send_to(session, &OutboundMessage::error("Rate limit exceeded", Some(window_secs)))
                .await;
            self.disconnect(&session.id, CloseReason::RateLimited).await;
            return Err(RealtimeError::RateLimitExceeded {
                limit: self.settings.rate_limit_messages,
                window_secs,
            });
        }

        let control = match ControlMessage::parse(text) {
            Ok(control) => control,
            Err(e) => {
                self.metrics.malformed_messages.inc();
                warn!("丢弃格式错误的上行消息: session={}, error={}", session.id, e);
                return Err(e.into());
            }
        };

        match control {
            ControlMessage::Subscribe { channel } => {
                let added = self.registry.register(&channel, session).await;
                debug!("会话 {} 订阅频道 {} (new={})", session.id, channel, added);
                if added && self.settings.subscription_acks {
                    self.send_to(session, &OutboundMessage::subscribed(channel)).await;
                }
            }
            ControlMessage::Unsubscribe { channel } => {
                let removed = self.registry.unregister(&channel, &session.id).await;
                debug!("会话 {} 取消订阅频道 {} (removed={})", session.id, channel, removed);
                if self.settings.subscription_acks {
                    self.send_to(session, &OutboundMessage::unsubscribed(channel)).await;
                }
            }
            ControlMessage::Pong { .. } => {
                session.on_pong().await;
            }
            ControlMessage::Unknown { kind } => {
                debug!("忽略未知类型的上行消息: session={}, type={}", session.id, kind);
            }
        }

        Ok(())
    }

    /// 向频道广播
    ///
    /// 先在本地投递，再交给总线转发到其他实例；返回本地投递数
    pub async fn broadcast(&self, channel: &str, message: OutboundMessage) -> usize {
        let channel = match validate_channel(channel) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("忽略广播: {}", e);
                return 0;
            }
        };

        let message = message.with_default_channel(channel);
        let delivered = self.local_broadcast(channel, &message).await;

        if let Some(bridge) = &self.bridge {
            bridge.publish(channel, &message);
        }

        delivered
    }

    /// 仅向本实例的订阅者投递
    ///
    /// 入队失败的会话被移除，不影响其他会话
    pub async fn local_broadcast(&self, channel: &str, message: &OutboundMessage) -> usize {
        let subscribers = self.registry.subscribers_of(channel).await;
        if subscribers.is_empty() {
            return 0;
        }

        let frame: Arc<str> = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!("序列化广播消息失败: {}", e);
                return 0;
            }
        };

        let mut delivered = 0usize;
        let mut failed = Vec::new();
        for session in &subscribers {
            match session.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(failure) => failed.push((session.id.clone(), failure)),
            }
        }

        for (session_id, failure) in failed {
            self.disconnect(&session_id, Self::failure_reason(&session_id, failure))
                .await;
        }

        self.metrics.messages_delivered.inc_by(delivered as u64);
        debug!(
            "📢 广播到频道 {}: {} / {} 个会话",
            channel,
            delivered,
            subscribers.len()
        );
        delivered
    }

    /// 趋势更新 -> `trends`
    pub async fn broadcast_trend_update(&self, data: Value) -> usize {
        self.broadcast(TRENDS_CHANNEL, OutboundMessage::trend_update(data))
            .await
    }

    /// 报道更新 -> `stories`，带 `id` 时同时发往 `story:<id>`
    pub async fn broadcast_story_update(&self, data: Value) -> usize {
        let story_id = data.get("id").and_then(|id| match id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        let message = OutboundMessage::story_update(data);
        let mut delivered = self.broadcast(STORIES_CHANNEL, message.clone()).await;
        if let Some(story_id) = story_id {
            delivered += self.broadcast(&story_channel(&story_id), message).await;
        }
        delivered
    }

    /// 可信度评分更新 -> `trust_scores` 与 `story:<id>`
    pub async fn broadcast_trust_score_update(
        &self,
        story_id: &str,
        trust_score: f64,
        signals: Vec<Value>,
    ) -> usize {
        let message = OutboundMessage::trust_score_update(story_id, trust_score, signals);
        let mut delivered = self
            .broadcast(TRUST_SCORES_CHANNEL, message.clone())
            .await;
        delivered += self.broadcast(&story_channel(story_id), message).await;
        delivered
    }

    /// 断开会话，重复调用无副作用
    pub async fn disconnect(&self, session_id: &str, reason: CloseReason) -> bool {
        let session = self.sessions.write().await.remove(session_id);
        let Some(session) = session else {
            return false;
        };

        session.mark_removed();
        let channels = self.registry.remove_session(session_id).await;
        session.close(reason);

        self.metrics.active_connections.dec();
        self.metrics
            .sessions_evicted
            .with_label_values(&[reason.as_label()])
            .inc();

        info!(
            "🔌 会话已断开: id={}, reason={}, channels={}",
            session_id,
            reason,
            channels.len()
        );
        true
    }

    /// 心跳巡检一轮，返回因超时被关闭的会话数
    pub async fn sweep_heartbeats(&self, now: Instant) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        if sessions.is_empty() {
            return 0;
        }

        let ping: Arc<str> = match OutboundMessage::ping().to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!("序列化 ping 失败: {}", e);
                return 0;
            }
        };

        let mut expired = 0;
        for session in sessions {
            match session.heartbeat_tick(now, self.settings.pong_timeout).await {
                HeartbeatAction::SendPing => {
                    if let Err(failure) = session.send_frame(ping.clone()) {
                        self.disconnect(&session.id, Self::failure_reason(&session.id, failure))
                            .await;
                    }
                }
                HeartbeatAction::Expire => {
                    let idle = now.saturating_duration_since(session.last_activity().await);
                    warn!(
                        "💔 {}，最近一次活动在 {:?} 前",
                        RealtimeError::IdleTimeout(session.id.clone()),
                        idle
                    );
                    if self.disconnect(&session.id, CloseReason::IdleTimeout).await {
                        expired += 1;
                    }
                }
                HeartbeatAction::Wait => {}
            }
        }
        expired
    }

    /// 连接统计
    pub async fn stats(&self) -> RealtimeStats {
        let (total_connections, users) = {
            let sessions = self.sessions.read().await;
            let users: HashSet<&str> = sessions
                .values()
                .filter_map(|s| s.identity.user_id.as_deref())
                .collect();
            (sessions.len(), users.len())
        };

        RealtimeStats {
            total_connections,
            channels: self.registry.channel_counts().await,
            users,
            bus_connected: self.bridge.as_ref().map(BusBridge::is_connected).unwrap_or(false),
            instance_id: self.instance_id.clone(),
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn channels_of(&self, session_id: &str) -> Vec<String> {
        self.registry.channels_of(session_id).await
    }

    /// 停止后台任务并以 1001 关闭所有会话
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.disconnect(&id, CloseReason::ServerShutdown).await;
        }
        info!("🛑 连接管理器已关闭，断开 {} 个会话", count);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn send_to(&self, session: &Arc<Session>, message: &OutboundMessage) -> bool {
        let frame = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!("序列化消息失败: {}", e);
                return false;
            }
        };

        match session.send_frame(frame) {
            Ok(()) => true,
            Err(failure) => {
                self.disconnect(&session.id, Self::failure_reason(&session.id, failure))
                    .await;
                false
            }
        }
    }

    fn failure_reason(session_id: &str, failure: SendFailure) -> CloseReason {
        match failure {
            SendFailure::Full => {
                warn!("🐢 会话 {} 发送队列已满，按慢消费者移除", session_id);
                CloseReason::SlowConsumer
            }
            SendFailure::Closed => CloseReason::Normal,
        }
    }

    async fn run_heartbeat_monitor(&self) {
        let mut ticker = tokio::time::interval(self.settings.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即返回
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.sweep_heartbeats(Instant::now()).await;
                    if expired > 0 {
                        info!("心跳巡检: 关闭 {} 个超时会话", expired);
                    }
                }
            }
        }
        debug!("心跳巡检任务结束");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::issue_token;
    use crate::auth::{AllowAnonymous, JwtAuthenticator};
    use crate::bus::MemoryBus;
    use crate::ws::session::HeartbeatState;
    use crate::ws::transport::{transport_pair, Outgoing, TransportReceiver};
    use serde_json::json;
    use std::time::Duration;

    fn manager(settings: RealtimeSettings) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            settings,
            Arc::new(AllowAnonymous),
            Arc::new(RealtimeMetrics::new().unwrap()),
            None,
            "test-node",
        )
    }

    fn clustered(bus: Arc<MemoryBus>, id: &str) -> Arc<ConnectionManager> {
        let settings = RealtimeSettings {
            bus_retry_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let manager = ConnectionManager::new(
            settings,
            Arc::new(AllowAnonymous),
            Arc::new(RealtimeMetrics::new().unwrap()),
            Some(bus as Arc<dyn PubSubBus>),
            id,
        );
        manager.start();
        manager
    }

    async fn connect(
        manager: &ConnectionManager,
        channel: &str,
    ) -> (Arc<Session>, TransportReceiver) {
        let (transport, rx) = transport_pair(manager.settings().send_queue_size);
        let session = manager
            .accept_connection(transport, Some(channel), None)
            .await
            .unwrap();
        (session, rx)
    }

    /// 取出当前已入队的消息与关闭原因
    fn drain(rx: &mut TransportReceiver) -> (Vec<OutboundMessage>, Option<CloseReason>) {
        let mut messages = Vec::new();
        loop {
            match rx.try_next() {
                Some(Outgoing::Frame(frame)) => {
                    messages.push(OutboundMessage::from_json(&frame).unwrap())
                }
                Some(Outgoing::Close(reason)) => return (messages, Some(reason)),
                None => return (messages, None),
            }
        }
    }

    fn kinds(messages: &[OutboundMessage]) -> Vec<String> {
        messages.iter().map(|m| m.kind.to_string()).collect()
    }

    #[tokio::test]
    async fn test_welcome_message() {
        let manager = manager(RealtimeSettings::default());
        let (_session, mut rx) = connect(&manager, "trends").await;

        let (messages, closed) = drain(&mut rx);
        assert_eq!(kinds(&messages), vec!["connection"]);
        assert_eq!(messages[0].channel.as_deref(), Some("trends"));
        assert_eq!(messages[0].extra["status"], "connected");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_empty_channel_falls_back_to_general() {
        let manager = manager(RealtimeSettings::default());
        let (session, _rx) = connect(&manager, "  ").await;
        assert_eq!(session.primary_channel, "general");
        assert_eq!(manager.channels_of(&session.id).await, vec!["general"]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_exact_channel_only() {
        let manager = manager(RealtimeSettings::default());
        let (_a, mut a_rx) = connect(&manager, "trends").await;
        let (_b, mut b_rx) = connect(&manager, "stories").await;
        let (c, mut c_rx) = connect(&manager, "general").await;
        manager
            .handle_inbound(&c, r#"{"type":"subscribe","channel":"trends"}"#)
            .await
            .unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        let delivered = manager
            .broadcast_trend_update(json!({"topic": "elections"}))
            .await;
        assert_eq!(delivered, 2);

        let (a_msgs, _) = drain(&mut a_rx);
        let (b_msgs, _) = drain(&mut b_rx);
        let (c_msgs, _) = drain(&mut c_rx);
        assert_eq!(kinds(&a_msgs), vec!["trend_update"]);
        assert_eq!(a_msgs[0].channel.as_deref(), Some("trends"));
        assert!(b_msgs.is_empty());
        assert_eq!(kinds(&c_msgs), vec!["trend_update"]);
    }

    #[tokio::test]
    async fn test_subscribe_ack_only_for_new_subscription() {
        let manager = manager(RealtimeSettings::default());
        let (session, mut rx) = connect(&manager, "general").await;
        drain(&mut rx);

        let subscribe = r#"{"type":"subscribe","channel":"stories"}"#;
        manager.handle_inbound(&session, subscribe).await.unwrap();
        manager.handle_inbound(&session, subscribe).await.unwrap();

        let (messages, _) = drain(&mut rx);
        assert_eq!(kinds(&messages), vec!["subscribed"]);
        assert_eq!(messages[0].channel.as_deref(), Some("stories"));
    }

    #[tokio::test]
    async fn test_acks_can_be_disabled() {
        let manager = manager(RealtimeSettings {
            subscription_acks: false,
            ..Default::default()
        });
        let (session, mut rx) = connect(&manager, "general").await;
        drain(&mut rx);

        manager
            .handle_inbound(&session, r#"{"type":"subscribe","channel":"stories"}"#)
            .await
            .unwrap();
        assert!(drain(&mut rx).0.is_empty());
    }

    #[tokio::test]
    async fn test_partial_unsubscribe() {
        let manager = manager(RealtimeSettings::default());
        let (session, mut rx) = connect(&manager, "trends").await;
        manager
            .handle_inbound(&session, r#"{"type":"subscribe","channel":"stories"}"#)
            .await
            .unwrap();

        let unsubscribe = r#"{"type":"unsubscribe","channel":"trends"}"#;
        manager.handle_inbound(&session, unsubscribe).await.unwrap();
        // 重复取消订阅无副作用
        manager.handle_inbound(&session, unsubscribe).await.unwrap();
        drain(&mut rx);

        assert_eq!(manager.broadcast("trends", OutboundMessage::new("note")).await, 0);
        assert_eq!(manager.broadcast("stories", OutboundMessage::new("note")).await, 1);

        let (messages, closed) = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel.as_deref(), Some("stories"));
        assert!(closed.is_none());
        assert_eq!(manager.channels_of(&session.id).await, vec!["stories"]);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_no_stale_sessions() {
        let manager = manager(RealtimeSettings::default());
        let (session, mut rx) = connect(&manager, "trends").await;
        manager
            .handle_inbound(&session, r#"{"type":"subscribe","channel":"story:7"}"#)
            .await
            .unwrap();

        assert!(manager.disconnect(&session.id, CloseReason::Normal).await);
        assert!(!manager.disconnect(&session.id, CloseReason::IdleTimeout).await);

        let stats = manager.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert!(stats.channels.is_empty());
        assert_eq!(manager.broadcast("trends", OutboundMessage::new("note")).await, 0);
        assert_eq!(drain(&mut rx).1, Some(CloseReason::Normal));
        assert_eq!(manager.metrics().active_connections.get(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_racing_disconnect_leaves_no_stale_session() {
        let manager = manager(RealtimeSettings::default());
        let (session, mut rx) = connect(&manager, "general").await;
        drain(&mut rx);

        // 订阅在 is_removed 检查之后、登记之前被心跳巡检断开
        assert!(manager.disconnect(&session.id, CloseReason::IdleTimeout).await);
        assert!(!manager.registry.register("trends", &session).await);

        let stats = manager.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert!(stats.channels.is_empty());
        assert!(manager.channels_of(&session.id).await.is_empty());
        assert_eq!(manager.broadcast("trends", OutboundMessage::new("note")).await, 0);
        assert!(!manager.disconnect(&session.id, CloseReason::Normal).await);
        assert_eq!(drain(&mut rx).1, Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_rate_limit_threshold() {
        let manager = manager(RealtimeSettings {
            rate_limit_messages: 3,
            ..Default::default()
        });
        let (session, mut rx) = connect(&manager, "general").await;
        drain(&mut rx);

        let pong = r#"{"type":"pong"}"#;
        for _ in 0..3 {
            manager.handle_inbound(&session, pong).await.unwrap();
        }
        assert!(manager.session(&session.id).await.is_some());

        let result = manager.handle_inbound(&session, pong).await;
        assert!(matches!(
            result,
            Err(RealtimeError::RateLimitExceeded { limit: 3, window_secs: 60 })
        ));

        let (messages, closed) = drain(&mut rx);
        assert_eq!(kinds(&messages), vec!["error"]);
        assert_eq!(messages[0].extra["message"], "Rate limit exceeded");
        assert_eq!(messages[0].extra["retry_after"], 60);
        assert_eq!(closed, Some(CloseReason::RateLimited));
        assert!(manager.session(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_expiry_and_answered_pings() {
        let manager = manager(RealtimeSettings::default());
        let (silent, mut silent_rx) = connect(&manager, "general").await;
        let (lively, mut lively_rx) = connect(&manager, "general").await;
        drain(&mut silent_rx);
        drain(&mut lively_rx);

        let start = Instant::now();
        for step in 0..3u64 {
            let now = start + Duration::from_secs(step * 30);
            assert_eq!(manager.sweep_heartbeats(now).await, 0);
            manager
                .handle_inbound(&lively, r#"{"type":"pong","timestamp":"2024-01-01T00:00:00Z"}"#)
                .await
                .unwrap();
        }

        let (pings, _) = drain(&mut silent_rx);
        assert_eq!(kinds(&pings), vec!["ping", "ping", "ping"]);
        assert_eq!(lively.heartbeat_state().await, HeartbeatState::Alive);

        let expired = manager
            .sweep_heartbeats(start + Duration::from_secs(90))
            .await;
        assert_eq!(expired, 1);
        assert_eq!(drain(&mut silent_rx).1, Some(CloseReason::IdleTimeout));
        assert!(manager.session(&silent.id).await.is_none());
        assert!(manager.session(&lively.id).await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let manager = manager(RealtimeSettings::default());
        let (session, mut rx) = connect(&manager, "general").await;
        drain(&mut rx);

        assert!(matches!(
            manager.handle_inbound(&session, "not json").await,
            Err(RealtimeError::MalformedMessage(_))
        ));
        assert!(manager
            .handle_inbound(&session, r#"{"type":"subscribe","channel":""}"#)
            .await
            .is_err());
        manager
            .handle_inbound(&session, r#"{"type":"typing"}"#)
            .await
            .unwrap();

        assert_eq!(manager.metrics().malformed_messages.get(), 2);
        assert!(manager.session(&session.id).await.is_some());
        assert!(drain(&mut rx).1.is_none());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_isolated() {
        let manager = manager(RealtimeSettings {
            send_queue_size: 2,
            ..Default::default()
        });
        let (slow, mut slow_rx) = connect(&manager, "trends").await;
        let (_fast, mut fast_rx) = connect(&manager, "trends").await;

        let mut fast_received = 0;
        for i in 0..5 {
            manager
                .broadcast_trend_update(json!({ "seq": i }))
                .await;
            fast_received += drain(&mut fast_rx)
                .0
                .iter()
                .filter(|m| m.kind.as_str() == "trend_update")
                .count();
        }

        assert_eq!(fast_received, 5);
        assert!(manager.session(&slow.id).await.is_none());
        assert_eq!(drain(&mut slow_rx).1, Some(CloseReason::SlowConsumer));
        assert_eq!(manager.stats().await.channels["trends"], 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_creates_no_session() {
        let manager = ConnectionManager::new(
            RealtimeSettings::default(),
            Arc::new(JwtAuthenticator::new("secret", true)),
            Arc::new(RealtimeMetrics::new().unwrap()),
            None,
            "test-node",
        );

        let (transport, mut rx) = transport_pair(8);
        let result = manager.accept_connection(transport, Some("trends"), None).await;
        assert!(matches!(result, Err(RealtimeError::AuthRejected(_))));
        assert_eq!(rx.try_next(), Some(Outgoing::Close(CloseReason::AuthRejected)));
        assert_eq!(manager.stats().await.total_connections, 0);

        let token = issue_token("secret", "reader-1");
        let (transport, _rx) = transport_pair(8);
        let session = manager
            .accept_connection(transport, Some("trends"), Some(&token))
            .await
            .unwrap();
        assert_eq!(session.identity.user_id.as_deref(), Some("reader-1"));
        assert_eq!(manager.stats().await.users, 1);
    }

    #[tokio::test]
    async fn test_connection_cap() {
        let manager = manager(RealtimeSettings {
            max_connections: 1,
            ..Default::default()
        });
        let (_first, _first_rx) = connect(&manager, "general").await;

        let (transport, mut rx) = transport_pair(8);
        let result = manager.accept_connection(transport, None, None).await;
        assert!(matches!(result, Err(RealtimeError::Overloaded(1))));
        assert_eq!(rx.try_next(), Some(Outgoing::Close(CloseReason::Overloaded)));
    }

    #[tokio::test]
    async fn test_story_update_dual_fanout() {
        let manager = manager(RealtimeSettings::default());
        let (_list, mut list_rx) = connect(&manager, "stories").await;
        let (_detail, mut detail_rx) = connect(&manager, "story:42").await;
        drain(&mut list_rx);
        drain(&mut detail_rx);

        let delivered = manager
            .broadcast_story_update(json!({"id": 42, "title": "Budget vote"}))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut list_rx).0[0].channel.as_deref(), Some("stories"));
        assert_eq!(drain(&mut detail_rx).0[0].channel.as_deref(), Some("story:42"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everyone() {
        let manager = manager(RealtimeSettings::default());
        let (_a, mut a_rx) = connect(&manager, "general").await;
        let (_b, mut b_rx) = connect(&manager, "trends").await;

        manager.shutdown().await;

        assert_eq!(drain(&mut a_rx).1, Some(CloseReason::ServerShutdown));
        assert_eq!(drain(&mut b_rx).1, Some(CloseReason::ServerShutdown));
        assert!(manager.is_shutting_down());

        let (transport, mut rx) = transport_pair(8);
        assert!(manager.accept_connection(transport, None, None).await.is_err());
        assert_eq!(rx.try_next(), Some(Outgoing::Close(CloseReason::ServerShutdown)));
    }

    async fn wait_for_messages(rx: &mut TransportReceiver, count: usize) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while messages.len() < count && Instant::now() < deadline {
            messages.extend(drain(rx).0);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // 再等一会儿，确认没有重复投递
        tokio::time::sleep(Duration::from_millis(50)).await;
        messages.extend(drain(rx).0);
        messages
    }

    #[tokio::test]
    async fn test_two_instances_over_bus() {
        let bus = Arc::new(MemoryBus::default());
        let node_a = clustered(bus.clone(), "node-a");
        let node_b = clustered(bus.clone(), "node-b");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_local, mut local_rx) = connect(&node_a, "trends").await;
        let (_remote, mut remote_rx) = connect(&node_b, "trends").await;
        drain(&mut local_rx);
        drain(&mut remote_rx);

        let delivered = node_a
            .broadcast_trend_update(json!({"topic": "climate"}))
            .await;
        assert_eq!(delivered, 1);

        let remote = wait_for_messages(&mut remote_rx, 1).await;
        let local = wait_for_messages(&mut local_rx, 1).await;
        assert_eq!(kinds(&remote), vec!["trend_update"]);
        assert_eq!(kinds(&local), vec!["trend_update"]);
        assert!(node_a.stats().await.bus_connected);

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_trust_score_exactly_once_across_instances() {
        let bus = Arc::new(MemoryBus::default());
        let node_a = clustered(bus.clone(), "node-a");
        let node_b = clustered(bus.clone(), "node-b");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_scores, mut scores_rx) = connect(&node_a, "trust_scores").await;
        let (_story, mut story_rx) = connect(&node_b, "story:42").await;
        drain(&mut scores_rx);
        drain(&mut story_rx);

        node_a
            .broadcast_trust_score_update("42", 0.87, vec![json!({"name": "source_quality"})])
            .await;

        let scores = wait_for_messages(&mut scores_rx, 1).await;
        let story = wait_for_messages(&mut story_rx, 1).await;
        assert_eq!(scores.len(), 1);
        assert_eq!(story.len(), 1);
        assert_eq!(story[0].story_id.as_deref(), Some("42"));
        assert_eq!(story[0].trust_score, Some(0.87));
        assert_eq!(story[0].channel.as_deref(), Some("story:42"));

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_bus_outage_keeps_local_delivery() {
        let bus = Arc::new(MemoryBus::default());
        let node = clustered(bus.clone(), "node-a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.set_available(false);

        let (_session, mut rx) = connect(&node, "trends").await;
        drain(&mut rx);

        assert_eq!(node.broadcast_trend_update(json!({})).await, 1);
        assert_eq!(drain(&mut rx).0.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.metrics().bus_publish_failures.get(), 1);
        assert!(!node.stats().await.bus_connected);

        node.shutdown().await;
    }
}
