/// 连接会话
///
/// 一个会话对应一条已通过认证的 WebSocket 连接

use chrono::{DateTime, Utc};
use common::CloseReason;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::transport::{SendFailure, SessionTransport};
use crate::auth::Identity;

/// 心跳状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Alive,
    /// 已发出 ping，记录第一个未应答 ping 的时间
    AwaitingPong { since: Instant },
    Closed,
}

/// 心跳巡检给出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    Wait,
    Expire,
}

#[derive(Debug)]
pub struct HeartbeatTracker {
    state: HeartbeatState,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self {
            state: HeartbeatState::Alive,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// 每个 ping 周期调用一次
    ///
    /// 等待 pong 期间每个周期重发 ping，超时从第一个未应答的 ping 起算
    pub fn on_tick(&mut self, now: Instant, pong_timeout: Duration) -> HeartbeatAction {
        match self.state {
            HeartbeatState::Alive => {
                self.state = HeartbeatState::AwaitingPong { since: now };
                HeartbeatAction::SendPing
            }
            HeartbeatState::AwaitingPong { since } => {
                if now.saturating_duration_since(since) >= pong_timeout {
                    self.state = HeartbeatState::Closed;
                    HeartbeatAction::Expire
                } else {
                    HeartbeatAction::SendPing
                }
            }
            HeartbeatState::Closed => HeartbeatAction::Wait,
        }
    }

    pub fn on_pong(&mut self) {
        if self.state != HeartbeatState::Closed {
            self.state = HeartbeatState::Alive;
        }
    }
}

/// 固定窗口计数器
#[derive(Debug)]
pub struct RateWindow {
    limit: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    pub fn new(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            count: 0,
            window_start: now,
        }
    }

    /// 记录一条消息，返回是否仍在限额内
    pub fn record(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// 会话
pub struct Session {
    pub id: String,
    pub identity: Identity,
    /// 建立连接时请求的频道
    pub primary_channel: String,
    pub connected_at: DateTime<Utc>,
    transport: SessionTransport,
    heartbeat: Mutex<HeartbeatTracker>,
    rate: Mutex<RateWindow>,
    last_activity: Mutex<Instant>,
    removed: AtomicBool,
}

impl Session {
    pub fn new(
        id: String,
        identity: Identity,
        primary_channel: String,
        transport: SessionTransport,
        rate_limit: u32,
        rate_window: Duration,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            identity,
            primary_channel,
            connected_at: Utc::now(),
            transport,
            heartbeat: Mutex::new(HeartbeatTracker::new()),
            rate: Mutex::new(RateWindow::new(rate_limit, rate_window, now)),
            last_activity: Mutex::new(now),
            removed: AtomicBool::new(false),
        })
    }

    /// 非阻塞入队一帧
    pub fn send_frame(&self, frame: Arc<str>) -> Result<(), SendFailure> {
        self.transport.try_send(frame)
    }

    /// 关闭底层传输
    pub fn close(&self, reason: CloseReason) -> bool {
        self.transport.close(reason)
    }

    /// 更新最后活跃时间
    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn last_activity(&self) -> Instant {
        *self.last_activity.lock().await
    }

    /// 计入一条客户端上行消息，超限时返回 false
    pub async fn record_message(&self, now: Instant) -> bool {
        self.rate.lock().await.record(now)
    }

    pub async fn heartbeat_tick(&self, now: Instant, pong_timeout: Duration) -> HeartbeatAction {
        self.heartbeat.lock().await.on_tick(now, pong_timeout)
    }

    pub async fn on_pong(&self) {
        self.heartbeat.lock().await.on_pong();
    }

    pub async fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat.lock().await.state()
    }

    /// 标记为已移除，只有第一次调用返回 true
    pub fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("primary_channel", &self.primary_channel)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
