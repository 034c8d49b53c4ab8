/// 共享连接控制器
///
/// 每个客户端上下文只持有一条物理连接，多个逻辑订阅在其上复用。
/// 控制器构造一次，克隆后分发给各个使用方。

use common::{CloseReason, ControlMessage, MessageKind, OutboundMessage};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::error::ClientError;
use crate::handlers::{Handler, HandlerTable};
use crate::transport::{Connector, InboundFrame, TransportPair};

/// 连接进入 CLOSED 的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    MaxAttemptsExhausted,
    AuthFailed,
    Shutdown,
}

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting { attempt: u32 },
    Open,
    Reconnecting { attempt: u32, delay: Duration },
    Closed { reason: ClosedReason },
}

/// 面向界面的状态指示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Reconnecting,
    Offline,
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Open => ConnectionStatus::Online,
            Self::Connecting { .. } | Self::Reconnecting { .. } => ConnectionStatus::Reconnecting,
            Self::Idle | Self::Closed { .. } => ConnectionStatus::Offline,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// 一次连接结束的方式
enum SessionEnd {
    Cancelled,
    Dropped,
    AuthRejected,
}

/// 处理函数表与当前连接的写端，在同一把锁下修改
#[derive(Default)]
struct Slot {
    handlers: HandlerTable,
    /// 仅在 OPEN 时存在
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Runner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    /// 当前有效的运行代数，过期的运行任务不能修改状态
    generation: Mutex<u64>,
    runner: Mutex<Option<Runner>>,
    root: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 共享连接句柄
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Inner>,
}

impl SharedConnection {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                slot: Mutex::new(Slot::default()),
                state_tx,
                generation: Mutex::new(0),
                runner: Mutex::new(None),
                root: CancellationToken::new(),
            }),
        }
    }

    /// 开始连接；已在连接或已打开时无操作
    pub fn connect(&self) {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Closed { .. } => self.reconnect(),
            _ => debug!("连接已在运行，忽略 connect"),
        }
    }

    /// 手动重连：取消当前运行任务并从头开始计数
    pub fn reconnect(&self) {
        if self.inner.root.is_cancelled() {
            warn!("控制器已关闭，忽略重连请求");
            return;
        }

        let (generation, token) = {
            let mut gen = lock(&self.inner.generation);
            *gen += 1;
            (*gen, self.inner.root.child_token())
        };
        lock(&self.inner.slot).outbound = None;

        let inner = self.inner.clone();
        let runner_token = token.clone();
        let handle = tokio::spawn(async move {
            inner.run(generation, runner_token).await;
        });

        if let Some(previous) = lock(&self.inner.runner).replace(Runner { token, handle }) {
            previous.token.cancel();
        }
        info!("🔄 启动连接任务 (generation={})", generation);
    }

    /// 注册或替换频道处理函数
    ///
    /// 新频道在连接打开时立即订阅，否则在下次打开时订阅
    pub fn subscribe<F>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(&OutboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let channel = channel.into();
        let handler: Handler = Arc::new(handler);

        let mut slot = lock(&self.inner.slot);
        let added = slot.handlers.insert(channel.clone(), handler);
        if added {
            if let Some(outbound) = &slot.outbound {
                send_control(outbound, &ControlMessage::subscribe(channel.clone()));
            }
        }
        debug!("注册频道处理函数: {} (new={})", channel, added);
    }

    /// 移除频道处理函数，重复调用无副作用
    pub fn unsubscribe(&self, channel: &str) -> bool {
        let mut slot = lock(&self.inner.slot);
        let removed = slot.handlers.remove(channel);
        if removed {
            if let Some(outbound) = &slot.outbound {
                send_control(outbound, &ControlMessage::unsubscribe(channel));
            }
        }
        removed
    }

    /// 发送控制消息；连接未打开时返回 false
    pub fn send(&self, message: &ControlMessage) -> bool {
        let slot = lock(&self.inner.slot);
        match &slot.outbound {
            Some(outbound) => send_control(outbound, message),
            None => {
                warn!("{}", ClientError::NotConnected);
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.inner.slot).handlers.channels()
    }

    /// 取消所有任务，关闭连接并等待运行任务退出
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        {
            let mut gen = lock(&self.inner.generation);
            *gen += 1;
            self.inner.state_tx.send_replace(ConnectionState::Closed {
                reason: ClosedReason::Shutdown,
            });
        }
        lock(&self.inner.slot).outbound = None;

        let runner = lock(&self.inner.runner).take();
        if let Some(runner) = runner {
            runner.token.cancel();
            if let Err(e) = runner.handle.await {
                warn!("连接任务异常退出: {}", e);
            }
        }
        info!("🛑 共享连接已关闭");
    }
}

impl Inner {
    /// 仅当代数仍有效时更新状态
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let gen = lock(&self.generation);
        if *gen != generation {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    /// 进入 OPEN：登记写端并重新订阅所有频道
    fn open(&self, generation: u64, outbound: &mpsc::UnboundedSender<String>) -> bool {
        let gen = lock(&self.generation);
        if *gen != generation {
            return false;
        }

        let mut slot = lock(&self.slot);
        slot.outbound = Some(outbound.clone());
        let channels = slot.handlers.channels();
        for channel in &channels {
            send_control(outbound, &ControlMessage::subscribe(channel.clone()));
        }
        self.state_tx.send_replace(ConnectionState::Open);
        drop(slot);
        drop(gen);

        info!("✅ 连接已打开，重新订阅 {} 个频道", channels.len());
        true
    }

    fn release(&self, generation: u64) {
        let gen = lock(&self.generation);
        if *gen == generation {
            lock(&self.slot).outbound = None;
        }
    }

    async fn run(&self, generation: u64, token: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            if !self.set_state(generation, ConnectionState::Connecting { attempt: failures + 1 }) {
                return;
            }

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.connector.connect() => result,
            };

            match result {
                Ok(pair) => {
                    failures = 0;
                    match self.run_session(generation, &token, pair).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::AuthRejected => {
                            warn!("❌ 服务端拒绝认证，停止重连");
                            self.set_state(
                                generation,
                                ConnectionState::Closed { reason: ClosedReason::AuthFailed },
                            );
                            return;
                        }
                        SessionEnd::Dropped => {
                            warn!("连接已断开，准备重连");
                        }
                    }
                }
                Err(ClientError::AuthFailed(msg)) => {
                    warn!("❌ 认证失败，停止重连: {}", msg);
                    self.set_state(
                        generation,
                        ConnectionState::Closed { reason: ClosedReason::AuthFailed },
                    );
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!("连接失败 ({}/{}): {}", failures, self.policy.max_attempts, e);
                    if failures >= self.policy.max_attempts {
                        error!("连续 {} 次连接失败，停止自动重连", failures);
                        self.set_state(
                            generation,
                            ConnectionState::Closed { reason: ClosedReason::MaxAttemptsExhausted },
                        );
                        return;
                    }
                }
            }

            let delay = self.policy.jittered_delay(failures);
            if !self.set_state(
                generation,
                ConnectionState::Reconnecting { attempt: failures + 1, delay },
            ) {
                return;
            }
            debug!("{:?} 后重新连接", delay);

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        generation: u64,
        token: &CancellationToken,
        pair: TransportPair,
    ) -> SessionEnd {
        let TransportPair { outbound, mut inbound } = pair;

        if !self.open(generation, &outbound) {
            return SessionEnd::Cancelled;
        }

        let end = loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break SessionEnd::Cancelled,
                frame = inbound.recv() => frame,
            };

            match frame {
                Some(InboundFrame::Text(text)) => self.route(&text, &outbound),
                Some(InboundFrame::Closed(code)) => match code.and_then(CloseReason::from_code) {
                    Some(CloseReason::AuthRejected) => break SessionEnd::AuthRejected,
                    Some(reason) => {
                        info!("服务端关闭连接: {} ({})", reason, reason.code());
                        break SessionEnd::Dropped;
                    }
                    None => {
                        info!("服务端关闭连接: code={:?}", code);
                        break SessionEnd::Dropped;
                    }
                },
                None => break SessionEnd::Dropped,
            }
        };

        self.release(generation);
        end
    }

    /// 路由一条下行消息，处理函数在接收循环内同步执行
    fn route(&self, text: &str, outbound: &mpsc::UnboundedSender<String>) {
        let message = match OutboundMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("丢弃无法解析的消息: {}", e);
                return;
            }
        };

        if message.kind == MessageKind::Ping {
            send_control(outbound, &ControlMessage::pong());
            return;
        }

        let found = lock(&self.slot).handlers.lookup(&message);
        let Some((channel, handler)) = found else {
            debug!("没有匹配的处理函数: {}", message.routing_key());
            return;
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&message)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "处理函数 panic".to_string(),
        };
        warn!("{}", ClientError::Handler { channel, message: failure });
    }
}

fn send_control(outbound: &mpsc::UnboundedSender<String>, message: &ControlMessage) -> bool {
    match message.to_json() {
        Ok(json) => outbound.send(json).is_ok(),
        Err(e) => {
            warn!("序列化控制消息失败: {}", e);
            false
        }
    }
}
