/// 总线桥接
///
/// 一个发布任务按入队顺序写入总线，一个监听任务把远端信封交回连接管理器

use common::OutboundMessage;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusEnvelope, BusError, PubSubBus};
use crate::metrics::RealtimeMetrics;
use crate::ws::RealtimeError;

/// 桥接参数
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// 订阅断开后的重试间隔
    pub retry_interval: Duration,
    /// 待发布队列容量，队列满时丢弃新消息
    pub outbox_size: usize,
    /// 单次发布的超时
    pub publish_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            outbox_size: 10000,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

pub struct BusBridge {
    bus: Arc<dyn PubSubBus>,
    instance_id: String,
    settings: BridgeSettings,
    metrics: Arc<RealtimeMetrics>,
    connected: Arc<AtomicBool>,
    outbox: mpsc::Sender<BusEnvelope>,
    outbox_rx: Mutex<Option<mpsc::Receiver<BusEnvelope>>>,
}

impl BusBridge {
    pub fn new(
        bus: Arc<dyn PubSubBus>,
        instance_id: impl Into<String>,
        settings: BridgeSettings,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        let (outbox, outbox_rx) = mpsc::channel(settings.outbox_size.max(1));
        Self {
            bus,
            instance_id: instance_id.into(),
            settings,
            metrics,
            connected: Arc::new(AtomicBool::new(false)),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
        }
    }

    pub fn bus_name(&self) -> &'static str {
        self.bus.name()
    }

    /// 最近一次总线操作是否成功
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// 入队待发布的消息，不阻塞
    pub fn publish(&self, channel: &str, message: &OutboundMessage) {
        let envelope = BusEnvelope::new(self.instance_id.clone(), channel, message.clone());
        match self.outbox.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.bus_publish_failures.inc();
                self.connected.store(false, Ordering::Release);
                warn!("总线发布队列已满，丢弃消息，仅在本地投递: channel={}", channel);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.bus_publish_failures.inc();
                warn!("总线发布任务已停止，消息仅在本地投递: channel={}", channel);
            }
        }
    }

    /// 启动发布与监听任务，返回远端信封接收端
    ///
    /// 只能启动一次，重复调用返回 `None`
    pub fn start(&self, shutdown: CancellationToken) -> Option<mpsc::UnboundedReceiver<BusEnvelope>> {
        let outbox_rx = self.outbox_rx.lock().ok()?.take()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_publisher(
            self.bus.clone(),
            outbox_rx,
            self.settings.publish_timeout,
            self.metrics.clone(),
            self.connected.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_listener(
            self.bus.clone(),
            self.instance_id.clone(),
            self.settings.retry_interval,
            inbound_tx,
            self.metrics.clone(),
            self.connected.clone(),
            shutdown,
        ));

        info!("🚌 总线桥接已启动: bus={}, instance={}", self.bus.name(), self.instance_id);
        Some(inbound_rx)
    }
}

async fn run_publisher(
    bus: Arc<dyn PubSubBus>,
    mut outbox: mpsc::Receiver<BusEnvelope>,
    publish_timeout: Duration,
    metrics: Arc<RealtimeMetrics>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            envelope = outbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let result = match tokio::time::timeout(publish_timeout, bus.publish(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(publish_timeout)),
        };

        match result {
            Ok(()) => {
                connected.store(true, Ordering::Release);
                debug!("已发布到总线: channel={}", envelope.channel);
            }
            Err(e) => {
                connected.store(false, Ordering::Release);
                metrics.bus_publish_failures.inc();
                warn!(
                    "发布到总线失败，本地投递不受影响: channel={}, {}",
                    envelope.channel,
                    RealtimeError::BusUnavailable(e)
                );
            }
        }
    }
    debug!("总线发布任务结束");
}

async fn run_listener(
    bus: Arc<dyn PubSubBus>,
    instance_id: String,
    retry_interval: Duration,
    inbound: mpsc::UnboundedSender<BusEnvelope>,
    metrics: Arc<RealtimeMetrics>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match bus.subscribe().await {
            Ok(mut stream) => {
                connected.store(true, Ordering::Release);
                info!("📡 已订阅总线: {}", bus.name());

                loop {
                    let envelope = tokio::select! {
                        _ = shutdown.cancelled() => {
                            debug!("总线监听任务结束");
                            return;
                        }
                        envelope = stream.next() => envelope,
                    };

                    let Some(envelope) = envelope else {
                        break;
                    };

                    // 本实例发布的消息已在本地投递过
                    if envelope.origin == instance_id {
                        continue;
                    }

                    metrics.bus_messages_received.inc();
                    if inbound.send(envelope).is_err() {
                        debug!("连接管理器已停止接收总线消息");
                        return;
                    }
                }

                connected.store(false, Ordering::Release);
                warn!("总线订阅已断开，{:?} 后重试", retry_interval);
            }
            Err(e) => {
                connected.store(false, Ordering::Release);
                warn!("订阅总线失败，{:?} 后重试: {}", retry_interval, e);
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
    debug!("总线监听任务结束");
}
