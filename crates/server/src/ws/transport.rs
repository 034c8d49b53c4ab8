/// 会话传输句柄
///
/// 连接管理器只通过有界队列和关闭信号接触传输层，真正的 socket 写入由
/// 每个连接的发送任务完成

use common::CloseReason;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 发送失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// 发送队列已满（慢消费者）
    Full,
    /// 传输已关闭
    Closed,
}

/// 发送任务从队列中取出的下一个动作
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(Arc<str>),
    Close(CloseReason),
}

/// 写端：由会话持有
#[derive(Clone)]
pub struct SessionTransport {
    frames: mpsc::Sender<Arc<str>>,
    shutdown: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

/// 读端：由连接的发送任务持有
pub struct TransportReceiver {
    frames: mpsc::Receiver<Arc<str>>,
    shutdown: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
    finished: bool,
}

/// 创建一对传输句柄
pub fn transport_pair(capacity: usize) -> (SessionTransport, TransportReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shutdown = CancellationToken::new();
    let close_reason = Arc::new(OnceLock::new());

    (
        SessionTransport {
            frames: tx,
            shutdown: shutdown.clone(),
            close_reason: close_reason.clone(),
        },
        TransportReceiver {
            frames: rx,
            shutdown,
            close_reason,
            finished: false,
        },
    )
}

impl SessionTransport {
    /// 非阻塞入队
    pub fn try_send(&self, frame: Arc<str>) -> Result<(), SendFailure> {
        if self.shutdown.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// 请求关闭传输，首个关闭原因生效
    ///
    /// 返回本次调用是否确定了关闭原因
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        self.shutdown.cancel();
        first
    }
}

impl TransportReceiver {
    /// 等待下一个发送动作，返回 `None` 表示已结束
    pub async fn next(&mut self) -> Option<Outgoing> {
        if self.finished {
            return None;
        }
        if self.shutdown.is_cancelled() {
            return Some(self.drain_then_close());
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Some(self.drain_then_close()),
            frame = self.frames.recv() => match frame {
                Some(frame) => Some(Outgoing::Frame(frame)),
                None => {
                    self.finished = true;
                    None
                }
            },
        }
    }

    /// 非阻塞版本
    pub fn try_next(&mut self) -> Option<Outgoing> {
        if self.finished {
            return None;
        }
        if self.shutdown.is_cancelled() {
            return Some(self.drain_then_close());
        }
        self.frames.try_recv().ok().map(Outgoing::Frame)
    }

    /// 关闭前先送出已入队的帧；慢消费者直接关闭
    fn drain_then_close(&mut self) -> Outgoing {
        let reason = self.close_reason.get().copied().unwrap_or(CloseReason::Normal);
        if reason != CloseReason::SlowConsumer {
            if let Ok(frame) = self.frames.try_recv() {
                return Outgoing::Frame(frame);
            }
        }
        self.finished = true;
        Outgoing::Close(reason)
    }
}
