/// 连接建立
///
/// 控制器只面向一对消息通道，具体的 WebSocket 读写由这里的后台任务完成

use async_trait::async_trait;
use common::protocol::codec::{self, Frame};
use common::CloseReason;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// 收到的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// 连接关闭及关闭码
    Closed(Option<u16>),
}

/// 一条已建立的连接
///
/// 丢弃 `outbound` 即关闭连接
pub struct TransportPair {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<TransportPair, ClientError>;
}

/// 基于 tokio-tungstenite 的连接器
pub struct WsConnector {
    url: String,
    channel: Option<String>,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, channel: Option<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            channel,
            token,
        }
    }

    /// 拼接 `channel` 查询参数，令牌只放在 `Authorization` 头中
    pub fn endpoint(&self) -> String {
        match &self.channel {
            Some(channel) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}channel={}", self.url, sep, urlencoding::encode(channel))
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<TransportPair, ClientError> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response)
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
            {
                ClientError::AuthFailed(format!("握手被拒绝: {}", response.status()))
            }
            other => ClientError::ConnectFailed(other.to_string()),
        })?;
        info!("✅ WebSocket 连接成功: {}", self.url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // 发送任务：通道关闭时发送正常关闭帧
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    debug!("发送消息失败: {}", e);
                    return;
                }
            }
            let _ = ws_sender.send(codec::close_message(CloseReason::Normal)).await;
            debug!("发送任务结束");
        });

        // 接收任务
        tokio::spawn(async move {
            let mut close_code = None;
            while let Some(result) = ws_receiver.next().await {
                let msg = match result {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("接收消息错误: {}", e);
                        break;
                    }
                };
                match codec::decode(msg) {
                    Ok(Frame::Text(text)) => {
                        if inbound_tx.send(InboundFrame::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Frame::Close(code)) => {
                        close_code = code;
                        break;
                    }
                    Ok(Frame::Ignored) => {}
                    Err(e) => warn!("丢弃无法解码的帧: {}", e),
                }
            }
            let _ = inbound_tx.send(InboundFrame::Closed(close_code));
            debug!("接收任务结束");
        });

        Ok(TransportPair {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_query() {
        let plain = WsConnector::new("ws://localhost:8000/ws/connect", None, None);
        assert_eq!(plain.endpoint(), "ws://localhost:8000/ws/connect");

        let full = WsConnector::new(
            "ws://localhost:8000/ws/connect",
            Some("trends".to_string()),
            Some("abc".to_string()),
        );
        assert_eq!(full.endpoint(), "ws://localhost:8000/ws/connect?channel=trends");

        let story = WsConnector::new(
            "ws://localhost:8000/ws/connect?v=1",
            Some("story:a b&c".to_string()),
            None,
        );
        assert_eq!(
            story.endpoint(),
            "ws://localhost:8000/ws/connect?v=1&channel=story%3Aa%20b%26c"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connect_failure() {
        let connector = WsConnector::new("ws://127.0.0.1:1/ws/connect", None, None);
        assert!(matches!(
            connector.connect().await,
            Err(ClientError::ConnectFailed(_))
        ));
    }
}
