/// 消息编解码辅助函数（tungstenite 帧）

use std::borrow::Cow;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::CloseReason;
use crate::{Error, Result};

/// 解码后的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON 文本
    Text(String),
    /// 关闭帧及关闭码
    Close(Option<u16>),
    /// 协议层 ping/pong 等无需上层处理的帧
    Ignored,
}

/// 构造关闭帧
pub fn close_message(reason: CloseReason) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: Cow::Borrowed(reason.reason()),
    }))
}

/// 解码 WebSocket 帧
pub fn decode(ws_msg: WsMessage) -> Result<Frame> {
    match ws_msg {
        WsMessage::Text(text) => Ok(Frame::Text(text)),
        WsMessage::Binary(data) => String::from_utf8(data)
            .map(Frame::Text)
            .map_err(|e| Error::MalformedMessage(format!("二进制帧不是 UTF-8: {}", e))),
        WsMessage::Close(frame) => Ok(Frame::Close(frame.map(|f| u16::from(f.code)))),
        _ => Ok(Frame::Ignored),
    }
}
