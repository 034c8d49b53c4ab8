/// 实时 WebSocket 连接处理器
///
/// 每条连接拆成发送 / 接收两个任务，任一结束即清理会话

use axum::extract::ws::{CloseFrame, Message as AxumWsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use common::protocol::{story_channel, STORIES_CHANNEL, TRENDS_CHANNEL, TRUST_SCORES_CHANNEL};
use common::CloseReason;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::manager::ConnectionManager;
use super::transport::{transport_pair, Outgoing, TransportReceiver};
use crate::app_state::AppState;

/// 连接参数
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub channel: Option<String>,
    pub token: Option<String>,
}

/// 频道别名端点只接受令牌参数
#[derive(Debug, Default, Deserialize)]
pub struct TokenParams {
    pub token: Option<String>,
}

/// `GET /ws/connect?channel=<name>&token=<jwt>`
pub async fn handle_connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params.token.or_else(|| token_from_headers(&headers));
    upgrade(ws, state, params.channel, token)
}

/// `GET /ws/trends`
pub async fn handle_trends_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params.token.or_else(|| token_from_headers(&headers));
    upgrade(ws, state, Some(TRENDS_CHANNEL.to_string()), token)
}

/// `GET /ws/stories`
pub async fn handle_stories_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params.token.or_else(|| token_from_headers(&headers));
    upgrade(ws, state, Some(STORIES_CHANNEL.to_string()), token)
}

/// `GET /ws/stories/:story_id`
pub async fn handle_story_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(story_id): Path<String>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params.token.or_else(|| token_from_headers(&headers));
    upgrade(ws, state, Some(story_channel(&story_id)), token)
}

/// `GET /ws/trust-scores`
pub async fn handle_trust_scores_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<TokenParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = params.token.or_else(|| token_from_headers(&headers));
    upgrade(ws, state, Some(TRUST_SCORES_CHANNEL.to_string()), token)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    channel: Option<String>,
    token: Option<String>,
) -> axum::response::Response {
    let manager = state.manager();
    ws.on_upgrade(move |socket| handle_socket(socket, manager, channel, token))
}

/// 从 `Authorization: Bearer` 或 `token` 头读取令牌
fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }

    headers
        .get("token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// 处理一条 WebSocket 连接
async fn handle_socket(
    socket: WebSocket,
    manager: Arc<ConnectionManager>,
    channel: Option<String>,
    token: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (transport, mut outgoing) = transport_pair(manager.settings().send_queue_size);

    let session = match manager
        .accept_connection(transport, channel.as_deref(), token.as_deref())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            info!("拒绝 WebSocket 连接: {}", e);
            // 传输已携带关闭原因，写出关闭帧即可
            if let Some(Outgoing::Close(reason)) = outgoing.next().await {
                let _ = ws_sender.send(close_message(reason)).await;
            }
            return;
        }
    };
    let session_id = session.id.clone();

    // 消息发送任务
    let mut send_task = tokio::spawn(async move {
        pump_outgoing(&mut ws_sender, &mut outgoing).await;
        debug!("会话发送任务结束");
    });

    // 消息接收任务
    let recv_manager = manager.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(AxumWsMessage::Text(text)) => {
                    debug!("收到上行消息: session={}, {}", recv_session.id, text);
                    if let Err(e) = recv_manager.handle_inbound(&recv_session, &text).await {
                        debug!("上行消息未处理: session={}, {}", recv_session.id, e);
                    }
                    if recv_session.is_removed() {
                        break;
                    }
                }
                Ok(AxumWsMessage::Close(frame)) => {
                    debug!("客户端关闭连接: session={}, frame={:?}", recv_session.id, frame);
                    break;
                }
                Ok(AxumWsMessage::Binary(data)) => {
                    debug!("忽略二进制消息: {} bytes", data.len());
                }
                Ok(_) => {
                    recv_session.touch().await;
                }
                Err(e) => {
                    warn!("接收 WebSocket 消息错误: session={}, {}", recv_session.id, e);
                    break;
                }
            }
        }
        debug!("会话接收任务结束");
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            // 对端已断开，让发送任务写出关闭帧后退出
            manager.disconnect(&session_id, CloseReason::Normal).await;
            if tokio::time::timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }

    manager.disconnect(&session_id, CloseReason::Normal).await;
    info!("WebSocket 连接已关闭: {}", session_id);
}

async fn pump_outgoing(
    sender: &mut SplitSink<WebSocket, AxumWsMessage>,
    outgoing: &mut TransportReceiver,
) {
    while let Some(item) = outgoing.next().await {
        match item {
            Outgoing::Frame(frame) => {
                if let Err(e) = sender.send(AxumWsMessage::Text(frame.to_string())).await {
                    debug!("发送 WebSocket 消息失败: {}", e);
                    break;
                }
            }
            Outgoing::Close(reason) => {
                let _ = sender.send(close_message(reason)).await;
                break;
            }
        }
    }
}

fn close_message(reason: CloseReason) -> AxumWsMessage {
    AxumWsMessage::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Cow::Borrowed(reason.reason()),
    }))
}
