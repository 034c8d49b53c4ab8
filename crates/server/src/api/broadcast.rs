/// 生产者广播接口
///
/// 进程外的生产者（数据管道、评分任务）通过这些接口把事件推送给订阅者

use axum::{extract::State, routing::post, Json, Router};
use common::OutboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::ApiError;
use crate::app_state::AppState;

/// 任意频道广播请求
#[derive(Debug, Deserialize, Validate)]
pub struct BroadcastRequest {
    #[validate(length(min = 1, max = 128))]
    pub channel: String,
    pub message: OutboundMessage,
}

/// 趋势 / 报道事件
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub data: Value,
}

/// 可信度评分事件
#[derive(Debug, Deserialize, Validate)]
pub struct TrustScoreRequest {
    #[validate(length(min = 1))]
    pub story_id: String,
    #[validate(range(min = 0.0, max = 100.0))]
    pub trust_score: f64,
    #[serde(default)]
    pub signals: Vec<Value>,
}

/// 广播结果
#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    /// 本实例投递数，其他实例经总线转发
    pub delivered: usize,
}

/// 创建路由
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(broadcast))
        .route("/trends", post(broadcast_trends))
        .route("/stories", post(broadcast_stories))
        .route("/trust-scores", post(broadcast_trust_scores))
}

async fn broadcast(
    State(state): State<AppState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    req.validate()?;
    let channel = req.channel.trim();
    if channel.is_empty() {
        return Err(ApiError::BadRequest("频道名不能为空".to_string()));
    }

    let delivered = state.manager.broadcast(channel, req.message).await;
    Ok(Json(BroadcastResponse { delivered }))
}

async fn broadcast_trends(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> Json<BroadcastResponse> {
    let delivered = state.manager.broadcast_trend_update(req.data).await;
    Json(BroadcastResponse { delivered })
}

async fn broadcast_stories(
    State(state): State<AppState>,
    Json(req): Json<EventRequest>,
) -> Json<BroadcastResponse> {
    let delivered = state.manager.broadcast_story_update(req.data).await;
    Json(BroadcastResponse { delivered })
}

async fn broadcast_trust_scores(
    State(state): State<AppState>,
    Json(req): Json<TrustScoreRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    req.validate()?;
    let delivered = state
        .manager
        .broadcast_trust_score_update(&req.story_id, req.trust_score, req.signals)
        .await;
    Ok(Json(BroadcastResponse { delivered }))
}
