/// 连接统计接口

use axum::{extract::State, routing::get, Json, Router};

use crate::app_state::AppState;
use crate::ws::RealtimeStats;

/// 创建路由
pub fn routes() -> Router<AppState> {
    Router::new().route("/stats", get(get_stats))
}

/// 获取连接统计
async fn get_stats(State(state): State<AppState>) -> Json<RealtimeStats> {
    Json(state.manager.stats().await)
}
