/// Pulsewire - Server
///
/// 实时推送服务：WebSocket 频道订阅、心跳、限流，以及经总线的跨实例广播

mod api;
mod app_state;
mod auth;
mod bus;
mod config;
mod metrics;
mod ws;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    api::ApiError,
    app_state::AppState,
    auth::{AllowAnonymous, Authenticator, JwtAuthenticator},
    bus::PubSubBus,
    metrics::RealtimeMetrics,
    ws::ConnectionManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    info!("🚀 启动 Pulsewire Server...");

    // 加载配置
    let cfg = config::Config::from_env()?;
    info!("✅ 配置加载成功");

    let metrics = Arc::new(RealtimeMetrics::new()?);

    // 认证
    let authenticator: Arc<dyn Authenticator> = if cfg.jwt_secret.is_empty() {
        if cfg.require_websocket_auth {
            anyhow::bail!("REQUIRE_WEBSOCKET_AUTH=true 时必须配置 JWT_SECRET");
        }
        Arc::new(AllowAnonymous)
    } else {
        Arc::new(JwtAuthenticator::new(&cfg.jwt_secret, cfg.require_websocket_auth))
    };
    info!("✅ WebSocket 认证: required={}", cfg.require_websocket_auth);

    // 总线
    let bus = build_bus(&cfg)?;

    // 初始化连接管理器
    let manager = ConnectionManager::new(
        cfg.realtime_settings(),
        authenticator,
        metrics,
        bus,
        instance_id(),
    );
    manager.start();
    info!("✅ 连接管理器初始化成功: instance={}", manager.instance_id());

    let app = build_router(AppState::new(manager.clone()));

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    info!("👋 服务已停止");
    Ok(())
}

/// 构建应用路由
pub fn build_router(state: AppState) -> Router {
    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/connect", get(ws::handle_connect))
        .route("/ws/trends", get(ws::handle_trends_socket))
        .route("/ws/stories", get(ws::handle_stories_socket))
        .route("/ws/stories/:story_id", get(ws::handle_story_socket))
        .route("/ws/trust-scores", get(ws::handle_trust_scores_socket))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(feature = "redis")]
fn build_bus(cfg: &config::Config) -> anyhow::Result<Option<Arc<dyn PubSubBus>>> {
    match &cfg.redis_url {
        Some(url) => {
            let bus = bus::RedisBus::new(url, cfg.bus_topic.clone())?;
            info!("✅ 使用 Redis 总线: topic={}", cfg.bus_topic);
            Ok(Some(Arc::new(bus)))
        }
        None => {
            info!("未配置 REDIS_URL，使用进程内总线（单实例）");
            Ok(Some(Arc::new(bus::MemoryBus::default())))
        }
    }
}

#[cfg(not(feature = "redis"))]
fn build_bus(cfg: &config::Config) -> anyhow::Result<Option<Arc<dyn PubSubBus>>> {
    if cfg.redis_url.is_some() {
        warn!(
            "已配置 REDIS_URL，但未启用 redis 特性，主题 {} 仅在进程内转发",
            cfg.bus_topic
        );
    }
    Ok(Some(Arc::new(bus::MemoryBus::default())))
}

/// 实例 ID：主机名 + 随机后缀
fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

async fn shutdown_signal(manager: Arc<ConnectionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，正在关闭所有连接...");
    manager.shutdown().await;
}

async fn root_handler() -> &'static str {
    "Pulsewire Realtime Server v1"
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.manager.metrics().render()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
