/// Pulsewire - 实时监控
///
/// 订阅配置的频道，打印收到的事件与连接状态变化

use std::sync::Arc;
use tracing::{info, warn};

use client::{ClientConfig, ConnectionStatus, SharedConnection, WsConnector};

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
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("🚀 启动 Pulsewire 实时监控...");

    let cfg = ClientConfig::from_env()?;
    info!("✅ 配置加载成功: {}", cfg.ws_url);

    let connector = Arc::new(WsConnector::new(
        cfg.ws_url.clone(),
        cfg.channel.clone(),
        cfg.token.clone(),
    ));
    let connection = SharedConnection::new(connector, cfg.reconnect.clone());

    for channel in &cfg.monitor_channels {
        let name = channel.clone();
        connection.subscribe(channel.clone(), move |msg| {
            info!(
                "📨 [{}] type={} story_id={:?} trust_score={:?} data={}",
                name,
                msg.kind,
                msg.story_id,
                msg.trust_score,
                msg.data
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default()
            );
            Ok(())
        });
    }
    info!("📡 已注册 {} 个频道: {:?}", cfg.monitor_channels.len(), cfg.monitor_channels);

    // 状态变化日志
    let mut states = connection.watch_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state.status() {
                ConnectionStatus::Online => info!("🟢 {:?}", state),
                ConnectionStatus::Reconnecting => warn!("🟡 {:?}", state),
                ConnectionStatus::Offline => warn!("🔴 {:?}", state),
            }
        }
    });

    connection.connect();

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在关闭连接...");
    connection.shutdown().await;

    Ok(())
}
