/// Pulsewire - 客户端
///
/// 共享连接控制器：一条物理连接承载多个逻辑订阅，断线后按退避策略自动重连

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use config::ClientConfig;
pub use controller::{ClosedReason, ConnectionState, ConnectionStatus, SharedConnection};
pub use error::ClientError;
pub use handlers::Handler;
pub use transport::{Connector, InboundFrame, TransportPair, WsConnector};
