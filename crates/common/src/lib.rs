/// Pulsewire - 公共库
///
/// 提供 Server 和 Client 共享的实时消息协议、错误处理、工具函数等

pub mod errors;
pub mod protocol;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use protocol::{CloseReason, ControlMessage, MessageKind, OutboundMessage};
