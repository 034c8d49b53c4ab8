/// 应用全局状态

use std::sync::Arc;

use crate::ws::ConnectionManager;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 实时连接管理器
    pub manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// 获取连接管理器
    pub fn manager(&self) -> Arc<ConnectionManager> {
        self.manager.clone()
    }
}
