/// 频道注册表
///
/// 维护 频道 -> 会话 以及 会话 -> 频道 两张表，两张表在同一把锁下修改

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::session::Session;

#[derive(Default)]
struct RegistryInner {
    channels: HashMap<String, HashMap<String, Arc<Session>>>,
    memberships: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    inner: RwLock<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅频道，返回是否为新订阅
    ///
    /// 已被移除的会话不会再登记，移除标记在 `remove_session` 取锁之前设置
    pub async fn register(&self, channel: &str, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.write().await;
        if session.is_removed() {
            return false;
        }
        let added = inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(session.id.clone(), session.clone())
            .is_none();
        inner
            .memberships
            .entry(session.id.clone())
            .or_default()
            .insert(channel.to_string());
        added
    }

    /// 取消订阅，返回会话之前是否在该频道中
    pub async fn unregister(&self, channel: &str, session_id: &str) -> bool {
        let mut inner = self.inner.write().await;

        let removed = match inner.channels.get_mut(channel) {
            Some(members) => {
                let removed = members.remove(session_id).is_some();
                if members.is_empty() {
                    inner.channels.remove(channel);
                }
                removed
            }
            None => false,
        };

        if let Some(joined) = inner.memberships.get_mut(session_id) {
            joined.remove(channel);
            if joined.is_empty() {
                inner.memberships.remove(session_id);
            }
        }

        removed
    }

    /// 频道订阅者快照
    pub async fn subscribers_of(&self, channel: &str) -> Vec<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .channels
            .get(channel)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 从会话加入的所有频道中移除，返回被移除的频道
    pub async fn remove_session(&self, session_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let joined = inner.memberships.remove(session_id).unwrap_or_default();

        for channel in &joined {
            if let Some(members) = inner.channels.get_mut(channel) {
                members.remove(session_id);
                if members.is_empty() {
                    inner.channels.remove(channel);
                }
            }
        }

        joined.into_iter().collect()
    }

    pub async fn channels_of(&self, session_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut channels: Vec<String> = inner
            .memberships
            .get(session_id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// 每个频道的订阅数
    pub async fn channel_counts(&self) -> BTreeMap<String, usize> {
        let inner = self.inner.read().await;
        inner
            .channels
            .iter()
            .map(|(name, members)| (name.clone(), members.len()))
            .collect()
    }
}
