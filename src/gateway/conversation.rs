//! 会话激活状态（按 chat，带过期）
//!
//! 读取时惰性过期，不跑后台清理；`list_active` 只做快照。

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// 默认会话存活时长：6 小时
pub const DEFAULT_CONVERSATION_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct ConversationStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Instant>>,
}

impl ConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 激活或刷新
    pub async fn activate(&self, chat_id: &str) {
        self.sessions
            .write()
            .await
            .insert(chat_id.to_string(), Instant::now());
        tracing::debug!("Conversation activated");
    }

    pub async fn deactivate(&self, chat_id: &str) -> bool {
        self.sessions.write().await.remove(chat_id).is_some()
    }

    /// 是否处于激活状态；已过期的条目在此处删除
    pub async fn is_active(&self, chat_id: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get(chat_id) {
            Some(activated) if now.saturating_duration_since(*activated) <= self.ttl => true,
            Some(_) => {
                sessions.remove(chat_id);
                false
            }
            None => false,
        }
    }

    /// 诊断用快照，不触发过期
    pub async fn list_active(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERSATION_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_activate_then_expire() {
        let store = ConversationStore::default();
        store.activate("chat-1").await;
        assert!(store.is_active("chat-1").await);

        tokio::time::advance(DEFAULT_CONVERSATION_TTL + Duration::from_secs(1)).await;
        assert!(!store.is_active("chat-1").await);
        assert!(!store.list_active().await.contains(&"chat-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_refreshes_ttl() {
        let store = ConversationStore::new(Duration::from_secs(100));
        store.activate("c").await;
        tokio::time::advance(Duration::from_secs(80)).await;
        store.activate("c").await;
        tokio::time::advance(Duration::from_secs(80)).await;
        assert!(store.is_active("c").await);
    }

    #[tokio::test]
    async fn test_deactivate() {
        let store = ConversationStore::default();
        store.activate("c").await;
        assert!(store.deactivate("c").await);
        assert!(!store.is_active("c").await);
        assert!(!store.deactivate("c").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_active_is_snapshot_without_expiry() {
        let store = ConversationStore::new(Duration::from_secs(10));
        store.activate("a").await;
        store.activate("b").await;
        tokio::time::advance(Duration::from_secs(11)).await;

        // 过期条目仍在快照里，直到被读取
        assert_eq!(store.list_active().await.len(), 2);
        assert!(!store.is_active("a").await);
        assert_eq!(store.list_active().await, vec!["b".to_string()]);
    }
}
