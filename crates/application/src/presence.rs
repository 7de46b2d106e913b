//! 全局在线用户登记
//!
//! 在线用户以十进制 id 的形式保存在共享集合中（默认键 `online-users`），
//! 所有网关实例共用。写入是尽力而为的：存储故障只记录日志，不打断连接流程。

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use domain::UserId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresenceStoreError {
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
}

impl PresenceStoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// 共享集合存储
///
/// 除在线集合外，每个成员还有一个跨实例共享的连接计数（保存在
/// [`connection_count_key`] 对应的哈希里）。`acquire_member` 与
/// `release_member` 必须原子地同时维护计数和集合成员。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError>;
    /// 强制移除成员，同时清掉它的连接计数
    async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError>;
    async fn members(&self, key: &str) -> Result<Vec<String>, PresenceStoreError>;
    /// 连接计数加一并确保成员在集合中，返回新的计数
    async fn acquire_member(&self, key: &str, member: &str) -> Result<u64, PresenceStoreError>;
    /// 连接计数减 `count`，降到 0 时移出集合，返回剩余计数
    async fn release_member(
        &self,
        key: &str,
        member: &str,
        count: u64,
    ) -> Result<u64, PresenceStoreError>;
}

/// 在线集合对应的连接计数哈希
pub fn connection_count_key(key: &str) -> String {
    format!("{key}:connections")
}

pub const DEFAULT_PRESENCE_KEY: &str = "online-users";

pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    key: String,
    alert_threshold: u32,
    consecutive_failures: AtomicU32,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, key: impl Into<String>, alert_threshold: u32) -> Self {
        Self {
            store,
            key: key.into(),
            alert_threshold: alert_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn set_online(&self, user_id: UserId) {
        let result = self.store.add_member(&self.key, &user_id.to_string()).await;
        self.record_write("set_online", user_id, result);
    }

    pub async fn set_offline(&self, user_id: UserId) {
        let result = self
            .store
            .remove_member(&self.key, &user_id.to_string())
            .await;
        self.record_write("set_offline", user_id, result);
    }

    /// 某个实例上新建了一条连接；全局计数从 0 变为 1 时用户上线
    pub async fn connection_opened(&self, user_id: UserId) {
        let result = self
            .store
            .acquire_member(&self.key, &user_id.to_string())
            .await
            .map(|total| {
                tracing::debug!(user_id = %user_id, total, "连接计数增加");
            });
        self.record_write("connection_opened", user_id, result);
    }

    /// 某个实例上关闭了 `count` 条连接；全局计数归零时用户离线
    pub async fn connection_closed(&self, user_id: UserId, count: u64) {
        let result = self
            .store
            .release_member(&self.key, &user_id.to_string(), count)
            .await
            .map(|remaining| {
                tracing::debug!(
                    user_id = %user_id,
                    remaining,
                    went_offline = remaining == 0,
                    "连接计数减少"
                );
            });
        self.record_write("connection_closed", user_id, result);
    }

    /// 当前全部在线用户，按 id 升序；读取失败直接返回错误
    pub async fn get_all_online_users(&self) -> Result<Vec<UserId>, PresenceStoreError> {
        let members = self.store.members(&self.key).await?;
        let mut users: Vec<UserId> = members
            .iter()
            .filter_map(|member| match member.parse::<UserId>() {
                Ok(user_id) => Some(user_id),
                Err(_) => {
                    tracing::warn!(key = %self.key, member = %member, "忽略无法解析的在线成员");
                    None
                }
            })
            .collect();
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }

    /// 连续写入失败次数，成功一次即清零
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn record_write(
        &self,
        operation: &'static str,
        user_id: UserId,
        result: Result<(), PresenceStoreError>,
    ) {
        match result {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                tracing::debug!(user_id = %user_id, operation, "在线状态已更新");
            }
            Err(err) => {
                let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= self.alert_threshold {
                    tracing::error!(
                        user_id = %user_id,
                        operation,
                        consecutive_failures = streak,
                        error = %err,
                        "在线状态存储持续写入失败"
                    );
                } else {
                    tracing::warn!(
                        user_id = %user_id,
                        operation,
                        consecutive_failures = streak,
                        error = %err,
                        "在线状态写入失败"
                    );
                }
            }
        }
    }
}

/// 内存实现的集合存储（用于测试）
pub mod memory {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct State {
        sets: HashMap<String, BTreeSet<String>>,
        counts: HashMap<String, HashMap<String, u64>>,
    }

    impl State {
        fn insert(&mut self, key: &str, member: &str) {
            self.sets
                .entry(key.to_owned())
                .or_default()
                .insert(member.to_owned());
        }

        fn remove(&mut self, key: &str, member: &str) {
            if let Some(set) = self.sets.get_mut(key) {
                set.remove(member);
                if set.is_empty() {
                    self.sets.remove(key);
                }
            }
            let count_key = connection_count_key(key);
            if let Some(counts) = self.counts.get_mut(&count_key) {
                counts.remove(member);
                if counts.is_empty() {
                    self.counts.remove(&count_key);
                }
            }
        }
    }

    /// 一把锁同时保护集合和计数，与 Redis 脚本的原子性一致
    #[derive(Default)]
    pub struct MemoryPresenceStore {
        state: RwLock<State>,
        failing: AtomicBool,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 打开后所有操作都返回 `Unavailable`，用于模拟存储故障
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// 成员当前的全局连接计数
        pub async fn connection_count(&self, key: &str, member: &str) -> u64 {
            self.state
                .read()
                .await
                .counts
                .get(&connection_count_key(key))
                .and_then(|counts| counts.get(member))
                .copied()
                .unwrap_or(0)
        }

        fn check_available(&self) -> Result<(), PresenceStoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PresenceStoreError::unavailable("memory store switched off"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError> {
            self.check_available()?;
            self.state.write().await.insert(key, member);
            Ok(())
        }

        async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError> {
            self.check_available()?;
            self.state.write().await.remove(key, member);
            Ok(())
        }

        async fn members(&self, key: &str) -> Result<Vec<String>, PresenceStoreError> {
            self.check_available()?;
            let state = self.state.read().await;
            Ok(state
                .sets
                .get(key)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn acquire_member(&self, key: &str, member: &str) -> Result<u64, PresenceStoreError> {
            self.check_available()?;
            let mut state = self.state.write().await;
            let count = state
                .counts
                .entry(connection_count_key(key))
                .or_default()
                .entry(member.to_owned())
                .or_insert(0);
            *count += 1;
            let total = *count;
            state.insert(key, member);
            Ok(total)
        }

        async fn release_member(
            &self,
            key: &str,
            member: &str,
            count: u64,
        ) -> Result<u64, PresenceStoreError> {
            self.check_available()?;
            let mut state = self.state.write().await;
            let remaining = state
                .counts
                .get_mut(&connection_count_key(key))
                .and_then(|counts| counts.get_mut(member))
                .map(|current| {
                    *current = current.saturating_sub(count);
                    *current
                })
                .unwrap_or(0);
            if remaining == 0 {
                state.remove(key, member);
            }
            Ok(remaining)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryPresenceStore;
    use super::*;

    fn registry() -> (PresenceRegistry, Arc<MemoryPresenceStore>) {
        let store = Arc::new(MemoryPresenceStore::new());
        (
            PresenceRegistry::new(store.clone(), DEFAULT_PRESENCE_KEY, 3),
            store,
        )
    }

    #[tokio::test]
    async fn set_online_is_idempotent() {
        let (registry, _) = registry();
        registry.set_online(UserId(7)).await;
        registry.set_online(UserId(7)).await;
        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(7)]);
    }

    #[tokio::test]
    async fn set_offline_of_absent_user_is_a_no_op() {
        let (registry, _) = registry();
        registry.set_online(UserId(1)).await;
        registry.set_offline(UserId(2)).await;
        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(1)]);
        assert_eq!(registry.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn online_users_are_sorted_numerically() {
        let (registry, _) = registry();
        for id in [10, 2, 33, 1] {
            registry.set_online(UserId(id)).await;
        }
        assert_eq!(
            registry.get_all_online_users().await.unwrap(),
            vec![UserId(1), UserId(2), UserId(10), UserId(33)]
        );
    }

    #[tokio::test]
    async fn unparsable_members_are_skipped() {
        let (registry, store) = registry();
        registry.set_online(UserId(5)).await;
        store
            .add_member(DEFAULT_PRESENCE_KEY, "not-a-number")
            .await
            .unwrap();
        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(5)]);
    }

    #[tokio::test]
    async fn user_goes_offline_only_when_the_shared_count_drops_to_zero() {
        let (registry, store) = registry();
        registry.connection_opened(UserId(7)).await;
        registry.connection_opened(UserId(7)).await;
        registry.connection_opened(UserId(7)).await;
        assert_eq!(store.connection_count(DEFAULT_PRESENCE_KEY, "7").await, 3);

        registry.connection_closed(UserId(7), 2).await;
        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(7)]);

        registry.connection_closed(UserId(7), 1).await;
        assert!(registry.get_all_online_users().await.unwrap().is_empty());
        assert_eq!(store.connection_count(DEFAULT_PRESENCE_KEY, "7").await, 0);
    }

    #[tokio::test]
    async fn releasing_more_than_held_clamps_to_zero() {
        let (registry, store) = registry();
        registry.connection_opened(UserId(3)).await;
        registry.connection_closed(UserId(3), 5).await;
        registry.connection_closed(UserId(4), 1).await;
        assert!(registry.get_all_online_users().await.unwrap().is_empty());
        assert_eq!(store.connection_count(DEFAULT_PRESENCE_KEY, "3").await, 0);
        assert_eq!(registry.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn forced_offline_resets_the_count() {
        let (registry, store) = registry();
        registry.connection_opened(UserId(8)).await;
        registry.connection_opened(UserId(8)).await;
        registry.set_offline(UserId(8)).await;
        assert_eq!(store.connection_count(DEFAULT_PRESENCE_KEY, "8").await, 0);

        registry.connection_opened(UserId(8)).await;
        registry.connection_closed(UserId(8), 1).await;
        assert!(registry.get_all_online_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failures_are_swallowed_and_counted() {
        let (registry, store) = registry();
        store.set_failing(true);
        for _ in 0..4 {
            registry.set_online(UserId(1)).await;
        }
        assert_eq!(registry.consecutive_failures(), 4);
        assert!(registry.get_all_online_users().await.is_err());

        store.set_failing(false);
        registry.set_offline(UserId(1)).await;
        assert_eq!(registry.consecutive_failures(), 0);
    }
}
