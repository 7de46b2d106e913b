//! 连接与用户的绑定
//!
//! 一个用户可以同时持有多条连接，在线状态按全部实例上的连接总数计算，
//! 只有最后一条连接断开时才离线。每次变更后都会重新读取全局在线列表
//! 并广播 `getOnlineUsers`。
//!
//! 本地映射只在短暂持有的读写锁下修改，存储 I/O 在锁外进行；
//! 同一用户的变更由各自的互斥锁串行化，不同用户互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{ConnectionId, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use super::broadcaster::{RealtimeBroadcaster, RealtimeEvent};
use crate::presence::PresenceRegistry;

#[derive(Default)]
struct BindingState {
    by_user: HashMap<UserId, HashMap<ConnectionId, CancellationToken>>,
    by_connection: HashMap<ConnectionId, UserId>,
    serial: HashMap<UserId, Arc<Mutex<()>>>,
}

impl BindingState {
    /// 用户没有本地连接且没有其他任务在排队时回收它的互斥锁
    fn forget_serial(&mut self, user_id: UserId) {
        if self.by_user.contains_key(&user_id) {
            return;
        }
        // 映射表和调用方的守卫各持有一份
        let idle = self
            .serial
            .get(&user_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            self.serial.remove(&user_id);
        }
    }
}

pub struct SocketSessionBinding {
    registry: Arc<PresenceRegistry>,
    broadcaster: Arc<dyn RealtimeBroadcaster>,
    state: RwLock<BindingState>,
}

impl SocketSessionBinding {
    pub fn new(registry: Arc<PresenceRegistry>, broadcaster: Arc<dyn RealtimeBroadcaster>) -> Self {
        Self {
            registry,
            broadcaster,
            state: RwLock::new(BindingState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// 绑定连接并标记在线，返回的令牌在连接被强制关闭时触发
    pub async fn bind_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let serial = self.serialize(user_id).await;

        let previous = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let previous = state.by_connection.insert(connection_id, user_id);
            if let Some(previous) = previous {
                tracing::warn!(
                    connection_id = %connection_id,
                    previous_user = %previous,
                    user_id = %user_id,
                    "连接 id 重复绑定，覆盖旧记录"
                );
                if let Some(connections) = state.by_user.get_mut(&previous) {
                    if let Some(stale) = connections.remove(&connection_id) {
                        stale.cancel();
                    }
                    if connections.is_empty() {
                        state.by_user.remove(&previous);
                    }
                }
            }
            state
                .by_user
                .entry(user_id)
                .or_default()
                .insert(connection_id, token.clone());
            previous
        };

        match previous {
            // 同一用户重复绑定同一连接，计数不变
            Some(previous) if previous == user_id => {}
            Some(previous) => {
                self.registry.connection_closed(previous, 1).await;
                self.registry.connection_opened(user_id).await;
            }
            None => self.registry.connection_opened(user_id).await,
        }
        drop(serial);

        tracing::info!(user_id = %user_id, connection_id = %connection_id, "实时连接已绑定");
        self.broadcast_online_users().await;
        token
    }

    /// 解除绑定；未知连接直接忽略。返回该连接之前是否已绑定
    pub async fn unbind_connection(&self, connection_id: ConnectionId) -> bool {
        let Some(user_id) = self.state.read().await.by_connection.get(&connection_id).copied()
        else {
            tracing::debug!(connection_id = %connection_id, "忽略未绑定的连接");
            return false;
        };

        let serial = self.serialize(user_id).await;
        let removed = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            // 排队期间连接可能已被清除或改绑
            if state.by_connection.get(&connection_id) != Some(&user_id) {
                false
            } else {
                state.by_connection.remove(&connection_id);
                if let Some(connections) = state.by_user.get_mut(&user_id) {
                    connections.remove(&connection_id);
                    if connections.is_empty() {
                        state.by_user.remove(&user_id);
                    }
                }
                true
            }
        };
        if !removed {
            self.release_serial(user_id, serial).await;
            tracing::debug!(connection_id = %connection_id, "连接已被其他操作解绑");
            return false;
        }

        self.registry.connection_closed(user_id, 1).await;
        self.release_serial(user_id, serial).await;

        tracing::info!(user_id = %user_id, connection_id = %connection_id, "实时连接已解绑");
        self.broadcast_online_users().await;
        true
    }

    /// 强制关闭用户在本实例上的全部连接，返回关闭的连接数
    ///
    /// 只释放本实例持有的连接计数；其他实例仍有连接时用户保持在线。
    pub async fn clear_user_socket(&self, user_id: UserId) -> usize {
        let serial = self.serialize(user_id).await;
        let dropped = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let connections = state.by_user.remove(&user_id).unwrap_or_default();
            for (connection_id, token) in &connections {
                state.by_connection.remove(connection_id);
                token.cancel();
            }
            connections.len()
        };

        if dropped > 0 {
            self.registry.connection_closed(user_id, dropped as u64).await;
        }
        self.release_serial(user_id, serial).await;

        tracing::info!(user_id = %user_id, dropped, "已清除用户的全部实时连接");
        self.broadcast_online_users().await;
        dropped
    }

    pub async fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        let state = self.state.read().await;
        state
            .by_user
            .get(&user_id)
            .map(|connections| connections.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.by_connection.len()
    }

    pub async fn is_online_locally(&self, user_id: UserId) -> bool {
        self.state.read().await.by_user.contains_key(&user_id)
    }

    async fn serialize(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = self
            .state
            .write()
            .await
            .serial
            .entry(user_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn release_serial(&self, user_id: UserId, serial: OwnedMutexGuard<()>) {
        self.state.write().await.forget_serial(user_id);
        drop(serial);
    }

    async fn broadcast_online_users(&self) {
        let users = match self.registry.get_all_online_users().await {
            Ok(users) => users,
            Err(err) => {
                tracing::warn!(error = %err, "读取在线用户失败，跳过本次广播");
                return;
            }
        };
        if let Err(err) = self
            .broadcaster
            .broadcast(RealtimeEvent::online_users(&users))
            .await
        {
            tracing::warn!(error = %err, "在线用户广播失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::presence::memory::MemoryPresenceStore;
    use crate::presence::{PresenceStore, PresenceStoreError, DEFAULT_PRESENCE_KEY};
    use crate::realtime::broadcaster::{LocalRealtimeBroadcaster, ONLINE_USERS_EVENT};
    use async_trait::async_trait;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct Fixture {
        binding: SocketSessionBinding,
        registry: Arc<PresenceRegistry>,
        store: Arc<MemoryPresenceStore>,
        broadcaster: Arc<LocalRealtimeBroadcaster>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPresenceStore::new());
        let registry = Arc::new(PresenceRegistry::new(store.clone(), DEFAULT_PRESENCE_KEY, 3));
        let broadcaster = Arc::new(LocalRealtimeBroadcaster::new(16));
        Fixture {
            binding: SocketSessionBinding::new(registry.clone(), broadcaster.clone()),
            registry,
            store,
            broadcaster,
        }
    }

    fn online_ids(event: &RealtimeEvent) -> Vec<i64> {
        assert_eq!(event.event, ONLINE_USERS_EVENT);
        serde_json::from_value(event.payload.clone()).unwrap()
    }

    #[tokio::test]
    async fn bind_marks_user_online_and_broadcasts() {
        let f = fixture();
        let mut events = f.broadcaster.subscribe();

        f.binding
            .bind_connection(UserId(7), ConnectionId::generate())
            .await;

        assert_eq!(f.registry.get_all_online_users().await.unwrap(), vec![UserId(7)]);
        assert_eq!(online_ids(&events.recv().await.unwrap()), vec![7]);
        assert!(f.binding.is_online_locally(UserId(7)).await);
    }

    #[tokio::test]
    async fn user_stays_online_until_last_connection_closes() {
        let f = fixture();
        let c1 = ConnectionId::generate();
        let c2 = ConnectionId::generate();
        f.binding.bind_connection(UserId(7), c1).await;
        f.binding.bind_connection(UserId(7), c2).await;
        let mut events = f.broadcaster.subscribe();

        assert!(f.binding.unbind_connection(c1).await);
        assert_eq!(f.registry.get_all_online_users().await.unwrap(), vec![UserId(7)]);
        assert_eq!(online_ids(&events.recv().await.unwrap()), vec![7]);

        assert!(f.binding.unbind_connection(c2).await);
        assert!(f.registry.get_all_online_users().await.unwrap().is_empty());
        assert!(online_ids(&events.recv().await.unwrap()).is_empty());
        assert_eq!(f.binding.connection_count().await, 0);
    }

    #[tokio::test]
    async fn unbinding_unknown_connection_does_not_broadcast() {
        let f = fixture();
        let mut events = f.broadcaster.subscribe();
        assert!(!f.binding.unbind_connection(ConnectionId::generate()).await);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn clear_user_socket_cancels_every_connection() {
        let f = fixture();
        let t1 = f
            .binding
            .bind_connection(UserId(3), ConnectionId::generate())
            .await;
        let t2 = f
            .binding
            .bind_connection(UserId(3), ConnectionId::generate())
            .await;
        f.binding
            .bind_connection(UserId(4), ConnectionId::generate())
            .await;

        assert_eq!(f.binding.clear_user_socket(UserId(3)).await, 2);
        assert!(t1.is_cancelled() && t2.is_cancelled());
        assert!(f.binding.connections_of(UserId(3)).await.is_empty());
        assert_eq!(f.registry.get_all_online_users().await.unwrap(), vec![UserId(4)]);
    }

    #[tokio::test]
    async fn broadcast_is_skipped_when_registry_cannot_be_read() {
        let f = fixture();
        let mut events = f.broadcaster.subscribe();
        f.store.set_failing(true);

        f.binding
            .bind_connection(UserId(9), ConnectionId::generate())
            .await;

        assert!(f.binding.is_online_locally(UserId(9)).await);
        assert_eq!(f.registry.consecutive_failures(), 1);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    fn binding_on(store: Arc<dyn PresenceStore>) -> (Arc<SocketSessionBinding>, Arc<PresenceRegistry>) {
        let registry = Arc::new(PresenceRegistry::new(store, DEFAULT_PRESENCE_KEY, 3));
        let binding = Arc::new(SocketSessionBinding::new(
            registry.clone(),
            Arc::new(LocalRealtimeBroadcaster::new(16)),
        ));
        (binding, registry)
    }

    #[tokio::test]
    async fn presence_is_counted_across_instances_sharing_a_store() {
        let store = Arc::new(MemoryPresenceStore::new());
        let (first, registry) = binding_on(store.clone());
        let (second, _) = binding_on(store.clone());

        let on_first = ConnectionId::generate();
        let on_second = ConnectionId::generate();
        first.bind_connection(UserId(7), on_first).await;
        second.bind_connection(UserId(7), on_second).await;
        assert_eq!(store.connection_count(DEFAULT_PRESENCE_KEY, "7").await, 2);

        // 另一实例上的最后一条连接断开，不影响本实例的连接
        assert!(second.unbind_connection(on_second).await);
        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(7)]);

        assert!(first.unbind_connection(on_first).await);
        assert!(registry.get_all_online_users().await.unwrap().is_empty());

        first.bind_connection(UserId(7), ConnectionId::generate()).await;
        second.bind_connection(UserId(7), ConnectionId::generate()).await;
        assert_eq!(second.clear_user_socket(UserId(7)).await, 1);
        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(7)]);
        assert_eq!(store.connection_count(DEFAULT_PRESENCE_KEY, "7").await, 1);
    }

    #[tokio::test]
    async fn rebinding_a_connection_id_moves_the_count() {
        let f = fixture();
        let connection = ConnectionId::generate();
        let stale = f.binding.bind_connection(UserId(1), connection).await;
        f.binding.bind_connection(UserId(2), connection).await;

        assert!(stale.is_cancelled());
        assert_eq!(f.registry.get_all_online_users().await.unwrap(), vec![UserId(2)]);
        assert!(!f.binding.is_online_locally(UserId(1)).await);

        f.binding.bind_connection(UserId(2), connection).await;
        assert_eq!(f.store.connection_count(DEFAULT_PRESENCE_KEY, "2").await, 1);
        assert_eq!(f.binding.connection_count().await, 1);
    }

    /// 指定成员的计数写入会一直挂起，直到测试放行
    struct StallingStore {
        inner: MemoryPresenceStore,
        stalled: String,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PresenceStore for StallingStore {
        async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError> {
            self.inner.add_member(key, member).await
        }

        async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceStoreError> {
            self.inner.remove_member(key, member).await
        }

        async fn members(&self, key: &str) -> Result<Vec<String>, PresenceStoreError> {
            self.inner.members(key).await
        }

        async fn acquire_member(&self, key: &str, member: &str) -> Result<u64, PresenceStoreError> {
            if member == self.stalled {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.acquire_member(key, member).await
        }

        async fn release_member(
            &self,
            key: &str,
            member: &str,
            count: u64,
        ) -> Result<u64, PresenceStoreError> {
            self.inner.release_member(key, member, count).await
        }
    }

    #[tokio::test]
    async fn slow_store_write_blocks_only_the_same_user() {
        let store = Arc::new(StallingStore {
            inner: MemoryPresenceStore::new(),
            stalled: "1".to_owned(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (binding, registry) = binding_on(store.clone());

        let slow = ConnectionId::generate();
        let pending_bind = tokio::spawn({
            let binding = binding.clone();
            async move { binding.bind_connection(UserId(1), slow).await }
        });
        timeout(Duration::from_secs(1), store.entered.notified())
            .await
            .expect("store write started");

        // 其他用户不受影响
        timeout(
            Duration::from_secs(1),
            binding.bind_connection(UserId(2), ConnectionId::generate()),
        )
        .await
        .expect("other user binds while the store is stalled");
        assert_eq!(binding.connection_count().await, 2);

        // 同一用户的解绑排在挂起的绑定之后
        let pending_unbind = tokio::spawn({
            let binding = binding.clone();
            async move { binding.unbind_connection(slow).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending_unbind.is_finished());

        store.release.notify_one();
        pending_bind.await.unwrap();
        assert!(pending_unbind.await.unwrap());

        assert_eq!(registry.get_all_online_users().await.unwrap(), vec![UserId(2)]);
        assert_eq!(store.inner.connection_count(DEFAULT_PRESENCE_KEY, "1").await, 0);
    }
}
